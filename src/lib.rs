/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! parafetch: a resumable, segmented file-download engine.
//!
//! Downloads are fetched in parallel byte-range segments, throttled by a
//! shared token bucket, tracked durably through a repository port, merged
//! in index order and verified against an expected checksum. The public
//! surface is [`DownloadOrchestrator`]; UIs and schedulers drive it and
//! listen on its event bus.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod store;
pub mod task;

pub use config::Config;
pub use engine::checksum::HashAlgorithm;
pub use engine::limiter::RateLimiter;
pub use engine::DownloadOrchestrator;
pub use error::{DownloadError, DownloadResult, RecoveryStrategy};
pub use events::{DownloadEvent, EventBus};
pub use store::{JsonFileRepository, MemoryRepository, TaskRepository};
pub use task::{DownloadId, DownloadRequest, DownloadStatus, DownloadTask, ProgressSnapshot};
