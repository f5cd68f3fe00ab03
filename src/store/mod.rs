/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Persistence ports for tasks, segments, mirrors and the failover log.
//!
//! The engine consumes storage purely through [`TaskRepository`]; any
//! backend honoring the atomicity contract on `persist_snapshot` works.

mod jsonfile;
mod memory;

pub use jsonfile::JsonFileRepository;
pub use memory::MemoryRepository;

use async_trait::async_trait;

use crate::engine::mirror::{MirrorFailoverEvent, MirrorUrl};
use crate::engine::segment::SegmentRecord;
use crate::error::DownloadResult;
use crate::task::{DownloadId, DownloadTask};

/// Storage port for the download engine.
///
/// Segment records are unique on `(download_id, index)`; saving a segment
/// set replaces any previous set for that download. The failover log is
/// append-only.
///
/// Atomicity contract: `persist_snapshot` commits the task together with
/// its segments, or not at all. Pause relies on this to guarantee that a
/// resumed download never observes a task status newer than its segment
/// offsets.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save_task(&self, task: &DownloadTask) -> DownloadResult<()>;
    async fn load_task(&self, id: DownloadId) -> DownloadResult<Option<DownloadTask>>;
    async fn delete_task(&self, id: DownloadId) -> DownloadResult<()>;
    async fn list_tasks(&self) -> DownloadResult<Vec<DownloadTask>>;

    async fn save_segments(
        &self,
        id: DownloadId,
        segments: &[SegmentRecord],
    ) -> DownloadResult<()>;
    async fn load_segments(&self, id: DownloadId) -> DownloadResult<Vec<SegmentRecord>>;
    async fn delete_segments(&self, id: DownloadId) -> DownloadResult<()>;

    async fn save_mirrors(&self, id: DownloadId, mirrors: &[MirrorUrl]) -> DownloadResult<()>;
    async fn load_mirrors(&self, id: DownloadId) -> DownloadResult<Vec<MirrorUrl>>;

    async fn append_failover_events(
        &self,
        id: DownloadId,
        events: &[MirrorFailoverEvent],
    ) -> DownloadResult<()>;
    async fn load_failover_events(
        &self,
        id: DownloadId,
    ) -> DownloadResult<Vec<MirrorFailoverEvent>>;

    /// Commit a task and its segment set as one unit
    async fn persist_snapshot(
        &self,
        task: &DownloadTask,
        segments: &[SegmentRecord],
    ) -> DownloadResult<()>;
}
