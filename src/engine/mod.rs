/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Segmented download engine: planning, probing, throttled ranged fetches,
//! mirror failover, ordered merge and checksum verification.

pub mod checksum;
pub mod limiter;
pub mod mirror;
pub mod planner;
pub mod probe;
pub mod segment;
pub mod worker;

mod orchestrator;

pub use orchestrator::DownloadOrchestrator;
