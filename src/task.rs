/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Download task records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::engine::checksum::HashAlgorithm;

/// Opaque download identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadId(pub Uuid);

impl DownloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status shared by tasks and segments at different granularity.
///
/// Transitions: `Pending -> Downloading -> {Completed | Failed | Paused |
/// Cancelled}`; `Paused -> Pending` on resume; `Cancelled` is reachable from
/// any non-terminal state. `Completed`, `Cancelled` and terminal `Failed`
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    /// Whether this status permits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Cancelled | DownloadStatus::Failed
        )
    }

    /// Whether a task in this status can be cancelled
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending | DownloadStatus::Downloading | DownloadStatus::Paused
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Pending => "Pending",
            DownloadStatus::Downloading => "Downloading",
            DownloadStatus::Paused => "Paused",
            DownloadStatus::Completed => "Completed",
            DownloadStatus::Failed => "Failed",
            DownloadStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// A download task record. Owned by the orchestrator and mutated only
/// through its state-transition operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: DownloadId,
    pub url: String,
    pub file_name: String,
    pub directory: PathBuf,
    /// Unknown until the connection probe resolves it
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub status: DownloadStatus,
    /// Expected digest, lowercase hex
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<HashAlgorithm>,
    pub retry_count: u32,
    /// Per-task speed limit in bytes/sec
    pub speed_limit: Option<u64>,
    /// Carried for external schedulers; the built-in queue admits tasks
    /// in arrival order and does not consult it
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>, directory: PathBuf) -> Self {
        Self {
            id: DownloadId::new(),
            url: url.into(),
            file_name: file_name.into(),
            directory,
            total_bytes: None,
            downloaded_bytes: 0,
            status: DownloadStatus::Pending,
            checksum: None,
            checksum_algorithm: None,
            retry_count: 0,
            speed_limit: None,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}

/// Request to create a new download
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
    pub directory: PathBuf,
    /// Segment count override; engine default when `None`, clamped to 1..=16
    pub segment_count: Option<usize>,
    /// Per-task speed limit in bytes/sec
    pub speed_limit: Option<u64>,
    /// Alternate source URLs for the same resource
    pub mirrors: Vec<String>,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<HashAlgorithm>,
    /// Persisted onto the task; see [`DownloadTask::priority`]
    pub priority: i32,
    /// Launch immediately, or leave in `Pending` for the queue
    pub start_immediately: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>, directory: PathBuf) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            directory,
            segment_count: None,
            speed_limit: None,
            mirrors: Vec::new(),
            checksum: None,
            checksum_algorithm: None,
            priority: 0,
            start_immediately: true,
        }
    }

    #[must_use]
    pub fn with_segments(mut self, count: usize) -> Self {
        self.segment_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed_limit = Some(bytes_per_sec);
        self
    }

    #[must_use]
    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        self.mirrors = mirrors;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, hex: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        self.checksum = Some(hex.into());
        self.checksum_algorithm = Some(algorithm);
        self
    }

    #[must_use]
    pub fn queued(mut self) -> Self {
        self.start_immediately = false;
        self
    }
}

/// Point-in-time progress for one segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentProgressSnapshot {
    pub index: usize,
    pub downloaded: u64,
    pub size: u64,
    pub status: crate::engine::segment::SegmentStatus,
}

/// Point-in-time progress for a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub id: DownloadId,
    pub status: DownloadStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Instantaneous speed in bytes/sec
    pub speed: u64,
    pub percentage: f64,
    pub segments: Vec<SegmentProgressSnapshot>,
}
