/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Segment records and live per-segment progress tracking.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::engine::planner::PlannedRange;
use crate::task::DownloadId;

/// State of a download segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

const STATUS_PENDING: u8 = 0;
const STATUS_DOWNLOADING: u8 = 1;
const STATUS_COMPLETED: u8 = 2;
const STATUS_FAILED: u8 = 3;

impl SegmentStatus {
    fn to_u8(self) -> u8 {
        match self {
            SegmentStatus::Pending => STATUS_PENDING,
            SegmentStatus::Downloading => STATUS_DOWNLOADING,
            SegmentStatus::Completed => STATUS_COMPLETED,
            SegmentStatus::Failed => STATUS_FAILED,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATUS_DOWNLOADING => SegmentStatus::Downloading,
            STATUS_COMPLETED => SegmentStatus::Completed,
            STATUS_FAILED => SegmentStatus::Failed,
            _ => SegmentStatus::Pending,
        }
    }
}

/// Durable form of a segment, persisted through the repository.
///
/// Invariant for a download with N segments: sorted by `index`, contiguous
/// and non-overlapping, `start` of segment 0 is 0, `end` of segment N-1 is
/// `total_size - 1`, and the lengths sum to `total_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: Uuid,
    pub download_id: DownloadId,
    /// 0-based; defines merge order
    pub index: usize,
    /// Start byte offset (inclusive)
    pub start: u64,
    /// End byte offset (inclusive)
    pub end: u64,
    pub downloaded: u64,
    pub status: SegmentStatus,
    pub mirror_url: Option<String>,
    pub retry_count: u32,
}

impl SegmentRecord {
    pub fn from_range(download_id: DownloadId, range: PlannedRange) -> Self {
        Self {
            id: Uuid::new_v4(),
            download_id,
            index: range.index,
            start: range.start,
            end: range.end,
            downloaded: 0,
            status: SegmentStatus::Pending,
            mirror_url: None,
            retry_count: 0,
        }
    }

    /// The single empty segment recorded for a zero-byte download
    pub fn empty_completed(download_id: DownloadId) -> Self {
        Self {
            id: Uuid::new_v4(),
            download_id,
            index: 0,
            start: 0,
            end: 0,
            downloaded: 0,
            status: SegmentStatus::Completed,
            mirror_url: None,
            retry_count: 0,
        }
    }

    /// Total size of this segment
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Shared live progress for a segment while its worker runs.
///
/// Workers update the atomics; the orchestrator's monitor loop snapshots
/// them back into `SegmentRecord`s for persistence and progress reports.
#[derive(Debug)]
pub struct SegmentProgress {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    downloaded: AtomicU64,
    status: AtomicU8,
}

impl SegmentProgress {
    pub fn from_record(record: &SegmentRecord) -> Arc<Self> {
        Arc::new(Self {
            index: record.index,
            start: record.start,
            end: record.end,
            downloaded: AtomicU64::new(record.downloaded),
            status: AtomicU8::new(record.status.to_u8()),
        })
    }

    /// Live counter for a close-delimited stream of unknown length; the
    /// nominal end never clamps anything, EOF decides when it is done
    pub fn unbounded() -> Arc<Self> {
        Arc::new(Self {
            index: 0,
            start: 0,
            end: u64::MAX - 1,
            downloaded: AtomicU64::new(0),
            status: AtomicU8::new(STATUS_PENDING),
        })
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Current absolute file position, i.e. where the next ranged fetch
    /// resumes from
    pub fn position(&self) -> u64 {
        self.start + self.downloaded.load(Ordering::Acquire)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.downloaded())
    }

    pub fn add_progress(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Discard progress: non-resumable retries and full checksum restarts
    pub fn reset(&self) {
        self.downloaded.store(0, Ordering::Release);
        self.set_status(SegmentStatus::Pending);
    }

    pub fn status(&self) -> SegmentStatus {
        SegmentStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SegmentStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.status() == SegmentStatus::Completed
    }

    /// HTTP Range header value for the remaining span
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.position(), self.end)
    }

    /// Fold live state back into a durable record
    pub fn write_back(&self, record: &mut SegmentRecord) {
        record.downloaded = self.downloaded();
        record.status = self.status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::planner::plan_segments;

    #[test]
    fn test_record_from_plan() {
        let id = DownloadId::new();
        let records: Vec<SegmentRecord> = plan_segments(1000, 4)
            .into_iter()
            .map(|r| SegmentRecord::from_range(id, r))
            .collect();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].start, 0);
        assert_eq!(records[3].end, 999);
        let total: u64 = records.iter().map(|r| r.size()).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_progress_position_and_range_header() {
        let id = DownloadId::new();
        let record = SegmentRecord::from_range(
            id,
            PlannedRange {
                index: 1,
                start: 100,
                end: 199,
            },
        );
        let progress = SegmentProgress::from_record(&record);
        assert_eq!(progress.position(), 100);
        assert_eq!(progress.range_header(), "bytes=100-199");

        progress.add_progress(40);
        assert_eq!(progress.position(), 140);
        assert_eq!(progress.remaining(), 60);
        assert_eq!(progress.range_header(), "bytes=140-199");
    }

    #[test]
    fn test_resume_starts_at_persisted_offset() {
        let id = DownloadId::new();
        let mut record = SegmentRecord::from_range(
            id,
            PlannedRange {
                index: 0,
                start: 0,
                end: 499,
            },
        );
        record.downloaded = 300;
        record.status = SegmentStatus::Downloading;

        let progress = SegmentProgress::from_record(&record);
        assert_eq!(progress.position(), 300);
        assert_eq!(progress.remaining(), 200);
    }

    #[test]
    fn test_write_back_round_trip() {
        let id = DownloadId::new();
        let mut record = SegmentRecord::from_range(
            id,
            PlannedRange {
                index: 0,
                start: 0,
                end: 99,
            },
        );
        let progress = SegmentProgress::from_record(&record);
        progress.add_progress(100);
        progress.set_status(SegmentStatus::Completed);

        progress.write_back(&mut record);
        assert_eq!(record.downloaded, 100);
        assert_eq!(record.status, SegmentStatus::Completed);
    }
}
