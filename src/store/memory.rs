/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! In-memory repository, the default backing for embedded use and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::TaskRepository;
use crate::engine::mirror::{MirrorFailoverEvent, MirrorUrl};
use crate::engine::segment::SegmentRecord;
use crate::error::DownloadResult;
use crate::task::{DownloadId, DownloadTask};

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<DownloadId, DownloadTask>,
    segments: HashMap<DownloadId, Vec<SegmentRecord>>,
    mirrors: HashMap<DownloadId, Vec<MirrorUrl>>,
    failover_log: HashMap<DownloadId, Vec<MirrorFailoverEvent>>,
}

/// All tables behind one lock, so a snapshot commit is naturally atomic
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryRepository {
    async fn save_task(&self, task: &DownloadTask) -> DownloadResult<()> {
        self.tables.write().await.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: DownloadId) -> DownloadResult<Option<DownloadTask>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn delete_task(&self, id: DownloadId) -> DownloadResult<()> {
        let mut tables = self.tables.write().await;
        tables.tasks.remove(&id);
        tables.segments.remove(&id);
        tables.mirrors.remove(&id);
        tables.failover_log.remove(&id);
        Ok(())
    }

    async fn list_tasks(&self) -> DownloadResult<Vec<DownloadTask>> {
        Ok(self.tables.read().await.tasks.values().cloned().collect())
    }

    async fn save_segments(
        &self,
        id: DownloadId,
        segments: &[SegmentRecord],
    ) -> DownloadResult<()> {
        self.tables
            .write()
            .await
            .segments
            .insert(id, segments.to_vec());
        Ok(())
    }

    async fn load_segments(&self, id: DownloadId) -> DownloadResult<Vec<SegmentRecord>> {
        let mut segments = self
            .tables
            .read()
            .await
            .segments
            .get(&id)
            .cloned()
            .unwrap_or_default();
        segments.sort_by_key(|s| s.index);
        Ok(segments)
    }

    async fn delete_segments(&self, id: DownloadId) -> DownloadResult<()> {
        self.tables.write().await.segments.remove(&id);
        Ok(())
    }

    async fn save_mirrors(&self, id: DownloadId, mirrors: &[MirrorUrl]) -> DownloadResult<()> {
        self.tables
            .write()
            .await
            .mirrors
            .insert(id, mirrors.to_vec());
        Ok(())
    }

    async fn load_mirrors(&self, id: DownloadId) -> DownloadResult<Vec<MirrorUrl>> {
        Ok(self
            .tables
            .read()
            .await
            .mirrors
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_failover_events(
        &self,
        id: DownloadId,
        events: &[MirrorFailoverEvent],
    ) -> DownloadResult<()> {
        self.tables
            .write()
            .await
            .failover_log
            .entry(id)
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    async fn load_failover_events(
        &self,
        id: DownloadId,
    ) -> DownloadResult<Vec<MirrorFailoverEvent>> {
        Ok(self
            .tables
            .read()
            .await
            .failover_log
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_snapshot(
        &self,
        task: &DownloadTask,
        segments: &[SegmentRecord],
    ) -> DownloadResult<()> {
        let mut tables = self.tables.write().await;
        tables.tasks.insert(task.id, task.clone());
        tables.segments.insert(task.id, segments.to_vec());
        Ok(())
    }
}
