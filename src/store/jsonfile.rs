/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! JSON-file-backed repository for crash recovery in the CLI.
//!
//! One document per task under the state directory. Writes go through a
//! temp file and an atomic rename, which is what gives `persist_snapshot`
//! its all-or-nothing property.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::TaskRepository;
use crate::engine::mirror::{MirrorFailoverEvent, MirrorUrl};
use crate::engine::segment::SegmentRecord;
use crate::error::{DownloadError, DownloadResult};
use crate::task::{DownloadId, DownloadTask};

/// On-disk document: a task plus everything owned by it
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDocument {
    task: DownloadTask,
    #[serde(default)]
    segments: Vec<SegmentRecord>,
    #[serde(default)]
    mirrors: Vec<MirrorUrl>,
    #[serde(default)]
    failover_log: Vec<MirrorFailoverEvent>,
}

#[derive(Debug)]
pub struct JsonFileRepository {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on the documents
    write_lock: Mutex<()>,
}

impl JsonFileRepository {
    pub fn new(dir: impl Into<PathBuf>) -> DownloadResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| DownloadError::disk(dir.display().to_string(), e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn doc_path(&self, id: DownloadId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read_doc(&self, id: DownloadId) -> DownloadResult<Option<TaskDocument>> {
        let path = self.doc_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| DownloadError::repository(format!("corrupt document {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::disk(path.display().to_string(), e)),
        }
    }

    async fn write_doc(&self, doc: &TaskDocument) -> DownloadResult<()> {
        let path = self.doc_path(doc.task.id);
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| DownloadError::repository(e.to_string()))?;
        write_atomic(&path, json.as_bytes()).await
    }

    async fn update_doc<F>(&self, id: DownloadId, mutate: F) -> DownloadResult<()>
    where
        F: FnOnce(&mut TaskDocument),
    {
        let _guard = self.write_lock.lock().await;
        let mut doc = self
            .read_doc(id)
            .await?
            .ok_or_else(|| DownloadError::repository(format!("no document for task {}", id)))?;
        mutate(&mut doc);
        self.write_doc(&doc).await
    }
}

/// Write to `<path>.tmp`, then rename over the destination
async fn write_atomic(path: &Path, bytes: &[u8]) -> DownloadResult<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| DownloadError::disk(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| DownloadError::disk(path.display().to_string(), e))
}

#[async_trait]
impl TaskRepository for JsonFileRepository {
    async fn save_task(&self, task: &DownloadTask) -> DownloadResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_doc(task.id).await?.unwrap_or(TaskDocument {
            task: task.clone(),
            segments: Vec::new(),
            mirrors: Vec::new(),
            failover_log: Vec::new(),
        });
        doc.task = task.clone();
        self.write_doc(&doc).await
    }

    async fn load_task(&self, id: DownloadId) -> DownloadResult<Option<DownloadTask>> {
        Ok(self.read_doc(id).await?.map(|d| d.task))
    }

    async fn delete_task(&self, id: DownloadId) -> DownloadResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.doc_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::disk(path.display().to_string(), e)),
        }
    }

    async fn list_tasks(&self) -> DownloadResult<Vec<DownloadTask>> {
        let mut tasks = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| DownloadError::disk(self.dir.display().to_string(), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::disk(self.dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(content) = tokio::fs::read_to_string(&path).await {
                    if let Ok(doc) = serde_json::from_str::<TaskDocument>(&content) {
                        tasks.push(doc.task);
                    }
                }
            }
        }
        Ok(tasks)
    }

    async fn save_segments(
        &self,
        id: DownloadId,
        segments: &[SegmentRecord],
    ) -> DownloadResult<()> {
        let segments = segments.to_vec();
        self.update_doc(id, move |doc| doc.segments = segments).await
    }

    async fn load_segments(&self, id: DownloadId) -> DownloadResult<Vec<SegmentRecord>> {
        let mut segments = self
            .read_doc(id)
            .await?
            .map(|d| d.segments)
            .unwrap_or_default();
        segments.sort_by_key(|s| s.index);
        Ok(segments)
    }

    async fn delete_segments(&self, id: DownloadId) -> DownloadResult<()> {
        self.update_doc(id, |doc| doc.segments.clear()).await
    }

    async fn save_mirrors(&self, id: DownloadId, mirrors: &[MirrorUrl]) -> DownloadResult<()> {
        let mirrors = mirrors.to_vec();
        self.update_doc(id, move |doc| doc.mirrors = mirrors).await
    }

    async fn load_mirrors(&self, id: DownloadId) -> DownloadResult<Vec<MirrorUrl>> {
        Ok(self
            .read_doc(id)
            .await?
            .map(|d| d.mirrors)
            .unwrap_or_default())
    }

    async fn append_failover_events(
        &self,
        id: DownloadId,
        events: &[MirrorFailoverEvent],
    ) -> DownloadResult<()> {
        let events = events.to_vec();
        self.update_doc(id, move |doc| doc.failover_log.extend(events))
            .await
    }

    async fn load_failover_events(
        &self,
        id: DownloadId,
    ) -> DownloadResult<Vec<MirrorFailoverEvent>> {
        Ok(self
            .read_doc(id)
            .await?
            .map(|d| d.failover_log)
            .unwrap_or_default())
    }

    async fn persist_snapshot(
        &self,
        task: &DownloadTask,
        segments: &[SegmentRecord],
    ) -> DownloadResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_doc(task.id).await?.unwrap_or(TaskDocument {
            task: task.clone(),
            segments: Vec::new(),
            mirrors: Vec::new(),
            failover_log: Vec::new(),
        });
        doc.task = task.clone();
        doc.segments = segments.to_vec();
        // Single rename commits the task and its segments together
        self.write_doc(&doc).await
    }
}
