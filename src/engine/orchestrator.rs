/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! The download state machine: plan, fetch, merge, verify, finalize.
//!
//! One orchestrator owns every task's lifecycle and is the only writer of
//! task status. Collaborators (repository, probe, mirrors, checksum) are
//! injected so tests can substitute them.

use reqwest::Client;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::checksum;
use crate::engine::limiter::RateLimiter;
use crate::engine::mirror::{assign_mirrors, FailoverCoordinator, MirrorRegistry};
use crate::engine::planner::{plan_segments, PlannedRange};
use crate::engine::probe::{ConnectionProbe, Probe, ProbeResult};
use crate::engine::segment::{SegmentProgress, SegmentRecord, SegmentStatus};
use crate::engine::worker::{run_segment, run_stream, SegmentWorkerContext, StreamWorkerContext};
use crate::error::{DownloadError, DownloadResult};
use crate::events::{DownloadEvent, EventBus};
use crate::store::TaskRepository;
use crate::task::{
    DownloadId, DownloadRequest, DownloadStatus, DownloadTask, ProgressSnapshot,
    SegmentProgressSnapshot,
};

const STOP_NONE: u8 = 0;
const STOP_PAUSED: u8 = 1;
const STOP_CANCELLED: u8 = 2;

/// Live handle for a running (or queued-to-run) download
struct ActiveDownload {
    cancel: CancellationToken,
    stop: AtomicU8,
    /// Instantaneous speed in bytes/sec, maintained by the monitor tick
    speed: AtomicU64,
    total_bytes: AtomicU64,
    segments: std::sync::Mutex<Vec<Arc<SegmentProgress>>>,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ActiveDownload {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            stop: AtomicU8::new(STOP_NONE),
            speed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            segments: std::sync::Mutex::new(Vec::new()),
            join: Mutex::new(None),
        })
    }

    fn downloaded(&self) -> u64 {
        self.segments
            .lock()
            .expect("segment lock")
            .iter()
            .map(|s| s.downloaded())
            .sum()
    }

    fn request_stop(&self, reason: u8) {
        self.stop.store(reason, Ordering::Release);
        self.cancel.cancel();
    }
}

struct Inner {
    config: Config,
    client: Client,
    repo: Arc<dyn TaskRepository>,
    probe: Arc<dyn Probe>,
    events: EventBus,
    global_limiter: Arc<RateLimiter>,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<DownloadId, Arc<ActiveDownload>>>,
}

/// Public control surface consumed by the UI / scheduler layer
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    pub fn new(config: Config, repo: Arc<dyn TaskRepository>) -> DownloadResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(crate::config::MAX_SEGMENTS)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .tcp_nodelay(true)
            .user_agent(concat!("parafetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Other(format!("failed to build HTTP client: {}", e)))?;

        let probe: Arc<dyn Probe> = Arc::new(ConnectionProbe::new(client.clone()));
        Ok(Self::with_parts(config, repo, client, probe))
    }

    /// Constructor seam for tests: inject a probe double
    pub fn with_parts(
        config: Config,
        repo: Arc<dyn TaskRepository>,
        client: Client,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let global_limiter = RateLimiter::from_limit(Some(config.global_speed_limit));
        let slots = Arc::new(Semaphore::new(config.max_active_downloads));
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                repo,
                probe,
                events: EventBus::new(),
                global_limiter,
                slots,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Change the global speed limit for all running workers; 0 removes it
    pub fn set_global_speed_limit(&self, bytes_per_sec: u64) {
        self.inner.global_limiter.set_rate(bytes_per_sec);
    }

    /// Create a download task. Launches immediately (queue permitting)
    /// unless the request says otherwise.
    pub async fn start_download(&self, request: DownloadRequest) -> DownloadResult<DownloadId> {
        validate_url(&request.url)?;
        for mirror in &request.mirrors {
            validate_url(mirror)?;
        }

        let mut task = DownloadTask::new(request.url, request.file_name, request.directory);
        task.checksum = request.checksum;
        task.checksum_algorithm = request.checksum_algorithm;
        task.speed_limit = request.speed_limit;
        task.priority = request.priority;

        let registry = MirrorRegistry::new(task.id, &task.url, &request.mirrors);
        self.inner.repo.save_task(&task).await?;
        self.inner
            .repo
            .save_mirrors(task.id, &registry.list_all())
            .await?;

        let segment_count = request
            .segment_count
            .unwrap_or(self.inner.config.default_segments)
            .clamp(crate::config::MIN_SEGMENTS, crate::config::MAX_SEGMENTS);

        info!(id = %task.id, url = %task.url, segments = segment_count, "download created");

        if request.start_immediately {
            self.spawn_run(task.id, segment_count).await;
        }
        Ok(task.id)
    }

    /// Idempotent: stops workers, flushes exact per-segment offsets, sets
    /// `Paused`. A no-op unless the task is currently `Downloading`.
    pub async fn pause_download(&self, id: DownloadId) -> DownloadResult<()> {
        let status = self.get_status(id).await;
        if status != DownloadStatus::Downloading {
            debug!(%id, %status, "pause ignored");
            return Ok(());
        }

        let handle = self.inner.active.lock().await.get(&id).cloned();
        if let Some(handle) = handle {
            handle.request_stop(STOP_PAUSED);
            let join = handle.join.lock().await.take();
            if let Some(join) = join {
                // Drain: the run task flushes and persists before exiting
                let _ = join.await;
            }
            return Ok(());
        }

        // `Downloading` with no live worker: a previous process crashed
        // mid-download. The record transitions directly; segment offsets
        // are whatever the last flush persisted.
        if let Some(mut task) = self.inner.repo.load_task(id).await? {
            if task.status == DownloadStatus::Downloading {
                task.status = DownloadStatus::Paused;
                self.inner.repo.save_task(&task).await?;
                self.inner.events.emit(DownloadEvent::Paused { id });
            }
        }
        Ok(())
    }

    /// Idempotent: `Paused -> Pending` and back into the queue; segments
    /// resume from their persisted offsets. A no-op unless `Paused`.
    pub async fn resume_download(&self, id: DownloadId) -> DownloadResult<()> {
        let Some(mut task) = self.inner.repo.load_task(id).await? else {
            return Ok(());
        };
        let orphaned = task.status == DownloadStatus::Downloading
            && !self.inner.active.lock().await.contains_key(&id);
        if task.status != DownloadStatus::Paused && !orphaned {
            debug!(%id, status = %task.status, "resume ignored");
            return Ok(());
        }
        if orphaned {
            // Left `Downloading` by a crashed process; re-enter the queue
            // from the last persisted offsets
            warn!(%id, "recovering download orphaned by a previous run");
        }

        task.status = DownloadStatus::Pending;
        self.inner.repo.save_task(&task).await?;
        self.inner.events.emit(DownloadEvent::Resumed { id });

        let segment_count = self
            .inner
            .repo
            .load_segments(id)
            .await?
            .len()
            .max(1)
            .min(crate::config::MAX_SEGMENTS);
        self.spawn_run(id, segment_count).await;
        Ok(())
    }

    /// Terminal from `Pending`, `Downloading` or `Paused`. Releases worker
    /// resources and the part file; the destination file is never touched.
    pub async fn cancel_download(&self, id: DownloadId) -> DownloadResult<()> {
        let handle = self.inner.active.lock().await.get(&id).cloned();
        if let Some(handle) = handle {
            handle.request_stop(STOP_CANCELLED);
            let join = handle.join.lock().await.take();
            if let Some(join) = join {
                let _ = join.await;
            }
            return Ok(());
        }

        // Not running: transition the record directly
        let Some(mut task) = self.inner.repo.load_task(id).await? else {
            return Ok(());
        };
        if !task.status.is_cancellable() {
            debug!(%id, status = %task.status, "cancel ignored");
            return Ok(());
        }
        remove_part_file(&self.inner.config, &task).await;
        task.status = DownloadStatus::Cancelled;
        self.inner.repo.save_task(&task).await?;
        self.inner.repo.delete_segments(id).await?;
        self.inner.events.emit(DownloadEvent::Cancelled { id });
        Ok(())
    }

    /// `Failed -> Pending` with retry counters reset; any other state is
    /// rejected as `InvalidState`
    pub async fn retry_download(&self, id: DownloadId) -> DownloadResult<()> {
        let Some(mut task) = self.inner.repo.load_task(id).await? else {
            return Err(DownloadError::TaskNotFound { id: id.to_string() });
        };
        if task.status != DownloadStatus::Failed {
            return Err(DownloadError::InvalidState {
                operation: "retry".to_string(),
                state: task.status.to_string(),
            });
        }

        task.status = DownloadStatus::Pending;
        task.retry_count = 0;
        task.last_error = None;
        self.inner.repo.save_task(&task).await?;

        let segment_count = self
            .inner
            .repo
            .load_segments(id)
            .await?
            .len()
            .max(self.inner.config.default_segments);
        self.spawn_run(id, segment_count).await;
        Ok(())
    }

    /// Current status. An unknown id yields the `Failed` sentinel rather
    /// than an error; callers that need to distinguish use `get_progress`.
    pub async fn get_status(&self, id: DownloadId) -> DownloadStatus {
        match self.inner.repo.load_task(id).await {
            Ok(Some(task)) => task.status,
            _ => DownloadStatus::Failed,
        }
    }

    /// Point-in-time progress, live when running, persisted otherwise
    pub async fn get_progress(&self, id: DownloadId) -> DownloadResult<Option<ProgressSnapshot>> {
        progress_snapshot(&self.inner, id).await
    }

    /// Progress for every non-terminal task
    pub async fn list_progress(&self) -> DownloadResult<Vec<ProgressSnapshot>> {
        let mut out = Vec::new();
        for task in self.inner.repo.list_tasks().await? {
            if !task.status.is_terminal() {
                if let Some(snapshot) = self.get_progress(task.id).await? {
                    out.push(snapshot);
                }
            }
        }
        Ok(out)
    }

    /// Remove the task record. Explicit user deletion only; the downloaded
    /// file on disk stays.
    pub async fn delete_download(&self, id: DownloadId) -> DownloadResult<()> {
        self.cancel_download(id).await?;
        self.inner.repo.delete_task(id).await
    }

    async fn spawn_run(&self, id: DownloadId, segment_count: usize) {
        let mut active = self.inner.active.lock().await;
        if active.contains_key(&id) {
            return;
        }
        let handle = ActiveDownload::new();
        active.insert(id, handle.clone());
        drop(active);

        let inner = self.inner.clone();
        let run_handle = handle.clone();
        let join = tokio::spawn(async move {
            run_download(inner, id, run_handle, segment_count).await;
        });
        *handle.join.lock().await = Some(join);
    }
}

/// Point-in-time progress: live atomics while a handle exists, persisted
/// records otherwise. Shared by the public API and the monitor loop.
async fn progress_snapshot(
    inner: &Arc<Inner>,
    id: DownloadId,
) -> DownloadResult<Option<ProgressSnapshot>> {
    let Some(task) = inner.repo.load_task(id).await? else {
        return Ok(None);
    };

    if let Some(handle) = inner.active.lock().await.get(&id) {
        let segments: Vec<SegmentProgressSnapshot> = handle
            .segments
            .lock()
            .expect("segment lock")
            .iter()
            .map(|s| SegmentProgressSnapshot {
                index: s.index,
                downloaded: s.downloaded(),
                size: s.size(),
                status: s.status(),
            })
            .collect();
        if !segments.is_empty() {
            let downloaded = segments.iter().map(|s| s.downloaded).sum();
            let total = handle.total_bytes.load(Ordering::Acquire);
            return Ok(Some(ProgressSnapshot {
                id,
                status: task.status,
                downloaded_bytes: downloaded,
                total_bytes: (total > 0).then_some(total),
                speed: handle.speed.load(Ordering::Acquire),
                percentage: percentage(downloaded, total),
                segments,
            }));
        }
    }

    let records = inner.repo.load_segments(id).await?;
    let segments: Vec<SegmentProgressSnapshot> = records
        .iter()
        .map(|r| SegmentProgressSnapshot {
            index: r.index,
            downloaded: r.downloaded,
            size: r.size(),
            status: r.status,
        })
        .collect();
    let downloaded = if segments.is_empty() {
        task.downloaded_bytes
    } else {
        segments.iter().map(|s| s.downloaded).sum()
    };
    Ok(Some(ProgressSnapshot {
        id,
        status: task.status,
        downloaded_bytes: downloaded,
        total_bytes: task.total_bytes,
        speed: 0,
        percentage: percentage(downloaded, task.total_bytes.unwrap_or(0)),
        segments,
    }))
}

fn validate_url(raw: &str) -> DownloadResult<()> {
    let parsed = url::Url::parse(raw).map_err(|e| DownloadError::Config {
        message: format!("invalid url '{}': {}", raw, e),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DownloadError::Config {
            message: format!("unsupported scheme '{}' in '{}'", parsed.scheme(), raw),
        });
    }
    Ok(())
}

fn percentage(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64) * 100.0
    }
}

/// Stable part-file path: carries the task id so a restart finds it again
fn part_path(config: &Config, task: &DownloadTask) -> PathBuf {
    let dir = config
        .work_dir
        .clone()
        .unwrap_or_else(|| task.directory.clone());
    dir.join(format!("{}.{}.part", task.file_name, task.id))
}

async fn remove_part_file(config: &Config, task: &DownloadTask) {
    let _ = tokio::fs::remove_file(part_path(config, task)).await;
}

/// Resolve the final destination, appending " (n)" before the extension on
/// collision
fn resolve_destination(directory: &Path, file_name: &str) -> PathBuf {
    let candidate = directory.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (file_name.to_string(), None),
    };

    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = directory.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

enum AttemptOutcome {
    Completed(PathBuf),
    Paused,
    Cancelled,
    /// Source rejected ranges mid-flight; replan as a single stream
    Replan,
    /// Merged output failed verification; restart from scratch carrying
    /// the mismatch for the eventual failure report
    ChecksumRetry(DownloadError),
    Failed(DownloadError),
}

async fn run_download(
    inner: Arc<Inner>,
    id: DownloadId,
    handle: Arc<ActiveDownload>,
    mut segment_count: usize,
) {
    // Queue: wait for a download slot, still responsive to cancellation
    let permit = tokio::select! {
        p = inner.slots.clone().acquire_owned() => p,
        _ = handle.cancel.cancelled() => {
            finish_stopped(&inner, id, &handle).await;
            inner.active.lock().await.remove(&id);
            return;
        }
    };
    let _permit = match permit {
        Ok(p) => p,
        Err(_) => return,
    };

    let mut restarts = 0u32;
    loop {
        let outcome = run_attempt(&inner, id, &handle, segment_count).await;
        match outcome {
            AttemptOutcome::Completed(path) => {
                info!(%id, path = %path.display(), "download completed");
                inner.events.emit(DownloadEvent::Completed {
                    id,
                    path: path.display().to_string(),
                });
                break;
            }
            AttemptOutcome::Paused => {
                info!(%id, "download paused");
                inner.events.emit(DownloadEvent::Paused { id });
                break;
            }
            AttemptOutcome::Cancelled => {
                info!(%id, "download cancelled");
                inner.events.emit(DownloadEvent::Cancelled { id });
                break;
            }
            AttemptOutcome::Replan => {
                warn!(%id, "ranges unsupported, replanning as a single stream");
                segment_count = 1;
                let _ = reset_segments(&inner, id).await;
            }
            AttemptOutcome::ChecksumRetry(err) => {
                restarts += 1;
                if restarts > inner.config.max_checksum_restarts {
                    fail_task(&inner, id, &err).await;
                    break;
                }
                warn!(%id, restarts, error = %err, "checksum mismatch, restarting download");
                let _ = reset_segments(&inner, id).await;
            }
            AttemptOutcome::Failed(err) => {
                fail_task(&inner, id, &err).await;
                break;
            }
        }
    }

    inner.active.lock().await.remove(&id);
}

/// Mark a queued task that was stopped before its first attempt
async fn finish_stopped(inner: &Arc<Inner>, id: DownloadId, handle: &Arc<ActiveDownload>) {
    let stop = handle.stop.load(Ordering::Acquire);
    if let Ok(Some(mut task)) = inner.repo.load_task(id).await {
        if stop == STOP_CANCELLED && task.status.is_cancellable() {
            remove_part_file(&inner.config, &task).await;
            task.status = DownloadStatus::Cancelled;
            let _ = inner.repo.save_task(&task).await;
            let _ = inner.repo.delete_segments(id).await;
            inner.events.emit(DownloadEvent::Cancelled { id });
        }
    }
}

async fn fail_task(inner: &Arc<Inner>, id: DownloadId, err: &DownloadError) {
    error!(%id, error = %err, "download failed");
    if let Ok(Some(mut task)) = inner.repo.load_task(id).await {
        task.status = DownloadStatus::Failed;
        task.retry_count += 1;
        task.last_error = Some(err.to_string());
        let _ = inner.repo.save_task(&task).await;
    }
    inner.events.emit(DownloadEvent::Failed {
        id,
        error: err.to_string(),
    });
}

async fn reset_segments(inner: &Arc<Inner>, id: DownloadId) -> DownloadResult<()> {
    let mut records = inner.repo.load_segments(id).await?;
    for record in &mut records {
        record.downloaded = 0;
        record.status = SegmentStatus::Pending;
        record.retry_count = 0;
    }
    inner.repo.save_segments(id, &records).await
}

/// One full plan -> fetch -> merge -> verify pass
async fn run_attempt(
    inner: &Arc<Inner>,
    id: DownloadId,
    handle: &Arc<ActiveDownload>,
    segment_count: usize,
) -> AttemptOutcome {
    let mut task = match inner.repo.load_task(id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return AttemptOutcome::Failed(DownloadError::TaskNotFound { id: id.to_string() })
        }
        Err(err) => return AttemptOutcome::Failed(err),
    };

    // A stop that landed between attempts is honored before any new work
    match handle.stop.load(Ordering::Acquire) {
        STOP_PAUSED => {
            task.status = DownloadStatus::Paused;
            if let Err(err) = inner.repo.save_task(&task).await {
                return AttemptOutcome::Failed(err);
            }
            return AttemptOutcome::Paused;
        }
        STOP_CANCELLED => {
            remove_part_file(&inner.config, &task).await;
            task.status = DownloadStatus::Cancelled;
            if let Err(err) = inner.repo.save_task(&task).await {
                return AttemptOutcome::Failed(err);
            }
            let _ = inner.repo.delete_segments(id).await;
            return AttemptOutcome::Cancelled;
        }
        _ => {}
    }

    task.status = DownloadStatus::Downloading;
    if task.started_at.is_none() {
        task.started_at = Some(chrono::Utc::now());
    }
    if let Err(err) = inner.repo.save_task(&task).await {
        return AttemptOutcome::Failed(err);
    }
    inner.events.emit(DownloadEvent::Started { id });

    // Rebuild the registry from persisted mirrors so health survives restarts
    let mirrors = inner.repo.load_mirrors(id).await.unwrap_or_default();
    let registry = Arc::new(if mirrors.is_empty() {
        MirrorRegistry::new(id, &task.url, &[])
    } else {
        let registry = MirrorRegistry::new(id, &mirrors[0].url, &[]);
        for m in &mirrors[1..] {
            registry.add_mirror(&m.url, m.priority);
        }
        registry
    });

    // Probe: size and range support decide the plan
    let probe_result: ProbeResult = tokio::select! {
        result = inner.probe.probe(&registry) => match result {
            Ok(result) => result,
            Err(err) => return AttemptOutcome::Failed(err),
        },
        _ = handle.cancel.cancelled() => {
            return stop_during_setup(inner, &mut task, handle).await;
        }
    };
    let _ = inner.repo.save_mirrors(id, &registry.list_all()).await;

    task.total_bytes = probe_result.size;
    if let Err(err) = inner.repo.save_task(&task).await {
        return AttemptOutcome::Failed(err);
    }

    // A source that discloses no length cannot be planned into ranges;
    // it gets a single stream read to EOF instead
    let Some(total_size) = probe_result.size else {
        return run_unsized_attempt(inner, id, &mut task, handle, &registry).await;
    };

    // Degenerate zero-byte resource: one empty segment, completed on the spot
    if total_size == 0 {
        let record = SegmentRecord::empty_completed(id);
        if let Err(err) = inner.repo.save_segments(id, &[record]).await {
            return AttemptOutcome::Failed(err);
        }
        let destination = resolve_destination(&task.directory, &task.file_name);
        if let Err(err) = tokio::fs::write(&destination, b"").await {
            return AttemptOutcome::Failed(DownloadError::disk(
                destination.display().to_string(),
                err,
            ));
        }
        return finalize(inner, &mut task, handle, destination).await;
    }

    let use_ranges = probe_result.supports_ranges;
    let effective_count = if use_ranges { segment_count } else { 1 };

    // Reuse persisted segments when they still fit the plan, so resume
    // picks up exactly where pause left off
    let mut records = inner.repo.load_segments(id).await.unwrap_or_default();
    let plan_matches = !records.is_empty()
        && records.len() == plan_segments(total_size, effective_count).len()
        && records.last().map(|r| r.end) == Some(total_size - 1);
    if !plan_matches {
        records = plan_segments(total_size, effective_count)
            .into_iter()
            .map(|r| SegmentRecord::from_range(id, r))
            .collect();
    }

    // Preallocate the part file so workers can seek into their regions
    let part = part_path(&inner.config, &task);
    let part_fresh = match preallocate(&part, total_size).await {
        Ok(fresh) => fresh,
        Err(err) => return AttemptOutcome::Failed(err),
    };
    if part_fresh {
        // Persisted offsets point into a file that no longer exists
        for record in &mut records {
            record.downloaded = 0;
            record.status = SegmentStatus::Pending;
        }
    }

    let assigned = assign_mirrors(&registry, records.len());
    for (record, url) in records.iter_mut().zip(&assigned) {
        if record.mirror_url.is_none() {
            record.mirror_url = Some(url.clone());
        }
    }
    if let Err(err) = inner.repo.persist_snapshot(&task, &records).await {
        return AttemptOutcome::Failed(err);
    }

    // Live progress shared between workers and the monitor
    let progress: Vec<Arc<SegmentProgress>> =
        records.iter().map(SegmentProgress::from_record).collect();
    *handle.segments.lock().expect("segment lock") = progress.clone();
    handle.total_bytes.store(total_size, Ordering::Release);

    let failover = Arc::new(FailoverCoordinator::new(inner.config.max_mirror_switches));
    let task_limiter = RateLimiter::from_limit(task.speed_limit);

    // Attempt-scoped token: internal stops (one segment failing the rest,
    // a range replan) must not poison the download-level token, which has
    // to survive into the next attempt
    let attempt_cancel = CancellationToken::new();

    let mut workers: JoinSet<DownloadResult<u64>> = JoinSet::new();
    for (record, segment) in records.iter().zip(progress.iter()) {
        if segment.is_complete() {
            continue;
        }
        let ctx = SegmentWorkerContext {
            client: inner.client.clone(),
            file_path: part.clone(),
            progress: segment.clone(),
            mirror_url: record
                .mirror_url
                .clone()
                .unwrap_or_else(|| task.url.clone()),
            registry: registry.clone(),
            failover: failover.clone(),
            global_limiter: inner.global_limiter.clone(),
            task_limiter: task_limiter.clone(),
            cancel: attempt_cancel.child_token(),
            use_ranges,
            stall_timeout: inner.config.stall_timeout(),
            max_retries: inner.config.max_segment_retries,
        };
        workers.spawn(run_segment(ctx));
    }

    // Supervise: join workers while flushing progress at a bounded cadence
    let mut flush_tick = tokio::time::interval(inner.config.flush_interval());
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_downloaded = handle.downloaded();
    let mut first_error: Option<DownloadError> = None;
    let mut range_replan = false;
    let mut stop_forwarded = false;

    while !workers.is_empty() {
        tokio::select! {
            _ = handle.cancel.cancelled(), if !stop_forwarded => {
                // Pause or cancel from the control surface
                stop_forwarded = true;
                attempt_cancel.cancel();
            }
            joined = workers.join_next() => {
                match joined {
                    Some(Ok(Ok(_bytes))) => {}
                    Some(Ok(Err(DownloadError::Cancelled))) => {}
                    Some(Ok(Err(DownloadError::RangeUnsupported { .. }))) => {
                        range_replan = true;
                        attempt_cancel.cancel();
                    }
                    Some(Ok(Err(err))) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        // One failed segment fails the download; stop the rest
                        attempt_cancel.cancel();
                    }
                    Some(Err(join_err)) => {
                        if first_error.is_none() {
                            first_error = Some(DownloadError::Other(format!(
                                "worker panicked: {}",
                                join_err
                            )));
                        }
                        attempt_cancel.cancel();
                    }
                    None => break,
                }
            }
            _ = flush_tick.tick() => {
                let downloaded = handle.downloaded();
                let elapsed = inner.config.flush_interval().as_secs_f64();
                let speed = ((downloaded.saturating_sub(last_downloaded)) as f64 / elapsed) as u64;
                handle.speed.store(speed, Ordering::Release);
                last_downloaded = downloaded;

                flush_progress(inner, &mut task, &records, &progress, downloaded).await;
                if let Ok(Some(snapshot)) = progress_snapshot(inner, id).await {
                    inner.events.emit(DownloadEvent::Progress { snapshot });
                }
            }
        }
    }

    // Persist the failover audit trail and the final worker state
    let events = failover.take_events();
    if !events.is_empty() {
        for event in &events {
            inner.events.emit(DownloadEvent::FailedOver {
                id,
                segment_index: event.segment_index,
                old_url: event.old_url.clone(),
                new_url: event.new_url.clone(),
            });
        }
        let _ = inner.repo.append_failover_events(id, &events).await;
        let _ = inner.repo.save_mirrors(id, &registry.list_all()).await;
    }

    let mut final_records = records.clone();
    for (record, segment) in final_records.iter_mut().zip(progress.iter()) {
        segment.write_back(record);
    }
    task.downloaded_bytes = handle.downloaded();

    // The stop flag decides what worker cancellation meant
    match handle.stop.load(Ordering::Acquire) {
        STOP_PAUSED => {
            // Pause persists exact offsets before returning: resume is
            // lossless beyond this snapshot
            task.status = DownloadStatus::Paused;
            if let Err(err) = inner.repo.persist_snapshot(&task, &final_records).await {
                return AttemptOutcome::Failed(err);
            }
            return AttemptOutcome::Paused;
        }
        STOP_CANCELLED => {
            let _ = tokio::fs::remove_file(&part).await;
            task.status = DownloadStatus::Cancelled;
            if let Err(err) = inner.repo.save_task(&task).await {
                return AttemptOutcome::Failed(err);
            }
            let _ = inner.repo.delete_segments(id).await;
            return AttemptOutcome::Cancelled;
        }
        _ => {}
    }

    if range_replan {
        let _ = inner.repo.persist_snapshot(&task, &final_records).await;
        return AttemptOutcome::Replan;
    }

    if let Some(err) = first_error {
        let _ = inner.repo.persist_snapshot(&task, &final_records).await;
        return AttemptOutcome::Failed(err);
    }

    if !progress.iter().all(|s| s.is_complete()) {
        let _ = inner.repo.persist_snapshot(&task, &final_records).await;
        return AttemptOutcome::Failed(DownloadError::Other(
            "workers exited without completing all segments".to_string(),
        ));
    }

    let _ = inner.repo.persist_snapshot(&task, &final_records).await;

    promote(inner, &mut task, handle, &part).await
}

/// Fetch a source that never disclosed a length: one plain GET streamed
/// to EOF. Segment planning, preallocation and ranged resume do not apply;
/// the size is learned from the bytes actually written.
async fn run_unsized_attempt(
    inner: &Arc<Inner>,
    id: DownloadId,
    task: &mut DownloadTask,
    handle: &Arc<ActiveDownload>,
    registry: &Arc<MirrorRegistry>,
) -> AttemptOutcome {
    let part = part_path(&inner.config, task);
    let progress = SegmentProgress::unbounded();
    *handle.segments.lock().expect("segment lock") = vec![progress.clone()];

    let url = assign_mirrors(registry, 1)
        .into_iter()
        .next()
        .unwrap_or_else(|| task.url.clone());
    let task_limiter = RateLimiter::from_limit(task.speed_limit);
    let attempt_cancel = CancellationToken::new();

    let ctx = StreamWorkerContext {
        client: inner.client.clone(),
        file_path: part.clone(),
        progress: progress.clone(),
        url,
        global_limiter: inner.global_limiter.clone(),
        task_limiter,
        cancel: attempt_cancel.child_token(),
        stall_timeout: inner.config.stall_timeout(),
        max_retries: inner.config.max_segment_retries,
    };
    let mut worker = tokio::spawn(run_stream(ctx));

    let mut flush_tick = tokio::time::interval(inner.config.flush_interval());
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_downloaded = 0u64;
    let mut stop_forwarded = false;

    let result = loop {
        tokio::select! {
            _ = handle.cancel.cancelled(), if !stop_forwarded => {
                stop_forwarded = true;
                attempt_cancel.cancel();
            }
            joined = &mut worker => {
                break match joined {
                    Ok(result) => result,
                    Err(join_err) => Err(DownloadError::Other(format!(
                        "worker panicked: {}",
                        join_err
                    ))),
                };
            }
            _ = flush_tick.tick() => {
                let downloaded = progress.downloaded();
                let elapsed = inner.config.flush_interval().as_secs_f64();
                let speed = ((downloaded.saturating_sub(last_downloaded)) as f64 / elapsed) as u64;
                handle.speed.store(speed, Ordering::Release);
                last_downloaded = downloaded;

                task.downloaded_bytes = downloaded;
                let _ = inner.repo.save_task(task).await;
                if let Ok(Some(snapshot)) = progress_snapshot(inner, id).await {
                    inner.events.emit(DownloadEvent::Progress { snapshot });
                }
            }
        }
    };

    task.downloaded_bytes = progress.downloaded();

    match handle.stop.load(Ordering::Acquire) {
        STOP_PAUSED => {
            // Partial bytes of a close-delimited body cannot be resumed
            // with a range request; resume restarts the stream from zero
            task.status = DownloadStatus::Paused;
            if let Err(err) = inner.repo.save_task(task).await {
                return AttemptOutcome::Failed(err);
            }
            return AttemptOutcome::Paused;
        }
        STOP_CANCELLED => {
            let _ = tokio::fs::remove_file(&part).await;
            task.status = DownloadStatus::Cancelled;
            if let Err(err) = inner.repo.save_task(task).await {
                return AttemptOutcome::Failed(err);
            }
            let _ = inner.repo.delete_segments(id).await;
            return AttemptOutcome::Cancelled;
        }
        _ => {}
    }

    let total = match result {
        Ok(total) => total,
        Err(err) => return AttemptOutcome::Failed(err),
    };

    // EOF decided the size; only now can the record be written as a
    // completed span
    task.total_bytes = Some(total);
    task.downloaded_bytes = total;
    let record = if total == 0 {
        SegmentRecord::empty_completed(id)
    } else {
        let mut record = SegmentRecord::from_range(
            id,
            PlannedRange {
                index: 0,
                start: 0,
                end: total - 1,
            },
        );
        record.downloaded = total;
        record.status = SegmentStatus::Completed;
        record
    };
    if let Err(err) = inner.repo.persist_snapshot(task, &[record]).await {
        return AttemptOutcome::Failed(err);
    }

    promote(inner, task, handle, &part).await
}

/// Promote the part file: rename to the destination, verify the digest if
/// one was requested, and mark the task complete
async fn promote(
    inner: &Arc<Inner>,
    task: &mut DownloadTask,
    handle: &Arc<ActiveDownload>,
    part: &Path,
) -> AttemptOutcome {
    let destination = resolve_destination(&task.directory, &task.file_name);
    if let Err(err) = tokio::fs::rename(part, &destination).await {
        return AttemptOutcome::Failed(DownloadError::disk(
            destination.display().to_string(),
            err,
        ));
    }

    // A mismatch discards the artifact entirely; partial data cannot be
    // attributed to byte ranges after merge
    if let (Some(expected), Some(algorithm)) = (&task.checksum, task.checksum_algorithm) {
        match checksum::validate(&destination, expected, algorithm).await {
            Ok(()) => {
                debug!(id = %task.id, %algorithm, "checksum verified");
            }
            Err(err @ DownloadError::ChecksumMismatch { .. }) => {
                warn!(id = %task.id, error = %err, "checksum mismatch");
                let _ = tokio::fs::remove_file(&destination).await;
                return AttemptOutcome::ChecksumRetry(err);
            }
            Err(err) => return AttemptOutcome::Failed(err),
        }
    }

    finalize(inner, task, handle, destination).await
}

/// Honor a stop that fired while the attempt was still setting up
async fn stop_during_setup(
    inner: &Arc<Inner>,
    task: &mut DownloadTask,
    handle: &Arc<ActiveDownload>,
) -> AttemptOutcome {
    if handle.stop.load(Ordering::Acquire) == STOP_CANCELLED {
        remove_part_file(&inner.config, task).await;
        task.status = DownloadStatus::Cancelled;
        if let Err(err) = inner.repo.save_task(task).await {
            return AttemptOutcome::Failed(err);
        }
        let _ = inner.repo.delete_segments(task.id).await;
        AttemptOutcome::Cancelled
    } else {
        task.status = DownloadStatus::Paused;
        if let Err(err) = inner.repo.save_task(task).await {
            return AttemptOutcome::Failed(err);
        }
        AttemptOutcome::Paused
    }
}

async fn finalize(
    inner: &Arc<Inner>,
    task: &mut DownloadTask,
    handle: &Arc<ActiveDownload>,
    destination: PathBuf,
) -> AttemptOutcome {
    task.status = DownloadStatus::Completed;
    task.completed_at = Some(chrono::Utc::now());
    task.downloaded_bytes = task.total_bytes.unwrap_or(handle.downloaded());
    if let Err(err) = inner.repo.save_task(task).await {
        return AttemptOutcome::Failed(err);
    }
    // Segment records are destroyed with the completed download
    let _ = inner.repo.delete_segments(task.id).await;
    AttemptOutcome::Completed(destination)
}

async fn flush_progress(
    inner: &Arc<Inner>,
    task: &mut DownloadTask,
    records: &[SegmentRecord],
    progress: &[Arc<SegmentProgress>],
    downloaded: u64,
) {
    let mut snapshot = records.to_vec();
    for (record, segment) in snapshot.iter_mut().zip(progress.iter()) {
        segment.write_back(record);
    }
    task.downloaded_bytes = downloaded;
    if let Err(err) = inner.repo.persist_snapshot(task, &snapshot).await {
        warn!(id = %task.id, error = %err, "progress flush failed");
    }
}

/// Returns true when a new zero-filled file had to be created
async fn preallocate(path: &Path, size: u64) -> DownloadResult<bool> {
    let exists = tokio::fs::metadata(path)
        .await
        .map(|m| m.len() == size)
        .unwrap_or(false);
    if exists {
        return Ok(false);
    }
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| DownloadError::disk(path.display().to_string(), e))?;
    file.set_len(size)
        .await
        .map_err(|e| DownloadError::disk(path.display().to_string(), e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_destination_no_collision() {
        let dir = tempdir().unwrap();
        let path = resolve_destination(dir.path(), "file.bin");
        assert_eq!(path, dir.path().join("file.bin"));
    }

    #[test]
    fn test_resolve_destination_numeric_suffix() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("file.bin"), b"x").unwrap();
        assert_eq!(
            resolve_destination(dir.path(), "file.bin"),
            dir.path().join("file (1).bin")
        );

        std::fs::write(dir.path().join("file (1).bin"), b"x").unwrap();
        assert_eq!(
            resolve_destination(dir.path(), "file.bin"),
            dir.path().join("file (2).bin")
        );
    }

    #[test]
    fn test_resolve_destination_without_extension() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("archive"), b"x").unwrap();
        assert_eq!(
            resolve_destination(dir.path(), "archive"),
            dir.path().join("archive (1)")
        );
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("http://example.com/f.bin").is_ok());
        assert!(validate_url("https://example.com/f.bin").is_ok());
        assert!(validate_url("ftp://example.com/f.bin").is_err());
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(50, 200), 25.0);
        assert_eq!(percentage(200, 200), 100.0);
    }
}
