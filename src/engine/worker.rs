/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Segment workers: one ranged fetch streamed into a region of the
//! shared part file, throttled and cooperatively cancellable.

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::engine::limiter::RateLimiter;
use crate::engine::mirror::{FailoverCoordinator, MirrorRegistry};
use crate::engine::segment::{SegmentProgress, SegmentStatus};
use crate::error::{DownloadError, DownloadResult};

/// Everything one worker needs, injected by the orchestrator
pub struct SegmentWorkerContext {
    pub client: Client,
    /// The shared preallocated part file; this worker writes only inside
    /// its segment's byte region
    pub file_path: PathBuf,
    pub progress: Arc<SegmentProgress>,
    /// Mirror bound at assignment time
    pub mirror_url: String,
    pub registry: Arc<MirrorRegistry>,
    pub failover: Arc<FailoverCoordinator>,
    pub global_limiter: Arc<RateLimiter>,
    pub task_limiter: Arc<RateLimiter>,
    pub cancel: CancellationToken,
    /// Plain GET without a Range header when the source rejects ranges
    pub use_ranges: bool,
    pub stall_timeout: Duration,
    pub max_retries: u32,
}

/// Run one segment to completion, retrying on the bound mirror and failing
/// over to the next-best healthy mirror when local retries are exhausted.
/// Returns the number of bytes written across all attempts of this run.
pub async fn run_segment(ctx: SegmentWorkerContext) -> DownloadResult<u64> {
    let mut mirror_url = ctx.mirror_url.clone();
    let mut switches = 0u32;
    let mut written_total = 0u64;

    ctx.progress.set_status(SegmentStatus::Downloading);

    loop {
        match fetch_with_retries(&ctx, &mirror_url, &mut written_total).await {
            Ok(()) => {
                ctx.progress.set_status(SegmentStatus::Completed);
                return Ok(written_total);
            }
            Err(DownloadError::Cancelled) => {
                // Pause or cancel: progress is kept, the orchestrator
                // decides what the stop means
                ctx.progress.set_status(SegmentStatus::Pending);
                return Err(DownloadError::Cancelled);
            }
            Err(err @ DownloadError::RangeUnsupported { .. }) => {
                // Surface for single-segment replanning, not a failure
                ctx.progress.set_status(SegmentStatus::Pending);
                return Err(err);
            }
            Err(err) if err.is_retryable() || matches!(err, DownloadError::Network { .. }) => {
                // Same-mirror retries are spent; escalate to failover
                match ctx.failover.fail_over(
                    &ctx.registry,
                    ctx.progress.index,
                    &mirror_url,
                    switches,
                    &err.to_string(),
                ) {
                    Ok(next) => {
                        switches += 1;
                        mirror_url = next.url;
                    }
                    Err(exhausted) => {
                        ctx.progress.set_status(SegmentStatus::Failed);
                        return Err(exhausted);
                    }
                }
            }
            Err(err) => {
                ctx.progress.set_status(SegmentStatus::Failed);
                return Err(err);
            }
        }
    }
}

/// Worker context for a source that disclosed no length: one plain GET
/// streamed to EOF, no ranges, no resume anchor
pub struct StreamWorkerContext {
    pub client: Client,
    pub file_path: PathBuf,
    pub progress: Arc<SegmentProgress>,
    pub url: String,
    pub global_limiter: Arc<RateLimiter>,
    pub task_limiter: Arc<RateLimiter>,
    pub cancel: CancellationToken,
    pub stall_timeout: Duration,
    pub max_retries: u32,
}

/// Download a close-delimited body to EOF, retrying from scratch with
/// backoff. Returns the total number of bytes written, which is the only
/// place the resource's size ever becomes known.
pub async fn run_stream(ctx: StreamWorkerContext) -> DownloadResult<u64> {
    let mut last_error: Option<DownloadError> = None;

    for attempt in 0..ctx.max_retries.max(1) {
        if attempt > 0 {
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }

        match stream_once(&ctx).await {
            Ok(total) => {
                ctx.progress.set_status(SegmentStatus::Completed);
                return Ok(total);
            }
            Err(DownloadError::Cancelled) => {
                ctx.progress.set_status(SegmentStatus::Pending);
                return Err(DownloadError::Cancelled);
            }
            Err(err) if err.is_retryable() => {
                debug!(url = %ctx.url, attempt, error = %err, "stream attempt failed");
                last_error = Some(err);
            }
            Err(err) => {
                ctx.progress.set_status(SegmentStatus::Failed);
                return Err(err);
            }
        }
    }

    ctx.progress.set_status(SegmentStatus::Failed);
    Err(last_error.unwrap_or_else(|| DownloadError::network(&ctx.url, "no attempts made")))
}

/// One full-body fetch; partial bytes from an earlier attempt are discarded
async fn stream_once(ctx: &StreamWorkerContext) -> DownloadResult<u64> {
    ctx.progress.reset();
    ctx.progress.set_status(SegmentStatus::Downloading);

    let response = tokio::select! {
        r = ctx.client.get(&ctx.url).send() => {
            r.map_err(|e| DownloadError::from_request(&ctx.url, e))?
        }
        _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
    };
    if let Some(err) = DownloadError::from_status(&ctx.url, response.status().as_u16()) {
        return Err(err);
    }

    // Truncating create: a restarted stream starts from byte zero
    let mut file = File::create(&ctx.file_path)
        .await
        .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;

    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            n = timeout(ctx.stall_timeout, stream.next()) => n,
            _ = ctx.cancel.cancelled() => {
                file.flush()
                    .await
                    .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;
                return Err(DownloadError::Cancelled);
            }
        };

        let chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => return Err(DownloadError::from_request(&ctx.url, e)),
            Ok(None) => break,
            Err(_) => return Err(DownloadError::network(&ctx.url, "download stalled")),
        };

        if chunk.is_empty() {
            continue;
        }

        ctx.global_limiter
            .acquire(chunk.len() as u64, &ctx.cancel)
            .await?;
        ctx.task_limiter
            .acquire(chunk.len() as u64, &ctx.cancel)
            .await?;

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;
        ctx.progress.add_progress(chunk.len() as u64);
        written += chunk.len() as u64;

        trace!(position = written, "chunk written");
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;

    Ok(written)
}

/// Try the current mirror up to `max_retries` times with exponential
/// backoff, resuming from the persisted offset on each ranged attempt.
async fn fetch_with_retries(
    ctx: &SegmentWorkerContext,
    mirror_url: &str,
    written_total: &mut u64,
) -> DownloadResult<()> {
    let mut last_error: Option<DownloadError> = None;

    for attempt in 0..ctx.max_retries.max(1) {
        if attempt > 0 {
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }

        match fetch_once(ctx, mirror_url, written_total).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() => {
                debug!(
                    segment = ctx.progress.index,
                    mirror = mirror_url,
                    attempt,
                    error = %err,
                    "segment fetch attempt failed"
                );
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or_else(|| DownloadError::network(mirror_url, "no attempts made")))
}

/// One streaming fetch into the segment's file region
async fn fetch_once(
    ctx: &SegmentWorkerContext,
    mirror_url: &str,
    written_total: &mut u64,
) -> DownloadResult<()> {
    if ctx.progress.remaining() == 0 {
        return Ok(());
    }

    // A non-resumable source restarts the segment from scratch
    if !ctx.use_ranges && ctx.progress.downloaded() > 0 {
        ctx.progress.reset();
    }

    let mut request = ctx.client.get(mirror_url);
    if ctx.use_ranges {
        request = request.header(header::RANGE, ctx.progress.range_header());
    }

    let response = tokio::select! {
        r = request.send() => r.map_err(|e| DownloadError::from_request(mirror_url, e))?,
        _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
    };

    let status = response.status();
    if ctx.use_ranges {
        if status == StatusCode::OK && ctx.progress.position() > 0 {
            // Server answered the ranged request with the whole body
            return Err(DownloadError::RangeUnsupported {
                url: mirror_url.to_string(),
            });
        }
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(DownloadError::from_status(mirror_url, status.as_u16())
                .unwrap_or_else(|| DownloadError::network(mirror_url, "unexpected status")));
        }
    } else if let Some(err) = DownloadError::from_status(mirror_url, status.as_u16()) {
        return Err(err);
    }

    let mut file = File::options()
        .write(true)
        .open(&ctx.file_path)
        .await
        .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;
    file.seek(std::io::SeekFrom::Start(ctx.progress.position()))
        .await
        .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;

    let mut stream = response.bytes_stream();

    loop {
        let next = tokio::select! {
            n = timeout(ctx.stall_timeout, stream.next()) => n,
            _ = ctx.cancel.cancelled() => {
                file.flush()
                    .await
                    .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;
                return Err(DownloadError::Cancelled);
            }
        };

        let chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => return Err(DownloadError::from_request(mirror_url, e)),
            Ok(None) => break,
            Err(_) => return Err(DownloadError::network(mirror_url, "download stalled")),
        };

        if chunk.is_empty() {
            continue;
        }

        // Do not write past the segment's region: a sloppy server may send
        // more than the requested range
        let remaining = ctx.progress.remaining();
        let take = (chunk.len() as u64).min(remaining) as usize;
        if take == 0 {
            break;
        }

        ctx.global_limiter
            .acquire(take as u64, &ctx.cancel)
            .await?;
        ctx.task_limiter.acquire(take as u64, &ctx.cancel).await?;

        file.write_all(&chunk[..take])
            .await
            .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;
        ctx.progress.add_progress(take as u64);
        *written_total += take as u64;

        trace!(
            segment = ctx.progress.index,
            position = ctx.progress.position(),
            "chunk written"
        );

        if ctx.progress.remaining() == 0 {
            break;
        }
    }

    file.flush()
        .await
        .map_err(|e| DownloadError::disk(ctx.file_path.display().to_string(), e))?;

    if ctx.progress.remaining() > 0 {
        return Err(DownloadError::network(
            mirror_url,
            format!(
                "stream ended early: {} bytes missing",
                ctx.progress.remaining()
            ),
        ));
    }

    Ok(())
}
