/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Mirror tracking, segment assignment and adaptive failover.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{DownloadError, DownloadResult};
use crate::task::DownloadId;

/// An alternate source URL with health and latency tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorUrl {
    pub id: Uuid,
    pub download_id: DownloadId,
    pub url: String,
    /// Tie-break order among equally fast mirrors; lower wins
    pub priority: i32,
    pub healthy: bool,
    pub response_time_ms: Option<u64>,
    pub last_error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl MirrorUrl {
    pub fn new(download_id: DownloadId, url: impl Into<String>, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            download_id,
            url: url.into(),
            priority,
            healthy: true,
            response_time_ms: None,
            last_error: None,
            checked_at: None,
        }
    }
}

/// Append-only audit record of one mirror switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorFailoverEvent {
    pub download_id: DownloadId,
    pub segment_index: usize,
    pub old_url: String,
    pub new_url: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Per-download registry of candidate source URLs.
///
/// The primary URL is always mirror 0; explicit alternates follow in the
/// order given. Health updates come from failover feedback and probing.
#[derive(Debug)]
pub struct MirrorRegistry {
    download_id: DownloadId,
    mirrors: Mutex<Vec<MirrorUrl>>,
}

impl MirrorRegistry {
    /// Build a registry from the primary URL plus explicit alternates
    pub fn new(download_id: DownloadId, primary: &str, alternates: &[String]) -> Self {
        let mut mirrors = vec![MirrorUrl::new(download_id, primary, 0)];
        for (i, url) in alternates.iter().enumerate() {
            mirrors.push(MirrorUrl::new(download_id, url, i as i32 + 1));
        }
        Self {
            download_id,
            mirrors: Mutex::new(mirrors),
        }
    }

    pub fn add_mirror(&self, url: impl Into<String>, priority: i32) {
        let mut mirrors = self.mirrors.lock().expect("mirror lock");
        mirrors.push(MirrorUrl::new(self.download_id, url, priority));
    }

    /// All mirrors currently marked healthy, in insertion order
    pub fn list_healthy(&self) -> Vec<MirrorUrl> {
        let mirrors = self.mirrors.lock().expect("mirror lock");
        mirrors.iter().filter(|m| m.healthy).cloned().collect()
    }

    pub fn list_all(&self) -> Vec<MirrorUrl> {
        self.mirrors.lock().expect("mirror lock").clone()
    }

    /// The lowest-latency healthy mirror; unmeasured mirrors sort after
    /// measured ones, ties broken by ascending priority
    pub fn get_best(&self) -> Option<MirrorUrl> {
        let mirrors = self.mirrors.lock().expect("mirror lock");
        mirrors
            .iter()
            .filter(|m| m.healthy)
            .min_by_key(|m| (m.response_time_ms.unwrap_or(u64::MAX), m.priority))
            .cloned()
    }

    pub fn update_health(
        &self,
        mirror_id: Uuid,
        healthy: bool,
        response_time_ms: Option<u64>,
        error: Option<String>,
    ) {
        let mut mirrors = self.mirrors.lock().expect("mirror lock");
        if let Some(mirror) = mirrors.iter_mut().find(|m| m.id == mirror_id) {
            mirror.healthy = healthy;
            if response_time_ms.is_some() {
                mirror.response_time_ms = response_time_ms;
            }
            mirror.last_error = error;
            mirror.checked_at = Some(Utc::now());
        }
    }

    /// Mark a mirror unhealthy by URL, recording why
    pub fn mark_unhealthy(&self, url: &str, error: impl Into<String>) {
        let mut mirrors = self.mirrors.lock().expect("mirror lock");
        if let Some(mirror) = mirrors.iter_mut().find(|m| m.url == url) {
            mirror.healthy = false;
            mirror.last_error = Some(error.into());
            mirror.checked_at = Some(Utc::now());
        }
    }

    pub fn len(&self) -> usize {
        self.mirrors.lock().expect("mirror lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bind each planned segment to a mirror, round-robin across the healthy
/// set. With no healthy alternates every segment falls back to the primary
/// source URL.
pub fn assign_mirrors(registry: &MirrorRegistry, segment_count: usize) -> Vec<String> {
    let healthy = registry.list_healthy();
    if healthy.is_empty() {
        // Primary is mirror 0 even when marked unhealthy; there is nothing
        // else left to hand out
        let all = registry.list_all();
        let fallback = all
            .first()
            .map(|m| m.url.clone())
            .unwrap_or_default();
        return vec![fallback; segment_count];
    }
    (0..segment_count)
        .map(|i| healthy[i % healthy.len()].url.clone())
        .collect()
}

/// Decides where a failing segment goes next.
///
/// Invoked by a worker after its per-mirror retries are exhausted: penalizes
/// the current mirror, appends an audit event, and hands back the next-best
/// healthy mirror until the per-segment switch budget runs out.
#[derive(Debug)]
pub struct FailoverCoordinator {
    max_switches: u32,
    events: Mutex<Vec<MirrorFailoverEvent>>,
}

impl FailoverCoordinator {
    pub fn new(max_switches: u32) -> Self {
        Self {
            max_switches,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Pick the next mirror for a segment whose current mirror failed.
    ///
    /// Returns `MirrorsExhausted` when the switch budget is spent or no
    /// healthy mirror remains.
    pub fn fail_over(
        &self,
        registry: &MirrorRegistry,
        segment_index: usize,
        current_url: &str,
        switches_so_far: u32,
        reason: &str,
    ) -> DownloadResult<MirrorUrl> {
        registry.mark_unhealthy(current_url, reason);

        if switches_so_far >= self.max_switches {
            return Err(DownloadError::MirrorsExhausted {
                segment_index,
                attempts: switches_so_far as usize,
                last_error: reason.to_string(),
            });
        }

        let next = registry
            .get_best()
            .ok_or_else(|| DownloadError::MirrorsExhausted {
                segment_index,
                attempts: switches_so_far as usize,
                last_error: reason.to_string(),
            })?;

        warn!(
            segment = segment_index,
            from = current_url,
            to = %next.url,
            reason,
            "mirror failover"
        );

        let event = MirrorFailoverEvent {
            download_id: next.download_id,
            segment_index,
            old_url: current_url.to_string(),
            new_url: next.url.clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        };
        self.events.lock().expect("event lock").push(event);

        Ok(next)
    }

    /// Drain recorded events for persistence (the log itself is append-only
    /// downstream)
    pub fn take_events(&self) -> Vec<MirrorFailoverEvent> {
        std::mem::take(&mut *self.events.lock().expect("event lock"))
    }
}
