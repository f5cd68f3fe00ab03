/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Asynchronous lifecycle events emitted toward the collaborator layer.
//!
//! Delivery is regular and bounded-latency, not exactly-once: the broadcast
//! channel drops the oldest events for slow receivers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::{DownloadId, ProgressSnapshot};

/// Buffered events per subscriber before lagging receivers lose the oldest
const EVENT_CAPACITY: usize = 256;

/// One download lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DownloadEvent {
    Started { id: DownloadId },
    Progress { snapshot: ProgressSnapshot },
    Paused { id: DownloadId },
    Resumed { id: DownloadId },
    Completed { id: DownloadId, path: String },
    Failed { id: DownloadId, error: String },
    Cancelled { id: DownloadId },
    FailedOver {
        id: DownloadId,
        segment_index: usize,
        old_url: String,
        new_url: String,
    },
}

/// Broadcast fan-out for download events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: an event with no subscribers is simply dropped
    pub fn emit(&self, event: DownloadEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
