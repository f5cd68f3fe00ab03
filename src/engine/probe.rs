/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Connection probing: resolve size and partial-content support.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Instant;

use crate::engine::mirror::MirrorRegistry;
use crate::error::{DownloadError, DownloadResult};

/// What a probe learned about a source. `size: None` means the server
/// never disclosed a length (chunked or close-delimited body), which is
/// different from a genuine zero-byte resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub supports_ranges: bool,
    pub size: Option<u64>,
}

/// Capability interface so the orchestrator can be tested without a server
#[async_trait]
pub trait Probe: Send + Sync {
    /// Probe each mirror until one answers; records latency and health
    /// back into the registry as a side effect.
    async fn probe(&self, registry: &MirrorRegistry) -> DownloadResult<ProbeResult>;
}

/// HTTP probe: a HEAD request first, then a one-byte range GET for servers
/// that ignore HEAD or omit Accept-Ranges.
pub struct ConnectionProbe {
    client: Client,
}

impl ConnectionProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn probe_one(&self, url: &str) -> DownloadResult<ProbeResult> {
        // HEAD first
        if let Ok(response) = self.client.head(url).send().await {
            if response.status().is_success() {
                let size = response.content_length().unwrap_or(0);
                let supports_ranges = response
                    .headers()
                    .get(header::ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.contains("bytes"))
                    .unwrap_or(false);

                // A zero here is ambiguous: HEAD bodies are empty, so the
                // length hint cannot distinguish "0 bytes" from "unknown".
                // Only a positive answer is trusted; everything else goes
                // through the range probe.
                if size > 0 {
                    return Ok(ProbeResult {
                        supports_ranges,
                        size: Some(size),
                    });
                }
            }
        }

        // Range probe fallback
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| DownloadError::from_request(url, e))?;

        if response.status() == StatusCode::PARTIAL_CONTENT {
            // Content-Range: bytes 0-0/<total>
            if let Some(total) = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split('/').next_back())
                .and_then(|v| v.parse::<u64>().ok())
            {
                return Ok(ProbeResult {
                    supports_ranges: true,
                    size: Some(total),
                });
            }
        }

        if response.status().is_success() {
            // GET responses carry a trustworthy hint: a Content-Length
            // header yields Some (Some(0) is a real empty resource), a
            // chunked or close-delimited body yields None
            return Ok(ProbeResult {
                supports_ranges: false,
                size: response.content_length(),
            });
        }

        match DownloadError::from_status(url, response.status().as_u16()) {
            Some(err) => Err(err),
            None => Err(DownloadError::network(url, "unexpected probe response")),
        }
    }
}

#[async_trait]
impl Probe for ConnectionProbe {
    async fn probe(&self, registry: &MirrorRegistry) -> DownloadResult<ProbeResult> {
        let mut last_error: Option<DownloadError> = None;

        for mirror in registry.list_healthy() {
            let started = Instant::now();
            match self.probe_one(&mirror.url).await {
                Ok(result) => {
                    let rt = started.elapsed().as_millis() as u64;
                    registry.update_health(mirror.id, true, Some(rt), None);
                    return Ok(result);
                }
                Err(err) => {
                    registry.update_health(mirror.id, false, None, Some(err.to_string()));
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DownloadError::network("", "no mirrors to probe")))
    }
}
