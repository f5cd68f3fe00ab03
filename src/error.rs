/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Error taxonomy for the download engine, with recovery classification.

use thiserror::Error;

/// Main error type for download operations
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level failures: timeout, reset, DNS
    #[error("Network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The server does not honor byte-range requests. Not a failure:
    /// the orchestrator replans with a single segment.
    #[error("Range requests not supported by {url}")]
    RangeUnsupported { url: String },

    /// 5xx responses
    #[error("Server error from {url}: HTTP {status}")]
    Server { url: String, status: u16 },

    /// 4xx responses other than 416
    #[error("Client error from {url}: HTTP {status}")]
    Client { url: String, status: u16 },

    /// Merged output digest did not match the expected checksum
    #[error("Checksum mismatch for '{file}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Filesystem failures: permissions, full disk, missing directories
    #[error("Disk error for '{path}': {message}")]
    Disk {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Every mirror was tried and failed for a segment
    #[error("All mirrors exhausted for segment {segment_index}: {attempts} attempts, last error: {last_error}")]
    MirrorsExhausted {
        segment_index: usize,
        attempts: usize,
        last_error: String,
    },

    /// Cooperative cancellation fired. A normal transition, not a failure.
    #[error("Operation cancelled")]
    Cancelled,

    /// No task with the given id is known to the orchestrator
    #[error("Download task {id} not found")]
    TaskNotFound { id: String },

    /// A control operation was called in a state that does not permit it
    #[error("Operation '{operation}' not valid in state {state}")]
    InvalidState { operation: String, state: String },

    /// Repository / persistence failures
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Generic/wrapped error
    #[error("{0}")]
    Other(String),
}

/// Recovery strategy for errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry on the same mirror with exponential backoff
    Retry {
        max_attempts: u32,
        initial_delay_ms: u64,
    },
    /// Switch to the next healthy mirror
    Failover,
    /// Replan the download as a single streaming segment
    Replan,
    /// Restart the whole download from scratch
    Restart,
    /// No recovery possible, surface to the caller
    Fatal,
    /// Not an error, nothing to recover
    None,
}

impl DownloadError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            DownloadError::Network { .. } => RecoveryStrategy::Retry {
                max_attempts: 3,
                initial_delay_ms: 500,
            },
            DownloadError::Server { .. } => RecoveryStrategy::Retry {
                max_attempts: 3,
                initial_delay_ms: 1000,
            },
            DownloadError::RangeUnsupported { .. } => RecoveryStrategy::Replan,
            DownloadError::MirrorsExhausted { .. } => RecoveryStrategy::Fatal,
            DownloadError::ChecksumMismatch { .. } => RecoveryStrategy::Restart,
            DownloadError::Client { .. } => RecoveryStrategy::Fatal,
            DownloadError::Disk { .. } => RecoveryStrategy::Fatal,
            DownloadError::Cancelled => RecoveryStrategy::None,
            _ => RecoveryStrategy::Fatal,
        }
    }

    /// Check if this error is retryable on the same mirror
    pub fn is_retryable(&self) -> bool {
        matches!(self.recovery_strategy(), RecoveryStrategy::Retry { .. })
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        DownloadError::Network {
            url: url.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Classify a reqwest error against the URL it was issued to
    pub fn from_request(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        let message = if source.is_timeout() {
            "request timed out".to_string()
        } else if source.is_connect() {
            "connection failed".to_string()
        } else {
            source.to_string()
        };
        DownloadError::Network {
            url,
            message,
            source: Some(source),
        }
    }

    /// Classify an HTTP status code. 2xx maps to `None`.
    pub fn from_status(url: impl Into<String>, status: u16) -> Option<Self> {
        let url = url.into();
        match status {
            200..=299 => None,
            416 => Some(DownloadError::RangeUnsupported { url }),
            400..=499 => Some(DownloadError::Client { url, status }),
            _ => Some(DownloadError::Server { url, status }),
        }
    }

    /// Create a disk error
    pub fn disk(path: impl Into<String>, source: std::io::Error) -> Self {
        DownloadError::Disk {
            path: path.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a repository error
    pub fn repository(message: impl Into<String>) -> Self {
        DownloadError::Repository {
            message: message.into(),
        }
    }
}

/// Result type alias for download operations
pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DownloadError::ChecksumMismatch {
            file: "archive.zip".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Checksum mismatch for 'archive.zip': expected aa, got bb"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(DownloadError::from_status("http://m", 200).is_none());
        assert!(matches!(
            DownloadError::from_status("http://m", 416),
            Some(DownloadError::RangeUnsupported { .. })
        ));
        assert!(matches!(
            DownloadError::from_status("http://m", 404),
            Some(DownloadError::Client { status: 404, .. })
        ));
        assert!(matches!(
            DownloadError::from_status("http://m", 503),
            Some(DownloadError::Server { status: 503, .. })
        ));
    }

    #[test]
    fn test_recovery_strategy() {
        let network_err = DownloadError::network("http://test", "timeout");
        assert!(network_err.is_retryable());

        let client_err = DownloadError::Client {
            url: "http://test".to_string(),
            status: 403,
        };
        assert!(!client_err.is_retryable());
        assert_eq!(client_err.recovery_strategy(), RecoveryStrategy::Fatal);

        assert_eq!(
            DownloadError::RangeUnsupported {
                url: "http://test".to_string()
            }
            .recovery_strategy(),
            RecoveryStrategy::Replan
        );
        assert_eq!(
            DownloadError::Cancelled.recovery_strategy(),
            RecoveryStrategy::None
        );
    }
}
