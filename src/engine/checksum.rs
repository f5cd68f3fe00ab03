/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! Streaming checksum computation and verification.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

use crate::error::{DownloadError, DownloadResult};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
    Md5,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
            HashAlgorithm::Md5 => f.write_str("md5"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "md5" => Ok(HashAlgorithm::Md5),
            other => Err(DownloadError::Config {
                message: format!("unknown hash algorithm '{}'", other),
            }),
        }
    }
}

/// Compute the digest of a byte slice as lowercase hex
pub fn compute_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
        HashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
    }
}

/// Compute the digest of a file, streaming in fixed-size reads, as
/// lowercase hex. Deterministic: the same bytes always hash the same.
pub async fn compute_file(path: &Path, algorithm: HashAlgorithm) -> DownloadResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| DownloadError::disk(path.display().to_string(), e))?;
    let mut buf = vec![0u8; READ_BUF_SIZE];

    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| DownloadError::disk(path.display().to_string(), e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| DownloadError::disk(path.display().to_string(), e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Check a file against an expected digest, case-insensitively. A
/// mismatch is an error carrying both digests for the failure report.
pub async fn validate(
    path: &Path,
    expected_hex: &str,
    algorithm: HashAlgorithm,
) -> DownloadResult<()> {
    let actual = compute_file(path, algorithm).await?;
    if actual.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(DownloadError::ChecksumMismatch {
            file: path.display().to_string(),
            expected: expected_hex.to_ascii_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_empty_input_sha256() {
        assert_eq!(compute_bytes(b"", HashAlgorithm::Sha256), EMPTY_SHA256);
    }

    #[test]
    fn test_deterministic() {
        let data = b"the same bytes";
        assert_eq!(
            compute_bytes(data, HashAlgorithm::Sha256),
            compute_bytes(data, HashAlgorithm::Sha256)
        );
        assert_eq!(
            compute_bytes(data, HashAlgorithm::Md5),
            compute_bytes(data, HashAlgorithm::Md5)
        );
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!(
            "SHA-256".parse::<HashAlgorithm>().unwrap(),
            HashAlgorithm::Sha256
        );
        assert_eq!("md5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[tokio::test]
    async fn test_file_digest_matches_bytes_digest() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello parafetch").unwrap();
        file.flush().unwrap();

        let from_file = compute_file(file.path(), HashAlgorithm::Sha256)
            .await
            .unwrap();
        let from_bytes = compute_bytes(b"hello parafetch", HashAlgorithm::Sha256);
        assert_eq!(from_file, from_bytes);
    }

    #[tokio::test]
    async fn test_empty_file_sha256() {
        let file = NamedTempFile::new().unwrap();
        let digest = compute_file(file.path(), HashAlgorithm::Sha256)
            .await
            .unwrap();
        assert_eq!(digest, EMPTY_SHA256);
    }

    #[tokio::test]
    async fn test_validate_case_insensitive() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        let digest = compute_file(file.path(), HashAlgorithm::Sha256)
            .await
            .unwrap();
        assert!(validate(file.path(), &digest.to_uppercase(), HashAlgorithm::Sha256)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_validate_detects_mutation() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"original contents").unwrap();
        file.flush().unwrap();
        let digest = compute_file(file.path(), HashAlgorithm::Sha256)
            .await
            .unwrap();

        file.write_all(b" plus tampering").unwrap();
        file.flush().unwrap();
        let err = validate(file.path(), &digest, HashAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
    }
}
