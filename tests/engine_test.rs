/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 */

//! End-to-end engine tests against a local stub HTTP server.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use parafetch::engine::checksum;
use parafetch::{
    Config, DownloadError, DownloadEvent, DownloadId, DownloadOrchestrator, DownloadRequest,
    DownloadStatus, DownloadTask, HashAlgorithm, MemoryRepository, TaskRepository,
};

/// How the stub answers requests
#[derive(Clone, Copy)]
enum ServerMode {
    /// HEAD advertises ranges; ranged GETs get 206 with the exact slice
    Ranged,
    /// Range headers are ignored; every GET streams the full body with 200
    NoRanges,
    /// No Content-Length anywhere: the body is close-delimited and its
    /// length is only knowable at EOF
    Unsized,
    /// Every request gets a 500
    AlwaysFail,
}

/// Minimal single-purpose HTTP/1.1 server, one request per connection
async fn spawn_server(body: Vec<u8>, mode: ServerMode) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, body, mode).await;
            });
        }
    });

    format!("http://{}/file.bin", addr)
}

async fn handle_connection(
    mut stream: TcpStream,
    body: Arc<Vec<u8>>,
    mode: ServerMode,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request = String::from_utf8_lossy(&buf);
    let mut lines = request.lines();
    let request_line = lines.next().unwrap_or_default();
    let method = request_line.split_whitespace().next().unwrap_or_default();
    let range = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("range"))
        .map(|(_, v)| v.trim().to_string());

    match mode {
        ServerMode::AlwaysFail => {
            stream
                .write_all(
                    b"HTTP/1.1 500 Internal Server Error\r\n\
                      Content-Length: 0\r\nConnection: close\r\n\r\n",
                )
                .await?;
        }
        ServerMode::Ranged => match (method, range) {
            ("HEAD", _) => {
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\
                     Accept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(header.as_bytes()).await?;
            }
            ("GET", Some(range)) => {
                let (start, end) = parse_range(&range, body.len() as u64);
                let slice = &body[start as usize..=end as usize];
                let header = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\
                     Content-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                    slice.len(),
                    start,
                    end,
                    body.len()
                );
                stream.write_all(header.as_bytes()).await?;
                stream.write_all(slice).await?;
            }
            _ => {
                write_full(&mut stream, &body).await?;
            }
        },
        ServerMode::NoRanges => {
            if method == "HEAD" {
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(header.as_bytes()).await?;
            } else {
                write_full(&mut stream, &body).await?;
            }
        }
        ServerMode::Unsized => {
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
                .await?;
            if method != "HEAD" {
                stream.write_all(&body).await?;
            }
        }
    }

    stream.flush().await?;
    Ok(())
}

async fn write_full(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await
}

/// "bytes=a-b" (b optional) clamped to the body
fn parse_range(range: &str, len: u64) -> (u64, u64) {
    let span = range.trim_start_matches("bytes=");
    let (start, end) = span.split_once('-').unwrap_or((span, ""));
    let start: u64 = start.parse().unwrap_or(0);
    let end: u64 = end.parse().unwrap_or(len - 1).min(len - 1);
    (start, end)
}

/// Deterministic pseudo-random payload so merge bugs show up as mismatches
fn test_body(len: usize) -> Vec<u8> {
    let mut state = 0x2545f4914f6cdd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn test_orchestrator() -> (DownloadOrchestrator, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    let orchestrator = DownloadOrchestrator::new(Config::default(), repo.clone()).unwrap();
    (orchestrator, repo)
}

/// Drain events until the download reaches a terminal outcome
async fn wait_for_outcome(
    events: &mut tokio::sync::broadcast::Receiver<DownloadEvent>,
    id: DownloadId,
) -> DownloadEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            match &event {
                DownloadEvent::Completed { id: got, .. }
                | DownloadEvent::Failed { id: got, .. }
                | DownloadEvent::Cancelled { id: got }
                    if *got == id =>
                {
                    return event;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("download did not finish in time")
}

#[tokio::test]
async fn test_segmented_download_merges_bit_identical() {
    let body = test_body(8 * 1024 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "file.bin", dir.path().to_path_buf()).with_segments(8);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion, got {:?}", other),
    }

    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Completed);

    let written = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(written, body);

    // No part file left behind, segment records destroyed
    assert!(!dir.path().join(format!("file.bin.{}.part", id)).exists());
    assert!(repo.load_segments(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_single_stream_when_ranges_unsupported() {
    let body = test_body(64 * 1024);
    let url = spawn_server(body.clone(), ServerMode::NoRanges).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, _repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "plain.bin", dir.path().to_path_buf()).with_segments(8);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion, got {:?}", other),
    }

    let written = std::fs::read(dir.path().join("plain.bin")).unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn test_checksum_verified_on_completion() {
    let body = test_body(32 * 1024);
    let expected = checksum::compute_bytes(&body, HashAlgorithm::Sha256);
    let url = spawn_server(body, ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, _repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "sum.bin", dir.path().to_path_buf())
        .with_segments(2)
        .with_checksum(expected, HashAlgorithm::Sha256);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_checksum_mismatch_discards_artifact() {
    let body = test_body(16 * 1024);
    let url = spawn_server(body, ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, _repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let wrong = "0".repeat(64);
    let request = DownloadRequest::new(url, "bad.bin", dir.path().to_path_buf())
        .with_segments(2)
        .with_checksum(wrong, HashAlgorithm::Sha256);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Failed { .. } => {}
        other => panic!("expected failure, got {:?}", other),
    }

    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Failed);
    // Partial or corrupt data must never reach the destination
    assert!(!dir.path().join("bad.bin").exists());
}

#[tokio::test]
async fn test_failover_to_healthy_mirror() {
    let body = test_body(64 * 1024);
    let dead = spawn_server(Vec::new(), ServerMode::AlwaysFail).await;
    let alive = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, _repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(dead, "mirrored.bin", dir.path().to_path_buf())
        .with_segments(4)
        .with_mirrors(vec![alive]);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion via mirror, got {:?}", other),
    }

    let written = std::fs::read(dir.path().join("mirrored.bin")).unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn test_pause_persists_offsets_and_resume_is_lossless() {
    let body = test_body(256 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    // Throttled hard enough that the download cannot finish before the pause
    let request = DownloadRequest::new(url, "slow.bin", dir.path().to_path_buf())
        .with_segments(4)
        .with_speed_limit(32 * 1024);
    let id = orchestrator.start_download(request).await.unwrap();

    // Wait for some bytes to land before pausing
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let DownloadEvent::Progress { snapshot } = events.recv().await.unwrap() {
                if snapshot.id == id && snapshot.downloaded_bytes > 0 {
                    break;
                }
            }
        }
    })
    .await
    .expect("no progress observed");

    orchestrator.pause_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Paused);

    // Pause returns only after the snapshot is durable: the persisted
    // per-segment offsets must agree with the reported progress
    let reported = orchestrator.get_progress(id).await.unwrap().unwrap();
    let persisted: u64 = repo
        .load_segments(id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.downloaded)
        .sum();
    assert_eq!(reported.downloaded_bytes, persisted);
    assert!(persisted < body.len() as u64);

    // A second pause is a no-op
    orchestrator.pause_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Paused);

    orchestrator.resume_download(id).await.unwrap();
    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion after resume, got {:?}", other),
    }

    let written = std::fs::read(dir.path().join("slow.bin")).unwrap();
    assert_eq!(written, body);
}

#[tokio::test]
async fn test_cancel_queued_download() {
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, repo) = test_orchestrator();
    let request = DownloadRequest::new(
        "http://127.0.0.1:1/never.bin",
        "never.bin",
        dir.path().to_path_buf(),
    )
    .queued();
    let id = orchestrator.start_download(request).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Pending);

    orchestrator.cancel_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Cancelled);
    assert!(repo.load_segments(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_download_removes_partial_data() {
    let body = test_body(256 * 1024);
    let url = spawn_server(body, ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "doomed.bin", dir.path().to_path_buf())
        .with_segments(4)
        .with_speed_limit(32 * 1024);
    let id = orchestrator.start_download(request).await.unwrap();

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let DownloadEvent::Progress { snapshot } = events.recv().await.unwrap() {
                if snapshot.id == id && snapshot.downloaded_bytes > 0 {
                    break;
                }
            }
        }
    })
    .await
    .expect("no progress observed");

    orchestrator.cancel_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Cancelled);
    assert!(repo.load_segments(id).await.unwrap().is_empty());
    assert!(!dir.path().join("doomed.bin").exists());
    assert!(!dir.path().join(format!("doomed.bin.{}.part", id)).exists());
}

#[tokio::test]
async fn test_unsized_body_streams_to_eof() {
    let body = test_body(96 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Unsized).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request =
        DownloadRequest::new(url, "nosize.bin", dir.path().to_path_buf()).with_segments(8);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion, got {:?}", other),
    }

    let written = std::fs::read(dir.path().join("nosize.bin")).unwrap();
    assert_eq!(written, body);

    // The size was unknowable up front; EOF is what established it
    let task = repo.load_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, DownloadStatus::Completed);
    assert_eq!(task.total_bytes, Some(body.len() as u64));
    assert_eq!(task.downloaded_bytes, body.len() as u64);
    assert!(!dir.path().join(format!("nosize.bin.{}.part", id)).exists());
}

#[tokio::test]
async fn test_unsized_body_never_completes_empty() {
    let body = test_body(16 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Unsized).await;
    let dir = tempfile::tempdir().unwrap();

    // Verification pins the payload: a download that mistook "no length
    // disclosed" for "zero bytes" cannot pass
    let expected = checksum::compute_bytes(&body, HashAlgorithm::Sha256);
    let (orchestrator, _repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "pinned.bin", dir.path().to_path_buf())
        .with_checksum(expected, HashAlgorithm::Sha256);
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(
        std::fs::read(dir.path().join("pinned.bin")).unwrap(),
        body
    );
}

#[tokio::test]
async fn test_pause_and_resume_recover_task_orphaned_by_crash() {
    let body = test_body(64 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    // A record left `Downloading` by a process that died: no live handle
    // exists for it in this orchestrator
    let repo = Arc::new(MemoryRepository::new());
    let mut task = DownloadTask::new(url, "orphan.bin", dir.path().to_path_buf());
    task.status = DownloadStatus::Downloading;
    task.downloaded_bytes = 1234;
    let id = task.id;
    repo.save_task(&task).await.unwrap();

    let orchestrator = DownloadOrchestrator::new(Config::default(), repo.clone()).unwrap();

    // Pause flips the stranded record directly
    orchestrator.pause_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Paused);

    let mut events = orchestrator.subscribe();
    orchestrator.resume_download(id).await.unwrap();
    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion after recovery, got {:?}", other),
    }
    assert_eq!(
        std::fs::read(dir.path().join("orphan.bin")).unwrap(),
        body
    );
}

#[tokio::test]
async fn test_resume_directly_recovers_orphaned_record() {
    let body = test_body(32 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let repo = Arc::new(MemoryRepository::new());
    let mut task = DownloadTask::new(url, "stranded.bin", dir.path().to_path_buf());
    task.status = DownloadStatus::Downloading;
    let id = task.id;
    repo.save_task(&task).await.unwrap();

    let orchestrator = DownloadOrchestrator::new(Config::default(), repo.clone()).unwrap();
    let mut events = orchestrator.subscribe();

    // Resume accepts the stranded `Downloading` record without an
    // intervening pause
    orchestrator.resume_download(id).await.unwrap();
    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion after recovery, got {:?}", other),
    }
    assert_eq!(
        std::fs::read(dir.path().join("stranded.bin")).unwrap(),
        body
    );
}

#[tokio::test]
async fn test_retry_relaunches_failed_download() {
    let body = test_body(32 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    // A task that failed in an earlier run, now pointing at a healthy source
    let repo = Arc::new(MemoryRepository::new());
    let mut task = DownloadTask::new(url, "again.bin", dir.path().to_path_buf());
    task.status = DownloadStatus::Failed;
    task.retry_count = 3;
    task.last_error = Some("connection refused".to_string());
    let id = task.id;
    repo.save_task(&task).await.unwrap();

    let orchestrator = DownloadOrchestrator::new(Config::default(), repo.clone()).unwrap();
    let mut events = orchestrator.subscribe();

    orchestrator.retry_download(id).await.unwrap();
    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion after retry, got {:?}", other),
    }

    let task = repo.load_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, DownloadStatus::Completed);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.last_error, None);
    assert_eq!(
        std::fs::read(dir.path().join("again.bin")).unwrap(),
        body
    );
}

#[tokio::test]
async fn test_retry_rejected_outside_failed_state() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _repo) = test_orchestrator();

    let request = DownloadRequest::new(
        "http://127.0.0.1:1/idle.bin",
        "idle.bin",
        dir.path().to_path_buf(),
    )
    .queued();
    let id = orchestrator.start_download(request).await.unwrap();

    let err = orchestrator.retry_download(id).await.unwrap_err();
    assert!(matches!(err, DownloadError::InvalidState { .. }));

    let err = orchestrator.retry_download(DownloadId::new()).await.unwrap_err();
    assert!(matches!(err, DownloadError::TaskNotFound { .. }));
}

#[tokio::test]
async fn test_cancel_paused_download_releases_everything() {
    let body = test_body(256 * 1024);
    let url = spawn_server(body, ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();

    let (orchestrator, repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "halted.bin", dir.path().to_path_buf())
        .with_segments(4)
        .with_speed_limit(32 * 1024);
    let id = orchestrator.start_download(request).await.unwrap();

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let DownloadEvent::Progress { snapshot } = events.recv().await.unwrap() {
                if snapshot.id == id && snapshot.downloaded_bytes > 0 {
                    break;
                }
            }
        }
    })
    .await
    .expect("no progress observed");

    orchestrator.pause_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Paused);

    orchestrator.cancel_download(id).await.unwrap();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Cancelled);
    assert!(repo.load_segments(id).await.unwrap().is_empty());
    assert!(!dir.path().join("halted.bin").exists());
    assert!(!dir.path().join(format!("halted.bin.{}.part", id)).exists());
}

#[tokio::test]
async fn test_unknown_id_yields_failed_sentinel() {
    let (orchestrator, _repo) = test_orchestrator();
    let id = DownloadId::new();
    assert_eq!(orchestrator.get_status(id).await, DownloadStatus::Failed);
    assert!(orchestrator.get_progress(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_name_collision_gets_numeric_suffix() {
    let body = test_body(8 * 1024);
    let url = spawn_server(body.clone(), ServerMode::Ranged).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("taken.bin"), b"existing").unwrap();

    let (orchestrator, _repo) = test_orchestrator();
    let mut events = orchestrator.subscribe();

    let request = DownloadRequest::new(url, "taken.bin", dir.path().to_path_buf());
    let id = orchestrator.start_download(request).await.unwrap();

    match wait_for_outcome(&mut events, id).await {
        DownloadEvent::Completed { .. } => {}
        other => panic!("expected completion, got {:?}", other),
    }

    // The pre-existing file is untouched; ours landed beside it
    assert_eq!(
        std::fs::read(dir.path().join("taken.bin")).unwrap(),
        b"existing"
    );
    assert_eq!(
        std::fs::read(dir.path().join("taken (1).bin")).unwrap(),
        body
    );
}
