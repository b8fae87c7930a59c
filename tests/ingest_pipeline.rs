//! End-to-end ingest: ranged uploads through to a committed object

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use uuid::Uuid;

use video_ingest::db::{create_pool, SqliteSessionStore};
use video_ingest::ingest::{
    ChunkReceiver, CreateSessionRequest, FailureReason, IngestService, MemorySessionStore,
    Orchestrator, Phase, PhaseEvent, SessionLimits, SessionStore, StagingArea,
};
use video_ingest::pipeline::{
    compute_sha256_base64, CompressedArtifact, CompressionMode, CompressionPolicy, Compressor,
    GzipCompressor,
};
use video_ingest::storage::LocalObjectStore;

/// Gzip compressor that counts its invocations
#[derive(Default)]
struct CountingCompressor {
    runs: AtomicUsize,
    inner: GzipCompressor,
}

#[async_trait]
impl Compressor for CountingCompressor {
    async fn compress(&self, src: &Path, dst: &Path) -> std::io::Result<CompressedArtifact> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.compress(src, dst).await
    }
}

struct Harness {
    _dir: TempDir,
    service: IngestService,
    objects: LocalObjectStore,
    compressor: Arc<CountingCompressor>,
}

fn harness_with(dir: TempDir, store: Arc<dyn SessionStore>, mode: CompressionMode) -> Harness {
    let staging = StagingArea::new(dir.path().join("staging"));
    let objects = LocalObjectStore::new(dir.path().join("objects"));
    let compressor = Arc::new(CountingCompressor::default());

    let orchestrator = Orchestrator::builder(store.clone(), staging.clone(), Arc::new(objects.clone()))
        .compressor(compressor.clone())
        .compression_policy(CompressionPolicy::new(mode))
        .key_prefix("uploads")
        .build();
    let receiver = ChunkReceiver::new(store.clone(), staging);
    let service = IngestService::new(store, receiver, orchestrator, SessionLimits::default());

    Harness {
        _dir: dir,
        service,
        objects,
        compressor,
    }
}

fn harness(mode: CompressionMode) -> Harness {
    harness_with(TempDir::new().unwrap(), Arc::new(MemorySessionStore::new()), mode)
}

fn request(total_size: u64, mime_type: &str, expected: Option<String>) -> CreateSessionRequest {
    CreateSessionRequest {
        filename: "board meeting.y4m".to_string(),
        mime_type: mime_type.to_string(),
        total_size,
        chunk_size: 0,
        owner_id: Some("user-42".to_string()),
        expected_checksum: expected,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Collect this session's transitions until it reaches a terminal phase
async fn transitions_until_terminal(
    events: &mut broadcast::Receiver<PhaseEvent>,
    session_id: Uuid,
) -> Vec<(Phase, Phase)> {
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        if event.session_id != session_id {
            continue;
        }
        seen.push((event.from, event.to));
        if event.to.is_terminal() {
            return seen;
        }
    }
}

#[tokio::test]
async fn test_two_ranges_complete_the_pipeline() {
    let h = harness(CompressionMode::Always);
    let mut events = h.service.subscribe();
    let data = payload(1024);

    let session = h
        .service
        .create_session(request(1024, "video/x-raw", None))
        .await
        .unwrap();

    // Second half first: nothing contiguous yet
    let status = h
        .service
        .upload_range(session.id, 512, 1024, &data[512..])
        .await
        .unwrap();
    assert_eq!(status.upload_offset, 0);
    assert_eq!(status.phase, Phase::Receiving);

    let status = h
        .service
        .upload_range(session.id, 0, 512, &data[..512])
        .await
        .unwrap();
    assert_eq!(status.upload_offset, 1024);
    assert!(status.missing_ranges.is_empty());

    let seen = transitions_until_terminal(&mut events, session.id).await;
    assert_eq!(
        seen,
        vec![
            (Phase::Receiving, Phase::Compressing),
            (Phase::Compressing, Phase::Hashing),
            (Phase::Hashing, Phase::UploadingS3),
            (Phase::UploadingS3, Phase::Completed),
        ]
    );

    let status = h.service.status(session.id).await.unwrap();
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.upload_offset, 1024);
    let key = status.storage_key.unwrap();
    assert_eq!(key, format!("uploads/{}/board_meeting.y4m.gz", session.id));

    // The stored object is the gzip artifact the checksum was taken over
    let stored = tokio::fs::read(h.objects.key_path(&key).unwrap()).await.unwrap();
    assert_eq!(status.checksum, Some(compute_sha256_base64(&stored)));
    assert_eq!(h.compressor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_declared_checksum_mismatch_fails_without_upload() {
    let h = harness(CompressionMode::Never);
    let mut events = h.service.subscribe();
    let data = payload(300);

    let session = h
        .service
        .create_session(request(300, "video/mp4", Some(compute_sha256_base64(b"other bytes"))))
        .await
        .unwrap();
    h.service
        .upload_range(session.id, 0, 300, &data)
        .await
        .unwrap();

    let seen = transitions_until_terminal(&mut events, session.id).await;
    assert_eq!(seen.last(), Some(&(Phase::Hashing, Phase::Failed)));

    let status = h.service.status(session.id).await.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.failure_reason, Some(FailureReason::ChecksumMismatch));
    assert!(status.storage_key.is_none());
    assert!(!h.objects.root().exists());
}

#[tokio::test]
async fn test_concurrent_final_ranges_process_once() {
    let h = harness(CompressionMode::Always);
    let mut events = h.service.subscribe();
    let data = payload(64);

    let session = h
        .service
        .create_session(request(64, "video/x-raw", None))
        .await
        .unwrap();
    h.service
        .upload_range(session.id, 0, 32, &data[..32])
        .await
        .unwrap();

    // Many retries of the last range race to complete the session
    let mut handles = Vec::new();
    for _ in 0..12 {
        let service = h.service.clone();
        let tail = data[32..].to_vec();
        handles.push(tokio::spawn(async move {
            service.upload_range(session.id, 32, 64, &tail).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().upload_offset, 64);
    }

    let seen = transitions_until_terminal(&mut events, session.id).await;
    assert_eq!(seen.first(), Some(&(Phase::Receiving, Phase::Compressing)));
    assert_eq!(seen.last(), Some(&(Phase::UploadingS3, Phase::Completed)));
    assert_eq!(seen.len(), 4);
    assert_eq!(h.compressor.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resumed_client_uploads_only_missing_ranges() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ingest.db").display());
    let store = Arc::new(SqliteSessionStore::new(create_pool(&url).await.unwrap()));
    let h = harness_with(dir, store, CompressionMode::Auto);
    let mut events = h.service.subscribe();
    let data = payload(2000);

    let session = h
        .service
        .create_session(request(2000, "video/webm", None))
        .await
        .unwrap();
    h.service
        .upload_range(session.id, 0, 700, &data[..700])
        .await
        .unwrap();
    h.service
        .upload_range(session.id, 1500, 2000, &data[1500..])
        .await
        .unwrap();

    // A reconnecting client asks what is left
    let status = h.service.status(session.id).await.unwrap();
    assert_eq!(status.upload_offset, 700);
    for gap in status.missing_ranges {
        let chunk = &data[gap.start as usize..gap.end as usize];
        h.service
            .upload_range(session.id, gap.start, gap.end, chunk)
            .await
            .unwrap();
    }

    transitions_until_terminal(&mut events, session.id).await;
    let status = h.service.status(session.id).await.unwrap();
    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.checksum, Some(compute_sha256_base64(&data)));

    // webm is already compressed, so the raw bytes are stored as-is
    let key = status.storage_key.unwrap();
    assert!(key.ends_with("/board_meeting.y4m"));
    let stored = tokio::fs::read(h.objects.key_path(&key).unwrap()).await.unwrap();
    assert_eq!(stored, data);
    assert_eq!(h.compressor.runs.load(Ordering::SeqCst), 0);
}
