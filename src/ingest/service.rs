//! Ingest service
//!
//! Caller-facing entry points. Ties the chunk receiver to the orchestrator:
//! the request whose range completes a session spawns its processing run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use super::orchestrator::Orchestrator;
use super::ranges::RangeTracker;
use super::receiver::ChunkReceiver;
use super::store::SessionStore;
use super::types::{
    negotiate_chunk_size, ByteRange, CreateSessionRequest, NewSession, Phase, PhaseEvent,
    SessionStatus, UploadSession, DEFAULT_CHUNK_SIZE, MAX_UPLOAD_SIZE,
};
use crate::error::{IngestError, Result};

/// Phases a session can be stranded in after a crash
const PROCESSING_PHASES: &[Phase] = &[Phase::Compressing, Phase::Hashing, Phase::UploadingS3];

/// Limits applied when opening sessions
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub default_chunk_size: u64,
    pub max_upload_size: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload_size: MAX_UPLOAD_SIZE,
        }
    }
}

/// Shared ingest state, cheap to clone
#[derive(Clone)]
pub struct IngestService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Arc<dyn SessionStore>,
    receiver: ChunkReceiver,
    orchestrator: Orchestrator,
    limits: SessionLimits,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        receiver: ChunkReceiver,
        orchestrator: Orchestrator,
        limits: SessionLimits,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                store,
                receiver,
                orchestrator,
                limits,
            }),
        }
    }

    /// Open a new upload session
    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<UploadSession> {
        let filename = req.filename.trim();
        if filename.is_empty() {
            return Err(IngestError::InvalidSession("filename must not be empty".into()));
        }
        if req.total_size == 0 {
            return Err(IngestError::InvalidSession("total_size must be positive".into()));
        }
        if req.total_size > self.inner.limits.max_upload_size {
            return Err(IngestError::InvalidSession(format!(
                "total_size {} exceeds maximum of {} bytes",
                req.total_size, self.inner.limits.max_upload_size
            )));
        }

        let chunk_size = negotiate_chunk_size(req.chunk_size, self.inner.limits.default_chunk_size);
        let mime_type = if req.mime_type.trim().is_empty() {
            "application/octet-stream".to_string()
        } else {
            req.mime_type.trim().to_string()
        };

        self.inner
            .receiver
            .open(NewSession {
                id: Uuid::new_v4(),
                owner_id: req.owner_id,
                filename: filename.to_string(),
                mime_type,
                total_size: req.total_size,
                chunk_size,
                tmp_path: Default::default(),
                expected_checksum: req.expected_checksum.filter(|c| !c.trim().is_empty()),
            })
            .await
    }

    /// Accept bytes `[start, end)` for a session.
    ///
    /// Safe to retry: a range that was already recorded is acknowledged
    /// without rewriting it.
    pub async fn upload_range(
        &self,
        session_id: Uuid,
        start: u64,
        end: u64,
        data: &[u8],
    ) -> Result<SessionStatus> {
        let outcome = self
            .inner
            .receiver
            .receive(session_id, ByteRange::new(start, end), data)
            .await?;

        if outcome.claimed_processing {
            self.inner.orchestrator.publish(PhaseEvent {
                session_id,
                from: Phase::Receiving,
                to: Phase::Compressing,
            });
            self.spawn_processing(session_id);
        }

        session_status(&outcome.session)
    }

    /// Current state of a session
    pub async fn status(&self, session_id: Uuid) -> Result<SessionStatus> {
        let session = self.inner.store.load(session_id).await?;
        session_status(&session)
    }

    /// Subscribe to phase transitions of every session
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.inner.orchestrator.subscribe()
    }

    /// Wait until a session is `completed` or `failed`.
    ///
    /// A run that stops on a store error leaves the session in a processing
    /// phase with no further events, so the wait is bounded by `timeout`.
    pub async fn wait_for_terminal(&self, session_id: Uuid, timeout: Duration) -> Result<SessionStatus> {
        let mut events = self.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            let status = self.status(session_id).await?;
            if status.phase.is_terminal() {
                return Ok(status);
            }

            match timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => {
                    return Err(IngestError::Internal("phase event channel closed".into()));
                }
                Err(_) => {
                    return Err(IngestError::ProcessingTimeout {
                        id: session_id,
                        phase: status.phase,
                    });
                }
            }
        }
    }

    /// Re-drive sessions left mid-processing by a previous process.
    ///
    /// Returns the number of sessions handed back to the orchestrator.
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let stranded = self.inner.store.list_by_phase(PROCESSING_PHASES).await?;

        for session in &stranded {
            tracing::info!(
                session_id = %session.id,
                phase = %session.phase,
                "Resuming interrupted processing"
            );
            self.spawn_processing(session.id);
        }

        Ok(stranded.len())
    }

    fn spawn_processing(&self, session_id: Uuid) {
        let orchestrator = self.inner.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(session_id).await {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "Processing interrupted, session left for recovery"
                );
            }
        });
    }
}

fn session_status(session: &UploadSession) -> Result<SessionStatus> {
    let missing_ranges = if session.phase == Phase::Receiving {
        RangeTracker::from_ranges(session.total_size, &session.uploaded_ranges)?.missing()
    } else {
        Vec::new()
    };

    Ok(SessionStatus {
        session_id: session.id,
        phase: session.phase,
        upload_offset: session.upload_offset,
        total_size: session.total_size,
        chunk_size: session.chunk_size,
        storage_key: session.storage_key.clone(),
        checksum: session.checksum_sha256_base64.clone(),
        failure_reason: session.failure_reason,
        missing_ranges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::receiver::StagingArea;
    use crate::ingest::store::MemorySessionStore;
    use crate::ingest::types::{SessionPatch, MIN_CHUNK_SIZE};
    use crate::storage::LocalObjectStore;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (IngestService, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        let staging = StagingArea::new(dir.path().join("staging"));
        let remote = Arc::new(LocalObjectStore::new(dir.path().join("objects")));
        let orchestrator = Orchestrator::builder(store.clone(), staging.clone(), remote).build();
        let receiver = ChunkReceiver::new(store.clone(), staging);
        let limits = SessionLimits {
            default_chunk_size: MIN_CHUNK_SIZE,
            max_upload_size: 1024,
        };
        (IngestService::new(store.clone(), receiver, orchestrator, limits), store)
    }

    fn request(total_size: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            filename: "clip.mp4".to_string(),
            mime_type: "video/mp4".to_string(),
            total_size,
            chunk_size: 0,
            owner_id: None,
            expected_checksum: None,
        }
    }

    #[tokio::test]
    async fn test_create_session_validates_metadata() {
        let dir = TempDir::new().unwrap();
        let (service, store) = service(&dir);

        let zero = service.create_session(request(0)).await;
        assert!(matches!(zero, Err(IngestError::InvalidSession(_))));

        let too_big = service.create_session(request(1025)).await;
        assert!(matches!(too_big, Err(IngestError::InvalidSession(_))));

        let mut unnamed = request(10);
        unnamed.filename = "  ".to_string();
        let unnamed = service.create_session(unnamed).await;
        assert!(matches!(unnamed, Err(IngestError::InvalidSession(_))));

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_negotiates_chunk_size() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir);

        let mut req = request(100);
        req.chunk_size = 1;
        let session = service.create_session(req).await.unwrap();

        assert_eq!(session.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(session.phase, Phase::Receiving);
        let staged = tokio::fs::metadata(&session.tmp_path).await.unwrap();
        assert_eq!(staged.len(), 100);
    }

    #[tokio::test]
    async fn test_status_reports_missing_ranges() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir);
        let session = service.create_session(request(10)).await.unwrap();

        let status = service.upload_range(session.id, 4, 7, b"abc").await.unwrap();
        assert_eq!(status.upload_offset, 0);
        assert_eq!(
            status.missing_ranges,
            vec![ByteRange::new(0, 4), ByteRange::new(7, 10)]
        );

        let status = service.status(session.id).await.unwrap();
        assert_eq!(status.phase, Phase::Receiving);
        assert!(status.storage_key.is_none());
        assert!(status.checksum.is_none());
    }

    #[tokio::test]
    async fn test_status_unknown_session() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir);

        let result = service.status(Uuid::new_v4()).await;
        assert!(matches!(result, Err(IngestError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_wait_for_terminal_times_out_on_stalled_session() {
        let dir = TempDir::new().unwrap();
        let (service, store) = service(&dir);
        let session = service.create_session(request(4)).await.unwrap();

        // Claimed for processing, but no run was ever spawned
        store
            .compare_and_swap(session.id, session.version, SessionPatch::phase(Phase::Hashing))
            .await
            .unwrap();

        let result = service
            .wait_for_terminal(session.id, Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(IngestError::ProcessingTimeout { phase: Phase::Hashing, .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_in_flight_finishes_stranded_session() {
        let dir = TempDir::new().unwrap();
        let (service, store) = service(&dir);
        let session = service.create_session(request(4)).await.unwrap();
        tokio::fs::write(&session.tmp_path, b"data").await.unwrap();

        // Simulate a crash right after the claiming swap
        store
            .compare_and_swap(
                session.id,
                session.version,
                SessionPatch {
                    uploaded_ranges: Some(vec![ByteRange::new(0, 4)]),
                    upload_offset: Some(4),
                    phase: Some(Phase::Compressing),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(service.recover_in_flight().await.unwrap(), 1);

        let status = service
            .wait_for_terminal(session.id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status.phase, Phase::Completed);
        assert!(status.storage_key.is_some());
        assert!(status.missing_ranges.is_empty());
    }
}
