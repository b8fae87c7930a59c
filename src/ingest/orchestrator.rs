//! Phase Orchestrator
//!
//! Drives a fully received session through post-receipt processing:
//!
//! ```text
//! receiving -> compressing -> hashing -> uploading_s3 -> completed
//!                   |            |             |
//!                   +------------+-------------+--> failed
//! ```
//!
//! Each step runs an adapter, then commits the outcome with exactly one
//! compare-and-swap. A swap that loses to another worker (the phase already
//! moved on) counts as success and its output is thrown away, so `run` can be
//! invoked redundantly, even concurrently, without recording anything twice.
//! Compression writes to a per-attempt file for the same reason: a losing
//! attempt never touches the artifact the winner recorded.

use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::receiver::StagingArea;
use super::store::SessionStore;
use super::types::{Phase, PhaseEvent, SessionPatch, UploadSession};
use crate::error::{IngestError, Result};
use crate::pipeline::{
    digests_match, ChecksumComputer, CompressionPolicy, Compressor, GzipCompressor, RetryPolicy,
    Sha256Checksum,
};
use crate::storage::{object_key, RemoteStore};

/// Capacity of the phase event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default object key prefix
pub const DEFAULT_KEY_PREFIX: &str = "videos";

/// Runs compress, hash and upload for one session at a time
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    compressor: Arc<dyn Compressor>,
    checksum: Arc<dyn ChecksumComputer>,
    remote: Arc<dyn RemoteStore>,
    compression: CompressionPolicy,
    retry: RetryPolicy,
    key_prefix: String,
    events: broadcast::Sender<PhaseEvent>,
}

/// Builder for [`Orchestrator`]; adapters default to gzip and SHA-256
pub struct OrchestratorBuilder {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
    remote: Arc<dyn RemoteStore>,
    compressor: Arc<dyn Compressor>,
    checksum: Arc<dyn ChecksumComputer>,
    compression: CompressionPolicy,
    retry: RetryPolicy,
    key_prefix: String,
}

impl OrchestratorBuilder {
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn checksum(mut self, checksum: Arc<dyn ChecksumComputer>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn compression_policy(mut self, policy: CompressionPolicy) -> Self {
        self.compression = policy;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Orchestrator {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Orchestrator {
            inner: Arc::new(OrchestratorInner {
                store: self.store,
                staging: self.staging,
                compressor: self.compressor,
                checksum: self.checksum,
                remote: self.remote,
                compression: self.compression,
                retry: self.retry,
                key_prefix: self.key_prefix,
                events,
            }),
        }
    }
}

impl Orchestrator {
    pub fn builder(
        store: Arc<dyn SessionStore>,
        staging: StagingArea,
        remote: Arc<dyn RemoteStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            staging,
            remote,
            compressor: Arc::new(GzipCompressor::default()),
            checksum: Arc::new(Sha256Checksum),
            compression: CompressionPolicy::default(),
            retry: RetryPolicy::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Subscribe to phase transitions of every session
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: PhaseEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Advance `session_id` until it is terminal or not yet fully received.
    ///
    /// Step failures end the session in `failed` and are not returned as
    /// errors. An `Err` means the store itself failed; the session keeps its
    /// processing phase and can be re-driven later.
    pub async fn run(&self, session_id: Uuid) -> Result<UploadSession> {
        loop {
            let session = self.inner.store.load(session_id).await?;

            let outcome = match session.phase {
                Phase::Receiving | Phase::Completed | Phase::Failed => return Ok(session),
                Phase::Compressing => self.compress(&session).await,
                Phase::Hashing => self.hash(&session).await,
                Phase::UploadingS3 => self.upload(&session).await,
            };

            let patch = match outcome {
                Ok(patch) => patch,
                Err(err) => match err.failure_reason() {
                    Some(reason) => {
                        tracing::error!(
                            session_id = %session_id,
                            phase = %session.phase,
                            reason = %reason,
                            error = %err,
                            "Processing step failed"
                        );
                        SessionPatch::failed(reason)
                    }
                    None => return Err(err),
                },
            };

            let artifact = patch.gzip_tmp_path.clone();
            if self.transition(&session, patch).await?.is_none() {
                if let Some(path) = artifact {
                    discard(&path).await;
                }
            }
        }
    }

    // ========================================================================
    // Steps
    // ========================================================================

    async fn compress(&self, session: &UploadSession) -> Result<SessionPatch> {
        if !self.inner.compression.should_compress(&session.mime_type) {
            tracing::debug!(
                session_id = %session.id,
                mime_type = %session.mime_type,
                "Skipping compression"
            );
            return Ok(SessionPatch::phase(Phase::Hashing));
        }

        let attempt = Uuid::new_v4();
        let partial = self.inner.staging.gzip_partial_path(session.id, attempt);
        let dst = self.inner.staging.gzip_path(session.id, attempt);

        let compressed = match self.inner.compressor.compress(&session.tmp_path, &partial).await {
            Ok(artifact) => fs::rename(&partial, &dst).await.map(|_| artifact),
            Err(e) => Err(e),
        };
        let artifact = match compressed {
            Ok(artifact) => artifact,
            Err(e) => {
                discard(&partial).await;
                return Err(IngestError::CompressionFailed(e.to_string()));
            }
        };

        tracing::info!(
            session_id = %session.id,
            input_size = artifact.input_size,
            output_size = artifact.output_size,
            "Compressed staged upload"
        );

        Ok(SessionPatch {
            phase: Some(Phase::Hashing),
            gzip_tmp_path: Some(dst),
            ..SessionPatch::default()
        })
    }

    async fn hash(&self, session: &UploadSession) -> Result<SessionPatch> {
        let digest = self
            .inner
            .checksum
            .digest(session.canonical_artifact())
            .await
            .map_err(|e| IngestError::HashingFailed(e.to_string()))?;

        if let Some(expected) = &session.expected_checksum {
            if !digests_match(expected, &digest) {
                return Err(IngestError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        Ok(SessionPatch {
            phase: Some(Phase::UploadingS3),
            checksum_sha256_base64: Some(digest),
            ..SessionPatch::default()
        })
    }

    async fn upload(&self, session: &UploadSession) -> Result<SessionPatch> {
        let compressed = session.gzip_tmp_path.is_some();
        let key = object_key(&self.inner.key_prefix, session.id, &session.filename, compressed);
        let content_type = if compressed {
            "application/gzip"
        } else {
            session.mime_type.as_str()
        };

        let remote = &self.inner.remote;
        let path = session.canonical_artifact().as_path();
        let key_ref = key.as_str();
        self.inner
            .retry
            .run("put_object", move || remote.put_file(key_ref, path, content_type))
            .await
            .map_err(|e| IngestError::UploadFailed(e.to_string()))?;

        tracing::info!(session_id = %session.id, storage_key = %key, "Uploaded artifact");

        Ok(SessionPatch {
            phase: Some(Phase::Completed),
            storage_key: Some(key),
            ..SessionPatch::default()
        })
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Commit `patch` against the phase `session` was observed in.
    ///
    /// Returns `None` when another worker already moved the session on.
    async fn transition(
        &self,
        session: &UploadSession,
        patch: SessionPatch,
    ) -> Result<Option<UploadSession>> {
        let from = session.phase;
        let mut version = session.version;

        loop {
            match self
                .inner
                .store
                .compare_and_swap(session.id, version, patch.clone())
                .await
            {
                Ok(updated) => {
                    tracing::info!(
                        session_id = %session.id,
                        from = %from,
                        to = %updated.phase,
                        version = updated.version,
                        "Session phase advanced"
                    );
                    self.publish(PhaseEvent {
                        session_id: session.id,
                        from,
                        to: updated.phase,
                    });
                    return Ok(Some(updated));
                }
                Err(IngestError::VersionConflict { .. }) => {
                    let current = self.inner.store.load(session.id).await?;
                    if current.phase != from {
                        tracing::debug!(
                            session_id = %session.id,
                            from = %from,
                            now = %current.phase,
                            "Transition already taken by another worker"
                        );
                        return Ok(None);
                    }
                    version = current.version;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Remove a staged artifact this run produced but could not record
async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Discarded unrecorded artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove artifact"),
    }
}

// ============================================================================
// Tests
// ============================================================================
