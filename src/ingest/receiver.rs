//! Chunk Receiver
//!
//! Accepts byte ranges from clients and writes them into a per-session
//! staging file at their absolute offset. Ranges may arrive out of order,
//! concurrently, or more than once.
//!
//! Writes to disjoint ranges never take a lock: each call opens its own file
//! handle. Only the metadata update is serialized, through the session
//! store's compare-and-swap, and the data is synced to disk before that
//! swap so an acknowledged range is always readable afterwards. Only the
//! parts of a range not yet recorded are written; recorded bytes are never
//! rewritten, so a retry cannot disturb a file that is already being processed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use super::ranges::RangeTracker;
use super::store::SessionStore;
use super::types::{ByteRange, NewSession, Phase, SessionPatch, UploadSession};
use crate::error::{IngestError, Result};

// ============================================================================
// Staging Area
// ============================================================================

/// Local directory holding per-session staging files
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Raw staged file for a session
    pub fn raw_path(&self, session_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.part", session_id))
    }

    /// Compressed staged file for one compression attempt.
    ///
    /// Each attempt gets its own name, so a run that loses the race to
    /// record its artifact never touches the winner's file.
    pub fn gzip_path(&self, session_id: Uuid, attempt: Uuid) -> PathBuf {
        self.root.join(format!("{}.{}.gz", session_id, attempt))
    }

    /// Where an attempt writes before its output is complete
    pub fn gzip_partial_path(&self, session_id: Uuid, attempt: Uuid) -> PathBuf {
        self.root.join(format!("{}.{}.gz.tmp", session_id, attempt))
    }

    /// Create the raw staging file, preallocated to the declared size
    pub async fn prepare(&self, session_id: Uuid, total_size: u64) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;

        let path = self.raw_path(session_id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(total_size).await?;

        Ok(path)
    }

    /// Write `data` at `offset` and flush it to stable storage
    pub async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Result of accepting one byte range
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    /// Session as of the last successful swap (or load, if nothing changed)
    pub session: UploadSession,

    /// Whether the range added any new bytes
    pub changed: bool,

    /// True for exactly one caller per session: the one whose swap moved
    /// the session from `receiving` to `compressing`
    pub claimed_processing: bool,
}

/// Writes client ranges into staging and records them in the session store
#[derive(Clone)]
pub struct ChunkReceiver {
    store: Arc<dyn SessionStore>,
    staging: StagingArea,
}

impl ChunkReceiver {
    pub fn new(store: Arc<dyn SessionStore>, staging: StagingArea) -> Self {
        Self { store, staging }
    }

    /// Preallocate staging for a new session and persist its record
    pub async fn open(&self, mut meta: NewSession) -> Result<UploadSession> {
        meta.tmp_path = self.staging.prepare(meta.id, meta.total_size).await?;
        let session = self.store.create(meta).await?;

        tracing::info!(
            session_id = %session.id,
            filename = %session.filename,
            total_size = session.total_size,
            chunk_size = session.chunk_size,
            "Opened upload session"
        );

        Ok(session)
    }

    /// Accept `data` for `range` of session `session_id`
    pub async fn receive(
        &self,
        session_id: Uuid,
        range: ByteRange,
        data: &[u8],
    ) -> Result<ReceiveOutcome> {
        let mut session = self.store.load(session_id).await?;

        range.validate(session.total_size)?;
        if data.len() as u64 != range.len() {
            return Err(IngestError::invalid_range(
                range,
                format!("expected {} bytes, got {}", range.len(), data.len()),
            ));
        }

        let tracker = RangeTracker::from_ranges(session.total_size, &session.uploaded_ranges)?;
        let gaps = tracker.gaps_in(range);
        if gaps.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                range = %range,
                "Range already received, ignoring"
            );
            return Ok(ReceiveOutcome {
                session,
                changed: false,
                claimed_processing: false,
            });
        }

        // Uncovered bytes can only exist while the session is still receiving
        if session.phase != Phase::Receiving {
            return Err(IngestError::InvalidSession(format!(
                "session {} is {}, not receiving",
                session_id, session.phase
            )));
        }

        for gap in &gaps {
            let from = (gap.start - range.start) as usize;
            let to = (gap.end - range.start) as usize;
            self.staging.write_at(&session.tmp_path, gap.start, &data[from..to]).await?;
        }

        loop {
            let mut tracker =
                RangeTracker::from_ranges(session.total_size, &session.uploaded_ranges)?;
            if tracker.covers(range) {
                // A concurrent retry of the same bytes won the swap
                if session.phase != Phase::Receiving {
                    tracing::warn!(
                        session_id = %session_id,
                        range = %range,
                        phase = %session.phase,
                        "Range was recorded by a concurrent request while this one was writing"
                    );
                }
                return Ok(ReceiveOutcome {
                    session,
                    changed: false,
                    claimed_processing: false,
                });
            }
            tracker.insert(range)?;

            let upload_offset = tracker.contiguous_offset();
            let claim = upload_offset == session.total_size && session.phase == Phase::Receiving;
            let patch = SessionPatch {
                uploaded_ranges: Some(tracker.into_ranges()),
                upload_offset: Some(upload_offset),
                phase: claim.then_some(Phase::Compressing),
                ..SessionPatch::default()
            };

            match self
                .store
                .compare_and_swap(session_id, session.version, patch)
                .await
            {
                Ok(updated) => {
                    tracing::debug!(
                        session_id = %session_id,
                        range = %range,
                        upload_offset = updated.upload_offset,
                        version = updated.version,
                        "Recorded byte range"
                    );
                    if claim {
                        tracing::info!(
                            session_id = %session_id,
                            total_size = updated.total_size,
                            "All bytes received, claimed processing"
                        );
                    }
                    return Ok(ReceiveOutcome {
                        session: updated,
                        changed: true,
                        claimed_processing: claim,
                    });
                }
                Err(IngestError::VersionConflict { expected, actual, .. }) => {
                    tracing::trace!(
                        session_id = %session_id,
                        expected,
                        actual,
                        "Range update lost a race, re-merging"
                    );
                    session = self.store.load(session_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
