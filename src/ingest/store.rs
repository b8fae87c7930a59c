//! Session Store
//!
//! Durable record of upload/processing state. Every mutation goes through
//! `compare_and_swap`, which is the only synchronization point between
//! concurrent chunk writers and the orchestrator:
//! - a patch applies only when the caller's version matches the stored one
//! - a successful swap bumps `version` by one and refreshes `updated_at`
//! - a stale version fails with `VersionConflict` and changes nothing

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::types::{NewSession, Phase, SessionPatch, UploadSession};
use crate::error::{IngestError, Result};

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for session store backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session in phase `receiving` at version 1
    async fn create(&self, meta: NewSession) -> Result<UploadSession>;

    /// Load a session, failing with `NotFound` if absent
    async fn load(&self, id: Uuid) -> Result<UploadSession>;

    /// Apply `patch` only if the stored version equals `expected_version`
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: SessionPatch,
    ) -> Result<UploadSession>;

    /// Sessions currently in any of `phases`, oldest first
    async fn list_by_phase(&self, phases: &[Phase]) -> Result<Vec<UploadSession>>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Process-local session store.
///
/// Records are held as `Arc<UploadSession>` and replaced wholesale on each
/// successful swap, so readers never observe a half-applied patch.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<Uuid, Arc<UploadSession>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, meta: NewSession) -> Result<UploadSession> {
        let session = UploadSession::new(meta);

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id) {
            return Err(IngestError::InvalidSession(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id, Arc::new(session.clone()));

        Ok(session)
    }

    async fn load(&self, id: Uuid) -> Result<UploadSession> {
        self.sessions
            .lock()
            .get(&id)
            .map(|s| UploadSession::clone(s))
            .ok_or(IngestError::NotFound(id))
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: SessionPatch,
    ) -> Result<UploadSession> {
        let mut sessions = self.sessions.lock();

        let current = sessions.get(&id).ok_or(IngestError::NotFound(id))?;
        if current.version != expected_version {
            return Err(IngestError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let next = patch.apply(current, Utc::now().timestamp_millis());
        sessions.insert(id, Arc::new(next.clone()));

        Ok(next)
    }

    async fn list_by_phase(&self, phases: &[Phase]) -> Result<Vec<UploadSession>> {
        let mut matching: Vec<UploadSession> = self
            .sessions
            .lock()
            .values()
            .filter(|s| phases.contains(&s.phase))
            .map(|s| UploadSession::clone(s))
            .collect();

        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }
}

// ============================================================================
// Tests
// ============================================================================
