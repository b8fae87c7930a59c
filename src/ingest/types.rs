//! Upload session types for ranged video ingest

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestError;

// ============================================================================
// Constants
// ============================================================================

/// Default transfer unit: 8MB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest chunk size a client may negotiate: 256KB
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// Largest chunk size a client may negotiate: 64MB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum declared upload size: 20GB
pub const MAX_UPLOAD_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Clamp a client-requested chunk size into the supported window.
///
/// A request of zero means "no preference" and yields the configured default.
pub fn negotiate_chunk_size(requested: u64, default: u64) -> u64 {
    if requested == 0 {
        return default.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

// ============================================================================
// Byte Ranges
// ============================================================================

/// Half-open byte interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check that the range is non-empty and lies within `[0, total_size]`
    pub fn validate(&self, total_size: u64) -> Result<(), IngestError> {
        if self.start >= self.end {
            return Err(IngestError::invalid_range(*self, "start must be before end"));
        }
        if self.end > total_size {
            return Err(IngestError::invalid_range(*self, "range exceeds declared total size"));
        }
        Ok(())
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

// ============================================================================
// Phases
// ============================================================================

/// Position of a session in the ingest state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "receiving")]
    Receiving,
    #[serde(rename = "compressing")]
    Compressing,
    #[serde(rename = "hashing")]
    Hashing,
    #[serde(rename = "uploading_s3")]
    UploadingS3,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Receiving => "receiving",
            Phase::Compressing => "compressing",
            Phase::Hashing => "hashing",
            Phase::UploadingS3 => "uploading_s3",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Phases owned by the background orchestrator
    pub fn is_processing(&self) -> bool {
        matches!(self, Phase::Compressing | Phase::Hashing | Phase::UploadingS3)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "receiving" => Ok(Phase::Receiving),
            "compressing" => Ok(Phase::Compressing),
            "hashing" => Ok(Phase::Hashing),
            "uploading_s3" => Ok(Phase::UploadingS3),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            other => Err(IngestError::Internal(format!("unknown phase: {}", other))),
        }
    }
}

/// Reason code stored on a session that ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CompressionFailed,
    HashingFailed,
    ChecksumMismatch,
    UploadFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::CompressionFailed => "compression_failed",
            FailureReason::HashingFailed => "hashing_failed",
            FailureReason::ChecksumMismatch => "checksum_mismatch",
            FailureReason::UploadFailed => "upload_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compression_failed" => Ok(FailureReason::CompressionFailed),
            "hashing_failed" => Ok(FailureReason::HashingFailed),
            "checksum_mismatch" => Ok(FailureReason::ChecksumMismatch),
            "upload_failed" => Ok(FailureReason::UploadFailed),
            other => Err(IngestError::Internal(format!("unknown failure reason: {}", other))),
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// One tracked upload/processing lifecycle.
///
/// Sessions are immutable values: the session store swaps in a new value on
/// every successful compare-and-swap and never edits one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Owning user, if already assigned
    pub owner_id: Option<String>,

    /// Original file name
    pub filename: String,

    /// Declared MIME type
    pub mime_type: String,

    /// Declared size in bytes
    pub total_size: u64,

    /// Negotiated transfer unit
    pub chunk_size: u64,

    /// Bytes contiguously persisted from byte 0
    pub upload_offset: u64,

    /// Every durably written range, sorted and coalesced
    pub uploaded_ranges: Vec<ByteRange>,

    /// Raw staged file
    pub tmp_path: PathBuf,

    /// Compressed staged file, once compression completes
    pub gzip_tmp_path: Option<PathBuf>,

    /// Digest of the canonical artifact, once hashing completes
    pub checksum_sha256_base64: Option<String>,

    /// Digest declared by the client out-of-band
    pub expected_checksum: Option<String>,

    /// Object storage key, once the remote upload completes
    pub storage_key: Option<String>,

    pub phase: Phase,

    pub failure_reason: Option<FailureReason>,

    /// Optimistic concurrency token, advanced by the store only
    pub version: u64,

    /// Milliseconds since epoch of the last mutation
    pub updated_at: i64,

    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Build the initial record for a freshly opened session
    pub fn new(meta: NewSession) -> Self {
        let now = Utc::now();

        Self {
            id: meta.id,
            owner_id: meta.owner_id,
            filename: meta.filename,
            mime_type: meta.mime_type,
            total_size: meta.total_size,
            chunk_size: meta.chunk_size,
            upload_offset: 0,
            uploaded_ranges: Vec::new(),
            tmp_path: meta.tmp_path,
            gzip_tmp_path: None,
            checksum_sha256_base64: None,
            expected_checksum: meta.expected_checksum,
            storage_key: None,
            phase: Phase::Receiving,
            failure_reason: None,
            version: 1,
            updated_at: now.timestamp_millis(),
            created_at: now,
        }
    }

    /// The file hashed and shipped to object storage
    pub fn canonical_artifact(&self) -> &PathBuf {
        self.gzip_tmp_path.as_ref().unwrap_or(&self.tmp_path)
    }
}

/// Metadata needed to create a session record
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub tmp_path: PathBuf,
    pub expected_checksum: Option<String>,
}

/// Field-level patch applied by a compare-and-swap.
///
/// `None` leaves the stored field untouched. `version` and `updated_at` are
/// not patchable; the store advances them itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub uploaded_ranges: Option<Vec<ByteRange>>,
    pub upload_offset: Option<u64>,
    pub phase: Option<Phase>,
    pub gzip_tmp_path: Option<PathBuf>,
    pub checksum_sha256_base64: Option<String>,
    pub storage_key: Option<String>,
    pub failure_reason: Option<FailureReason>,
}

impl SessionPatch {
    pub fn phase(phase: Phase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            phase: Some(Phase::Failed),
            failure_reason: Some(reason),
            ..Self::default()
        }
    }

    /// Produce the successor of `base`, one version ahead
    pub fn apply(&self, base: &UploadSession, now_ms: i64) -> UploadSession {
        let mut next = base.clone();

        if let Some(ranges) = &self.uploaded_ranges {
            next.uploaded_ranges = ranges.clone();
        }
        if let Some(offset) = self.upload_offset {
            next.upload_offset = offset;
        }
        if let Some(phase) = self.phase {
            next.phase = phase;
        }
        if let Some(path) = &self.gzip_tmp_path {
            next.gzip_tmp_path = Some(path.clone());
        }
        if let Some(checksum) = &self.checksum_sha256_base64 {
            next.checksum_sha256_base64 = Some(checksum.clone());
        }
        if let Some(key) = &self.storage_key {
            next.storage_key = Some(key.clone());
        }
        if let Some(reason) = self.failure_reason {
            next.failure_reason = Some(reason);
        }

        next.version = base.version + 1;
        next.updated_at = now_ms.max(base.updated_at);
        next
    }
}

// ============================================================================
// Caller-facing Types
// ============================================================================

/// Request to open an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Original file name
    pub filename: String,

    /// MIME type of the video
    pub mime_type: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Requested transfer unit (0 = server default)
    #[serde(default)]
    pub chunk_size: u64,

    #[serde(default)]
    pub owner_id: Option<String>,

    /// Base64 SHA-256 of the canonical artifact, if the client knows it
    #[serde(default)]
    pub expected_checksum: Option<String>,
}

/// Status snapshot returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub phase: Phase,
    pub upload_offset: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Gaps still to be uploaded, for resuming clients
    pub missing_ranges: Vec<ByteRange>,
}

/// Published whenever a session changes phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    pub session_id: Uuid,
    pub from: Phase,
    pub to: Phase,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> UploadSession {
        UploadSession::new(NewSession {
            id: Uuid::new_v4(),
            owner_id: None,
            filename: "clip.mov".to_string(),
            mime_type: "video/quicktime".to_string(),
            total_size: 100,
            chunk_size: MIN_CHUNK_SIZE,
            tmp_path: PathBuf::from("/tmp/clip.part"),
            expected_checksum: None,
        })
    }

    #[test]
    fn test_phase_wire_names() {
        assert_eq!(serde_json::to_string(&Phase::UploadingS3).unwrap(), "\"uploading_s3\"");
        assert_eq!("uploading_s3".parse::<Phase>().unwrap(), Phase::UploadingS3);
        assert_eq!(
            serde_json::to_string(&FailureReason::ChecksumMismatch).unwrap(),
            "\"checksum_mismatch\""
        );
    }

    #[test]
    fn test_patch_advances_version_and_keeps_untouched_fields() {
        let session = sample_session();
        let patch = SessionPatch {
            upload_offset: Some(40),
            uploaded_ranges: Some(vec![ByteRange::new(0, 40)]),
            ..SessionPatch::default()
        };

        let next = patch.apply(&session, session.updated_at + 5);

        assert_eq!(next.version, session.version + 1);
        assert_eq!(next.upload_offset, 40);
        assert_eq!(next.phase, Phase::Receiving);
        assert_eq!(next.filename, session.filename);
        assert_eq!(next.updated_at, session.updated_at + 5);
        // the base value is untouched
        assert_eq!(session.upload_offset, 0);
    }

    #[test]
    fn test_negotiate_chunk_size() {
        assert_eq!(negotiate_chunk_size(0, DEFAULT_CHUNK_SIZE), DEFAULT_CHUNK_SIZE);
        assert_eq!(negotiate_chunk_size(1, DEFAULT_CHUNK_SIZE), MIN_CHUNK_SIZE);
        assert_eq!(negotiate_chunk_size(u64::MAX, DEFAULT_CHUNK_SIZE), MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_ranges_serialize_as_pairs() {
        let json = serde_json::to_string(&vec![ByteRange::new(0, 5), ByteRange::new(10, 20)]).unwrap();
        assert_eq!(json, r#"[{"start":0,"end":5},{"start":10,"end":20}]"#);
    }
}
