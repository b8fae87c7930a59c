//! Error types for the video ingest core

use thiserror::Error;
use uuid::Uuid;

use crate::ingest::{ByteRange, FailureReason, Phase};

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingest error type
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid byte range {range}: {reason}")]
    InvalidRange { range: ByteRange, reason: String },

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict on session {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Hashing failed: {0}")]
    HashingFailed(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Session {id} still {phase} after waiting for processing")]
    ProcessingTimeout { id: Uuid, phase: Phase },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn invalid_range(range: ByteRange, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            range,
            reason: reason.into(),
        }
    }

    /// Stable code for callers that surface errors over the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRange { .. } => "INVALID_RANGE",
            Self::InvalidSession(_) => "INVALID_SESSION",
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::CompressionFailed(_) => "COMPRESSION_FAILED",
            Self::HashingFailed(_) => "HASHING_FAILED",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::UploadFailed(_) => "UPLOAD_FAILED",
            Self::ProcessingTimeout { .. } => "PROCESSING_TIMEOUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Reason code recorded when this error terminates a session
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::CompressionFailed(_) => Some(FailureReason::CompressionFailed),
            Self::HashingFailed(_) => Some(FailureReason::HashingFailed),
            Self::ChecksumMismatch { .. } => Some(FailureReason::ChecksumMismatch),
            Self::UploadFailed(_) => Some(FailureReason::UploadFailed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = IngestError::invalid_range(ByteRange::new(5, 2), "start must be before end");
        assert_eq!(err.code(), "INVALID_RANGE");
        assert_eq!(
            err.to_string(),
            "Invalid byte range [5, 2): start must be before end"
        );

        let err = IngestError::VersionConflict {
            id: Uuid::nil(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(err.code(), "VERSION_CONFLICT");
    }

    #[test]
    fn test_only_step_errors_terminate_sessions() {
        let mismatch = IngestError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(mismatch.failure_reason(), Some(FailureReason::ChecksumMismatch));
        assert_eq!(
            IngestError::HashingFailed("eof".into()).failure_reason(),
            Some(FailureReason::HashingFailed)
        );
        assert_eq!(
            IngestError::UploadFailed("403".into()).failure_reason(),
            Some(FailureReason::UploadFailed)
        );

        let io = IngestError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.failure_reason(), None);
        assert_eq!(IngestError::Internal("x".into()).failure_reason(), None);
    }
}
