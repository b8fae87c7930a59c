//! Storage types

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Failure while transferring an artifact to object storage
#[derive(Error, Debug)]
pub enum TransferError {
    /// Timeouts, dropped connections, 5xx responses
    #[error("transient transfer error: {0}")]
    Transient(String),

    /// The backend refused the request; retrying will not help
    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Transient(_) => true,
            TransferError::Rejected(_) => false,
            TransferError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
        }
    }
}

/// Durable object storage for finished artifacts
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload the file at `path` under `key`
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<(), TransferError>;
}

/// Build the object key for a session's artifact.
///
/// Deterministic in session id and filename so a re-driven upload overwrites
/// the same object instead of leaving a second copy behind.
pub fn object_key(prefix: &str, session_id: uuid::Uuid, filename: &str, compressed: bool) -> String {
    let mut name: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = name.trim_start_matches('.').len();
    if trimmed == 0 {
        name = "video".to_string();
    }
    if compressed {
        name.push_str(".gz");
    }

    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", session_id, name)
    } else {
        format!("{}/{}/{}", prefix, session_id, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_object_key_is_deterministic_and_safe() {
        let id = Uuid::parse_str("6f1c1d2e-0000-4000-8000-000000000001").unwrap();

        assert_eq!(
            object_key("videos/", id, "My Trip (2024).mp4", false),
            "videos/6f1c1d2e-0000-4000-8000-000000000001/My_Trip__2024_.mp4"
        );
        assert_eq!(
            object_key("", id, "../../etc/passwd", true),
            "6f1c1d2e-0000-4000-8000-000000000001/.._.._etc_passwd.gz"
        );
        assert_eq!(
            object_key("videos", id, "...", false),
            "videos/6f1c1d2e-0000-4000-8000-000000000001/video"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransferError::Transient("503".into()).is_transient());
        assert!(!TransferError::Rejected("403".into()).is_transient());
        assert!(TransferError::Io(std::io::ErrorKind::TimedOut.into()).is_transient());
        assert!(!TransferError::Io(std::io::ErrorKind::NotFound.into()).is_transient());
    }
}
