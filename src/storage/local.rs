//! Filesystem object store
//!
//! Development stand-in for S3: objects are files under a root directory,
//! written to a temp name, synced, then renamed into place.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use super::types::{RemoteStore, TransferError};

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, refusing anything that escapes the root
    pub fn key_path(&self, key: &str) -> Result<PathBuf, TransferError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

        if key.is_empty() || !safe {
            return Err(TransferError::Rejected(format!("invalid object key: {}", key)));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl RemoteStore for LocalObjectStore {
    async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> Result<(), TransferError> {
        let dest = self.key_path(key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| TransferError::Rejected(format!("invalid object key: {}", key)))?;
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".tmp.{}", Uuid::new_v4()));
        fs::copy(path, &temp_path).await?;
        fs::File::open(&temp_path).await?.sync_all().await?;
        fs::rename(&temp_path, &dest).await?;

        tracing::debug!(key = %key, dest = %dest.display(), "Stored object on local disk");
        Ok(())
    }
}
