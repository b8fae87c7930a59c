//! Content checksums for staged artifacts

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Read buffer used while hashing: 1MB
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Computes an encoded digest of a file
#[async_trait]
pub trait ChecksumComputer: Send + Sync {
    async fn digest(&self, path: &Path) -> std::io::Result<String>;
}

/// SHA-256, standard base64 encoded
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

#[async_trait]
impl ChecksumComputer for Sha256Checksum {
    async fn digest(&self, path: &Path) -> std::io::Result<String> {
        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(STANDARD.encode(hasher.finalize()))
    }
}

/// Compute SHA-256 of in-memory data, standard base64 encoded
pub fn compute_sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Compare a declared digest against a computed one.
///
/// Surrounding whitespace in the declared value is ignored.
pub fn digests_match(declared: &str, computed: &str) -> bool {
    declared.trim() == computed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_digest_matches_in_memory_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staged.part");
        let data: Vec<u8> = (0..3 * HASH_BUFFER_SIZE + 17).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let digest = Sha256Checksum.digest(&path).await.unwrap();
        assert_eq!(digest, compute_sha256_base64(&data));
    }

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        assert_eq!(
            compute_sha256_base64(b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn test_digests_match() {
        let digest = compute_sha256_base64(b"abc");
        assert!(digests_match(&format!(" {}\n", digest), &digest));
        assert!(!digests_match("bogus", &digest));
    }
}
