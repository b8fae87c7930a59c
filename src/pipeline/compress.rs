//! Staged upload compression.
//!
//! Streams the raw staged file through a gzip encoder into a sibling
//! artifact. Whether a session is compressed at all is decided by
//! [`CompressionPolicy`] from its declared MIME type.

use std::path::Path;

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader};

/// Compressed artifact written by a [`Compressor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedArtifact {
    /// Size of the raw input.
    pub input_size: u64,
    /// Size of the compressed output.
    pub output_size: u64,
}

/// Produces a compressed copy of a staged file.
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(&self, src: &Path, dst: &Path) -> std::io::Result<CompressedArtifact>;
}

/// Gzip compressor backed by `async-compression`.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: async_compression::Level,
}

impl GzipCompressor {
    pub fn new(level: async_compression::Level) -> Self {
        Self { level }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new(async_compression::Level::Default)
    }
}

#[async_trait]
impl Compressor for GzipCompressor {
    async fn compress(&self, src: &Path, dst: &Path) -> std::io::Result<CompressedArtifact> {
        let mut reader = BufReader::new(File::open(src).await?);
        let output = File::create(dst).await?;
        let mut encoder = GzipEncoder::with_quality(output, self.level);

        let input_size = tokio::io::copy(&mut reader, &mut encoder).await?;
        encoder.shutdown().await?;

        let output = encoder.into_inner();
        output.sync_all().await?;
        let output_size = output.metadata().await?.len();

        Ok(CompressedArtifact {
            input_size,
            output_size,
        })
    }
}

// ============================================================================
// Policy
// ============================================================================

/// When staged uploads are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Compress unless the MIME type is already a compressed container.
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for CompressionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(CompressionMode::Auto),
            "always" => Ok(CompressionMode::Always),
            "never" => Ok(CompressionMode::Never),
            other => Err(format!("unknown compression mode: {}", other)),
        }
    }
}

/// Container formats whose payload is already entropy coded.
const PRECOMPRESSED_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "video/mpeg",
    "video/ogg",
    "video/3gpp",
    "video/3gpp2",
    "video/x-flv",
    "video/x-m4v",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionPolicy {
    mode: CompressionMode,
}

impl CompressionPolicy {
    pub fn new(mode: CompressionMode) -> Self {
        Self { mode }
    }

    pub fn should_compress(&self, mime_type: &str) -> bool {
        match self.mode {
            CompressionMode::Always => true,
            CompressionMode::Never => false,
            CompressionMode::Auto => {
                // Ignore parameters such as `; codecs="avc1"`
                let essence = mime_type
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase();
                !PRECOMPRESSED_TYPES.contains(&essence.as_str())
            }
        }
    }
}
