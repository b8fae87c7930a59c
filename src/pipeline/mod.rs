//! Post-receipt processing adapters
//!
//! Each adapter takes a staged file in and reports a deterministic result
//! out. None of them knows about phases; ordering and failure routing live
//! in the orchestrator.

pub mod checksum;
pub mod compress;
pub mod retry;

pub use checksum::{compute_sha256_base64, digests_match, ChecksumComputer, Sha256Checksum};
pub use compress::{CompressedArtifact, CompressionMode, CompressionPolicy, Compressor, GzipCompressor};
pub use retry::RetryPolicy;
