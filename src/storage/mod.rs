//! Storage module for finished artifacts
//!
//! Supports S3-compatible backends (MinIO, Cloudflare R2, Backblaze B2,
//! AWS S3) and a local directory for development.

mod local;
mod s3_client;
mod types;

pub use local::LocalObjectStore;
pub use s3_client::S3Client;
pub use types::*;
