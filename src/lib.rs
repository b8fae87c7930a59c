//! Video Ingest
//!
//! Resumable ingest of large video files: clients upload arbitrary byte
//! ranges, the receiver persists them at their absolute offsets, and once
//! every byte is present the orchestrator compresses, hashes and commits the
//! artifact to object storage.

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod storage;

pub use config::Config;
pub use error::{IngestError, Result};
pub use ingest::{IngestService, Phase, SessionStatus, UploadSession};
