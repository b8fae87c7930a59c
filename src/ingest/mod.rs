//! Resumable ingest module
//!
//! Accepts a video as arbitrary byte ranges, tracks which bytes have been
//! durably written, and hands the session to the orchestrator once every
//! byte is present.

pub mod orchestrator;
pub mod ranges;
pub mod receiver;
pub mod service;
pub mod store;
pub mod types;

pub use orchestrator::{Orchestrator, OrchestratorBuilder, DEFAULT_KEY_PREFIX};
pub use ranges::RangeTracker;
pub use receiver::{ChunkReceiver, ReceiveOutcome, StagingArea};
pub use service::{IngestService, SessionLimits};
pub use store::{MemorySessionStore, SessionStore};
pub use types::*;
