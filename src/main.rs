//! Video Ingest
//!
//! Pushes a local file through the full ingest pipeline: opens a session,
//! uploads it as concurrent byte ranges, waits for processing to finish and
//! prints the final status.
//!
//! Usage: `video-ingest <file> [mime-type] [workers]`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use video_ingest::config::{Config, StorageProvider};
use video_ingest::db::{self, SqliteSessionStore};
use video_ingest::ingest::{
    ByteRange, ChunkReceiver, CreateSessionRequest, IngestService, Orchestrator, SessionStore,
    StagingArea,
};
use video_ingest::pipeline::CompressionPolicy;
use video_ingest::storage::{LocalObjectStore, RemoteStore, S3Client};

const DEFAULT_WORKERS: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "video_ingest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    let mut args = std::env::args().skip(1);
    let Some(file) = args.next().map(PathBuf::from) else {
        bail!("usage: video-ingest <file> [mime-type] [workers]");
    };
    let mime_type = args
        .next()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let workers = match args.next() {
        Some(n) => n.parse::<usize>().context("workers must be a number")?.max(1),
        None => DEFAULT_WORKERS,
    };

    tracing::info!("Starting video-ingest v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Staging directory: {}", config.ingest.staging_dir.display());

    // Initialize database
    let pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));

    // Initialize object storage
    let remote: Arc<dyn RemoteStore> = match config.storage.provider {
        StorageProvider::Local => {
            tracing::info!("Object directory: {}", config.storage.local_root.display());
            Arc::new(LocalObjectStore::new(&config.storage.local_root))
        }
        _ => {
            tracing::info!("S3 endpoint: {}", config.storage.endpoint);
            tracing::info!("S3 bucket: {}", config.storage.bucket);
            Arc::new(S3Client::new(&config.storage).await)
        }
    };

    let staging = StagingArea::new(&config.ingest.staging_dir);
    let orchestrator = Orchestrator::builder(store.clone(), staging.clone(), remote)
        .compression_policy(CompressionPolicy::new(config.ingest.compression))
        .retry_policy(config.ingest.retry_policy())
        .key_prefix(config.storage.key_prefix.clone())
        .build();
    let receiver = ChunkReceiver::new(store.clone(), staging);
    let service = IngestService::new(store, receiver, orchestrator, config.ingest.limits());

    let recovered = service.recover_in_flight().await?;
    if recovered > 0 {
        tracing::info!("Resumed {} interrupted sessions", recovered);
    }

    let session_id = ingest_file(&service, &file, mime_type, workers).await?;
    let status = service
        .wait_for_terminal(session_id, config.ingest.processing_timeout)
        .await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

/// Upload `path` as concurrent byte ranges, returning the session id
async fn ingest_file(
    service: &IngestService,
    path: &Path,
    mime_type: String,
    workers: usize,
) -> anyhow::Result<Uuid> {
    let total_size = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let session = service
        .create_session(CreateSessionRequest {
            filename,
            mime_type,
            total_size,
            chunk_size: 0,
            owner_id: None,
            expected_checksum: None,
        })
        .await?;

    let ranges: Vec<ByteRange> = (0..total_size)
        .step_by(session.chunk_size as usize)
        .map(|start| ByteRange::new(start, (start + session.chunk_size).min(total_size)))
        .collect();

    tracing::info!(
        session_id = %session.id,
        ranges = ranges.len(),
        workers,
        "Uploading"
    );

    let session_id = session.id;
    stream::iter(ranges)
        .map(|range| async move {
            let data = read_range(path, range).await?;
            service
                .upload_range(session_id, range.start, range.end, &data)
                .await?;
            anyhow::Ok(())
        })
        .buffer_unordered(workers)
        .try_collect::<Vec<_>>()
        .await?;

    Ok(session_id)
}

async fn read_range(path: &Path, range: ByteRange) -> anyhow::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;

    let mut data = vec![0u8; range.len() as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}
