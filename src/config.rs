//! Configuration management for the video ingest core

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::ingest::{SessionLimits, DEFAULT_CHUNK_SIZE, DEFAULT_KEY_PREFIX, MAX_UPLOAD_SIZE};
use crate::pipeline::{CompressionMode, RetryPolicy};

#[derive(Debug, Clone)]
pub struct Config {
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Directory holding raw and compressed staging files
    pub staging_dir: PathBuf,
    pub default_chunk_size: u64,
    pub max_upload_size: u64,
    pub compression: CompressionMode,
    pub upload_max_attempts: u32,
    pub upload_backoff: Duration,
    /// How long the binary waits for a session to reach a terminal phase
    pub processing_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    pub key_prefix: String,
    /// Object directory for the `local` provider
    pub local_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    Minio,
    R2,
    S3,
    B2,
    Local,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl IngestConfig {
    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            default_chunk_size: self.default_chunk_size,
            max_upload_size: self.max_upload_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.upload_max_attempts, self.upload_backoff)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ingest: IngestConfig {
                staging_dir: PathBuf::from("./staging"),
                default_chunk_size: DEFAULT_CHUNK_SIZE,
                max_upload_size: MAX_UPLOAD_SIZE,
                compression: CompressionMode::Auto,
                upload_max_attempts: 5,
                upload_backoff: Duration::from_millis(500),
                processing_timeout: Duration::from_secs(3600),
            },
            storage: StorageConfig {
                provider: StorageProvider::Minio,
                endpoint: "http://localhost:9000".to_string(),
                bucket: "videos".to_string(),
                access_key: "admin".to_string(),
                secret_key: "password123".to_string(),
                region: Some("us-east-1".to_string()),
                key_prefix: DEFAULT_KEY_PREFIX.to_string(),
                local_root: PathBuf::from("./objects"),
            },
            database: DatabaseConfig {
                url: "sqlite:./ingest.db".to_string(),
            },
        }
    }
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Read configuration from the environment.
    ///
    /// S3 credentials are required unless `S3_PROVIDER=local`.
    pub fn from_env() -> Result<Self, env::VarError> {
        let defaults = Config::default();

        let provider = match env::var("S3_PROVIDER")
            .unwrap_or_else(|_| "minio".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "r2" => StorageProvider::R2,
            "s3" => StorageProvider::S3,
            "b2" => StorageProvider::B2,
            "local" => StorageProvider::Local,
            _ => StorageProvider::Minio,
        };

        let remote_var = |name: &str, default: &str| -> Result<String, env::VarError> {
            match env::var(name) {
                Ok(v) => Ok(v),
                Err(_) if provider == StorageProvider::Local => Ok(default.to_string()),
                Err(e) => Err(e),
            }
        };

        Ok(Config {
            ingest: IngestConfig {
                staging_dir: env::var("STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.ingest.staging_dir),
                default_chunk_size: parsed_or("DEFAULT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
                max_upload_size: parsed_or("MAX_UPLOAD_SIZE", MAX_UPLOAD_SIZE),
                compression: parsed_or("INGEST_COMPRESSION", CompressionMode::Auto),
                upload_max_attempts: parsed_or("UPLOAD_MAX_ATTEMPTS", defaults.ingest.upload_max_attempts),
                upload_backoff: Duration::from_millis(parsed_or("UPLOAD_BACKOFF_MS", 500)),
                processing_timeout: Duration::from_secs(parsed_or("PROCESSING_TIMEOUT_SECS", 3600)),
            },
            storage: StorageConfig {
                provider,
                endpoint: remote_var("S3_ENDPOINT", &defaults.storage.endpoint)?,
                bucket: remote_var("S3_BUCKET", &defaults.storage.bucket)?,
                access_key: remote_var("S3_ACCESS_KEY", &defaults.storage.access_key)?,
                secret_key: remote_var("S3_SECRET_KEY", &defaults.storage.secret_key)?,
                region: env::var("S3_REGION").ok(),
                key_prefix: env::var("S3_KEY_PREFIX").unwrap_or(defaults.storage.key_prefix),
                local_root: env::var("OBJECT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.local_root),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
        })
    }
}
