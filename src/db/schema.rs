//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions table (ranged ingest + post-receipt processing)
CREATE TABLE IF NOT EXISTS upload_sessions (
    id TEXT PRIMARY KEY,
    owner_id TEXT,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    upload_offset INTEGER NOT NULL DEFAULT 0,
    -- JSON array of {start, end} objects, sorted and coalesced
    uploaded_ranges TEXT NOT NULL DEFAULT '[]',
    tmp_path TEXT NOT NULL,
    gzip_tmp_path TEXT,
    checksum_sha256_base64 TEXT,
    expected_checksum TEXT,
    storage_key TEXT,
    phase TEXT NOT NULL DEFAULT 'receiving',
    failure_reason TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    -- Milliseconds since epoch
    updated_at INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_upload_sessions_phase ON upload_sessions(phase);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_owner ON upload_sessions(owner_id);
"#;
