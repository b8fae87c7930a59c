//! Upload session database operations

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::ingest::{FailureReason, NewSession, Phase, SessionPatch, SessionStore, UploadSession};

const SELECT_COLUMNS: &str = r#"
    SELECT id, owner_id, filename, mime_type, total_size, chunk_size,
           upload_offset, uploaded_ranges, tmp_path, gzip_tmp_path,
           checksum_sha256_base64, expected_checksum, storage_key, phase,
           failure_reason, version, updated_at, created_at
    FROM upload_sessions
"#;

/// Raw `upload_sessions` row
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    owner_id: Option<String>,
    filename: String,
    mime_type: String,
    total_size: i64,
    chunk_size: i64,
    upload_offset: i64,
    uploaded_ranges: String,
    tmp_path: String,
    gzip_tmp_path: Option<String>,
    checksum_sha256_base64: Option<String>,
    expected_checksum: Option<String>,
    storage_key: Option<String>,
    phase: String,
    failure_reason: Option<String>,
    version: i64,
    updated_at: i64,
    created_at: String,
}

fn to_u64(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| IngestError::Internal(format!("negative {} in session row: {}", column, value)))
}

fn to_i64(column: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| IngestError::Internal(format!("{} out of range for storage: {}", column, value)))
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = IngestError;

    fn try_from(row: SessionRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| IngestError::Internal(format!("bad session id {}: {}", row.id, e)))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| IngestError::Internal(format!("bad created_at {}: {}", row.created_at, e)))?
            .with_timezone(&Utc);

        Ok(UploadSession {
            id,
            owner_id: row.owner_id,
            filename: row.filename,
            mime_type: row.mime_type,
            total_size: to_u64("total_size", row.total_size)?,
            chunk_size: to_u64("chunk_size", row.chunk_size)?,
            upload_offset: to_u64("upload_offset", row.upload_offset)?,
            uploaded_ranges: serde_json::from_str(&row.uploaded_ranges)?,
            tmp_path: PathBuf::from(row.tmp_path),
            gzip_tmp_path: row.gzip_tmp_path.map(PathBuf::from),
            checksum_sha256_base64: row.checksum_sha256_base64,
            expected_checksum: row.expected_checksum,
            storage_key: row.storage_key,
            phase: row.phase.parse()?,
            failure_reason: row
                .failure_reason
                .as_deref()
                .map(str::parse::<FailureReason>)
                .transpose()?,
            version: to_u64("version", row.version)?,
            updated_at: row.updated_at,
            created_at,
        })
    }
}

/// SQLite-backed session store.
///
/// The swap is a single `UPDATE ... WHERE id = ? AND version = ?`; SQLite
/// serializes writers, so at most one caller sees a changed row.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<UploadSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(UploadSession::try_from).transpose()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, meta: NewSession) -> Result<UploadSession> {
        let session = UploadSession::new(meta);

        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, owner_id, filename, mime_type, total_size, chunk_size,
                upload_offset, uploaded_ranges, tmp_path, expected_checksum,
                phase, version, updated_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.owner_id)
        .bind(&session.filename)
        .bind(&session.mime_type)
        .bind(to_i64("total_size", session.total_size)?)
        .bind(to_i64("chunk_size", session.chunk_size)?)
        .bind(to_i64("upload_offset", session.upload_offset)?)
        .bind(serde_json::to_string(&session.uploaded_ranges)?)
        .bind(session.tmp_path.to_string_lossy().into_owned())
        .bind(&session.expected_checksum)
        .bind(session.phase.as_str())
        .bind(to_i64("version", session.version)?)
        .bind(session.updated_at)
        .bind(session.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::InvalidSession(format!(
                "session {} already exists",
                session.id
            )));
        }

        Ok(session)
    }

    async fn load(&self, id: Uuid) -> Result<UploadSession> {
        self.fetch(id).await?.ok_or(IngestError::NotFound(id))
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: u64,
        patch: SessionPatch,
    ) -> Result<UploadSession> {
        let current = self.load(id).await?;
        if current.version != expected_version {
            return Err(IngestError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let next = patch.apply(&current, Utc::now().timestamp_millis());

        let result = sqlx::query(
            r#"
            UPDATE upload_sessions SET
                upload_offset = ?,
                uploaded_ranges = ?,
                gzip_tmp_path = ?,
                checksum_sha256_base64 = ?,
                storage_key = ?,
                phase = ?,
                failure_reason = ?,
                version = ?,
                updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(to_i64("upload_offset", next.upload_offset)?)
        .bind(serde_json::to_string(&next.uploaded_ranges)?)
        .bind(next.gzip_tmp_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(&next.checksum_sha256_base64)
        .bind(&next.storage_key)
        .bind(next.phase.as_str())
        .bind(next.failure_reason.map(|r| r.as_str()))
        .bind(to_i64("version", next.version)?)
        .bind(next.updated_at)
        .bind(id.to_string())
        .bind(to_i64("version", expected_version)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Someone else swapped between our read and our write
            let actual = self.load(id).await?.version;
            return Err(IngestError::VersionConflict {
                id,
                expected: expected_version,
                actual,
            });
        }

        Ok(next)
    }

    async fn list_by_phase(&self, phases: &[Phase]) -> Result<Vec<UploadSession>> {
        if phases.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; phases.len()].join(", ");
        let sql = format!(
            "{} WHERE phase IN ({}) ORDER BY created_at ASC",
            SELECT_COLUMNS, placeholders
        );

        let mut query = sqlx::query_as::<_, SessionRow>(&sql);
        for phase in phases {
            query = query.bind(phase.as_str());
        }

        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(UploadSession::try_from)
            .collect()
    }
}
