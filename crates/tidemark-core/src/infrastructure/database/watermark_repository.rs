use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use sqlx::Row as SqlxRow;

use super::{
    format_timestamp,
    parse_timestamp,
    DatabasePool,
};
use crate::domain::{
    DomainError,
    DomainResult,
    QualityScore,
    RunAudit,
    Watermark,
    WatermarkStatus,
};
use crate::infrastructure::watermark::{
    ensure_forward,
    WatermarkStore,
};

const WATERMARK_COLUMNS: &str = "source_id, last_extracted_at, last_commit_at, status, version";

const AUDIT_COLUMNS: &str =
    "run_id, source_id, window_from, window_to, rows_processed, quality_json, committed_at";

/// Watermark store on SQLite or PostgreSQL
///
/// A commit updates the watermark row guarded by its version and inserts the
/// run's audit row in the same transaction.
pub struct SqlWatermarkStore {
    pool: DatabasePool,
}

impl SqlWatermarkStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            pool: DatabasePool::Sqlite(pool),
        }
    }

    pub fn new_from_pool(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn parse_status(value: &str) -> DomainResult<WatermarkStatus> {
        value.parse().map_err(DomainError::DatabaseError)
    }

    fn parse_quality(value: Option<String>) -> DomainResult<Option<QualityScore>> {
        value
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| DomainError::DatabaseError(format!("Invalid quality JSON: {}", e)))
    }

    fn watermark_from_sqlite_row(row: &sqlx::sqlite::SqliteRow) -> DomainResult<Watermark> {
        let get_str = |idx: usize| -> DomainResult<String> {
            row.try_get(idx)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))
        };

        Ok(Watermark {
            source_id: get_str(0)?,
            last_extracted_at: parse_timestamp(&get_str(1)?)?,
            last_commit_at: parse_timestamp(&get_str(2)?)?,
            status: Self::parse_status(&get_str(3)?)?,
            version: row
                .try_get(4)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?,
        })
    }

    fn watermark_from_postgres_row(row: &sqlx::postgres::PgRow) -> DomainResult<Watermark> {
        let status: String = row
            .try_get(3)
            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

        Ok(Watermark {
            source_id: row
                .try_get(0)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?,
            last_extracted_at: row
                .try_get(1)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?,
            last_commit_at: row
                .try_get(2)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?,
            status: Self::parse_status(&status)?,
            version: row
                .try_get(4)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?,
        })
    }

    fn audit_from_sqlite_row(row: &sqlx::sqlite::SqliteRow) -> DomainResult<RunAudit> {
        let get_str = |idx: usize| -> DomainResult<String> {
            row.try_get(idx)
                .map_err(|e| DomainError::DatabaseError(e.to_string()))
        };
        let rows_processed: i64 = row
            .try_get(4)
            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
        let quality: Option<String> = row
            .try_get(5)
            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

        Ok(RunAudit {
            run_id: get_str(0)?,
            source_id: get_str(1)?,
            window_from: parse_timestamp(&get_str(2)?)?,
            window_to: parse_timestamp(&get_str(3)?)?,
            rows_processed: rows_processed.max(0) as u64,
            quality: Self::parse_quality(quality)?,
            committed_at: parse_timestamp(&get_str(6)?)?,
        })
    }

    fn audit_from_postgres_row(row: &sqlx::postgres::PgRow) -> DomainResult<RunAudit> {
        let map = |e: sqlx::Error| DomainError::DatabaseError(e.to_string());
        let rows_processed: i64 = row.try_get(4).map_err(map)?;
        let quality: Option<String> = row.try_get(5).map_err(map)?;

        Ok(RunAudit {
            run_id: row.try_get(0).map_err(map)?,
            source_id: row.try_get(1).map_err(map)?,
            window_from: row.try_get(2).map_err(map)?,
            window_to: row.try_get(3).map_err(map)?,
            rows_processed: rows_processed.max(0) as u64,
            quality: Self::parse_quality(quality)?,
            committed_at: row.try_get(6).map_err(map)?,
        })
    }

    fn conflict(expected: &Watermark, found: Option<i64>) -> DomainError {
        match found {
            Some(found) => DomainError::WatermarkConflict {
                source_id: expected.source_id.clone(),
                expected: expected.version,
                found,
            },
            None => DomainError::WatermarkNotFound(expected.source_id.clone()),
        }
    }
}

#[async_trait]
impl WatermarkStore for SqlWatermarkStore {
    async fn initialize(&self, source_id: &str, start: DateTime<Utc>) -> DomainResult<Watermark> {
        let initial = Watermark::initial(source_id, start);

        match &self.pool {
            DatabasePool::Sqlite(p) => {
                sqlx::query(
                    "INSERT INTO watermarks (source_id, last_extracted_at, last_commit_at, status, version)
                     VALUES (?, ?, ?, ?, ?) ON CONFLICT (source_id) DO NOTHING",
                )
                .bind(&initial.source_id)
                .bind(format_timestamp(initial.last_extracted_at))
                .bind(format_timestamp(initial.last_commit_at))
                .bind(initial.status.as_str())
                .bind(initial.version)
                .execute(p)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
            DatabasePool::Postgres(p) => {
                sqlx::query(
                    "INSERT INTO watermarks (source_id, last_extracted_at, last_commit_at, status, version)
                     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (source_id) DO NOTHING",
                )
                .bind(&initial.source_id)
                .bind(initial.last_extracted_at)
                .bind(initial.last_commit_at)
                .bind(initial.status.as_str())
                .bind(initial.version)
                .execute(p)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
        }

        self.get(source_id).await
    }

    async fn get(&self, source_id: &str) -> DomainResult<Watermark> {
        let sql = format!(
            "SELECT {} FROM watermarks WHERE source_id = {}",
            WATERMARK_COLUMNS,
            self.pool.placeholder(1)
        );

        let watermark = match &self.pool {
            DatabasePool::Sqlite(p) => sqlx::query(&sql)
                .bind(source_id)
                .fetch_optional(p)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?
                .map(|row| Self::watermark_from_sqlite_row(&row))
                .transpose()?,
            DatabasePool::Postgres(p) => sqlx::query(&sql)
                .bind(source_id)
                .fetch_optional(p)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?
                .map(|row| Self::watermark_from_postgres_row(&row))
                .transpose()?,
        };

        watermark.ok_or_else(|| DomainError::WatermarkNotFound(source_id.to_string()))
    }

    async fn commit(
        &self, expected: &Watermark, new_extracted_at: DateTime<Utc>, audit: &RunAudit,
    ) -> DomainResult<Watermark> {
        ensure_forward(expected, new_extracted_at)?;

        let next = expected.advanced(new_extracted_at, audit.committed_at);
        let quality_json = audit
            .quality
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        match &self.pool {
            DatabasePool::Sqlite(p) => {
                let mut tx = p
                    .begin()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                let updated = sqlx::query(
                    "UPDATE watermarks
                     SET last_extracted_at = ?, last_commit_at = ?, status = ?, version = version + 1
                     WHERE source_id = ? AND version = ?",
                )
                .bind(format_timestamp(next.last_extracted_at))
                .bind(format_timestamp(next.last_commit_at))
                .bind(next.status.as_str())
                .bind(&expected.source_id)
                .bind(expected.version)
                .execute(&mut *tx)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?
                .rows_affected();

                if updated == 0 {
                    let found: Option<i64> =
                        sqlx::query_scalar("SELECT version FROM watermarks WHERE source_id = ?")
                            .bind(&expected.source_id)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                    return Err(Self::conflict(expected, found));
                }

                sqlx::query(&format!(
                    "INSERT INTO run_audit ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                    AUDIT_COLUMNS
                ))
                .bind(&audit.run_id)
                .bind(&audit.source_id)
                .bind(format_timestamp(audit.window_from))
                .bind(format_timestamp(audit.window_to))
                .bind(audit.rows_processed as i64)
                .bind(&quality_json)
                .bind(format_timestamp(audit.committed_at))
                .execute(&mut *tx)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                tx.commit()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
            DatabasePool::Postgres(p) => {
                let mut tx = p
                    .begin()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                let updated = sqlx::query(
                    "UPDATE watermarks
                     SET last_extracted_at = $1, last_commit_at = $2, status = $3, version = version + 1
                     WHERE source_id = $4 AND version = $5",
                )
                .bind(next.last_extracted_at)
                .bind(next.last_commit_at)
                .bind(next.status.as_str())
                .bind(&expected.source_id)
                .bind(expected.version)
                .execute(&mut *tx)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?
                .rows_affected();

                if updated == 0 {
                    let found: Option<i64> =
                        sqlx::query_scalar("SELECT version FROM watermarks WHERE source_id = $1")
                            .bind(&expected.source_id)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                    return Err(Self::conflict(expected, found));
                }

                sqlx::query(&format!(
                    "INSERT INTO run_audit ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    AUDIT_COLUMNS
                ))
                .bind(&audit.run_id)
                .bind(&audit.source_id)
                .bind(audit.window_from)
                .bind(audit.window_to)
                .bind(audit.rows_processed as i64)
                .bind(&quality_json)
                .bind(audit.committed_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                tx.commit()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
        }

        tracing::debug!(
            source_id = %expected.source_id,
            version = next.version,
            last_extracted_at = %next.last_extracted_at,
            "Watermark committed"
        );

        Ok(next)
    }

    async fn history(&self, source_id: &str, limit: usize) -> DomainResult<Vec<RunAudit>> {
        let sql = format!(
            "SELECT {} FROM run_audit WHERE source_id = {} ORDER BY committed_at DESC LIMIT {}",
            AUDIT_COLUMNS,
            self.pool.placeholder(1),
            self.pool.placeholder(2)
        );

        match &self.pool {
            DatabasePool::Sqlite(p) => sqlx::query(&sql)
                .bind(source_id)
                .bind(limit as i64)
                .fetch_all(p)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?
                .iter()
                .map(Self::audit_from_sqlite_row)
                .collect(),
            DatabasePool::Postgres(p) => sqlx::query(&sql)
                .bind(source_id)
                .bind(limit as i64)
                .fetch_all(p)
                .await
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?
                .iter()
                .map(Self::audit_from_postgres_row)
                .collect(),
        }
    }
}
