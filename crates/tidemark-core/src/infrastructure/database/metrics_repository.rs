use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::Row as SqlxRow;

use super::{
    format_timestamp,
    parse_timestamp,
    DatabasePool,
};
use crate::domain::{
    AnomalyKind,
    AnomalyRecord,
    DomainError,
    DomainResult,
    QualityScore,
};
use crate::infrastructure::metrics::MetricsSink;

const QUALITY_COLUMNS: &str =
    "completeness, accuracy, consistency, overall, warning_count, computed_at";

const ANOMALY_COLUMNS: &str = "source_id, partition_date, kind, metric_name, observed_value, \
                               baseline_mean, baseline_stddev, z_score, distance, severity, detected_at";

/// Persists quality scores and anomalies for trend queries
pub struct MetricsRepository {
    pool: DatabasePool,
}

impl MetricsRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            pool: DatabasePool::Sqlite(pool),
        }
    }

    pub fn new_from_pool(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Latest quality scores for a source, newest first
    pub async fn quality_trend(
        &self, source_id: &str, limit: usize,
    ) -> DomainResult<Vec<QualityScore>> {
        let sql = format!(
            "SELECT {} FROM quality_scores WHERE source_id = {} ORDER BY computed_at DESC LIMIT {}",
            QUALITY_COLUMNS,
            self.pool.placeholder(1),
            self.pool.placeholder(2)
        );

        match &self.pool {
            DatabasePool::Sqlite(p) => {
                let rows = sqlx::query(&sql)
                    .bind(source_id)
                    .bind(limit as i64)
                    .fetch_all(p)
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                rows.iter()
                    .map(|row| {
                        let computed_at: String = row
                            .try_get(5)
                            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                        Self::quality_from_row(row, parse_timestamp(&computed_at)?)
                    })
                    .collect()
            }
            DatabasePool::Postgres(p) => {
                let rows = sqlx::query(&sql)
                    .bind(source_id)
                    .bind(limit as i64)
                    .fetch_all(p)
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                rows.iter()
                    .map(|row| {
                        let computed_at = row
                            .try_get(5)
                            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                        Self::quality_from_row(row, computed_at)
                    })
                    .collect()
            }
        }
    }

    fn quality_from_row<'r, R>(
        row: &'r R, computed_at: chrono::DateTime<chrono::Utc>,
    ) -> DomainResult<QualityScore>
    where
        R: SqlxRow,
        usize: sqlx::ColumnIndex<R>,
        f64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
        i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    {
        let map = |e: sqlx::Error| DomainError::DatabaseError(e.to_string());
        let warning_count: i64 = row.try_get(4).map_err(map)?;

        Ok(QualityScore {
            completeness: row.try_get(0).map_err(map)?,
            accuracy: row.try_get(1).map_err(map)?,
            consistency: row.try_get(2).map_err(map)?,
            overall: row.try_get(3).map_err(map)?,
            warning_count: warning_count.clamp(0, u32::MAX as i64) as u32,
            computed_at,
        })
    }

    /// Latest anomalies for a source, newest first
    pub async fn recent_anomalies(
        &self, source_id: &str, limit: usize,
    ) -> DomainResult<Vec<AnomalyRecord>> {
        let sql = format!(
            "SELECT {} FROM anomalies WHERE source_id = {} ORDER BY detected_at DESC, id DESC LIMIT {}",
            ANOMALY_COLUMNS,
            self.pool.placeholder(1),
            self.pool.placeholder(2)
        );

        match &self.pool {
            DatabasePool::Sqlite(p) => {
                let rows = sqlx::query(&sql)
                    .bind(source_id)
                    .bind(limit as i64)
                    .fetch_all(p)
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                rows.iter()
                    .map(|row| {
                        let detected_at: String = row
                            .try_get(10)
                            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                        Self::anomaly_from_row(row, parse_timestamp(&detected_at)?)
                    })
                    .collect()
            }
            DatabasePool::Postgres(p) => {
                let rows = sqlx::query(&sql)
                    .bind(source_id)
                    .bind(limit as i64)
                    .fetch_all(p)
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                rows.iter()
                    .map(|row| {
                        let detected_at = row
                            .try_get(10)
                            .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                        Self::anomaly_from_row(row, detected_at)
                    })
                    .collect()
            }
        }
    }

    fn anomaly_from_row<'r, R>(
        row: &'r R, detected_at: chrono::DateTime<chrono::Utc>,
    ) -> DomainResult<AnomalyRecord>
    where
        R: SqlxRow,
        usize: sqlx::ColumnIndex<R>,
        f64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
        Option<f64>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
        String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    {
        let map = |e: sqlx::Error| DomainError::DatabaseError(e.to_string());
        let date: String = row.try_get(1).map_err(map)?;
        let kind: String = row.try_get(2).map_err(map)?;
        let severity: String = row.try_get(9).map_err(map)?;

        Ok(AnomalyRecord {
            source_id: row.try_get(0).map_err(map)?,
            date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|e| DomainError::DatabaseError(e.to_string()))?,
            kind: match kind.as_str() {
                "volume" => AnomalyKind::Volume,
                "distribution" => AnomalyKind::Distribution,
                other => {
                    return Err(DomainError::DatabaseError(format!(
                        "Unknown anomaly kind: {}",
                        other
                    )))
                }
            },
            metric_name: row.try_get(3).map_err(map)?,
            observed_value: row.try_get(4).map_err(map)?,
            baseline_mean: row.try_get(5).map_err(map)?,
            baseline_stddev: row.try_get(6).map_err(map)?,
            z_score: row.try_get(7).map_err(map)?,
            distance: row.try_get(8).map_err(map)?,
            severity: severity.parse().map_err(DomainError::DatabaseError)?,
            detected_at,
        })
    }
}

#[async_trait]
impl MetricsSink for MetricsRepository {
    async fn record_quality(
        &self, source_id: &str, run_id: &str, score: &QualityScore,
    ) -> DomainResult<()> {
        let sql = format!(
            "INSERT INTO quality_scores (source_id, run_id, {}) VALUES ({})",
            QUALITY_COLUMNS,
            (1..=8)
                .map(|i| self.pool.placeholder(i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        match &self.pool {
            DatabasePool::Sqlite(p) => {
                sqlx::query(&sql)
                    .bind(source_id)
                    .bind(run_id)
                    .bind(score.completeness)
                    .bind(score.accuracy)
                    .bind(score.consistency)
                    .bind(score.overall)
                    .bind(score.warning_count as i64)
                    .bind(format_timestamp(score.computed_at))
                    .execute(p)
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
            DatabasePool::Postgres(p) => {
                sqlx::query(&sql)
                    .bind(source_id)
                    .bind(run_id)
                    .bind(score.completeness)
                    .bind(score.accuracy)
                    .bind(score.consistency)
                    .bind(score.overall)
                    .bind(score.warning_count as i64)
                    .bind(score.computed_at)
                    .execute(p)
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn record_anomalies(
        &self, run_id: &str, anomalies: &[AnomalyRecord],
    ) -> DomainResult<()> {
        if anomalies.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO anomalies (run_id, {}) VALUES ({})",
            ANOMALY_COLUMNS,
            (1..=12)
                .map(|i| self.pool.placeholder(i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        match &self.pool {
            DatabasePool::Sqlite(p) => {
                let mut tx = p
                    .begin()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                for anomaly in anomalies {
                    sqlx::query(&sql)
                        .bind(run_id)
                        .bind(&anomaly.source_id)
                        .bind(anomaly.date.format("%Y-%m-%d").to_string())
                        .bind(anomaly.kind.as_str())
                        .bind(&anomaly.metric_name)
                        .bind(anomaly.observed_value)
                        .bind(anomaly.baseline_mean)
                        .bind(anomaly.baseline_stddev)
                        .bind(anomaly.z_score)
                        .bind(anomaly.distance)
                        .bind(anomaly.severity.as_str())
                        .bind(format_timestamp(anomaly.detected_at))
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                }

                tx.commit()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
            DatabasePool::Postgres(p) => {
                let mut tx = p
                    .begin()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;

                for anomaly in anomalies {
                    sqlx::query(&sql)
                        .bind(run_id)
                        .bind(&anomaly.source_id)
                        .bind(anomaly.date.format("%Y-%m-%d").to_string())
                        .bind(anomaly.kind.as_str())
                        .bind(&anomaly.metric_name)
                        .bind(anomaly.observed_value)
                        .bind(anomaly.baseline_mean)
                        .bind(anomaly.baseline_stddev)
                        .bind(anomaly.z_score)
                        .bind(anomaly.distance)
                        .bind(anomaly.severity.as_str())
                        .bind(anomaly.detected_at)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
                }

                tx.commit()
                    .await
                    .map_err(|e| DomainError::DatabaseError(e.to_string()))?;
            }
        }

        Ok(())
    }
}
