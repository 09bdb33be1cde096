use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "postgres")]
use sqlx::postgres::{
    PgPool,
    PgPoolOptions,
};
use sqlx::sqlite::{
    SqliteConnectOptions,
    SqlitePoolOptions,
};
use sqlx::{
    Executor,
    SqlitePool,
};

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS watermarks (
        source_id TEXT PRIMARY KEY,
        last_extracted_at TEXT NOT NULL,
        last_commit_at TEXT NOT NULL,
        status TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS run_audit (
        run_id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        window_from TEXT NOT NULL,
        window_to TEXT NOT NULL,
        rows_processed INTEGER NOT NULL,
        quality_json TEXT,
        committed_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_run_audit_source ON run_audit (source_id, committed_at)",
    "CREATE TABLE IF NOT EXISTS quality_scores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        completeness REAL NOT NULL,
        accuracy REAL NOT NULL,
        consistency REAL NOT NULL,
        overall REAL NOT NULL,
        warning_count INTEGER NOT NULL,
        computed_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_quality_scores_source ON quality_scores (source_id, computed_at)",
    "CREATE TABLE IF NOT EXISTS anomalies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        partition_date TEXT NOT NULL,
        kind TEXT NOT NULL,
        metric_name TEXT NOT NULL,
        observed_value REAL NOT NULL,
        baseline_mean REAL NOT NULL,
        baseline_stddev REAL NOT NULL,
        z_score REAL NOT NULL,
        distance REAL,
        severity TEXT NOT NULL,
        detected_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_anomalies_source ON anomalies (source_id, detected_at)",
];

#[cfg(feature = "postgres")]
const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS watermarks (
        source_id TEXT PRIMARY KEY,
        last_extracted_at TIMESTAMPTZ NOT NULL,
        last_commit_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        version BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS run_audit (
        run_id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        window_from TIMESTAMPTZ NOT NULL,
        window_to TIMESTAMPTZ NOT NULL,
        rows_processed BIGINT NOT NULL,
        quality_json TEXT,
        committed_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_run_audit_source ON run_audit (source_id, committed_at)",
    "CREATE TABLE IF NOT EXISTS quality_scores (
        id BIGSERIAL PRIMARY KEY,
        source_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        completeness DOUBLE PRECISION NOT NULL,
        accuracy DOUBLE PRECISION NOT NULL,
        consistency DOUBLE PRECISION NOT NULL,
        overall DOUBLE PRECISION NOT NULL,
        warning_count BIGINT NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_quality_scores_source ON quality_scores (source_id, computed_at)",
    "CREATE TABLE IF NOT EXISTS anomalies (
        id BIGSERIAL PRIMARY KEY,
        run_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        partition_date TEXT NOT NULL,
        kind TEXT NOT NULL,
        metric_name TEXT NOT NULL,
        observed_value DOUBLE PRECISION NOT NULL,
        baseline_mean DOUBLE PRECISION NOT NULL,
        baseline_stddev DOUBLE PRECISION NOT NULL,
        z_score DOUBLE PRECISION NOT NULL,
        distance DOUBLE PRECISION,
        severity TEXT NOT NULL,
        detected_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_anomalies_source ON anomalies (source_id, detected_at)",
];

pub async fn init_database(path: PathBuf) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(300))
        .connect_with(options)
        .await?;

    for statement in SQLITE_SCHEMA {
        pool.execute(*statement).await?;
    }

    tracing::debug!(path = %path.display(), "SQLite database ready");

    Ok(pool)
}

#[cfg(feature = "postgres")]
pub async fn init_postgres_database(connection_string: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET search_path TO public")
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(connection_string)
        .await?;

    for statement in POSTGRES_SCHEMA {
        pool.execute(*statement).await?;
    }

    Ok(pool)
}
