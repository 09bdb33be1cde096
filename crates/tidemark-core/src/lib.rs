pub mod application;
pub mod domain;
pub mod event;
pub mod infrastructure;
pub mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
pub use application::{
    PipelineOrchestrator,
    TieredWriter,
    ValidationEngine,
};
pub use domain::{
    DomainError,
    DomainResult,
    RunStatus,
    RunSummary,
    SourceProfile,
    Watermark,
};
pub use event::{
    EventBus,
    NoOpEventBus,
    Notification,
    NotificationSeverity,
    NotificationSink,
    PipelineEvent,
    TracingNotificationSink,
};
use infrastructure::config::{
    SourceAdapterConfig,
    SqliteSourceConfig,
};
use infrastructure::database::{
    init_database,
    DatabasePool,
};
pub use infrastructure::{
    config::TidemarkConfig,
    LocalObjectSink,
    MetricsRepository,
    MetricsSink,
    ObjectSink,
    SqlSource,
    SqlWatermarkStore,
    WatermarkStore,
};
use sqlx::sqlite::{
    SqliteConnectOptions,
    SqlitePoolOptions,
};

/// Fully wired pipeline for a loaded configuration
pub struct PipelineContext {
    pub config: TidemarkConfig,

    pub watermarks: Arc<dyn WatermarkStore>,

    pub metrics: Arc<MetricsRepository>,

    pub sink: Arc<dyn ObjectSink>,

    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl PipelineContext {
    pub async fn new(config: TidemarkConfig) -> anyhow::Result<Self> {
        Self::with_event_bus(config, Arc::new(NoOpEventBus)).await
    }

    pub async fn with_event_bus(
        config: TidemarkConfig, event_bus: Arc<dyn EventBus>,
    ) -> anyhow::Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let pool = open_database(&config).await?;
        let watermarks: Arc<dyn WatermarkStore> =
            Arc::new(SqlWatermarkStore::new_from_pool(pool.clone()));
        let metrics = Arc::new(MetricsRepository::new_from_pool(pool));
        let sink: Arc<dyn ObjectSink> = Arc::new(LocalObjectSink::new(config.objects_dir()));

        let mut orchestrator = PipelineOrchestrator::new(
            Arc::clone(&watermarks),
            Arc::clone(&sink),
            config.pipeline.clone(),
        )
        .with_metrics(metrics.clone())
        .with_notifications(Arc::new(TracingNotificationSink))
        .with_event_bus(event_bus)
        .with_quality_weights(config.quality.clone());

        for (source_id, source_config) in &config.sources {
            let profile = config
                .source_profile(source_id)
                .with_context(|| format!("No profile for source {}", source_id))?;

            let source = match &source_config.adapter {
                SourceAdapterConfig::Sqlite(adapter) => open_sqlite_source(source_id, adapter)?,
            };
            orchestrator
                .register_source(Arc::new(source), profile)
                .with_context(|| format!("Failed to register source {}", source_id))?;
        }

        tracing::info!(
            data_dir = %data_dir.display(),
            backend = %config.storage.backend,
            sources = config.sources.len(),
            "Pipeline context ready"
        );

        Ok(Self {
            config,
            watermarks,
            metrics,
            sink,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

async fn open_database(config: &TidemarkConfig) -> anyhow::Result<DatabasePool> {
    if config.storage.backend.requires_postgres() {
        #[cfg(feature = "postgres")]
        {
            let pool = infrastructure::database::init_postgres_database(
                &config.storage.postgres.connection_string,
            )
            .await
            .context("Failed to connect to PostgreSQL")?;
            return Ok(DatabasePool::Postgres(pool));
        }

        #[cfg(not(feature = "postgres"))]
        anyhow::bail!("PostgreSQL backend requested but the postgres feature is disabled");
    }

    let db_path = config.db_path();
    let pool = init_database(db_path.clone())
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    Ok(DatabasePool::Sqlite(pool))
}

/// Source tables are opened read-only and connected on first use
fn open_sqlite_source(source_id: &str, adapter: &SqliteSourceConfig) -> anyhow::Result<SqlSource> {
    let options = SqliteConnectOptions::new()
        .filename(&adapter.path)
        .read_only(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(30))
        .connect_lazy_with(options);

    SqlSource::new(
        source_id,
        pool,
        &adapter.table,
        &adapter.id_column,
        &adapter.time_column,
    )
    .with_context(|| format!("Invalid adapter for source {}", source_id))
}
