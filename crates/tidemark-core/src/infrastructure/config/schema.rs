use std::path::PathBuf;

use chrono::{
    DateTime,
    Utc,
};
use indexmap::IndexMap;
use serde::{
    Deserialize,
    Serialize,
};

use crate::domain::{
    AnomalyOverrides,
    AnomalySettings,
    PipelineSettings,
    QualityWeights,
    RecordSchema,
    SourceProfile,
    ValidationOverrides,
    ValidationThresholds,
};

pub(super) const DEFAULT_DATABASE_FILE: &str = "tidemark.db";

pub(super) const DEFAULT_OBJECTS_DIR: &str = "objects";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Postgres,
}

impl StorageBackend {
    pub fn requires_postgres(&self) -> bool {
        matches!(self, Self::Postgres)
    }
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(format!(
                "Unknown storage backend: {}. Valid options: sqlite, postgres",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TidemarkConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub validation: ValidationThresholds,

    #[serde(default)]
    pub anomaly: AnomalySettings,

    #[serde(default)]
    pub quality: QualityWeights,

    #[serde(default)]
    pub sources: IndexMap<String, SourceConfig>,
}

impl TidemarkConfig {
    pub fn data_dir(&self) -> PathBuf {
        if self.general.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.general.data_dir)
        }
    }

    pub fn default_data_dir() -> PathBuf {
        std::env::var("TIDEMARK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .map(|p| p.join("tidemark"))
                    .unwrap_or_else(|| PathBuf::from(".tidemark"))
            })
    }

    pub fn db_path(&self) -> PathBuf {
        if self.storage.database_path.is_empty() {
            self.data_dir().join(DEFAULT_DATABASE_FILE)
        } else {
            PathBuf::from(&self.storage.database_path)
        }
    }

    pub fn objects_dir(&self) -> PathBuf {
        if self.storage.objects_dir.is_empty() {
            self.data_dir().join(DEFAULT_OBJECTS_DIR)
        } else {
            PathBuf::from(&self.storage.objects_dir)
        }
    }

    /// Global thresholds merged with the source's overrides
    pub fn source_profile(&self, source_id: &str) -> Option<SourceProfile> {
        let source = self.sources.get(source_id)?;

        Some(
            SourceProfile::new(source_id, source.schema.clone())
                .with_thresholds(self.validation.merged(&source.validation))
                .with_anomaly(self.anomaly.merged(&source.anomaly)),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeneralConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file; defaults to `<data_dir>/tidemark.db`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database_path: String,

    /// Root of the tiered object store; defaults to `<data_dir>/objects`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub objects_dir: String,

    #[serde(default, skip_serializing_if = "is_default_postgres_config")]
    pub postgres: PostgresConfig,
}

fn is_default_postgres_config(c: &PostgresConfig) -> bool {
    c.connection_string.is_empty()
}

impl StorageConfig {
    pub fn summary(&self) -> String {
        format!("Storage: {} backend", self.backend)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    #[serde(default)]
    pub connection_string: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub adapter: SourceAdapterConfig,

    #[serde(default)]
    pub schema: RecordSchema,

    /// Used by `init` when no explicit start is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_watermark: Option<DateTime<Utc>>,

    #[serde(default)]
    pub validation: ValidationOverrides,

    #[serde(default)]
    pub anomaly: AnomalyOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceAdapterConfig {
    Sqlite(SqliteSourceConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSourceConfig {
    /// Path of the SQLite database holding the table
    pub path: String,

    pub table: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default = "default_time_column")]
    pub time_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_time_column() -> String {
    "updated_at".to_string()
}
