use super::schema::{
    SourceAdapterConfig,
    SourceConfig,
    StorageBackend,
    StorageConfig,
    TidemarkConfig,
};
use crate::domain::{
    validate_source_id,
    AnomalySettings,
    PipelineSettings,
    QualityWeights,
    ValidationThresholds,
};

#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<ConfigWarning>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_issues(&self) -> bool {
        !self.errors.is_empty() || !self.warnings.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>, code: ConfigErrorCode) {
        self.errors.push(ConfigError {
            field: field.into(),
            message: message.into(),
            code,
        });
    }

    fn warning(
        &mut self, field: impl Into<String>, message: impl Into<String>, code: ConfigWarningCode,
    ) {
        self.warnings.push(ConfigWarning {
            field: field.into(),
            message: message.into(),
            code,
        });
    }

    pub fn summary(&self) -> String {
        if self.errors.is_empty() && self.warnings.is_empty() {
            "Configuration is valid".to_string()
        } else {
            format!(
                "{} error(s), {} warning(s)",
                self.errors.len(),
                self.warnings.len()
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub field: String,
    pub message: String,
    pub code: ConfigErrorCode,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorCode {
    MissingRequired,
    InvalidValue,
    UnknownField,
    FeatureNotEnabled,
}

impl std::fmt::Display for ConfigErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRequired => write!(f, "MISSING_REQUIRED"),
            Self::InvalidValue => write!(f, "INVALID_VALUE"),
            Self::UnknownField => write!(f, "UNKNOWN_FIELD"),
            Self::FeatureNotEnabled => write!(f, "FEATURE_NOT_ENABLED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub code: ConfigWarningCode,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarningCode {
    NoSources,
    EmptySchema,
    OpenCategory,
    Suspicious,
}

impl std::fmt::Display for ConfigWarningCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSources => write!(f, "NO_SOURCES"),
            Self::EmptySchema => write!(f, "EMPTY_SCHEMA"),
            Self::OpenCategory => write!(f, "OPEN_CATEGORY"),
            Self::Suspicious => write!(f, "SUSPICIOUS"),
        }
    }
}

fn check_ratio(result: &mut ConfigValidation, field: &str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        result.error(
            field,
            format!("must be between 0 and 1, got {}", value),
            ConfigErrorCode::InvalidValue,
        );
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &TidemarkConfig) -> ConfigValidation {
        let mut result = ConfigValidation::new();

        Self::validate_storage(&config.storage, &mut result);
        Self::validate_pipeline(&config.pipeline, &mut result);
        Self::validate_thresholds("validation", &config.validation, &mut result);
        Self::validate_anomaly("anomaly", &config.anomaly, &mut result);
        Self::validate_quality(&config.quality, &mut result);

        if config.sources.is_empty() {
            result.warning(
                "sources",
                "No sources configured",
                ConfigWarningCode::NoSources,
            );
        }

        for (source_id, source) in &config.sources {
            Self::validate_source(config, source_id, source, &mut result);
        }

        result
    }

    fn validate_storage(storage: &StorageConfig, result: &mut ConfigValidation) {
        if storage.backend == StorageBackend::Postgres
            && storage.postgres.connection_string.is_empty()
        {
            result.error(
                "storage.postgres.connection_string",
                "PostgreSQL connection string is required when backend = 'postgres'",
                ConfigErrorCode::MissingRequired,
            );
        }

        #[cfg(not(feature = "postgres"))]
        if storage.backend == StorageBackend::Postgres {
            result.error(
                "storage.backend",
                "PostgreSQL backend requires the 'postgres' feature",
                ConfigErrorCode::FeatureNotEnabled,
            );
        }
    }

    fn validate_pipeline(pipeline: &PipelineSettings, result: &mut ConfigValidation) {
        if pipeline.max_workers == 0 {
            result.error(
                "pipeline.max_workers",
                "must be at least 1",
                ConfigErrorCode::InvalidValue,
            );
        }
        if pipeline.window_minutes <= 0 {
            result.error(
                "pipeline.window_minutes",
                "must be positive",
                ConfigErrorCode::InvalidValue,
            );
        } else if (24 * 60) % pipeline.window_minutes != 0 {
            result.warning(
                "pipeline.window_minutes",
                "does not divide a day; windows are still cut at midnight",
                ConfigWarningCode::Suspicious,
            );
        }
        if pipeline.batch_size == 0 {
            result.error(
                "pipeline.batch_size",
                "must be at least 1",
                ConfigErrorCode::InvalidValue,
            );
        }
        if pipeline.retry.max_attempts == 0 {
            result.error(
                "pipeline.retry.max_attempts",
                "must be at least 1",
                ConfigErrorCode::InvalidValue,
            );
        }
        if pipeline.safety_lag_secs == 0 {
            result.warning(
                "pipeline.safety_lag_secs",
                "no safety lag; in-flight transactions may be missed",
                ConfigWarningCode::Suspicious,
            );
        }
    }

    fn validate_thresholds(
        prefix: &str, thresholds: &ValidationThresholds, result: &mut ConfigValidation,
    ) {
        check_ratio(
            result,
            &format!("{}.count_tolerance", prefix),
            thresholds.count_tolerance,
        );
        check_ratio(
            result,
            &format!("{}.null_threshold", prefix),
            thresholds.null_threshold,
        );
        check_ratio(
            result,
            &format!("{}.range_tolerance", prefix),
            thresholds.range_tolerance,
        );
        check_ratio(
            result,
            &format!("{}.type_mismatch_tolerance", prefix),
            thresholds.type_mismatch_tolerance,
        );
        if thresholds.rule_max_attempts == 0 {
            result.error(
                format!("{}.rule_max_attempts", prefix),
                "must be at least 1",
                ConfigErrorCode::InvalidValue,
            );
        }
    }

    fn validate_anomaly(prefix: &str, anomaly: &AnomalySettings, result: &mut ConfigValidation) {
        check_ratio(
            result,
            &format!("{}.similarity_floor", prefix),
            anomaly.similarity_floor,
        );
        if anomaly.z_threshold <= 0.0 {
            result.error(
                format!("{}.z_threshold", prefix),
                "must be positive",
                ConfigErrorCode::InvalidValue,
            );
        }
        if anomaly.z_high_threshold < anomaly.z_threshold {
            result.error(
                format!("{}.z_high_threshold", prefix),
                "must not be lower than z_threshold",
                ConfigErrorCode::InvalidValue,
            );
        }
        if anomaly.min_baseline_days > anomaly.baseline_days {
            result.warning(
                format!("{}.min_baseline_days", prefix),
                "exceeds baseline_days; volume detection will never run",
                ConfigWarningCode::Suspicious,
            );
        }
    }

    fn validate_quality(quality: &QualityWeights, result: &mut ConfigValidation) {
        let weights = [
            ("quality.completeness", quality.completeness),
            ("quality.accuracy", quality.accuracy),
            ("quality.consistency", quality.consistency),
        ];
        for (field, weight) in weights {
            if weight < 0.0 {
                result.error(field, "must not be negative", ConfigErrorCode::InvalidValue);
            }
        }
        if quality.total() <= 0.0 {
            result.error(
                "quality",
                "at least one weight must be positive",
                ConfigErrorCode::InvalidValue,
            );
        } else if (quality.total() - 1.0).abs() > 1e-6 {
            result.warning(
                "quality",
                format!("weights sum to {}, not 1", quality.total()),
                ConfigWarningCode::Suspicious,
            );
        }
    }

    fn validate_source(
        config: &TidemarkConfig, source_id: &str, source: &SourceConfig,
        result: &mut ConfigValidation,
    ) {
        let prefix = format!("sources.{}", source_id);

        if let Err(e) = validate_source_id(source_id) {
            result.error(prefix.clone(), e.to_string(), ConfigErrorCode::InvalidValue);
        }

        match &source.adapter {
            SourceAdapterConfig::Sqlite(adapter) => {
                if adapter.path.is_empty() {
                    result.error(
                        format!("{}.adapter.path", prefix),
                        "SQLite source path is required",
                        ConfigErrorCode::MissingRequired,
                    );
                }
                if adapter.table.is_empty() {
                    result.error(
                        format!("{}.adapter.table", prefix),
                        "table is required",
                        ConfigErrorCode::MissingRequired,
                    );
                }
            }
        }

        let schema = &source.schema;
        if schema.fields.is_empty() {
            result.warning(
                format!("{}.schema", prefix),
                "No fields declared; only identifiers and timestamps are validated",
                ConfigWarningCode::EmptySchema,
            );
        }

        for field in &schema.fields {
            if let (Some(min), Some(max)) = (field.min, field.max) {
                if min > max {
                    result.error(
                        format!("{}.schema.{}", prefix, field.name),
                        format!("min {} is greater than max {}", min, max),
                        ConfigErrorCode::InvalidValue,
                    );
                }
            }
            if field.has_range() && !field.field_type.is_numeric() {
                result.warning(
                    format!("{}.schema.{}", prefix, field.name),
                    "range declared on a non-numeric field is ignored",
                    ConfigWarningCode::Suspicious,
                );
            }
        }

        for (setting, name) in [
            ("dimension", schema.dimension.as_deref()),
            ("error_flag", schema.error_flag.as_deref()),
        ] {
            let Some(name) = name else {
                continue;
            };
            match schema.field(name) {
                None => result.error(
                    format!("{}.schema.{}", prefix, setting),
                    format!("references undeclared field '{}'", name),
                    ConfigErrorCode::UnknownField,
                ),
                Some(spec) if setting == "dimension" && !spec.is_categorical() => result.warning(
                    format!("{}.schema.{}", prefix, setting),
                    format!("'{}' has no allowed set; category drift is not checked", name),
                    ConfigWarningCode::OpenCategory,
                ),
                Some(_) => {}
            }
        }

        let thresholds = config.validation.merged(&source.validation);
        Self::validate_thresholds(&format!("{}.validation", prefix), &thresholds, result);
        let anomaly = config.anomaly.merged(&source.anomaly);
        Self::validate_anomaly(&format!("{}.anomaly", prefix), &anomaly, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::ConfigLoader;

    #[test]
    fn test_default_config_only_warns() {
        let result = ConfigValidator::validate(&TidemarkConfig::default());
        assert!(result.is_ok());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.code == ConfigWarningCode::NoSources));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let config = ConfigLoader::parse(
            r#"
            [pipeline]
            max_workers = 0

            [validation]
            count_tolerance = 1.5

            [anomaly]
            z_threshold = 3.0
            z_high_threshold = 2.0
            "#,
        )
        .unwrap();

        let result = ConfigValidator::validate(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"pipeline.max_workers"));
        assert!(fields.contains(&"validation.count_tolerance"));
        assert!(fields.contains(&"anomaly.z_high_threshold"));
    }

    #[test]
    fn test_source_checks() {
        let config = ConfigLoader::parse(
            r#"
            [sources.orders.adapter]
            type = "sqlite"
            path = "/data/shop.db"
            table = "orders"

            [sources.orders.schema]
            dimension = "channel"

            [[sources.orders.schema.fields]]
            name = "amount"
            type = "float"
            min = 10.0
            max = 1.0

            [sources.orders.validation]
            null_threshold = -0.1
            "#,
        )
        .unwrap();

        let result = ConfigValidator::validate(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"sources.orders.schema.amount"));
        assert!(fields.contains(&"sources.orders.schema.dimension"));
        assert!(fields.contains(&"sources.orders.validation.null_threshold"));
        assert!(!result.is_ok());
    }
}
