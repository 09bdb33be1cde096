pub mod aggregate;
pub mod anomaly;
pub mod batch;
pub mod error;
pub mod manifest;
pub mod quality;
pub mod run;
pub mod schema;
pub mod settings;
pub mod validation;
pub mod watermark;

pub use aggregate::{
    DailyAggregate,
    GroupSummary,
    MetricSummary,
};
pub use anomaly::{
    AnomalyKind,
    AnomalyOverrides,
    AnomalyRecord,
    AnomalySettings,
    AnomalySeverity,
};
pub use batch::{
    Batch,
    TimeWindow,
    WindowPlan,
};
pub use error::{
    DomainError,
    DomainResult,
};
pub use manifest::{
    validate_source_id,
    ManifestEntry,
    PartitionKey,
};
pub use quality::{
    QualityScore,
    QualityWeights,
};
pub use run::{
    RunStatus,
    RunSummary,
};
pub use schema::{
    FieldSpec,
    RecordSchema,
};
pub use settings::{
    PipelineSettings,
    SourceProfile,
};
pub use validation::{
    GateState,
    RuleCategory,
    Severity,
    Tier,
    ValidationOverrides,
    ValidationReport,
    ValidationResult,
    ValidationThresholds,
};
pub use watermark::{
    RunAudit,
    Watermark,
    WatermarkStatus,
};
