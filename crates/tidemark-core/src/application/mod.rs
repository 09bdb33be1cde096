pub mod anomaly;
pub mod extractor;
pub mod orchestrator;
pub mod quality;
pub mod validation;
pub mod writer;

pub use anomaly::AnomalyDetector;
pub use extractor::ChangeExtractor;
pub use orchestrator::PipelineOrchestrator;
pub use quality::{
    QualityInputs,
    QualityScorer,
};
pub use validation::{
    ValidationEngine,
    ValidationGate,
};
pub use writer::{
    AggregatedPartition,
    CleanedPartition,
    TieredWriter,
};
