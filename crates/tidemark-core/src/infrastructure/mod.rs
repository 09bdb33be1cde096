pub mod checksum;
pub mod config;
pub mod database;
pub mod metrics;
pub mod sources;
pub mod storage;
pub mod watermark;

pub use database::{
    DatabasePool,
    MetricsRepository,
    SqlWatermarkStore,
};
pub use metrics::{
    MemoryMetricsSink,
    MetricsSink,
    NoOpMetricsSink,
};
pub use sources::{
    MemorySource,
    SqlSource,
};
pub use storage::{
    LocalObjectSink,
    MemoryObjectSink,
    ObjectMetadata,
    ObjectSink,
};
pub use watermark::{
    MemoryWatermarkStore,
    WatermarkStore,
};
