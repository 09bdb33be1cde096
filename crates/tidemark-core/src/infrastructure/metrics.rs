use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    AnomalyRecord,
    DomainResult,
    QualityScore,
};

/// Time series of quality scores and anomalies for later querying
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_quality(
        &self, source_id: &str, run_id: &str, score: &QualityScore,
    ) -> DomainResult<()>;

    async fn record_anomalies(&self, run_id: &str, anomalies: &[AnomalyRecord])
        -> DomainResult<()>;
}

pub struct NoOpMetricsSink;

#[async_trait]
impl MetricsSink for NoOpMetricsSink {
    async fn record_quality(
        &self, _source_id: &str, _run_id: &str, _score: &QualityScore,
    ) -> DomainResult<()> {
        Ok(())
    }

    async fn record_anomalies(
        &self, _run_id: &str, _anomalies: &[AnomalyRecord],
    ) -> DomainResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMetricsSink {
    quality: RwLock<Vec<(String, String, QualityScore)>>,
    anomalies: RwLock<Vec<(String, AnomalyRecord)>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn quality_scores(&self, source_id: &str) -> Vec<QualityScore> {
        self.quality
            .read()
            .await
            .iter()
            .filter(|(source, _, _)| source == source_id)
            .map(|(_, _, score)| score.clone())
            .collect()
    }

    pub async fn anomalies(&self) -> Vec<AnomalyRecord> {
        self.anomalies
            .read()
            .await
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn record_quality(
        &self, source_id: &str, run_id: &str, score: &QualityScore,
    ) -> DomainResult<()> {
        self.quality
            .write()
            .await
            .push((source_id.to_string(), run_id.to_string(), score.clone()));
        Ok(())
    }

    async fn record_anomalies(
        &self, run_id: &str, anomalies: &[AnomalyRecord],
    ) -> DomainResult<()> {
        let mut stored = self.anomalies.write().await;
        stored.extend(
            anomalies
                .iter()
                .map(|record| (run_id.to_string(), record.clone())),
        );
        Ok(())
    }
}
