use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::RwLock;

use crate::domain::{
    AnomalyRecord,
    GateState,
    Tier,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        source_id: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    WindowExtracted {
        run_id: String,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        rows: u64,
        expected: u64,
    },

    TierWritten {
        run_id: String,
        tier: Tier,
        partition_key: String,
        row_count: u64,
    },

    GateCompleted {
        run_id: String,
        tier: Tier,
        state: GateState,
        blocking_rules: Vec<String>,
    },

    AnomalyDetected {
        run_id: String,
        anomaly: AnomalyRecord,
    },

    WatermarkCommitted {
        run_id: String,
        source_id: String,
        last_extracted_at: DateTime<Utc>,
        version: i64,
    },

    RunFailed {
        run_id: String,
        source_id: String,
        error: String,
    },
}

impl PipelineEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            PipelineEvent::RunStarted { .. } => "run-started",
            PipelineEvent::WindowExtracted { .. } => "window-extracted",
            PipelineEvent::TierWritten { .. } => "tier-written",
            PipelineEvent::GateCompleted { .. } => "gate-completed",
            PipelineEvent::AnomalyDetected { .. } => "anomaly-detected",
            PipelineEvent::WatermarkCommitted { .. } => "watermark-committed",
            PipelineEvent::RunFailed { .. } => "run-failed",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            PipelineEvent::RunStarted { run_id, .. }
            | PipelineEvent::WindowExtracted { run_id, .. }
            | PipelineEvent::TierWritten { run_id, .. }
            | PipelineEvent::GateCompleted { run_id, .. }
            | PipelineEvent::AnomalyDetected { run_id, .. }
            | PipelineEvent::WatermarkCommitted { run_id, .. }
            | PipelineEvent::RunFailed { run_id, .. } => run_id,
        }
    }

    pub fn to_json_payload(&self) -> serde_json::Value {
        match self {
            PipelineEvent::RunStarted {
                run_id,
                source_id,
                from,
                to,
            } => serde_json::json!({
                "run_id": run_id,
                "source_id": source_id,
                "from": from,
                "to": to,
            }),
            PipelineEvent::WindowExtracted {
                run_id,
                window_start,
                window_end,
                rows,
                expected,
            } => serde_json::json!({
                "run_id": run_id,
                "window_start": window_start,
                "window_end": window_end,
                "rows": rows,
                "expected": expected,
            }),
            PipelineEvent::TierWritten {
                run_id,
                tier,
                partition_key,
                row_count,
            } => serde_json::json!({
                "run_id": run_id,
                "tier": tier,
                "partition_key": partition_key,
                "row_count": row_count,
            }),
            PipelineEvent::GateCompleted {
                run_id,
                tier,
                state,
                blocking_rules,
            } => serde_json::json!({
                "run_id": run_id,
                "tier": tier,
                "state": state,
                "blocking_rules": blocking_rules,
            }),
            PipelineEvent::AnomalyDetected { run_id, anomaly } => {
                let mut json = serde_json::to_value(anomaly).unwrap_or_default();
                if let Some(map) = json.as_object_mut() {
                    map.insert("run_id".to_string(), serde_json::json!(run_id));
                }
                json
            }
            PipelineEvent::WatermarkCommitted {
                run_id,
                source_id,
                last_extracted_at,
                version,
            } => serde_json::json!({
                "run_id": run_id,
                "source_id": source_id,
                "last_extracted_at": last_extracted_at,
                "version": version,
            }),
            PipelineEvent::RunFailed {
                run_id,
                source_id,
                error,
            } => serde_json::json!({
                "run_id": run_id,
                "source_id": source_id,
                "error": error,
            }),
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: PipelineEvent);
}

pub struct NoOpEventBus;

#[async_trait]
impl EventBus for NoOpEventBus {
    async fn emit(&self, _event: PipelineEvent) {}
}

/// Keeps every emitted event; used to observe runs in tests
#[derive(Default)]
pub struct RecordingEventBus {
    events: RwLock<Vec<PipelineEvent>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().await.clone()
    }

    pub async fn names(&self) -> Vec<&'static str> {
        self.events
            .read()
            .await
            .iter()
            .map(PipelineEvent::event_name)
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn emit(&self, event: PipelineEvent) {
        self.events.write().await.push(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub severity: NotificationSeverity,
    pub message: String,
    pub context: serde_json::Value,
}

impl Notification {
    pub fn new(
        severity: NotificationSeverity, message: impl Into<String>, context: serde_json::Value,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            context,
        }
    }
}

/// Outbound alert channel; delivery is up to the implementation
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

pub struct NoOpNotificationSink;

#[async_trait]
impl NotificationSink for NoOpNotificationSink {
    async fn notify(&self, _notification: Notification) {}
}

/// Writes notifications to the log at a level matching their severity
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) {
        let context = notification.context.to_string();
        match notification.severity {
            NotificationSeverity::Info => {
                tracing::info!(context = %context, "{}", notification.message)
            }
            NotificationSeverity::Warning => {
                tracing::warn!(context = %context, "{}", notification.message)
            }
            NotificationSeverity::Critical => {
                tracing::error!(context = %context, "{}", notification.message)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryNotificationSink {
    notifications: RwLock<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    pub async fn with_severity(&self, severity: NotificationSeverity) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| n.severity == severity)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn notify(&self, notification: Notification) {
        self.notifications.write().await.push(notification);
    }
}
