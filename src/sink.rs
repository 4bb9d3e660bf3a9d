//! Fan-out of pipeline events to live listeners.
//!
//! The core publishes and forgets: delivery is best effort and at most once.
//! Broadcasting to many listeners is the sink's job, not the pipeline's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::aqi::AqiResult;
use crate::error::CoreError;
use crate::models::{Notification, Reading};

// ---

/// Events pushed to the fan-out sink, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    SensorData { reading: Reading, aqi: Vec<AqiResult> },
    Alert { notification: Notification },
    Maintenance { sensor_id: String, battery_level: u8 },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::SensorData { .. } => "sensor_data",
            PipelineEvent::Alert { .. } => "alert",
            PipelineEvent::Maintenance { .. } => "maintenance",
        }
    }
}

#[async_trait]
pub trait FanoutSink: Send + Sync {
    async fn publish(&self, event: PipelineEvent) -> Result<(), CoreError>;
}

// ---

/// In-process broadcast; each subscriber gets its own bounded buffer and
/// lagging subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<PipelineEvent>,
}

impl BroadcastSink {
    // ---
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        BroadcastSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl FanoutSink for BroadcastSink {
    async fn publish(&self, event: PipelineEvent) -> Result<(), CoreError> {
        // ---
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(n) => trace!("Published {} event to {} listeners", kind, n),
            // Nobody listening is fine
            Err(_) => trace!("Dropped {} event, no listeners", kind),
        }
        Ok(())
    }
}
