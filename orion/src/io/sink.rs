//! One-way dashboard publishing.
//!
//! Sinks never feed back into the loop: publishing is fire-and-forget and
//! must not block or fail the caller.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::hub::HubStatus;
use crate::io::cycle_log::CycleRecord;

/// Point-in-time view published by the supervisor every tick.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub hub: HubStatus,
    pub queue_depth: usize,
    pub pending_decisions: usize,
    /// Stall diagnoses from the latest supervisor pass, `instance_id -> reason`.
    pub stalls: Vec<(String, String)>,
    pub open_circuits: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DashboardUpdate {
    Status(DashboardSnapshot),
    Cycle(CycleRecord),
}

impl DashboardUpdate {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            DashboardUpdate::Status(_) => "status",
            DashboardUpdate::Cycle(_) => "cycle",
        }
    }
}

pub trait DashboardSink: Send + Sync {
    fn publish(&self, update: &DashboardUpdate);
}

/// Drops every update.
pub struct NullSink;

impl DashboardSink for NullSink {
    fn publish(&self, _update: &DashboardUpdate) {}
}

/// Logs updates through `tracing`.
pub struct TracingSink;

impl DashboardSink for TracingSink {
    fn publish(&self, update: &DashboardUpdate) {
        match update {
            DashboardUpdate::Status(snapshot) => debug!(
                instances = snapshot.hub.instances.len(),
                queue_depth = snapshot.queue_depth,
                pending = snapshot.pending_decisions,
                "dashboard status"
            ),
            DashboardUpdate::Cycle(record) => info!(
                instance = %record.instance_id,
                iteration = record.iteration,
                outcome = ?record.result.deploy_outcome,
                "cycle finished"
            ),
        }
    }
}

/// Fans updates out to any number of subscribers (the SSE stream).
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<DashboardUpdate>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardUpdate> {
        self.tx.subscribe()
    }
}

impl DashboardSink for BroadcastSink {
    fn publish(&self, update: &DashboardUpdate) {
        // No subscribers is not an error.
        let _ = self.tx.send(update.clone());
    }
}

/// Publishes to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn DashboardSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn DashboardSink>>) -> Self {
        Self { sinks }
    }
}

impl DashboardSink for FanoutSink {
    fn publish(&self, update: &DashboardUpdate) {
        for sink in &self.sinks {
            sink.publish(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubStatus;

    fn status() -> DashboardUpdate {
        DashboardUpdate::Status(DashboardSnapshot {
            hub: HubStatus {
                instances: Vec::new(),
                active_executor: None,
                executor_conflict: false,
            },
            queue_depth: 0,
            pending_decisions: 0,
            stalls: Vec::new(),
            open_circuits: Vec::new(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish(&status());
        let update = rx.recv().await.expect("update");
        assert_eq!(update.event_name(), "status");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        BroadcastSink::new(1).publish(&status());
        NullSink.publish(&status());
    }

    #[test]
    fn status_serializes_tagged() {
        let value = serde_json::to_value(status()).expect("json");
        assert_eq!(value["type"], "status");
        assert_eq!(value["data"]["queue_depth"], 0);
    }
}
