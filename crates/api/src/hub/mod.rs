//! # Broadcast Hub
//!
//! Group-scoped fan-out of dashboard snapshots and event notifications to
//! connected WebSocket clients. Groups: `dashboard`, `system_status`,
//! `scan:{scanId}` and `events:{filter}`.
//!
//! Delivery is at-least-once to connected clients only; disconnected
//! clients are not queued (dashboards re-fetch the consolidated snapshot on
//! reconnect). Per-connection send queues are bounded: non-critical
//! messages are dropped oldest-first under pressure, while a `SecurityEvent`
//! overflow closes the connection instead of dropping the event.
//! `DashboardUpdate`s are debounced: rapid sub-events coalesce into one
//! push carrying the latest snapshot.

pub mod socket;

use async_trait::async_trait;
use dashmap::DashMap;
use sentinel_core::error::Result;
use sentinel_core::metrics::PipelineMetrics;
use sentinel_core::types::{Correlation, DashboardSnapshot, EventSummary};
use sentinel_pipeline::EventPublisher;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Messages the hub emits to clients.
#[derive(Debug, Clone)]
pub enum HubMessage {
    DashboardUpdate(serde_json::Value),
    SecurityEvent(serde_json::Value),
    SystemStatusUpdate(serde_json::Value),
    CorrelationDetected(serde_json::Value),
    ScanProgress(serde_json::Value),
}

impl HubMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::DashboardUpdate(_) => "DashboardUpdate",
            HubMessage::SecurityEvent(_) => "SecurityEvent",
            HubMessage::SystemStatusUpdate(_) => "SystemStatusUpdate",
            HubMessage::CorrelationDetected(_) => "CorrelationDetected",
            HubMessage::ScanProgress(_) => "ScanProgress",
        }
    }

    /// Losing one of these is acceptable under backpressure.
    fn droppable(&self) -> bool {
        !matches!(self, HubMessage::SecurityEvent(_))
    }

    fn payload(&self) -> &serde_json::Value {
        match self {
            HubMessage::DashboardUpdate(v)
            | HubMessage::SecurityEvent(v)
            | HubMessage::SystemStatusUpdate(v)
            | HubMessage::CorrelationDetected(v)
            | HubMessage::ScanProgress(v) => v,
        }
    }

    pub fn to_wire(&self) -> String {
        serde_json::json!({ "type": self.kind(), "data": self.payload() }).to_string()
    }
}

/// Per-connection send queue capacity.
const SEND_QUEUE_CAPACITY: usize = 64;
/// Debounce window for coalesced dashboard updates.
const DASHBOARD_DEBOUNCE: Duration = Duration::from_millis(500);

struct Connection {
    tx: mpsc::Sender<String>,
    #[allow(dead_code)]
    principal: Option<String>,
}

/// Computes the consolidated snapshot pushed on debounced updates.
#[async_trait]
pub trait SnapshotProvider: Send + Sync + 'static {
    async fn snapshot(&self) -> Result<DashboardSnapshot>;
}

pub struct BroadcastHub {
    connections: DashMap<Uuid, Connection>,
    groups: DashMap<String, HashSet<Uuid>>,
    dashboard_dirty: Notify,
    metrics: PipelineMetrics,
}

impl BroadcastHub {
    pub fn new(metrics: PipelineMetrics) -> Self {
        Self {
            connections: DashMap::new(),
            groups: DashMap::new(),
            dashboard_dirty: Notify::new(),
            metrics,
        }
    }

    /// Register a connection; the caller owns the receiving half.
    pub fn register(&self, principal: Option<String>) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        self.connections.insert(id, Connection { tx, principal });
        debug!(connection_id = %id, "hub connection registered");
        (id, rx)
    }

    pub fn unregister(&self, id: Uuid) {
        self.connections.remove(&id);
        for mut group in self.groups.iter_mut() {
            group.value_mut().remove(&id);
        }
        debug!(connection_id = %id, "hub connection closed");
    }

    /// Join a group. Authorization happened upstream: the connection
    /// carries a pre-validated principal.
    pub fn join(&self, id: Uuid, group: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(id);
        debug!(connection_id = %id, group, "joined group");
    }

    pub fn leave(&self, id: Uuid, group: &str) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(&id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Fan a message out to a group. Member ids are snapshotted first so no
    /// map lock is held across channel sends.
    pub fn broadcast(&self, group: &str, message: &HubMessage) {
        let member_ids: Vec<Uuid> = match self.groups.get(group) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };
        if member_ids.is_empty() {
            return;
        }

        let wire = message.to_wire();
        let mut to_close = Vec::new();

        for id in member_ids {
            let Some(connection) = self.connections.get(&id) else {
                continue;
            };
            match connection.tx.try_send(wire.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if message.droppable() {
                        debug!(connection_id = %id, kind = message.kind(), "slow client, update dropped");
                    } else {
                        // A SecurityEvent is never silently dropped: the
                        // connection is closed and the client re-syncs.
                        warn!(connection_id = %id, "slow client, closing connection");
                        to_close.push(id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => to_close.push(id),
            }
        }

        for id in to_close {
            self.unregister(id);
        }

        self.metrics
            .broadcasts_sent
            .with_label_values(&[message.kind()])
            .inc();
    }

    /// Request a (debounced) dashboard push.
    pub fn mark_dashboard_dirty(&self) {
        self.dashboard_dirty.notify_one();
    }

    /// Emit a scan progress update to its scan group.
    pub fn scan_progress(&self, scan_id: &str, payload: serde_json::Value) {
        self.broadcast(
            &format!("scan:{}", scan_id),
            &HubMessage::ScanProgress(payload),
        );
    }

    /// Push a system status update to its group.
    pub fn system_status(&self, payload: serde_json::Value) {
        self.broadcast("system_status", &HubMessage::SystemStatusUpdate(payload));
    }

    /// Immediate (non-debounced) dashboard push, used by the broadcast
    /// endpoint.
    pub fn dashboard_update(&self, snapshot: &DashboardSnapshot) {
        if let Ok(payload) = serde_json::to_value(snapshot) {
            self.broadcast("dashboard", &HubMessage::DashboardUpdate(payload));
        }
    }

    /// Debounce loop: coalesces dirty marks within the window and pushes
    /// one snapshot reflecting the latest state.
    pub async fn run_dashboard_debouncer(
        self: Arc<Self>,
        provider: Arc<dyn SnapshotProvider>,
        cancel: CancellationToken,
    ) {
        info!("dashboard debouncer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.dashboard_dirty.notified() => {
                    // Collect further marks for the debounce window.
                    tokio::time::sleep(DASHBOARD_DEBOUNCE).await;
                    match provider.snapshot().await {
                        Ok(snapshot) => self.dashboard_update(&snapshot),
                        Err(e) => debug!(error = %e, "snapshot computation failed"),
                    }
                }
            }
        }
        info!("dashboard debouncer stopped");
    }

    /// Close every connection; used during shutdown.
    pub fn close_all(&self) {
        let ids: Vec<Uuid> = self.connections.iter().map(|c| *c.key()).collect();
        for id in ids {
            self.unregister(id);
        }
        self.groups.clear();
    }
}

/// Does `summary` match an `events:{filter}` group suffix? Filters are a
/// risk level, an event type, or `all`.
fn matches_event_filter(filter: &str, summary: &EventSummary) -> bool {
    if filter == "all" {
        return true;
    }
    if let Some(risk) = sentinel_core::types::RiskLevel::parse(filter) {
        return summary.risk_level == risk;
    }
    if let Some(event_type) = sentinel_core::types::EventType::parse(filter) {
        return summary.event_type == event_type;
    }
    false
}

impl EventPublisher for BroadcastHub {
    fn publish_event(&self, summary: EventSummary) {
        let Ok(payload) = serde_json::to_value(&summary) else {
            return;
        };
        let message = HubMessage::SecurityEvent(payload);

        self.broadcast("dashboard", &message);

        let filter_groups: Vec<String> = self
            .groups
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix("events:")
                    .filter(|suffix| matches_event_filter(suffix, &summary))
                    .map(|_| entry.key().clone())
            })
            .collect();
        for group in filter_groups {
            self.broadcast(&group, &message);
        }

        self.mark_dashboard_dirty();
    }

    fn publish_correlation(&self, correlation: &Correlation) {
        if let Ok(payload) = serde_json::to_value(correlation) {
            self.broadcast("dashboard", &HubMessage::CorrelationDetected(payload));
        }
        self.mark_dashboard_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::config::MetricsConfig;
    use sentinel_core::metrics::MetricsRegistry;
    use sentinel_core::types::{EventType, RiskLevel};

    fn hub() -> BroadcastHub {
        let registry = MetricsRegistry::new(MetricsConfig {
            enabled: false,
            namespace: "test".into(),
        });
        BroadcastHub::new(PipelineMetrics::new(&registry))
    }

    fn summary(risk: RiskLevel) -> EventSummary {
        EventSummary {
            id: Uuid::new_v4(),
            event_type: EventType::AuthenticationFailure,
            risk_level: risk,
            timestamp: chrono::Utc::now(),
            host: "WIN-1".into(),
            user: Some("admin".into()),
            source_ip: Some("203.0.113.45".into()),
            summary: "failed logon".into(),
        }
    }

    #[tokio::test]
    async fn group_members_receive_broadcasts() {
        let hub = hub();
        let (id, mut rx) = hub.register(None);
        hub.join(id, "dashboard");

        hub.broadcast(
            "dashboard",
            &HubMessage::SecurityEvent(serde_json::json!({"x": 1})),
        );

        let wire = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed["type"], "SecurityEvent");
        assert_eq!(parsed["data"]["x"], 1);
    }

    #[tokio::test]
    async fn non_members_receive_nothing() {
        let hub = hub();
        let (_id, mut rx) = hub.register(None);
        hub.broadcast(
            "dashboard",
            &HubMessage::SecurityEvent(serde_json::json!({})),
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn security_event_overflow_closes_connection() {
        let hub = hub();
        let (id, _rx) = hub.register(None);
        hub.join(id, "dashboard");

        // Saturate the bounded queue without draining it.
        for _ in 0..(SEND_QUEUE_CAPACITY + 1) {
            hub.broadcast(
                "dashboard",
                &HubMessage::SecurityEvent(serde_json::json!({})),
            );
        }
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn droppable_overflow_keeps_connection() {
        let hub = hub();
        let (id, _rx) = hub.register(None);
        hub.join(id, "dashboard");

        for _ in 0..(SEND_QUEUE_CAPACITY + 10) {
            hub.broadcast(
                "dashboard",
                &HubMessage::DashboardUpdate(serde_json::json!({})),
            );
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn event_filter_groups_match_risk_and_type() {
        let hub = hub();
        let (high_id, mut high_rx) = hub.register(None);
        hub.join(high_id, "events:high");
        let (auth_id, mut auth_rx) = hub.register(None);
        hub.join(auth_id, "events:authentication_failure");
        let (low_id, mut low_rx) = hub.register(None);
        hub.join(low_id, "events:low");

        hub.publish_event(summary(RiskLevel::High));

        assert!(high_rx.try_recv().is_ok());
        assert!(auth_rx.try_recv().is_ok());
        assert!(low_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn scan_progress_reaches_only_its_scan_group() {
        let hub = hub();
        let (id, mut rx) = hub.register(None);
        hub.join(id, "scan:abc");
        let (other_id, mut other_rx) = hub.register(None);
        hub.join(other_id, "scan:xyz");

        hub.scan_progress("abc", serde_json::json!({"percent": 40}));

        let wire = rx.try_recv().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed["type"], "ScanProgress");
        assert_eq!(parsed["data"]["percent"], 40);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let hub = hub();
        let (id, mut rx) = hub.register(None);
        hub.join(id, "system_status");
        hub.leave(id, "system_status");

        hub.system_status(serde_json::json!({"healthy": true}));
        assert!(rx.try_recv().is_err());
    }
}
