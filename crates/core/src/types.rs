//! Core domain model shared by every subsystem: raw log records, security
//! events, detection rules, correlations and dashboard snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A raw record as delivered by a log channel subscription.
///
/// Owned by the log watcher; its lifetime ends once the orchestrator has
/// accepted it into the intake queue, at which point the channel bookmark may
/// advance past `bookmark_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub channel: String,
    pub event_id: u32,
    pub time_created: DateTime<Utc>,
    pub xml_payload: String,
    pub host: String,
    /// Opaque per-channel position token
    pub bookmark_token: u64,
    /// Fields pre-extracted from the payload (user, source_ip, process, ...)
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl RawRecord {
    /// Stable content hash, part of the dedup key.
    pub fn record_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.xml_payload.as_bytes());
        hex_encode(&hasher.finalize())
    }

    /// Dedup identity: exactly one SecurityEvent may exist per key within the
    /// configured window.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.channel,
            self.event_id,
            self.time_created.timestamp_millis(),
            self.host,
            self.record_hash()
        )
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Classification of a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AuthenticationSuccess,
    AuthenticationFailure,
    ProcessCreation,
    NetworkConnection,
    PrivilegeEscalation,
    FileSystem,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AuthenticationSuccess => "authentication_success",
            EventType::AuthenticationFailure => "authentication_failure",
            EventType::ProcessCreation => "process_creation",
            EventType::NetworkConnection => "network_connection",
            EventType::PrivilegeEscalation => "privilege_escalation",
            EventType::FileSystem => "file_system",
            EventType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authentication_success" => Some(EventType::AuthenticationSuccess),
            "authentication_failure" => Some(EventType::AuthenticationFailure),
            "process_creation" => Some(EventType::ProcessCreation),
            "network_connection" => Some(EventType::NetworkConnection),
            "privilege_escalation" => Some(EventType::PrivilegeEscalation),
            "file_system" => Some(EventType::FileSystem),
            "other" => Some(EventType::Other),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk levels are totally ordered so correlation upgrades can be expressed
/// as `max(current, proposed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// Monotonic upgrade: the result is never lower than `self`.
    pub fn upgraded_to(self, proposed: RiskLevel) -> RiskLevel {
        self.max(proposed)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the classification on an event was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Deterministic,
    Ai,
    Correlation,
    Hybrid,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Deterministic => "deterministic",
            DetectionMethod::Ai => "ai",
            DetectionMethod::Correlation => "correlation",
            DetectionMethod::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deterministic" => Some(DetectionMethod::Deterministic),
            "ai" => Some(DetectionMethod::Ai),
            "correlation" => Some(DetectionMethod::Correlation),
            "hybrid" => Some(DetectionMethod::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage status of an event, revisable by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Open,
    Investigating,
    Resolved,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Open => "open",
            EventStatus::Investigating => "investigating",
            EventStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(EventStatus::Open),
            "investigating" => Some(EventStatus::Investigating),
            "resolved" => Some(EventStatus::Resolved),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geo/ASN enrichment attached to an event's source address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IpEnrichment {
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub organization: Option<String>,
    pub is_high_risk: bool,
}

impl IpEnrichment {
    /// Lookup failed or the address is private: everything unknown.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.country.is_none() && self.asn.is_none()
    }
}

/// The central entity flowing through the enrichment pipeline and stored in
/// the relational store.
///
/// Invariants:
/// - `created_at >= timestamp`
/// - `id` is unique; creation order is monotonic via `created_at`
/// - once persisted, `timestamp`, `event_id`, `channel` and `host` never
///   change; `notes`, `status`, `correlation_score`, `correlation_ids` and
///   `mitre_techniques` may be revised by later stages
/// - `risk_level` only ever moves upward after persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_id: u32,
    pub channel: String,
    pub event_type: EventType,
    pub risk_level: RiskLevel,
    /// 0..=100
    pub confidence: u8,
    /// 0.0..=1.0, set by the correlation engine
    pub correlation_score: f64,
    /// Source timestamp from the log record
    pub timestamp: DateTime<Utc>,
    /// When the pipeline created this event
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub user: Option<String>,
    pub source_ip: Option<String>,
    pub dest_ip: Option<String>,
    pub process: Option<String>,
    pub command_line: Option<String>,
    pub parent_process: Option<String>,
    pub mitre_techniques: Vec<String>,
    pub summary: String,
    pub recommended_actions: Vec<String>,
    pub detection_method: DetectionMethod,
    pub ip_enrichment: Option<IpEnrichment>,
    /// Vector store reference; equals `id` once the embedding is persisted
    pub embedding_ref: Option<Uuid>,
    pub notes: String,
    pub status: EventStatus,
    pub correlation_ids: Vec<Uuid>,
    /// Dedup identity carried from the raw record
    pub dedup_key: String,
    /// Set when the pipeline fell back to a reduced path for this event
    pub degraded: bool,
}

impl SecurityEvent {
    /// Build the minimal event for a record no rule matched.
    pub fn minimal(record: &RawRecord) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event_id: record.event_id,
            channel: record.channel.clone(),
            event_type: EventType::Other,
            risk_level: RiskLevel::Low,
            confidence: 0,
            correlation_score: 0.0,
            timestamp: record.time_created,
            created_at: now.max(record.time_created),
            host: record.host.clone(),
            user: record.field("user").map(str::to_owned),
            source_ip: record.field("source_ip").map(str::to_owned),
            dest_ip: record.field("dest_ip").map(str::to_owned),
            process: record.field("process").map(str::to_owned),
            command_line: record.field("command_line").map(str::to_owned),
            parent_process: record.field("parent_process").map(str::to_owned),
            mitre_techniques: Vec::new(),
            summary: format!("Unclassified event {} on channel {}", record.event_id, record.channel),
            recommended_actions: Vec::new(),
            detection_method: DetectionMethod::Deterministic,
            ip_enrichment: None,
            embedding_ref: None,
            notes: String::new(),
            status: EventStatus::Open,
            correlation_ids: Vec::new(),
            dedup_key: record.dedup_key(),
            degraded: false,
        }
    }

    /// Deterministic canonical projection used for embedding input and cache
    /// keys: `channel|event_id|summary|host|user|source_ip|process`,
    /// lowercased with runs of whitespace collapsed to a single space.
    /// Missing optional fields render empty between their separators so the
    /// shape is stable.
    pub fn canonical_text(&self) -> String {
        let raw = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.channel,
            self.event_id,
            self.summary,
            self.host,
            self.user.as_deref().unwrap_or(""),
            self.source_ip.as_deref().unwrap_or(""),
            self.process.as_deref().unwrap_or(""),
        );
        normalize_text(&raw)
    }

    /// SHA-256 of the canonical text; the embedding cache key.
    pub fn canonical_hash(&self) -> String {
        text_hash(&self.canonical_text())
    }

    /// Raise the risk level, never lowering it. Returns true when changed.
    pub fn upgrade_risk(&mut self, proposed: RiskLevel) -> bool {
        let upgraded = self.risk_level.upgraded_to(proposed);
        let changed = upgraded != self.risk_level;
        self.risk_level = upgraded;
        changed
    }

    /// Compact projection for broadcasts and dashboard "recent" lists.
    pub fn summary_view(&self) -> EventSummary {
        EventSummary {
            id: self.id,
            event_type: self.event_type,
            risk_level: self.risk_level,
            timestamp: self.timestamp,
            host: self.host.clone(),
            user: self.user.clone(),
            source_ip: self.source_ip.clone(),
            summary: self.summary.clone(),
        }
    }
}

/// Normalize free text: lowercase, collapse whitespace runs.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    out
}

/// SHA-256 hex digest of normalized text.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// A neighbor returned by vector similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub similarity: f32,
    pub metadata: HashMap<String, String>,
}

/// Compact event projection pushed to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: Uuid,
    pub event_type: EventType,
    pub risk_level: RiskLevel,
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub user: Option<String>,
    pub source_ip: Option<String>,
    pub summary: String,
}

/// Deterministic `(channel, event_id)` classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    pub id: i32,
    pub event_id: u32,
    pub channel: String,
    pub event_type: EventType,
    pub risk_level: RiskLevel,
    pub confidence: u8,
    pub summary: String,
    pub mitre_techniques: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub enabled: bool,
    pub priority: i32,
    pub tags: Vec<String>,
}

/// Categories of incidents the correlation engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationType {
    TemporalBurst,
    BruteForce,
    LateralMovement,
    PrivilegeEscalation,
}

impl CorrelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationType::TemporalBurst => "temporal_burst",
            CorrelationType::BruteForce => "brute_force",
            CorrelationType::LateralMovement => "lateral_movement",
            CorrelationType::PrivilegeEscalation => "privilege_escalation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temporal_burst" => Some(CorrelationType::TemporalBurst),
            "brute_force" => Some(CorrelationType::BruteForce),
            "lateral_movement" => Some(CorrelationType::LateralMovement),
            "privilege_escalation" => Some(CorrelationType::PrivilegeEscalation),
            _ => None,
        }
    }
}

impl fmt::Display for CorrelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A higher-order incident grouping related events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub id: Uuid,
    pub correlation_type: CorrelationType,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    /// Human-readable description of the matched pattern
    pub pattern: String,
    pub event_ids: Vec<Uuid>,
    pub mitre_techniques: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub time_window_secs: u64,
    pub matched_rule: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Runtime form of a configured correlation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub id: String,
    pub correlation_type: CorrelationType,
    pub time_window_secs: u64,
    pub min_event_count: usize,
    pub min_confidence: f64,
    pub required_event_types: Vec<EventType>,
    pub enabled: bool,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Dashboard aggregation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Hour => "1h",
            TimeRange::Day => "24h",
            TimeRange::Week => "7d",
            TimeRange::Month => "30d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(TimeRange::Hour),
            "24h" => Some(TimeRange::Day),
            "7d" => Some(TimeRange::Week),
            "30d" => Some(TimeRange::Month),
            _ => None,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            TimeRange::Hour => chrono::Duration::hours(1),
            TimeRange::Day => chrono::Duration::hours(24),
            TimeRange::Week => chrono::Duration::days(7),
            TimeRange::Month => chrono::Duration::days(30),
        }
    }
}

/// Health of a single platform component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Security-event slice of the consolidated snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityEventStats {
    pub total: u64,
    pub risk_counts: HashMap<RiskLevel, u64>,
    pub recent: Vec<EventSummary>,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Component-health slice of the consolidated snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemStatusStats {
    pub total_components: u32,
    pub healthy_components: u32,
    pub component_statuses: HashMap<String, ComponentHealth>,
}

/// Scanner slice of the consolidated snapshot. Populated by the external
/// scanner integration; carried here so the snapshot schema is complete.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThreatScannerStats {
    pub total_scans: u64,
    pub active_scans: u32,
    pub threats_found: u64,
    pub last_scan_time: Option<DateTime<Utc>>,
}

/// Consolidated dashboard state, recomputed on demand and cached for at most
/// 30 seconds. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub security_events: SecurityEventStats,
    pub system_status: SystemStatusStats,
    pub threat_scanner: ThreatScannerStats,
    pub last_updated: DateTime<Utc>,
    pub time_range: TimeRange,
}

/// Per-channel replay position, persisted in the relational store. Advanced
/// only past records the orchestrator has durably accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub channel: String,
    pub token: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RawRecord {
        RawRecord {
            channel: "Security".into(),
            event_id: 4625,
            time_created: Utc::now(),
            xml_payload: "<Event><System><EventID>4625</EventID></System></Event>".into(),
            host: "WIN-SERVER01".into(),
            bookmark_token: 42,
            fields: HashMap::from([
                ("user".to_string(), "SYSTEM\\administrator".to_string()),
                ("source_ip".to_string(), "203.0.113.45".to_string()),
                ("process".to_string(), "lsass.exe".to_string()),
            ]),
        }
    }

    #[test]
    fn risk_upgrade_is_monotonic() {
        let mut event = SecurityEvent::minimal(&sample_record());
        assert_eq!(event.risk_level, RiskLevel::Low);

        assert!(event.upgrade_risk(RiskLevel::High));
        assert_eq!(event.risk_level, RiskLevel::High);

        // Downgrade attempts are ignored
        assert!(!event.upgrade_risk(RiskLevel::Medium));
        assert_eq!(event.risk_level, RiskLevel::High);
    }

    #[test]
    fn created_at_never_precedes_timestamp() {
        let mut record = sample_record();
        record.time_created = Utc::now() + chrono::Duration::seconds(30);
        let event = SecurityEvent::minimal(&record);
        assert!(event.created_at >= event.timestamp);
    }

    #[test]
    fn canonical_text_collapses_whitespace_and_case() {
        let mut event = SecurityEvent::minimal(&sample_record());
        event.summary = "Failed   Logon\tAttempt".into();
        let text = event.canonical_text();
        assert!(text.contains("failed logon attempt"));
        assert!(!text.contains("  "));
    }

    #[test]
    fn canonical_hash_ignores_whitespace_differences() {
        let mut a = SecurityEvent::minimal(&sample_record());
        let mut b = SecurityEvent::minimal(&sample_record());
        a.summary = "failed logon attempt".into();
        b.summary = "Failed  logon\t attempt ".into();
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn dedup_key_differs_per_payload() {
        let a = sample_record();
        let mut b = sample_record();
        b.xml_payload.push_str("<extra/>");
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn time_range_round_trip() {
        for range in [TimeRange::Hour, TimeRange::Day, TimeRange::Week, TimeRange::Month] {
            assert_eq!(TimeRange::parse(range.as_str()), Some(range));
        }
        assert_eq!(TimeRange::parse("2h"), None);
    }
}
