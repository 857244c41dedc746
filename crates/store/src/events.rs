//! Event repository: the authoritative write/read path for
//! [`SecurityEvent`] rows, including filtered pagination, store-side
//! timeline bucketing and the dashboard aggregates.

use chrono::{DateTime, Utc};
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::{
    DetectionMethod, EventStatus, EventSummary, EventType, IpEnrichment, RiskLevel, SecurityEvent,
    SecurityEventStats, TimeRange,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// Filter for `query`; all fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Empty means any
    pub risk_levels: Vec<RiskLevel>,
    /// Empty means any
    pub event_types: Vec<EventType>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub source_ip: Option<String>,
    /// Full-text match over summary and command line
    pub text: Option<String>,
    pub status: Option<EventStatus>,
}

/// Operator-editable fields for PATCH updates.
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub notes: Option<String>,
    pub status: Option<EventStatus>,
}

/// Outcome of an insert attempt against the dedup constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same dedup key already exists; nothing was written.
    Duplicate,
}

/// Timeline bucket granularities accepted by the aggregation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            "week" => Some(Granularity::Week),
            "month" => Some(Granularity::Month),
            _ => None,
        }
    }

    /// Argument for `date_trunc`; a fixed mapping, never caller input.
    fn date_trunc_arg(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

/// One timeline bucket.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimelineBucket {
    pub timestamp: DateTime<Utc>,
    pub count: i64,
}

/// Summary statistics over a time window.
#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct TimelineStats {
    pub total_events: i64,
    pub by_risk: HashMap<String, i64>,
    pub by_type: HashMap<String, i64>,
    pub by_hour_of_day: HashMap<u8, i64>,
    pub by_day_of_week: HashMap<u8, i64>,
    pub top_techniques: Vec<(String, i64)>,
    pub top_hosts: Vec<(String, i64)>,
    pub top_users: Vec<(String, i64)>,
    pub average_confidence: f64,
    pub events_per_hour: f64,
}

/// Repository over the `security_events` table.
#[derive(Clone)]
pub struct EventRepository {
    pool: PgPool,
}

impl EventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an event exactly once per dedup key.
    pub async fn insert(&self, event: &SecurityEvent) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO security_events (
                id, event_id, channel, event_type, risk_level, risk_rank,
                confidence, correlation_score, event_time, created_at, host,
                username, source_ip, dest_ip, process, command_line,
                parent_process, mitre_techniques, summary, recommended_actions,
                detection_method, ip_enrichment, embedding_ref, notes, status,
                correlation_ids, dedup_key, degraded
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26,
                $27, $28
            )
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(event.id)
        .bind(event.event_id as i32)
        .bind(&event.channel)
        .bind(event.event_type.as_str())
        .bind(event.risk_level.as_str())
        .bind(event.risk_level as i16)
        .bind(event.confidence as i16)
        .bind(event.correlation_score)
        .bind(event.timestamp)
        .bind(event.created_at)
        .bind(&event.host)
        .bind(&event.user)
        .bind(&event.source_ip)
        .bind(&event.dest_ip)
        .bind(&event.process)
        .bind(&event.command_line)
        .bind(&event.parent_process)
        .bind(serde_json::to_value(&event.mitre_techniques)?)
        .bind(&event.summary)
        .bind(serde_json::to_value(&event.recommended_actions)?)
        .bind(event.detection_method.as_str())
        .bind(
            event
                .ip_enrichment
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(event.embedding_ref)
        .bind(&event.notes)
        .bind(event.status.as_str())
        .bind(serde_json::to_value(&event.correlation_ids)?)
        .bind(&event.dedup_key)
        .bind(event.degraded)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SecurityEvent>> {
        let row = sqlx::query("SELECT * FROM security_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| event_from_row(&r)).transpose()
    }

    /// Apply an operator patch to the mutable fields.
    pub async fn update(&self, id: Uuid, patch: &EventPatch) -> Result<SecurityEvent> {
        if patch.notes.is_none() && patch.status.is_none() {
            return Err(Error::invalid_input("patch must set notes or status"));
        }

        let result = sqlx::query(
            r#"
            UPDATE security_events
            SET notes = COALESCE($2, notes),
                status = COALESCE($3, status)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&patch.notes)
        .bind(patch.status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("security event {} not found", id)));
        }
        self.get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("security event {} not found", id)))
    }

    /// Paged query with conjunctive filters, newest first.
    pub async fn query(
        &self,
        filter: &EventFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<SecurityEvent>, i64)> {
        let limit = limit.clamp(1, 500);
        let offset = (page.max(1) - 1) as i64 * limit as i64;

        let mut query = QueryBuilder::new("SELECT * FROM security_events");
        push_filters(&mut query, filter);
        query.push(" ORDER BY event_time DESC LIMIT ");
        query.push_bind(limit as i64);
        query.push(" OFFSET ");
        query.push_bind(offset);

        let rows = query.build().fetch_all(&self.pool).await?;
        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>>>()?;

        let mut count_query = QueryBuilder::new("SELECT COUNT(*) AS total FROM security_events");
        push_filters(&mut count_query, filter);
        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        Ok((events, total))
    }

    /// Bucketed counts computed at the store via `date_trunc`. An event at
    /// exactly the upper bound falls into the next bucket.
    pub async fn timeline(
        &self,
        granularity: Granularity,
        filter: &EventFilter,
    ) -> Result<Vec<TimelineBucket>> {
        let mut query = QueryBuilder::new(format!(
            "SELECT date_trunc('{}', event_time) AS bucket, COUNT(*) AS count FROM security_events",
            granularity.date_trunc_arg()
        ));
        push_filters(&mut query, filter);
        query.push(" GROUP BY bucket ORDER BY bucket");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(TimelineBucket {
                    timestamp: row.try_get("bucket")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    /// Window statistics for the timeline stats endpoint.
    pub async fn timeline_stats(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<TimelineStats> {
        let mut stats = TimelineStats::default();

        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total, COALESCE(AVG(confidence), 0)::float8 AS avg_confidence
            FROM security_events WHERE event_time >= $1 AND event_time < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        stats.total_events = totals.try_get("total")?;
        stats.average_confidence = totals.try_get("avg_confidence")?;

        let hours = (to - from).num_seconds().max(1) as f64 / 3_600.0;
        stats.events_per_hour = stats.total_events as f64 / hours;

        let by_risk = sqlx::query(
            r#"
            SELECT risk_level, COUNT(*) AS count FROM security_events
            WHERE event_time >= $1 AND event_time < $2 GROUP BY risk_level
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        for row in by_risk {
            stats
                .by_risk
                .insert(row.try_get("risk_level")?, row.try_get("count")?);
        }

        let by_type = sqlx::query(
            r#"
            SELECT event_type, COUNT(*) AS count FROM security_events
            WHERE event_time >= $1 AND event_time < $2 GROUP BY event_type
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        for row in by_type {
            stats
                .by_type
                .insert(row.try_get("event_type")?, row.try_get("count")?);
        }

        let by_hour = sqlx::query(
            r#"
            SELECT EXTRACT(HOUR FROM event_time)::int4 AS hour, COUNT(*) AS count
            FROM security_events WHERE event_time >= $1 AND event_time < $2 GROUP BY hour
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        for row in by_hour {
            let hour: i32 = row.try_get("hour")?;
            stats.by_hour_of_day.insert(hour as u8, row.try_get("count")?);
        }

        let by_dow = sqlx::query(
            r#"
            SELECT EXTRACT(DOW FROM event_time)::int4 AS dow, COUNT(*) AS count
            FROM security_events WHERE event_time >= $1 AND event_time < $2 GROUP BY dow
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        for row in by_dow {
            let dow: i32 = row.try_get("dow")?;
            stats.by_day_of_week.insert(dow as u8, row.try_get("count")?);
        }

        stats.top_techniques = self
            .top_counts(
                r#"
                SELECT technique AS name, COUNT(*) AS count
                FROM security_events, jsonb_array_elements_text(mitre_techniques) AS technique
                WHERE event_time >= $1 AND event_time < $2
                GROUP BY technique ORDER BY count DESC LIMIT 10
                "#,
                from,
                to,
            )
            .await?;
        stats.top_hosts = self
            .top_counts(
                r#"
                SELECT host AS name, COUNT(*) AS count FROM security_events
                WHERE event_time >= $1 AND event_time < $2
                GROUP BY host ORDER BY count DESC LIMIT 10
                "#,
                from,
                to,
            )
            .await?;
        stats.top_users = self
            .top_counts(
                r#"
                SELECT username AS name, COUNT(*) AS count FROM security_events
                WHERE event_time >= $1 AND event_time < $2 AND username IS NOT NULL
                GROUP BY username ORDER BY count DESC LIMIT 10
                "#,
                from,
                to,
            )
            .await?;

        Ok(stats)
    }

    /// The security-event slice of the consolidated dashboard snapshot.
    pub async fn dashboard_aggregates(&self, range: TimeRange) -> Result<SecurityEventStats> {
        let from = Utc::now() - range.duration();

        let mut stats = SecurityEventStats::default();

        let rows = sqlx::query(
            r#"
            SELECT risk_level, COUNT(*) AS count, MAX(event_time) AS latest
            FROM security_events WHERE event_time >= $1 GROUP BY risk_level
            "#,
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let risk: String = row.try_get("risk_level")?;
            let count: i64 = row.try_get("count")?;
            let latest: Option<DateTime<Utc>> = row.try_get("latest")?;
            if let Some(level) = RiskLevel::parse(&risk) {
                stats.risk_counts.insert(level, count as u64);
            }
            stats.total += count as u64;
            stats.last_event_time = match (stats.last_event_time, latest) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }

        stats.recent = self.recent_summaries(10, Some(from)).await?;
        Ok(stats)
    }

    /// Most recent event summaries, newest first.
    pub async fn recent_summaries(
        &self,
        limit: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventSummary>> {
        let mut query = QueryBuilder::new(
            "SELECT id, event_type, risk_level, event_time, host, username, source_ip, summary \
             FROM security_events",
        );
        if let Some(since) = since {
            query.push(" WHERE event_time >= ");
            query.push_bind(since);
        }
        query.push(" ORDER BY event_time DESC LIMIT ");
        query.push_bind(limit as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let event_type: String = row.try_get("event_type")?;
                let risk: String = row.try_get("risk_level")?;
                Ok(EventSummary {
                    id: row.try_get("id")?,
                    event_type: EventType::parse(&event_type).unwrap_or(EventType::Other),
                    risk_level: RiskLevel::parse(&risk).unwrap_or(RiskLevel::Low),
                    timestamp: row.try_get("event_time")?,
                    host: row.try_get("host")?,
                    user: row.try_get("username")?,
                    source_ip: row.try_get("source_ip")?,
                    summary: row.try_get("summary")?,
                })
            })
            .collect()
    }

    /// Retention sweep: remove events older than the cutoff. Returns the ids
    /// of removed rows so the vector store can be swept to match.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("DELETE FROM security_events WHERE event_time < $1 RETURNING id")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(Error::from))
            .collect()
    }

    async fn top_counts(
        &self,
        sql: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("name")?, row.try_get("count")?)))
            .collect()
    }
}

fn push_filters(query: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &EventFilter) {
    query.push(" WHERE TRUE");
    if let Some(from) = filter.date_from {
        query.push(" AND event_time >= ");
        query.push_bind(from);
    }
    if let Some(to) = filter.date_to {
        query.push(" AND event_time < ");
        query.push_bind(to);
    }
    if !filter.risk_levels.is_empty() {
        query.push(" AND risk_level IN (");
        let mut separated = query.separated(", ");
        for risk in &filter.risk_levels {
            separated.push_bind(risk.as_str());
        }
        query.push(")");
    }
    if !filter.event_types.is_empty() {
        query.push(" AND event_type IN (");
        let mut separated = query.separated(", ");
        for event_type in &filter.event_types {
            separated.push_bind(event_type.as_str());
        }
        query.push(")");
    }
    if let Some(host) = &filter.host {
        query.push(" AND host = ");
        query.push_bind(host.clone());
    }
    if let Some(user) = &filter.user {
        query.push(" AND username = ");
        query.push_bind(user.clone());
    }
    if let Some(source_ip) = &filter.source_ip {
        query.push(" AND source_ip = ");
        query.push_bind(source_ip.clone());
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ");
        query.push_bind(status.as_str());
    }
    if let Some(text) = &filter.text {
        query.push(" AND search_tsv @@ plainto_tsquery('english', ");
        query.push_bind(text.clone());
        query.push(")");
    }
}

/// Decode a full event row.
pub(crate) fn event_from_row(row: &PgRow) -> Result<SecurityEvent> {
    let event_type: String = row.try_get("event_type")?;
    let risk: String = row.try_get("risk_level")?;
    let method: String = row.try_get("detection_method")?;
    let status: String = row.try_get("status")?;
    let event_id: i32 = row.try_get("event_id")?;
    let confidence: i16 = row.try_get("confidence")?;

    let mitre: serde_json::Value = row.try_get("mitre_techniques")?;
    let actions: serde_json::Value = row.try_get("recommended_actions")?;
    let correlation_ids: serde_json::Value = row.try_get("correlation_ids")?;
    let enrichment: Option<serde_json::Value> = row.try_get("ip_enrichment")?;

    Ok(SecurityEvent {
        id: row.try_get("id")?,
        event_id: event_id as u32,
        channel: row.try_get("channel")?,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad event_type column"))?,
        risk_level: RiskLevel::parse(&risk)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad risk_level column"))?,
        confidence: confidence.clamp(0, 100) as u8,
        correlation_score: row.try_get("correlation_score")?,
        timestamp: row.try_get("event_time")?,
        created_at: row.try_get("created_at")?,
        host: row.try_get("host")?,
        user: row.try_get("username")?,
        source_ip: row.try_get("source_ip")?,
        dest_ip: row.try_get("dest_ip")?,
        process: row.try_get("process")?,
        command_line: row.try_get("command_line")?,
        parent_process: row.try_get("parent_process")?,
        mitre_techniques: serde_json::from_value(mitre)?,
        summary: row.try_get("summary")?,
        recommended_actions: serde_json::from_value(actions)?,
        detection_method: DetectionMethod::parse(&method)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad detection_method column"))?,
        ip_enrichment: enrichment
            .map(serde_json::from_value::<IpEnrichment>)
            .transpose()?,
        embedding_ref: row.try_get("embedding_ref")?,
        notes: row.try_get("notes")?,
        status: EventStatus::parse(&status)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad status column"))?,
        correlation_ids: serde_json::from_value(correlation_ids)?,
        dedup_key: row.try_get("dedup_key")?,
        degraded: row.try_get("degraded")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_rejects_unknown_values() {
        assert_eq!(Granularity::parse("hour"), Some(Granularity::Hour));
        assert_eq!(Granularity::parse("fortnight"), None);
    }

    #[test]
    fn granularity_maps_to_fixed_trunc_args() {
        for (input, expected) in [
            (Granularity::Minute, "minute"),
            (Granularity::Hour, "hour"),
            (Granularity::Day, "day"),
            (Granularity::Week, "week"),
            (Granularity::Month, "month"),
        ] {
            assert_eq!(input.date_trunc_arg(), expected);
        }
    }

    #[test]
    fn empty_patch_is_rejected_shape() {
        let patch = EventPatch::default();
        assert!(patch.notes.is_none() && patch.status.is_none());
    }
}
