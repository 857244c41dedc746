//! Correlation repository. Persisting a correlation is transactional: the
//! correlation row, the append to each participant's `correlation_ids` and
//! any monotonic risk upgrades commit together, so a correlation is never
//! visible half-applied.

use chrono::{DateTime, Utc};
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::{Correlation, CorrelationType, RiskLevel};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

/// Filter for the correlation listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct CorrelationFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub correlation_type: Option<CorrelationType>,
    pub min_confidence: Option<f64>,
    pub limit: Option<u32>,
}

/// Aggregate statistics for the statistics endpoint.
#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct CorrelationStatistics {
    pub total: i64,
    pub by_type: HashMap<String, i64>,
    pub average_confidence: f64,
    pub last_24h: i64,
}

#[derive(Clone)]
pub struct CorrelationRepository {
    pool: PgPool,
}

impl CorrelationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a correlation and apply its side effects to participants.
    ///
    /// Participant updates are idempotent (the id is appended only when
    /// absent) and risk changes are guarded by `risk_rank <` so they are
    /// strictly monotonic upgrades.
    pub async fn insert_with_upgrades(&self, correlation: &Correlation) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO correlations (
                id, correlation_type, confidence, risk_level, pattern,
                event_ids, mitre_techniques, detected_at, time_window_secs,
                matched_rule, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(correlation.id)
        .bind(correlation.correlation_type.as_str())
        .bind(correlation.confidence)
        .bind(correlation.risk_level.as_str())
        .bind(&correlation.pattern)
        .bind(serde_json::to_value(&correlation.event_ids)?)
        .bind(serde_json::to_value(&correlation.mitre_techniques)?)
        .bind(correlation.detected_at)
        .bind(correlation.time_window_secs as i64)
        .bind(&correlation.matched_rule)
        .bind(serde_json::to_value(&correlation.metadata)?)
        .execute(&mut *tx)
        .await?;

        for event_id in &correlation.event_ids {
            sqlx::query(
                r#"
                UPDATE security_events
                SET correlation_ids = correlation_ids || to_jsonb($2::uuid),
                    correlation_score = GREATEST(correlation_score, $3)
                WHERE id = $1 AND NOT correlation_ids @> to_jsonb($2::uuid)
                "#,
            )
            .bind(event_id)
            .bind(correlation.id)
            .bind(correlation.confidence)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE security_events
                SET risk_level = $2, risk_rank = $3
                WHERE id = $1 AND risk_rank < $3
                "#,
            )
            .bind(event_id)
            .bind(correlation.risk_level.as_str())
            .bind(correlation.risk_level as i16)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn query(&self, filter: &CorrelationFilter) -> Result<Vec<Correlation>> {
        let mut query = sqlx::QueryBuilder::new("SELECT * FROM correlations WHERE TRUE");
        if let Some(start) = filter.start_time {
            query.push(" AND detected_at >= ");
            query.push_bind(start);
        }
        if let Some(end) = filter.end_time {
            query.push(" AND detected_at < ");
            query.push_bind(end);
        }
        if let Some(correlation_type) = filter.correlation_type {
            query.push(" AND correlation_type = ");
            query.push_bind(correlation_type.as_str());
        }
        if let Some(min_confidence) = filter.min_confidence {
            query.push(" AND confidence >= ");
            query.push_bind(min_confidence);
        }
        query.push(" ORDER BY detected_at DESC LIMIT ");
        query.push_bind(filter.limit.unwrap_or(100).clamp(1, 1_000) as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(correlation_from_row).collect()
    }

    pub async fn statistics(&self) -> Result<CorrelationStatistics> {
        let mut stats = CorrelationStatistics::default();

        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(AVG(confidence), 0)::float8 AS avg_confidence \
             FROM correlations",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.total = totals.try_get("total")?;
        stats.average_confidence = totals.try_get("avg_confidence")?;

        let by_type = sqlx::query(
            "SELECT correlation_type, COUNT(*) AS count FROM correlations GROUP BY correlation_type",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in by_type {
            stats
                .by_type
                .insert(row.try_get("correlation_type")?, row.try_get("count")?);
        }

        let last_24h = sqlx::query(
            "SELECT COUNT(*) AS count FROM correlations WHERE detected_at >= $1",
        )
        .bind(Utc::now() - chrono::Duration::hours(24))
        .fetch_one(&self.pool)
        .await?;
        stats.last_24h = last_24h.try_get("count")?;

        Ok(stats)
    }

    /// Retention sweep for old correlations.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM correlations WHERE detected_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn correlation_from_row(row: &PgRow) -> Result<Correlation> {
    let correlation_type: String = row.try_get("correlation_type")?;
    let risk: String = row.try_get("risk_level")?;
    let event_ids: serde_json::Value = row.try_get("event_ids")?;
    let mitre: serde_json::Value = row.try_get("mitre_techniques")?;
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let window: i64 = row.try_get("time_window_secs")?;

    Ok(Correlation {
        id: row.try_get("id")?,
        correlation_type: CorrelationType::parse(&correlation_type).ok_or_else(|| {
            Error::new(ErrorCode::SerializationError, "bad correlation_type column")
        })?,
        confidence: row.try_get("confidence")?,
        risk_level: RiskLevel::parse(&risk)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad risk_level column"))?,
        pattern: row.try_get("pattern")?,
        event_ids: serde_json::from_value(event_ids)?,
        mitre_techniques: serde_json::from_value(mitre)?,
        detected_at: row.try_get("detected_at")?,
        time_window_secs: window as u64,
        matched_rule: row.try_get("matched_rule")?,
        metadata: serde_json::from_value(metadata)?,
    })
}
