//! Detection-rule repository: the admin-managed `(channel, event_id)`
//! classification table consumed by the rule detector's cached snapshot.

use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::{DetectionRule, EventType, RiskLevel};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Create/update payload for a rule. `id` is assigned by the store.
#[derive(Debug, Clone)]
pub struct RuleSpec {
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

#[derive(Clone)]
pub struct RuleRepository {
    pool: PgPool,
}

impl RuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The full enabled set, ordered by priority. This is what the detector
    /// snapshots.
    pub async fn load_enabled(&self) -> Result<Vec<DetectionRule>> {
        let rows = sqlx::query(
            "SELECT * FROM detection_rules WHERE enabled ORDER BY priority DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<DetectionRule>> {
        let rows = sqlx::query("SELECT * FROM detection_rules ORDER BY priority DESC, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    pub async fn get(&self, id: i32) -> Result<Option<DetectionRule>> {
        let row = sqlx::query("SELECT * FROM detection_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    pub async fn create(&self, spec: &RuleSpec) -> Result<DetectionRule> {
        let row = sqlx::query(
            r#"
            INSERT INTO detection_rules (
                event_id, channel, event_type, risk_level, confidence, summary,
                mitre_techniques, recommended_actions, enabled, priority, tags
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(spec.event_id as i32)
        .bind(&spec.channel)
        .bind(spec.event_type.as_str())
        .bind(spec.risk_level.as_str())
        .bind(spec.confidence as i16)
        .bind(&spec.summary)
        .bind(serde_json::to_value(&spec.mitre_techniques)?)
        .bind(serde_json::to_value(&spec.recommended_actions)?)
        .bind(spec.enabled)
        .bind(spec.priority)
        .bind(serde_json::to_value(&spec.tags)?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::conflict(format!(
                "rule for ({}, {}) already exists",
                spec.channel, spec.event_id
            )),
            _ => Error::from(e),
        })?;

        rule_from_row(&row)
    }

    pub async fn update(&self, id: i32, spec: &RuleSpec) -> Result<DetectionRule> {
        let row = sqlx::query(
            r#"
            UPDATE detection_rules SET
                event_id = $2, channel = $3, event_type = $4, risk_level = $5,
                confidence = $6, summary = $7, mitre_techniques = $8,
                recommended_actions = $9, enabled = $10, priority = $11, tags = $12
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(spec.event_id as i32)
        .bind(&spec.channel)
        .bind(spec.event_type.as_str())
        .bind(spec.risk_level.as_str())
        .bind(spec.confidence as i16)
        .bind(&spec.summary)
        .bind(serde_json::to_value(&spec.mitre_techniques)?)
        .bind(serde_json::to_value(&spec.recommended_actions)?)
        .bind(spec.enabled)
        .bind(spec.priority)
        .bind(serde_json::to_value(&spec.tags)?)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => rule_from_row(&row),
            None => Err(Error::not_found(format!("detection rule {} not found", id))),
        }
    }

    pub async fn delete(&self, id: i32) -> Result<()> {
        let result = sqlx::query("DELETE FROM detection_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("detection rule {} not found", id)));
        }
        Ok(())
    }
}

fn rule_from_row(row: &PgRow) -> Result<DetectionRule> {
    let event_type: String = row.try_get("event_type")?;
    let risk: String = row.try_get("risk_level")?;
    let event_id: i32 = row.try_get("event_id")?;
    let confidence: i16 = row.try_get("confidence")?;
    let mitre: serde_json::Value = row.try_get("mitre_techniques")?;
    let actions: serde_json::Value = row.try_get("recommended_actions")?;
    let tags: serde_json::Value = row.try_get("tags")?;

    Ok(DetectionRule {
        id: row.try_get("id")?,
        event_id: event_id as u32,
        channel: row.try_get("channel")?,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad event_type column"))?,
        risk_level: RiskLevel::parse(&risk)
            .ok_or_else(|| Error::new(ErrorCode::SerializationError, "bad risk_level column"))?,
        confidence: confidence.clamp(0, 100) as u8,
        summary: row.try_get("summary")?,
        mitre_techniques: serde_json::from_value(mitre)?,
        recommended_actions: serde_json::from_value(actions)?,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        tags: serde_json::from_value(tags)?,
    })
}
