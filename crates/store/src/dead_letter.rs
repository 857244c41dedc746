//! Dead-letter queue. Events whose persistence retries are exhausted land
//! here with a structured reason; a background scan retries them with
//! monotonically growing spacing until they either insert or an operator
//! intervenes.

use chrono::{DateTime, Duration, Utc};
use sentinel_core::error::Result;
use sentinel_core::types::SecurityEvent;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Retry spacing doubles per attempt, capped at one hour.
const BASE_RETRY_SECS: i64 = 60;
const MAX_RETRY_SECS: i64 = 3_600;

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub payload: serde_json::Value,
    pub reason: String,
    pub detail: Option<String>,
    pub attempts: i32,
    pub first_failed_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn event(&self) -> Result<SecurityEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Clone)]
pub struct DeadLetterRepository {
    pool: PgPool,
}

impl DeadLetterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Divert an event after its write retries were exhausted.
    pub async fn divert(
        &self,
        event: &SecurityEvent,
        reason: &str,
        detail: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO dead_letters (
                payload, reason, detail, attempts, first_failed_at,
                last_attempt_at, next_attempt_at
            ) VALUES ($1, $2, $3, 0, $4, $4, $5)
            RETURNING id
            "#,
        )
        .bind(serde_json::to_value(event)?)
        .bind(reason)
        .bind(detail)
        .bind(now)
        .bind(now + Duration::seconds(BASE_RETRY_SECS))
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        tracing::error!(
            dead_letter_id = id,
            event_id = %event.id,
            reason,
            "event diverted to dead-letter queue"
        );
        Ok(id)
    }

    /// Entries whose next attempt is due.
    pub async fn due(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dead_letters
            WHERE next_attempt_at IS NOT NULL AND next_attempt_at <= $1
            ORDER BY next_attempt_at
            LIMIT $2
            "#,
        )
        .bind(Utc::now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    /// Record a failed redelivery attempt; spacing grows monotonically.
    pub async fn mark_retry_failed(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dead_letters
            SET attempts = attempts + 1,
                last_attempt_at = $2,
                next_attempt_at = $2 + make_interval(secs =>
                    LEAST($3 * POWER(2, attempts + 1), $4))
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(BASE_RETRY_SECS as f64)
        .bind(MAX_RETRY_SECS as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove an entry once its event finally persisted.
    pub async fn resolve(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter> {
    Ok(DeadLetter {
        id: row.try_get("id")?,
        payload: row.try_get("payload")?,
        reason: row.try_get("reason")?,
        detail: row.try_get("detail")?,
        attempts: row.try_get("attempts")?,
        first_failed_at: row.try_get("first_failed_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
    })
}
