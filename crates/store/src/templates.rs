//! Notification template storage. Templates are rendered by the external
//! notifier integrations; the core only stores and versions them.

use chrono::{DateTime, Utc};
use sentinel_core::error::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NotificationTemplate {
    pub id: i32,
    pub name: String,
    /// Delivery channel identifier (teams, slack, email)
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TemplateSpec {
    pub name: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub enabled: bool,
}

#[derive(Clone)]
pub struct TemplateRepository {
    pool: PgPool,
}

impl TemplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<NotificationTemplate>> {
        let rows = sqlx::query("SELECT * FROM notification_templates ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(template_from_row).collect()
    }

    pub async fn get(&self, id: i32) -> Result<Option<NotificationTemplate>> {
        let row = sqlx::query("SELECT * FROM notification_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    pub async fn create(&self, spec: &TemplateSpec) -> Result<NotificationTemplate> {
        let row = sqlx::query(
            r#"
            INSERT INTO notification_templates (name, channel, subject, body, enabled, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.channel)
        .bind(&spec.subject)
        .bind(&spec.body)
        .bind(spec.enabled)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::conflict(format!("template '{}' already exists", spec.name))
            }
            _ => Error::from(e),
        })?;
        template_from_row(&row)
    }

    pub async fn update(&self, id: i32, spec: &TemplateSpec) -> Result<NotificationTemplate> {
        let row = sqlx::query(
            r#"
            UPDATE notification_templates
            SET name = $2, channel = $3, subject = $4, body = $5, enabled = $6, updated_at = $7
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&spec.name)
        .bind(&spec.channel)
        .bind(&spec.subject)
        .bind(&spec.body)
        .bind(spec.enabled)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => template_from_row(&row),
            None => Err(Error::not_found(format!("template {} not found", id))),
        }
    }

    pub async fn delete(&self, id: i32) -> Result<()> {
        let result = sqlx::query("DELETE FROM notification_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("template {} not found", id)));
        }
        Ok(())
    }
}

fn template_from_row(row: &PgRow) -> Result<NotificationTemplate> {
    Ok(NotificationTemplate {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        channel: row.try_get("channel")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        enabled: row.try_get("enabled")?,
        updated_at: row.try_get("updated_at")?,
    })
}
