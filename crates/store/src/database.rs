//! # Relational Store Connection Management
//!
//! Owns the PostgreSQL connection pool for the authoritative structured
//! store. The logical schema (events, rules, correlations, bookmarks,
//! templates, dead letters plus their indexes) ships embedded and is applied
//! idempotently at startup; an unreadable store at that point is a fatal
//! process error.

use sentinel_core::config::DatabaseConfig;
use sentinel_core::error::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{error, info};

/// Pooled handle to the relational store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and size the pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            max_connections = config.max_connections,
            "connecting relational store pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        info!("relational store pool ready");
        Ok(Self { pool })
    }

    /// Apply the embedded schema. Statements are idempotent so this runs on
    /// every startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        let schema = include_str!("../sql/schema.sql");
        for statement in schema.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                error!(error = %e, "schema statement failed");
                e
            })?;
        }
        info!("relational store schema verified");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Live pool counters for the database-pool metrics endpoint.
    pub fn pool_metrics(&self) -> PoolMetrics {
        PoolMetrics {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
        }
    }
}

/// Connection-pool counters exposed over REST.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolMetrics {
    pub size: u32,
    pub idle: u32,
}
