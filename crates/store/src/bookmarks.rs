//! Bookmark persistence. One row per channel holding the highest
//! contiguous-acknowledged token; the watcher resumes from here after a
//! restart.

use chrono::Utc;
use sentinel_core::error::Result;
use sentinel_core::types::Bookmark;
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct BookmarkRepository {
    pool: PgPool,
}

impl BookmarkRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn read(&self, channel: &str) -> Result<Option<Bookmark>> {
        let row = sqlx::query("SELECT channel, token, updated_at FROM bookmarks WHERE channel = $1")
            .bind(channel)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let token: i64 = r.try_get("token")?;
            Ok(Bookmark {
                channel: r.try_get("channel")?,
                token: token as u64,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// Advance the persisted bookmark. The token only ever moves forward;
    /// a stale write (lower token) is ignored.
    pub async fn advance(&self, channel: &str, token: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bookmarks (channel, token, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (channel)
            DO UPDATE SET token = EXCLUDED.token, updated_at = EXCLUDED.updated_at
            WHERE bookmarks.token < EXCLUDED.token
            "#,
        )
        .bind(channel)
        .bind(token as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
