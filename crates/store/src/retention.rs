//! Retention sweeps. A periodic job removes events and correlations past
//! their configured ages and reports removed event ids to the vector side so
//! both stores stay aligned; the relational store is the authoritative
//! truth.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sentinel_core::config::RetentionConfig;
use sentinel_core::error::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::correlations::CorrelationRepository;
use crate::events::EventRepository;

/// Implemented by the vector store client so the sweep can evict stale
/// vectors without this crate depending on it.
#[async_trait]
pub trait VectorSweep: Send + Sync {
    async fn delete_ids(&self, ids: &[Uuid]) -> Result<()>;
    /// Coarse sweep of everything older than the cutoff; idempotent with
    /// respect to `delete_ids`.
    async fn delete_before(&self, cutoff: chrono::DateTime<Utc>) -> Result<()>;
}

pub struct RetentionSweeper {
    events: EventRepository,
    correlations: CorrelationRepository,
    vector: Option<std::sync::Arc<dyn VectorSweep>>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        events: EventRepository,
        correlations: CorrelationRepository,
        vector: Option<std::sync::Arc<dyn VectorSweep>>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            events,
            correlations,
            vector,
            config,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.vector_sweep_interval_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("retention sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "retention sweep failed; will retry next interval");
                    }
                }
            }
        }
    }

    /// One pass: purge old rows, then mirror event removals to the vector
    /// store.
    pub async fn sweep_once(&self) -> Result<()> {
        let now = Utc::now();
        let event_cutoff = now - Duration::days(self.config.event_days as i64);
        let correlation_cutoff = now - Duration::days(self.config.correlation_days as i64);

        let removed_events = self.events.purge_older_than(event_cutoff).await?;
        let removed_correlations = self
            .correlations
            .purge_older_than(correlation_cutoff)
            .await?;

        if !removed_events.is_empty() || removed_correlations > 0 {
            info!(
                events = removed_events.len(),
                correlations = removed_correlations,
                "retention sweep removed expired rows"
            );
        }

        if let Some(vector) = &self.vector {
            if !removed_events.is_empty() {
                if let Err(e) = vector.delete_ids(&removed_events).await {
                    warn!(error = %e, "vector sweep failed; stale vectors remain until next pass");
                }
            }
            // Catch vectors whose rows vanished outside this sweep (manual
            // deletes, partial failures on earlier passes).
            if let Err(e) = vector.delete_before(event_cutoff).await {
                warn!(error = %e, "vector cutoff sweep failed");
            }
        }

        Ok(())
    }
}
