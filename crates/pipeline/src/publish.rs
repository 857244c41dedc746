//! Outbound notification seam between the pipeline and the broadcast hub.
//! The hub lives in the API crate; the pipeline only knows this trait.

use sentinel_core::types::{Correlation, EventSummary};

pub trait EventPublisher: Send + Sync + 'static {
    /// A security event was persisted.
    fn publish_event(&self, summary: EventSummary);

    /// A correlation was persisted; participants may have been upgraded.
    fn publish_correlation(&self, correlation: &Correlation);
}

/// Discards everything; used by tests and headless runs.
#[derive(Debug, Default, Clone)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish_event(&self, _summary: EventSummary) {}
    fn publish_correlation(&self, _correlation: &Correlation) {}
}
