//! Bookmark acknowledgement tracking.
//!
//! Records are emitted in token order per channel but acknowledged out of
//! order (the orchestrator accepts them concurrently). The persisted
//! bookmark may only advance to the highest token whose predecessors are all
//! acknowledged, so replay after a crash never skips a record.

use dashmap::DashMap;
use sentinel_store::BookmarkRepository;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-channel contiguity tracker.
#[derive(Debug, Default)]
pub struct AckTracker {
    /// token → acknowledged
    pending: BTreeMap<u64, bool>,
    /// Highest token with a fully-acknowledged prefix
    committed: Option<u64>,
}

impl AckTracker {
    /// Register an emitted record before it is handed downstream.
    pub fn emitted(&mut self, token: u64) {
        self.pending.entry(token).or_insert(false);
    }

    /// Mark a token acknowledged. Unknown tokens are ignored.
    pub fn acked(&mut self, token: u64) {
        if let Some(entry) = self.pending.get_mut(&token) {
            *entry = true;
        }
        self.advance();
    }

    /// Drop an emitted token without persisting it (parse errors): the
    /// bookmark may advance past it.
    pub fn skipped(&mut self, token: u64) {
        self.acked(token);
    }

    /// Highest contiguous acknowledged token, if it moved past gaps.
    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    fn advance(&mut self) {
        while let Some((&token, &acked)) = self.pending.iter().next() {
            if !acked {
                break;
            }
            self.pending.remove(&token);
            self.committed = Some(token);
        }
    }
}

/// Shared ack surface handed to the orchestrator feed.
#[derive(Clone)]
pub struct BookmarkCommitter {
    trackers: Arc<DashMap<String, AckTracker>>,
    repository: BookmarkRepository,
}

impl BookmarkCommitter {
    pub fn new(repository: BookmarkRepository) -> Self {
        Self {
            trackers: Arc::new(DashMap::new()),
            repository,
        }
    }

    pub fn emitted(&self, channel: &str, token: u64) {
        self.trackers
            .entry(channel.to_string())
            .or_default()
            .emitted(token);
    }

    /// Acknowledge durable acceptance of a record.
    pub fn ack(&self, channel: &str, token: u64) {
        if let Some(mut tracker) = self.trackers.get_mut(channel) {
            tracker.acked(token);
        }
    }

    pub fn skip(&self, channel: &str, token: u64) {
        if let Some(mut tracker) = self.trackers.get_mut(channel) {
            tracker.skipped(token);
        }
    }

    /// Flush committed positions to the store.
    pub async fn flush(&self) {
        let snapshot: Vec<(String, u64)> = self
            .trackers
            .iter()
            .filter_map(|entry| entry.value().committed().map(|t| (entry.key().clone(), t)))
            .collect();

        for (channel, token) in snapshot {
            if let Err(e) = self.repository.advance(&channel, token).await {
                warn!(channel = %channel, token, error = %e, "bookmark flush failed");
            } else {
                debug!(channel = %channel, token, "bookmark advanced");
            }
        }
    }

    /// Periodic flush loop; flushes once more on cancellation so shutdown
    /// commits bookmarks for fully persisted records.
    pub async fn run(self, flush_interval: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await;
                    break;
                }
                _ = interval.tick() => {
                    self.flush().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_never_advances_past_a_gap() {
        let mut tracker = AckTracker::default();
        for token in 1..=5 {
            tracker.emitted(token);
        }

        tracker.acked(1);
        tracker.acked(2);
        tracker.acked(4); // 3 still outstanding
        assert_eq!(tracker.committed(), Some(2));

        tracker.acked(3);
        assert_eq!(tracker.committed(), Some(4));

        tracker.acked(5);
        assert_eq!(tracker.committed(), Some(5));
    }

    #[test]
    fn out_of_order_acks_converge() {
        let mut tracker = AckTracker::default();
        for token in 1..=4 {
            tracker.emitted(token);
        }
        tracker.acked(4);
        tracker.acked(3);
        tracker.acked(2);
        assert_eq!(tracker.committed(), None);
        tracker.acked(1);
        assert_eq!(tracker.committed(), Some(4));
    }

    #[test]
    fn skipped_records_advance_like_acks() {
        let mut tracker = AckTracker::default();
        tracker.emitted(1);
        tracker.emitted(2);
        tracker.skipped(1);
        tracker.acked(2);
        assert_eq!(tracker.committed(), Some(2));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut tracker = AckTracker::default();
        tracker.acked(7);
        assert_eq!(tracker.committed(), None);
    }
}
