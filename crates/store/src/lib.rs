//! # Relational Store
//!
//! The authoritative structured store for security events, detection rules,
//! correlations, bookmarks, notification templates and the dead-letter
//! queue, backed by a pooled PostgreSQL connection.
//!
//! Write-path invariants enforced here:
//! - event inserts are exactly-once per dedup key;
//! - risk upgrades applied by correlations are monotonic;
//! - `correlation_ids` is append-only;
//! - full-text search and the required composite indexes live in the
//!   embedded schema.

pub mod bookmarks;
pub mod correlations;
pub mod database;
pub mod dead_letter;
pub mod events;
pub mod retention;
pub mod rules;
pub mod templates;

pub use bookmarks::BookmarkRepository;
pub use correlations::{CorrelationFilter, CorrelationRepository, CorrelationStatistics};
pub use database::{Database, PoolMetrics};
pub use dead_letter::{DeadLetter, DeadLetterRepository};
pub use events::{
    EventFilter, EventPatch, EventRepository, Granularity, InsertOutcome, TimelineBucket,
    TimelineStats,
};
pub use retention::{RetentionSweeper, VectorSweep};
pub use rules::{RuleRepository, RuleSpec};
pub use templates::{NotificationTemplate, TemplateRepository, TemplateSpec};
