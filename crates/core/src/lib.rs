pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod types;

pub use cache::{CacheService, CacheStats, SingleFlight};
pub use config::{Config, CorsConfig};
pub use error::{Error, ErrorCode, ErrorContext, ErrorKind, ErrorMetrics, RequestContext, Result};
pub use metrics::{MetricsRegistry, MetricsService, PipelineMetrics};
pub use pool::{InstanceLease, InstancePool};
pub use retry::{retry_transient, Backoff, FixedSchedule};
pub use types::*;

// Re-export commonly used types from dependencies
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
