//! # Event Processing Pipeline
//!
//! The hot path of the monitoring platform: the log watcher tails event
//! channels with durable bookmarks, the orchestrator runs each record
//! through deterministic detection, embedding, vector retrieval, LLM
//! analysis and IP enrichment, persists the result to both stores, and
//! hands persisted events to the correlation engine and the broadcast hub.

pub mod batcher;
pub mod correlation;
pub mod detector;
pub mod embedding;
pub mod enrich;
pub mod llm;
pub mod orchestrator;
pub mod pressure;
pub mod publish;
pub mod vector;
pub mod watcher;

pub use batcher::VectorBatcher;
pub use correlation::CorrelationEngine;
pub use detector::{Detection, RuleDetector};
pub use embedding::EmbeddingClient;
pub use enrich::IpEnricher;
pub use llm::LlmAnalyzer;
pub use orchestrator::{Orchestrator, PipelineCounters};
pub use pressure::{AdaptiveThrottle, ResourceMonitor};
pub use publish::{EventPublisher, NoopPublisher};
pub use vector::{VectorPoint, VectorStoreClient};
pub use watcher::{ChannelSource, JsonlFileSource, LogWatcher, RecordSink};
