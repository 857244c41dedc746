use sentinel_core::cache::CacheService;
use sentinel_core::metrics::MetricsService;
use sentinel_core::pool::InstancePool;
use sentinel_core::Config;
use sentinel_pipeline::{
    CorrelationEngine, EmbeddingClient, Orchestrator, RuleDetector, VectorStoreClient,
};
use sentinel_store::{
    CorrelationRepository, Database, DeadLetterRepository, EventRepository, RuleRepository,
    TemplateRepository,
};
use std::sync::Arc;

use crate::dashboard::{ComponentRegistry, DashboardService};
use crate::hub::BroadcastHub;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub events: EventRepository,
    pub rules: RuleRepository,
    pub correlations: CorrelationRepository,
    pub templates: TemplateRepository,
    pub dead_letters: DeadLetterRepository,
    pub detector: Arc<RuleDetector>,
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<CorrelationEngine>,
    pub embedding: Arc<EmbeddingClient>,
    pub vector: Arc<VectorStoreClient>,
    pub vector_pool: Arc<InstancePool>,
    pub cache: Arc<CacheService>,
    pub hub: Arc<BroadcastHub>,
    pub dashboard: Arc<DashboardService>,
    pub components: Arc<ComponentRegistry>,
    pub metrics_service: Arc<MetricsService>,
}
