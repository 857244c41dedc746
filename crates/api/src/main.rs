//! # Sentinel Server
//!
//! Wires the monitoring platform together: relational store, vector store
//! pool, cache, enrichment pipeline, correlation engine, broadcast hub and
//! the REST surface, then runs until interrupted.
//!
//! Startup order matters: configuration is validated first (invalid
//! required configuration stops the process), the store schema is ensured,
//! background subsystems start, and only then does the listener accept
//! traffic. Shutdown propagates one cancellation token top-down: intake
//! stops, workers drain, the batcher flushes its final partial batch, the
//! correlator flushes, the hub closes connections, and bookmarks are
//! committed for fully persisted records.

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::{
    routing::{get, post, put},
    Router,
};
use sentinel_core::cache::CacheService;
use sentinel_core::metrics::{MetricsRegistry, MetricsService, PipelineMetrics};
use sentinel_core::pool::InstancePool;
use sentinel_core::types::ComponentHealth;
use sentinel_core::{Config, CorsConfig};
use sentinel_pipeline::{
    CorrelationEngine, EmbeddingClient, IpEnricher, JsonlFileSource, LlmAnalyzer, LogWatcher,
    Orchestrator, ResourceMonitor, RuleDetector, VectorBatcher, VectorStoreClient,
};
use sentinel_store::{
    BookmarkRepository, CorrelationRepository, Database, DeadLetterRepository, EventRepository,
    RetentionSweeper, RuleRepository, TemplateRepository,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api_middleware;
mod dashboard;
mod error;
mod handlers;
mod health;
mod hub;
mod state;

use crate::dashboard::{ComponentRegistry, DashboardService};
use crate::hub::BroadcastHub;
use crate::state::AppState;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinel=info,sentinel_server=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_cors_layer(cors_config: &CorsConfig) -> anyhow::Result<CorsLayer> {
    let mut cors = CorsLayer::new();

    if cors_config.allowed_origins.contains(&"*".to_string()) {
        cors = cors.allow_origin(Any);
    } else {
        let origins: Result<Vec<HeaderValue>, _> = cors_config
            .allowed_origins
            .iter()
            .map(|origin| origin.parse())
            .collect();
        cors = cors.allow_origin(origins?);
    }

    if cors_config.allowed_methods.contains(&"*".to_string()) {
        cors = cors.allow_methods(Any);
    } else {
        let methods: Result<Vec<Method>, _> = cors_config
            .allowed_methods
            .iter()
            .map(|method| method.parse())
            .collect();
        cors = cors.allow_methods(methods?);
    }

    if cors_config.allowed_headers.contains(&"*".to_string()) {
        cors = cors.allow_headers(Any);
    } else {
        let headers: Result<Vec<HeaderName>, _> = cors_config
            .allowed_headers
            .iter()
            .map(|header| header.parse())
            .collect();
        cors = cors.allow_headers(headers?);
    }

    Ok(cors)
}

fn create_router(state: AppState) -> anyhow::Result<Router> {
    let cors = build_cors_layer(&state.config.cors)?;

    let router = Router::new()
        // Events & aggregates
        .route("/api/security-events", get(handlers::events::list_events))
        .route(
            "/api/security-events/:id",
            get(handlers::events::get_event).patch(handlers::events::patch_event),
        )
        .route("/api/timeline", get(handlers::timeline::timeline))
        .route("/api/timeline/stats", get(handlers::timeline::timeline_stats))
        .route(
            "/api/dashboarddata/consolidated",
            get(handlers::dashboard::consolidated),
        )
        .route(
            "/api/dashboarddata/broadcast",
            post(handlers::dashboard::broadcast),
        )
        // Detection rules
        .route(
            "/api/security-event-rules",
            get(handlers::rules::list_rules).post(handlers::rules::create_rule),
        )
        .route(
            "/api/security-event-rules/:id",
            put(handlers::rules::update_rule).delete(handlers::rules::delete_rule),
        )
        // Correlations
        .route(
            "/api/correlation/statistics",
            get(handlers::correlation::statistics),
        )
        .route(
            "/api/correlation/rules",
            get(handlers::correlation::list_rules),
        )
        .route(
            "/api/correlation/rules/:id",
            put(handlers::correlation::update_rule),
        )
        .route(
            "/api/correlation/correlations",
            get(handlers::correlation::list_correlations),
        )
        .route("/api/correlation/analyze", post(handlers::correlation::analyze))
        // Notification templates
        .route(
            "/api/notification-templates",
            get(handlers::templates::list_templates).post(handlers::templates::create_template),
        )
        .route(
            "/api/notification-templates/:id",
            put(handlers::templates::update_template).delete(handlers::templates::delete_template),
        )
        // Vector & system
        .route("/api/vector/search", post(handlers::vector::search))
        .route("/api/system-status", get(health::system_status))
        .route("/api/database-pool/metrics", get(handlers::pool::metrics))
        .route(
            "/api/database-pool/connections",
            get(handlers::pool::connections),
        )
        // Real-time hub
        .route("/hubs/scan-progress/negotiate", post(hub::socket::negotiate))
        .route("/hubs/scan-progress", get(hub::socket::hub_socket))
        // Probes
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors)
                .layer(axum::middleware::from_fn(
                    api_middleware::security_headers_middleware,
                ))
                .layer(axum::middleware::from_fn(
                    api_middleware::correlation_id_middleware,
                )),
        )
        .with_state(state);

    Ok(router)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("starting sentinel server");

    // Invalid required configuration is fatal before anything spawns.
    let config = Config::load().context("configuration load failed")?;
    config.validate().context("configuration invalid")?;
    info!("configuration validated");

    let db = Database::connect(&config.database)
        .await
        .context("relational store unreachable")?;
    db.ensure_schema()
        .await
        .context("schema verification failed")?;

    let events = EventRepository::new(db.pool().clone());
    let rules = RuleRepository::new(db.pool().clone());
    let correlations = CorrelationRepository::new(db.pool().clone());
    let templates = TemplateRepository::new(db.pool().clone());
    let bookmarks = BookmarkRepository::new(db.pool().clone());
    let dead_letters = DeadLetterRepository::new(db.pool().clone());

    let metrics_registry = MetricsRegistry::new(config.metrics.clone());
    let metrics = PipelineMetrics::new(&metrics_registry);
    let metrics_service = Arc::new(MetricsService::new(metrics_registry));

    let cache = Arc::new(CacheService::new(&config.cache));
    let cancel = CancellationToken::new();

    // Vector store behind the health-balanced instance pool.
    let vector_pool = Arc::new(InstancePool::new(&config.pool, &config.health));
    let vector = Arc::new(VectorStoreClient::new(
        &config.pool,
        config.embedding.dimension,
        Arc::clone(&vector_pool),
        Arc::clone(&cache),
        metrics.clone(),
    ));
    if let Err(e) = vector.ensure_collection().await {
        // Fatal for the vector subsystem only: the pipeline degrades to
        // deterministic classification without retrieval context.
        warn!(error = %e, "vector collection unavailable at startup");
    }
    let mut background = Vec::new();
    background.push(vector_pool.spawn_health_monitor(
        config.health.clone(),
        "/healthz",
        cancel.clone(),
    ));

    // Enrichment stages
    let embedding = Arc::new(EmbeddingClient::new(
        config.embedding.clone(),
        Arc::clone(&cache),
        metrics.clone(),
    ));
    let enricher = Arc::new(IpEnricher::new(
        &config.enrichment,
        Arc::clone(&cache),
        metrics.clone(),
    ));
    let llm = Arc::new(LlmAnalyzer::new(
        &config.llm,
        Arc::clone(&cache),
        metrics.clone(),
    ));

    let detector = Arc::new(RuleDetector::new(rules.clone()));
    match detector.refresh().await {
        Ok(count) => info!(rules = count, "detection rules loaded"),
        Err(e) => warn!(error = %e, "rule load failed; starting with empty rule set"),
    }

    // Hub + correlation engine
    let hub = Arc::new(BroadcastHub::new(metrics.clone()));
    let engine = Arc::new(
        CorrelationEngine::new(
            &config.correlation,
            correlations.clone(),
            Arc::clone(&hub) as Arc<dyn sentinel_pipeline::EventPublisher>,
            metrics.clone(),
        )
        .context("correlation rules invalid")?,
    );
    let (correlation_tx, correlation_rx) = tokio::sync::mpsc::channel(1_024);
    background.push(tokio::spawn(
        Arc::clone(&engine).run(correlation_rx, cancel.clone()),
    ));

    // Vector write batching
    let (batcher, batcher_handle) = VectorBatcher::spawn(
        Arc::clone(&vector),
        config.pipeline.vector_batch_size,
        config.vector_batch_timeout(),
        metrics.clone(),
        cancel.clone(),
    );
    background.push(batcher_handle);

    // Orchestrator + workers
    let orchestrator = Arc::new(Orchestrator::new(
        config.pipeline.clone(),
        Arc::clone(&detector),
        Arc::clone(&embedding),
        Arc::clone(&vector),
        Arc::clone(&llm),
        Arc::clone(&enricher),
        events.clone(),
        dead_letters.clone(),
        batcher,
        correlation_tx,
        Arc::clone(&hub) as Arc<dyn sentinel_pipeline::EventPublisher>,
        Arc::clone(&cache),
        metrics.clone(),
        cancel.clone(),
    ));
    background.extend(Arc::clone(&orchestrator).start());

    // Log watcher feeding the orchestrator
    let source_dir = config
        .logwatcher
        .source_dir
        .clone()
        .unwrap_or_else(|| "./logs".to_string());
    let watcher = LogWatcher::new(
        Arc::new(JsonlFileSource::new(source_dir)),
        Arc::clone(&orchestrator) as Arc<dyn sentinel_pipeline::RecordSink>,
        bookmarks,
        config.logwatcher.clone(),
        metrics.clone(),
    );
    background.extend(watcher.start(cancel.clone()));

    // Resource pressure monitor
    background.push(tokio::spawn(
        ResourceMonitor::new(
            config.pipeline.clone(),
            Arc::clone(&cache),
            orchestrator.throttle(),
            metrics.clone(),
        )
        .run(cancel.clone()),
    ));

    // Retention sweeps (relational truth drives the vector sweep)
    background.push(tokio::spawn(
        RetentionSweeper::new(
            events.clone(),
            correlations.clone(),
            Some(Arc::clone(&vector) as Arc<dyn sentinel_store::VectorSweep>),
            config.retention.clone(),
        )
        .run(cancel.clone()),
    ));

    // Dashboard snapshots + component status
    let components = Arc::new(ComponentRegistry::new());
    let dashboard = Arc::new(DashboardService::new(events.clone(), Arc::clone(&components)));
    background.push(tokio::spawn(Arc::clone(&hub).run_dashboard_debouncer(
        Arc::clone(&dashboard) as Arc<dyn hub::SnapshotProvider>,
        cancel.clone(),
    )));
    background.push(tokio::spawn(component_status_loop(
        db.clone(),
        Arc::clone(&vector_pool),
        Arc::clone(&detector),
        Arc::clone(&components),
        Arc::clone(&hub),
        cancel.clone(),
    )));

    let state = AppState {
        config: config.clone(),
        db,
        events,
        rules,
        correlations,
        templates,
        dead_letters,
        detector,
        orchestrator,
        engine,
        embedding,
        vector,
        vector_pool,
        cache,
        hub: Arc::clone(&hub),
        dashboard,
        components,
        metrics_service,
    };

    let app = create_router(state)?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("listener bind failed")?;
    info!(%addr, "server listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await?;

    // Give workers, batcher, correlator and committer their drain window.
    let drain = Duration::from_secs(config.server.shutdown_drain_secs);
    let _ = tokio::time::timeout(drain, async {
        for handle in background {
            let _ = handle.await;
        }
    })
    .await;
    hub.close_all();
    info!("sentinel server stopped");
    Ok(())
}

/// Samples component health every 15 seconds and pushes updates to the
/// `system_status` group.
async fn component_status_loop(
    db: Database,
    vector_pool: Arc<InstancePool>,
    detector: Arc<RuleDetector>,
    components: Arc<ComponentRegistry>,
    hub: Arc<BroadcastHub>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(15));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let database = match db.health_check().await {
                    Ok(()) => ComponentHealth::Healthy,
                    Err(_) => ComponentHealth::Unhealthy,
                };
                components.set("database", database);
                components.set("vector_store", vector_pool.health());
                components.set(
                    "rule_cache",
                    if detector.is_degraded() {
                        ComponentHealth::Degraded
                    } else {
                        ComponentHealth::Healthy
                    },
                );
                components.set("pipeline", ComponentHealth::Healthy);
                components.set("broadcast_hub", ComponentHealth::Healthy);

                hub.system_status(serde_json::json!(components.system_status()));
            }
        }
    }
}
