//! podgate host
//!
//! Payment-gated pod hosting over HTTP:
//! - `/pods` routes: admission, charge negotiation, provisioning
//! - hash-addressed reverse proxy for HTTP and WebSocket pod traffic
//! - expiry reaping that returns memory to the admission gate

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod local;
pub mod middleware;
pub mod proxy;
pub mod routes;

use axum::http::Uri;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use podgate_billing::{
    ChargeNegotiator, InMemoryProfitLedger, MonthlyCostFeed, ProfitLedger, PullTransport,
    RecurringPullCoordinator, RecurringPullEngine, ScheduledPullEngine, SimulatedPullTransport,
    SimulatedStreamTransport,
};
use podgate_common::{
    HashingManifestParser, InMemoryManifestStore, InMemoryPodRegistry, ManifestParser,
    ManifestStore, PodManager, PodRegistry,
};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::compression::predicate::{DefaultPredicate, NotForContentType, Predicate};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::admission::MemoryGate;
use crate::config::{ConfigError, HostConfig};
use crate::error::ApiError;
use crate::local::LocalPodManager;
use crate::proxy::PodProxy;
use crate::routes::pods::RAW_STREAM_CONTENT_TYPE;

/// How often expired pods are reaped
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Host startup errors
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build proxy client: {0}")]
    Proxy(#[from] reqwest::Error),
}

/// Application state shared across handlers
pub struct AppState {
    pub config: HostConfig,
    /// Parsed `public_uri`
    pub public_url: Url,
    pub negotiator: Arc<ChargeNegotiator>,
    pub gate: Arc<MemoryGate>,
    pub registry: Arc<dyn PodRegistry>,
    pub manifests: Arc<dyn ManifestStore>,
    pub parser: Arc<dyn ManifestParser>,
    pub pods: Arc<dyn PodManager>,
    pub recurring: Arc<dyn RecurringPullEngine>,
    pub proxy: Arc<PodProxy>,
}

impl AppState {
    /// State backed by in-memory stores, the local pod manager and simulated
    /// payment transports. Spawns the recurring pull coordinator, so it must
    /// be called from within a tokio runtime.
    pub fn development(config: HostConfig) -> Result<Arc<Self>, StartupError> {
        config.validate()?;
        let public_url = config.public_url()?;
        let asset = config.asset();

        let registry: Arc<dyn PodRegistry> = Arc::new(InMemoryPodRegistry::new());
        let ledger: Arc<dyn ProfitLedger> = Arc::new(InMemoryProfitLedger::new());
        let pulls: Arc<dyn PullTransport> = Arc::new(SimulatedPullTransport);

        let (engine, events) = ScheduledPullEngine::new(pulls.clone());
        let recurring: Arc<dyn RecurringPullEngine> = Arc::new(engine);
        RecurringPullCoordinator::new(ledger.clone(), registry.clone(), recurring.clone(), asset.clone())
            .spawn(events);

        let negotiator = ChargeNegotiator::new(
            config.charge_policy(),
            asset,
            Arc::new(MonthlyCostFeed::new(config.cost_per_month)),
            ledger,
            Arc::new(SimulatedStreamTransport),
            pulls,
            recurring.clone(),
        );

        let gate = match config.host_memory_bytes {
            Some(total) => MemoryGate::new(total, config.max_memory_fraction),
            None => MemoryGate::from_system(config.max_memory_fraction),
        };
        let proxy = PodProxy::new(registry.clone(), &config.proxy)?;
        let pods = LocalPodManager::new(registry.clone(), config.pod_host);

        Ok(Arc::new(Self {
            config,
            public_url,
            negotiator: Arc::new(negotiator),
            gate: Arc::new(gate),
            registry,
            manifests: Arc::new(InMemoryManifestStore::new()),
            parser: Arc::new(HashingManifestParser),
            pods: Arc::new(pods),
            recurring,
            proxy: Arc::new(proxy),
        }))
    }
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}

/// Build the API router with the pod proxy in front of it
pub fn build_router(state: Arc<AppState>) -> Router {
    let compression = CompressionLayer::new().compress_when(
        DefaultPredicate::new().and(NotForContentType::const_new(RAW_STREAM_CONTENT_TYPE)),
    );

    Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/pods",
            get(routes::pods::info)
                .post(routes::pods::create)
                .put(routes::pods::extend),
        )
        .route("/pods/:id/logs", get(routes::pods::logs))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::logging))
                .layer(axum::middleware::from_fn_with_state(
                    state.proxy.clone(),
                    proxy::proxy_filter,
                ))
                .layer(compression),
        )
        .with_state(state)
}

/// Stop expired pods, return their memory to the gate and cancel their
/// recurring pulls. Returns the number of pods reaped.
pub async fn reap_expired(state: &AppState) -> usize {
    let reaped = match state.pods.reap_expired(Utc::now()).await {
        Ok(reaped) => reaped,
        Err(e) => {
            error!(error = %e, "failed to reap expired pods");
            return 0;
        }
    };

    for pod in &reaped {
        state.gate.release(pod.memory_mib);
        let cancelled = state.recurring.stop(&pod.id);
        info!(
            manifest_hash = %pod.id,
            memory_mib = pod.memory_mib,
            recurring_cancelled = cancelled,
            "reaped expired pod"
        );
    }
    reaped.len()
}

/// Run [`reap_expired`] every `period`
pub fn spawn_reaper(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            reap_expired(&state).await;
        }
    })
}

/// Serve the host on `config.bind` until ctrl-c
pub async fn serve(state: Arc<AppState>) -> Result<(), std::io::Error> {
    let addr = state.config.bind;
    let reaper = spawn_reaper(state.clone(), REAP_INTERVAL);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("podgate listening on {}", listener.local_addr()?);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    reaper.abort();
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
