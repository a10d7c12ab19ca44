//! Bot Supervisor Library
//!
//! Provisions and supervises one isolated trading worker per subscriber:
//! tier-derived limits, per-subscriber config synthesis, and a
//! start/stop/crash-recovery state machine safe under concurrent requests.

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod subscriber;
pub mod supervisor;
pub mod synth;
pub mod tiers;
pub mod worker;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// Re-export main types for convenience
pub use config::ManagerConfig;
pub use error::{GatewayError, SpawnError, SupervisorError, SynthError};
pub use gateway::{BalanceGateway, BalanceSnapshot, BalanceSource, HttpBalanceSource};
pub use subscriber::{ExchangeCredentials, InMemorySubscriberStore, Subscriber, SubscriberStore};
pub use supervisor::{RestartPolicy, StatusSnapshot, Supervisor};
pub use synth::{ConfigArtifact, ConfigSynthesizer};
pub use tiers::{TierPolicy, TierPolicyRegistry, BASELINE_STRATEGY};
pub use worker::{LaunchSpec, ProcessLauncher, WorkerExit, WorkerLauncher, WorkerProcess, WorkerState};

/// Application state shared across handlers
pub struct AppState {
    pub supervisor: Supervisor,
    pub store: Arc<dyn SubscriberStore>,
    pub gateway: BalanceGateway,
}

/// Build the control API router
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let control_routes = Router::new()
        .route("/subscribers/{id}", put(handlers::upsert_subscriber))
        .route("/subscribers/{id}/start", post(handlers::start_worker))
        .route("/subscribers/{id}/stop", post(handlers::stop_worker))
        .route("/subscribers/{id}/status", get(handlers::worker_status))
        .route("/subscribers/{id}/balance", get(handlers::worker_balance));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/v1", control_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
