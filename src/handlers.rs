//! Control API handlers
//!
//! The inbound surface consumed by the chat/command collaborator. All
//! routes are safe to call repeatedly and concurrently for the same
//! subscriber.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{GatewayError, SupervisorError, SynthError};
use crate::gateway::BalanceSnapshot;
use crate::subscriber::{ExchangeCredentials, Subscriber};
use crate::supervisor::StatusSnapshot;
use crate::worker::WorkerState;
use crate::AppState;

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// No Debug derive: the body carries exchange credentials.
#[derive(Deserialize)]
pub struct UpsertSubscriberRequest {
    pub tier: String,
    pub risk_level: String,
    pub strategy: String,
    pub exchange_name: String,
    pub api_key: String,
    pub api_secret: String,
}

/// PUT /v1/subscribers/:id - register or refresh a subscriber snapshot
pub async fn upsert_subscriber(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpsertSubscriberRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let subscriber = Subscriber {
        id,
        tier: req.tier,
        risk_level: req.risk_level,
        strategy: req.strategy,
        exchange: ExchangeCredentials {
            exchange: req.exchange_name,
            api_key: req.api_key,
            api_secret: req.api_secret,
        },
    };

    state
        .store
        .upsert(subscriber)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    info!("Subscriber {} snapshot updated", id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/subscribers/:id/start
pub async fn start_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusSnapshot>, (StatusCode, String)> {
    let subscriber = state
        .store
        .fetch(id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, format!("unknown subscriber {}", id)))?;

    let snapshot = state.supervisor.start(&subscriber).await.map_err(|e| {
        let status = match &e {
            SupervisorError::Synthesis(SynthError::TemplateMissing { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SupervisorError::Synthesis(SynthError::Persistence { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SupervisorError::Spawn(_) => StatusCode::BAD_GATEWAY,
        };
        (status, e.to_string())
    })?;

    Ok(Json(snapshot))
}

/// POST /v1/subscribers/:id/stop
pub async fn stop_worker(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<StatusSnapshot> {
    let snapshot = state.supervisor.stop(id).await;
    state.gateway.invalidate(id).await;
    Json(snapshot)
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: StatusSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalanceSnapshot>,
}

/// GET /v1/subscribers/:id/status
///
/// Pure snapshot: state and heartbeat from the registry, balance only if
/// the gateway cache holds a fresh value. Never blocks on the worker.
pub async fn worker_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Json<StatusResponse> {
    let status = state.supervisor.status(id).await;
    let balance = state.gateway.peek(id).await;
    Json(StatusResponse { status, balance })
}

/// GET /v1/subscribers/:id/balance - bounded-timeout query to the worker
pub async fn worker_balance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BalanceSnapshot>, (StatusCode, String)> {
    let status = state.supervisor.status(id).await;
    if status.state != WorkerState::Running {
        return Err((
            StatusCode::CONFLICT,
            format!("worker for {} is not running", id),
        ));
    }
    let api_port = status.api_port.ok_or((
        StatusCode::CONFLICT,
        "worker has no api binding".to_string(),
    ))?;

    match state.gateway.query(id, api_port).await {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e @ GatewayError::Timeout { .. }) => Err((StatusCode::GATEWAY_TIMEOUT, e.to_string())),
        Err(e) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
    }
}
