//! Operator HTTP API
//!
//! - GET /health - Liveness plus relay state
//! - GET /metrics - Prometheus metrics
//! - GET /status - Request counts and uptime
//! - GET /requests?status= - Requests in one status (default `failed`)
//! - GET /requests/{id} - One request
//! - POST /requests/{id}/requeue - Give a failed request a fresh retry budget

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::relay::RelayState;
use crate::store::RequestStore;
use crate::types::{RequestId, RequestStatus, StatusCounts, TransferRequest};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RequestStore>,
    pub relay_state: watch::Receiver<RelayState>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn RequestStore>, relay_state: watch::Receiver<RelayState>) -> Self {
        Self {
            store,
            relay_state,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub relay_state: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub relay_state: RelayState,
    pub uptime_seconds: u64,
    pub requests: StatusCounts,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn store_failure(e: impl std::fmt::Display) -> Response {
    warn!(error = %e, "Store query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn parse_id(raw: &str) -> Result<RequestId, Response> {
    raw.parse::<RequestId>()
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let relay_state = *state.relay_state.borrow();
    Json(HealthResponse {
        status: "ok".to_string(),
        relay_state: relay_state.to_string(),
    })
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Response {
    match state.store.counts().await {
        Ok(requests) => Json(StatusResponse {
            relay_state: *state.relay_state.borrow(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            requests,
        })
        .into_response(),
        Err(e) => store_failure(e),
    }
}

async fn list_requests(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let status = match query.status.as_deref() {
        None => RequestStatus::Failed,
        Some(raw) => match raw.parse::<RequestStatus>() {
            Ok(status) => status,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
    };
    match state.store.list_by_status(status).await {
        Ok(requests) => Json::<Vec<TransferRequest>>(requests).into_response(),
        Err(e) => store_failure(e),
    }
}

async fn get_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get(&id).await {
        Ok(Some(request)) => Json(request).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("request {} not found", id)),
        Err(e) => store_failure(e),
    }
}

async fn requeue(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.requeue(&id, Utc::now()).await {
        Ok(true) => {
            info!(request = %id, "Failed request requeued by operator");
            match state.store.get(&id).await {
                Ok(Some(request)) => Json(request).into_response(),
                Ok(None) => error_response(StatusCode::NOT_FOUND, format!("request {} not found", id)),
                Err(e) => store_failure(e),
            }
        }
        Ok(false) => match state.store.get(&id).await {
            Ok(Some(request)) => error_response(
                StatusCode::CONFLICT,
                format!("request {} is {}, only failed requests can be requeued", id, request.status),
            ),
            Ok(None) => error_response(StatusCode::NOT_FOUND, format!("request {} not found", id)),
            Err(e) => store_failure(e),
        },
        Err(e) => store_failure(e),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/requests", get(list_requests))
        .route("/requests/{id}", get(get_request))
        .route("/requests/{id}/requeue", post(requeue))
        .with_state(state)
}

/// Serve the API until `cancel` fires
pub async fn serve(bind_address: &str, state: AppState, cancel: CancellationToken) -> eyre::Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}: {}", bind_address, e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("API server stopped");
    Ok(())
}

/// Wait for a spawned server task. Returns false if the task panicked or was
/// aborted.
pub async fn join_server(task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "API server task failed");
            false
        }
    }
}
