use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::cache::{DockerImageCaches, ImageResolver};
use crate::error::RequesterError;
use crate::scheduler::BaseScheduler;
use crate::store::JobStore;
use armada_protocol::PeerRegistry;

pub mod handlers;
pub mod probes;

/// Bytes of request head (method, path, headers) counted against the body
/// budget, matching the wire accounting clients are written against.
pub const HEADER_BYTE_BUDGET: usize = 163;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Applied when no per-path timeout is configured
    pub default_timeout: Duration,
    /// Per-endpoint request timeouts, keyed by path
    pub request_timeouts: HashMap<String, Duration>,
    /// Cap on what we are willing to read per request
    pub max_bytes_to_read_in_body: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            request_timeouts: HashMap::new(),
            max_bytes_to_read_in_body: 10 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<BaseScheduler>,
    pub store: Arc<dyn JobStore>,
    pub caches: Arc<DockerImageCaches>,
    pub resolver: Arc<dyn ImageResolver>,
    pub peers: Option<PeerRegistry>,
    pub start_time: DateTime<Utc>,
    pub config: Arc<ApiServerConfig>,
}

/// Map domain errors onto the HTTP surface.
pub struct ApiError(pub RequesterError);

impl From<RequesterError> for ApiError {
    fn from(error: RequesterError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            RequesterError::NotFound(_) => (StatusCode::NOT_FOUND, "Job not found".to_string()),
            RequesterError::InvalidJob(_) | RequesterError::AlreadyExists(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            RequesterError::JobTerminated(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()),
        };
        (status, message).into_response()
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/submit", post(handlers::submit))
        .route("/list", get(handlers::list))
        .route("/states/{id}", get(handlers::states))
        .route("/results/{id}", get(handlers::results))
        .route("/events/{id}", get(handlers::events))
        .route("/cancel", post(handlers::cancel))
        .route("/healthz", get(probes::healthz))
        .route("/livez", get(probes::livez))
        .route("/readyz", get(probes::readyz))
        .route("/varz", get(probes::varz))
        .layer(middleware::from_fn_with_state(state.clone(), request_timeout))
        .layer(middleware::from_fn_with_state(state.clone(), enforce_request_budget))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on an already-bound listener until the process exits.
pub async fn serve(state: ApiState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Reject requests whose head or declared body cannot fit the read budget.
async fn enforce_request_budget(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let cap = state.config.max_bytes_to_read_in_body;
    let head = request.uri().to_string().len() + HEADER_BYTE_BUDGET;
    let declared_body: usize = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if head > cap || head + declared_body > cap {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Body::from("http: request body too large"),
        )
            .into_response();
    }
    next.run(request).await
}

/// Per-endpoint timeout; exceeding it answers 503.
async fn request_timeout(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let timeout = state
        .config
        .request_timeouts
        .get(request.uri().path())
        .copied()
        .unwrap_or(state.config.default_timeout);

    // Handlers that complete on their first poll still pass the deadline gate
    let work = async {
        tokio::task::yield_now().await;
        next.run(request).await
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(response) => response,
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Body::from("Server Timeout!")).into_response(),
    }
}
