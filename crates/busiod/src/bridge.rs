//! HTTP bridge to the node's I/O ports
//!
//! Lets a controller drive the worker without a bus node of its own:
//! configuration and spoof requests are published on the worker's input
//! ports, status and captures are relayed back.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use busio_core::{Capture, IoConfig, IoStatus, LocalNode, Node, NodeError, Publisher, Spoof};
use busio_io::PortNames;
use futures::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request
    BadRequest(String),
    /// 404 Not Found
    NotFound(String),
    /// 503 Service Unavailable
    ServiceUnavailable(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };
        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });
        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        ApiError::ServiceUnavailable(e.to_string())
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Clone)]
pub struct BridgeState {
    node: LocalNode,
    capture_port: String,
    config_pub: Arc<dyn Publisher<IoConfig>>,
    spoof_pub: Arc<dyn Publisher<Spoof>>,
    latest_status: Arc<RwLock<Option<IoStatus>>>,
}

impl BridgeState {
    /// Bind the bridge to the worker's ports and start tracking status.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(node: &LocalNode, ports: &PortNames) -> Result<Self, NodeError> {
        let latest_status = Arc::new(RwLock::new(None));
        let mut status_sub = node.make_subscriber::<IoStatus>(&ports.status)?;
        let slot = latest_status.clone();
        tokio::spawn(async move {
            while let Some(status) = status_sub.receive().await {
                *slot.write() = Some(status);
            }
        });

        Ok(Self {
            node: node.clone(),
            capture_port: ports.capture.clone(),
            config_pub: Arc::from(node.make_publisher::<IoConfig>(&ports.config)?),
            spoof_pub: Arc::from(node.make_publisher::<Spoof>(&ports.spoof)?),
            latest_status,
        })
    }

    /// Publish an interface configuration; `false` if the node is closed
    pub async fn publish_config(&self, config: IoConfig) -> bool {
        self.config_pub.publish(config).await
    }
}

pub fn create_router(state: BridgeState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/io/config", put(put_config))
        .route("/io/spoof", post(post_spoof))
        .route("/io/status", get(get_status))
        .route("/io/capture", get(stream_captures))
        .route("/heartbeat", post(heartbeat))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// PUT /io/config
async fn put_config(
    State(state): State<BridgeState>,
    body: Result<Json<IoConfig>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(config) = body?;
    tracing::info!(interfaces = config.iface_config.len(), "Configuration received");
    if !state.publish_config(config).await {
        return Err(ApiError::ServiceUnavailable("Configuration not published".to_string()));
    }
    Ok(StatusCode::ACCEPTED)
}

/// POST /io/spoof
async fn post_spoof(
    State(state): State<BridgeState>,
    body: Result<Json<Spoof>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(spoof) = body?;
    if !state.spoof_pub.publish(spoof).await {
        return Err(ApiError::ServiceUnavailable("Spoof not published".to_string()));
    }
    Ok(StatusCode::ACCEPTED)
}

/// GET /io/status
async fn get_status(State(state): State<BridgeState>) -> Result<Json<IoStatus>, ApiError> {
    state
        .latest_status
        .read()
        .clone()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No status reported yet".to_string()))
}

/// GET /io/capture
async fn stream_captures(
    State(state): State<BridgeState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut sub = state.node.make_subscriber::<Capture>(&state.capture_port)?;
    let mut shutdown = state.node.shutdown_signal();
    // Open streams would otherwise hold up graceful shutdown
    let stream = async_stream::stream! {
        loop {
            let capture = tokio::select! {
                _ = shutdown.wait() => break,
                capture = sub.receive() => match capture {
                    Some(capture) => capture,
                    None => break,
                },
            };
            match Event::default().event("capture").json_data(&capture) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!(error = %e, "Failed to encode capture"),
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /heartbeat
async fn heartbeat(State(state): State<BridgeState>) -> StatusCode {
    state.node.heartbeat();
    StatusCode::NO_CONTENT
}
