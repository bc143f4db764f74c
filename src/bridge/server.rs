// Bridge HTTP ingress - POST /events and GET /health

//! # Bridge Server
//!
//! The HTTP face of the event bridge. Exactly two endpoints:
//!
//! | Endpoint  | Method   | Semantics                                           |
//! |-----------|----------|-----------------------------------------------------|
//! | `/health` | GET/HEAD | Liveness: status, version, router readiness, uptime |
//! | `/events` | POST     | Consume one JSON event; validate; stamp; route      |
//!
//! Status mapping: 202 on acceptance (with the stamped `server_time`), 400 on
//! malformed JSON or failed validation, 405 on a non-POST method against
//! `/events` (with `Allow: POST`), 413 over the body ceiling, 500 when the
//! router rejects the event. Internal detail never leaks into 500 bodies.
//!
//! Shutdown drains in-flight requests with a fixed deadline.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::error_handling::HandleErrorLayer;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::bridge::config::BridgeConfig;
use crate::bridge::router::EventRouter;
use crate::models::{Event, PROTOCOL_VERSION};
use crate::{LatticeError, Result};

/// How long shutdown waits for in-flight requests before closing connections
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Lifecycle phase reported by `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerPhase {
    Starting,
    Ready,
    Draining,
}

impl ServerPhase {
    fn as_str(&self) -> &'static str {
        match self {
            ServerPhase::Starting => "starting",
            ServerPhase::Ready => "ready",
            ServerPhase::Draining => "draining",
        }
    }
}

/// Shared application state for the bridge handlers
#[derive(Clone)]
pub struct BridgeState {
    router: Arc<EventRouter>,
    phase: Arc<RwLock<ServerPhase>>,
    started_at: Instant,
    max_body_bytes: usize,
}

/// `/health` response document
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    router_ready: bool,
    uptime_seconds: u64,
}

/// JSON error body for rejected requests
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// The event-bridge HTTP server
pub struct BridgeServer {
    config: BridgeConfig,
    state: BridgeState,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig, router: Arc<EventRouter>) -> Self {
        let state = BridgeState {
            router,
            phase: Arc::new(RwLock::new(ServerPhase::Starting)),
            started_at: Instant::now(),
            max_body_bytes: config.max_body_bytes,
        };
        Self { config, state }
    }

    /// The router this server feeds
    pub fn router_handle(&self) -> Arc<EventRouter> {
        self.state.router.clone()
    }

    /// Create the Axum router with both bridge routes
    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/events", post(ingest_event))
            .route("/health", get(health))
            // Backstop above the handler's own ceiling so well-formed
            // rejections come from ingest_event with a JSON body
            .layer(DefaultBodyLimit::max(
                self.config.max_body_bytes.saturating_add(1024),
            ))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(|_err: BoxError| async {
                        StatusCode::REQUEST_TIMEOUT
                    }))
                    .timeout(self.config.write_timeout),
            )
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Run the server until the shutdown future resolves
    ///
    /// After the shutdown signal, in-flight requests are drained with a fixed
    /// deadline; stragglers are closed.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        use std::net::ToSocketAddrs;

        let addr: SocketAddr = self
            .config
            .addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                LatticeError::Internal(format!("cannot resolve bind address {}", self.config.addr()))
            })?;

        let app = self.create_router();
        let builder = axum::Server::try_bind(&addr)
            .map_err(|err| LatticeError::Internal(format!("cannot bind {}: {}", addr, err)))?
            .http1_header_read_timeout(self.config.read_timeout)
            .tcp_keepalive(Some(self.config.idle_timeout));

        *self.state.phase.write().unwrap() = ServerPhase::Ready;
        info!(addr = %addr, "event bridge listening");
        info!("  POST http://{}/events", addr);
        info!("  GET  http://{}/health", addr);

        let phase = self.state.phase.clone();
        let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
        let graceful = builder
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.await;
                *phase.write().unwrap() = ServerPhase::Draining;
                info!("event bridge draining");
                let _ = drain_tx.send(());
            });

        tokio::select! {
            result = graceful => {
                result.map_err(|err| LatticeError::Internal(format!("bridge server error: {}", err)))?;
            }
            _ = async {
                let _ = drain_rx.await;
                tokio::time::sleep(DRAIN_DEADLINE).await;
            } => {
                warn!("drain deadline exceeded, closing remaining connections");
            }
        }
        Ok(())
    }
}

/// Consume one JSON event: bound, parse, validate, stamp, route
async fn ingest_event(State(state): State<BridgeState>, body: Bytes) -> Response {
    if body.len() > state.max_body_bytes {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("body exceeds {} bytes", state.max_body_bytes),
        );
    }

    let mut event: Event = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", err));
        }
    };
    if let Err(err) = event.validate() {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    let server_time = Utc::now();
    event.server_time = Some(server_time);

    match state.router.route(event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "accepted",
                "server_time": server_time.to_rfc3339(),
            })),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "event processing failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Liveness endpoint
async fn health(State(state): State<BridgeState>) -> impl IntoResponse {
    Json(health_snapshot(&state))
}

fn health_snapshot(state: &BridgeState) -> HealthResponse {
    let phase = *state.phase.read().unwrap();
    HealthResponse {
        status: phase.as_str().to_string(),
        version: PROTOCOL_VERSION.to_string(),
        router_ready: phase == ServerPhase::Ready,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }
}
