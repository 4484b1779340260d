// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface of a node.
//!
//! | Route                               | Method | Served by |
//! |-------------------------------------|--------|-----------|
//! | `/agent/notify`                     | POST   | any node  |
//! | `/agent/sync`                       | POST   | master    |
//! | `/agent/add`                        | POST   | master    |
//! | `/agent/nodeinfo`                   | GET    | master    |
//! | `/agent/get-worker`                 | POST   | master    |
//! | `/agent/fill-worker-config`         | POST   | master    |
//! | `/agent/logs`                       | POST   | master    |
//! | `/agent/sync-now`                   | POST   | agents    |
//! | `/api/workers`                      | POST   | master    |
//! | `/api/workers/{uid}`                | PUT, DELETE | master |
//! | `/api/workers/{uid}/flush`          | POST   | any node  |
//! | `/api/workers/{uid}/status`         | GET    | any node  |
//! | `/health`                           | GET    | any node, no auth |
//!
//! Every route except `/health` requires the caller's node name and node token,
//! as `x-node-name`/`x-secret` headers or `name`/`secret` query parameters.
//! Responses are wrapped in an [`Envelope`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use edgehost_agent_sdk::auth::{HEADER_NODE_NAME, HEADER_NODE_SECRET, verify_node_token};
use edgehost_agent_sdk::types::paths;
use edgehost_agent_sdk::{
    Envelope, FillWorkerConfigRequest, FillWorkerConfigResponse, GetWorkerRequest, NodeInfo,
    NotifyEventRequest, PushLogsRequest, RegisterNodeRequest, SdkError, SyncWorkersResponse,
    WorkerRecord,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::Error;
use crate::handlers::{self, NodeHandlerState, WorkerRequest};
use crate::reconcile::SyncReport;

/// Name of the authenticated calling node.
#[derive(Debug, Clone)]
pub struct CallerNode(pub String);

/// Build the router.
pub fn router(state: Arc<NodeHandlerState>) -> Router {
    Router::new()
        .route(paths::NOTIFY, post(notify))
        .route(paths::SYNC, post(sync))
        .route(paths::ADD_NODE, post(add_node))
        .route(paths::NODE_INFO, get(node_info))
        .route(paths::GET_WORKER, post(get_worker))
        .route(paths::FILL_WORKER_CONFIG, post(fill_worker_config))
        .route(paths::LOGS, post(push_logs))
        .route("/agent/sync-now", post(sync_now))
        .route("/api/workers", post(create_worker))
        .route("/api/workers/{uid}", put(update_worker).delete(delete_worker))
        .route("/api/workers/{uid}/flush", post(flush_worker))
        .route("/api/workers/{uid}/status", get(worker_status))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_node_token,
        ))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` turns true.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

// ============================================================================
// Authentication
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    name: Option<String>,
    secret: Option<String>,
}

async fn require_node_token(
    State(state): State<Arc<NodeHandlerState>>,
    Query(query): Query<AuthQuery>,
    mut request: Request,
    next: Next,
) -> Response {
    let (node_name, token) = {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        (
            header(HEADER_NODE_NAME).or(query.name),
            header(HEADER_NODE_SECRET).or(query.secret),
        )
    };

    match (node_name, token) {
        (Some(node_name), Some(token))
            if verify_node_token(&node_name, &token, &state.cluster_secret) =>
        {
            request.extensions_mut().insert(CallerNode(node_name));
            next.run(request).await
        }
        (node_name, _) => {
            warn!(
                node = node_name.as_deref().unwrap_or("-"),
                path = %request.uri().path(),
                "Rejected unauthenticated request"
            );
            envelope_error(StatusCode::UNAUTHORIZED, "unauthorized")
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Error returned by route handlers.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::WorkerNotFound(_) | Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
            Error::NodeExists(_) | Error::WorkerNameTaken(_) => StatusCode::CONFLICT,
            Error::InvalidRequest(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Sdk(SdkError::InvalidInput(_) | SdkError::Serialization(_)) => {
                StatusCode::BAD_REQUEST
            }
            Error::Sdk(_) => StatusCode::BAD_GATEWAY,
            Error::PortsExhausted => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        envelope_error(status, &self.0.to_string())
    }
}

fn envelope_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(Envelope::<()>::error(status.as_u16(), msg))).into_response()
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope::ok(data)))
}

// ============================================================================
// Routes
// ============================================================================

async fn health(State(state): State<Arc<NodeHandlerState>>) -> ApiResult<handlers::HealthCheckResponse> {
    ok(handlers::handle_health_check(&state).await?)
}

async fn notify(
    State(state): State<Arc<NodeHandlerState>>,
    Json(request): Json<NotifyEventRequest>,
) -> ApiResult<()> {
    ok(handlers::handle_notify(&state, request).await?)
}

async fn sync(
    State(state): State<Arc<NodeHandlerState>>,
    Extension(CallerNode(caller)): Extension<CallerNode>,
) -> ApiResult<SyncWorkersResponse> {
    ok(handlers::handle_sync(&state, &caller).await?)
}

async fn add_node(
    State(state): State<Arc<NodeHandlerState>>,
    Extension(CallerNode(caller)): Extension<CallerNode>,
    Json(request): Json<RegisterNodeRequest>,
) -> ApiResult<NodeInfo> {
    ok(handlers::handle_add_node(&state, &caller, request).await?)
}

async fn node_info(
    State(state): State<Arc<NodeHandlerState>>,
    Extension(CallerNode(caller)): Extension<CallerNode>,
) -> ApiResult<NodeInfo> {
    ok(handlers::handle_node_info(&state, &caller).await?)
}

async fn get_worker(
    State(state): State<Arc<NodeHandlerState>>,
    Json(request): Json<GetWorkerRequest>,
) -> ApiResult<Vec<WorkerRecord>> {
    ok(handlers::handle_get_worker(&state, request).await?)
}

async fn fill_worker_config(
    State(state): State<Arc<NodeHandlerState>>,
    Json(request): Json<FillWorkerConfigRequest>,
) -> ApiResult<FillWorkerConfigResponse> {
    ok(handlers::handle_fill_worker_config(&state, request).await?)
}

async fn push_logs(
    State(state): State<Arc<NodeHandlerState>>,
    Json(request): Json<PushLogsRequest>,
) -> ApiResult<usize> {
    ok(handlers::handle_push_logs(&state, request).await?)
}

async fn sync_now(
    State(state): State<Arc<NodeHandlerState>>,
) -> ApiResult<SyncReport> {
    ok(handlers::handle_sync_now(&state).await?)
}

async fn create_worker(
    State(state): State<Arc<NodeHandlerState>>,
    Json(request): Json<WorkerRequest>,
) -> ApiResult<WorkerRecord> {
    ok(handlers::handle_create_worker(&state, request).await?)
}

async fn update_worker(
    State(state): State<Arc<NodeHandlerState>>,
    Path(uid): Path<String>,
    Json(request): Json<WorkerRequest>,
) -> ApiResult<WorkerRecord> {
    ok(handlers::handle_update_worker(&state, &uid, request).await?)
}

async fn delete_worker(
    State(state): State<Arc<NodeHandlerState>>,
    Path(uid): Path<String>,
) -> ApiResult<()> {
    ok(handlers::handle_delete_worker(&state, &uid).await?)
}

async fn flush_worker(
    State(state): State<Arc<NodeHandlerState>>,
    Path(uid): Path<String>,
) -> ApiResult<()> {
    ok(handlers::handle_flush_worker(&state, &uid).await?)
}

async fn worker_status(
    State(state): State<Arc<NodeHandlerState>>,
    Path(uid): Path<String>,
) -> ApiResult<handlers::WorkerStatusResponse> {
    ok(handlers::handle_worker_status(&state, &uid).await?)
}
