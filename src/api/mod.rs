//! HTTP control plane: a thin translation layer over the scheduling core.
//!
//! Handlers forward to the core through [`CoreHandle`] and map `QueueError`
//! categories onto HTTP status codes. Administrative routes (config,
//! shutdown) refuse callers whose peer address is not loopback, which is why
//! the server runs with `into_make_service_with_connect_info`.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::QueueError;
use crate::scheduler::CoreHandle;
use crate::store::{JobState, NewJob};

#[derive(Clone)]
pub struct ApiState {
    pub core: CoreHandle,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", post(enqueue_handler).get(list_handler))
        .route("/api/jobs/:id", get(get_handler))
        .route("/api/status", get(status_handler))
        .route("/api/dlq", get(dlq_list_handler))
        .route("/api/dlq/retry-all", post(dlq_retry_all_handler))
        .route("/api/dlq/:id/retry", post(dlq_retry_one_handler))
        .route("/api/config", get(config_list_handler))
        .route(
            "/api/config/:key",
            get(config_get_handler).put(config_set_handler),
        )
        .route("/api/shutdown", post(shutdown_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the control API until the token is cancelled; in-flight requests
/// are allowed to finish.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ApiState,
    token: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await
}

enum ApiError {
    Forbidden,
    Queue(QueueError),
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Queue(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "administrative endpoints are restricted to localhost".to_string(),
            ),
            ApiError::Queue(e) => {
                let status = match &e {
                    QueueError::Validation(_) => StatusCode::BAD_REQUEST,
                    QueueError::DuplicateJob(_) => StatusCode::CONFLICT,
                    QueueError::JobNotFound(_)
                    | QueueError::UnknownConfigKey(_)
                    | QueueError::DlqEmpty => StatusCode::NOT_FOUND,
                    QueueError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

fn require_loopback(addr: &SocketAddr) -> Result<(), ApiError> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct RetryAllResponse {
    message: String,
    count: usize,
}

#[derive(Deserialize)]
struct ListParams {
    state: Option<String>,
}

#[derive(Deserialize)]
struct ConfigSetBody {
    value: serde_json::Value,
}

async fn enqueue_handler(
    State(state): State<ApiState>,
    Json(new): Json<NewJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.core.enqueue(new).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_handler(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = match params.state.as_deref() {
        Some(s) => Some(s.parse::<JobState>().map_err(ApiError::Queue)?),
        None => None,
    };
    let jobs = state.core.list(filter).await?;
    Ok(Json(jobs))
}

async fn get_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.core.get(id).await?;
    Ok(Json(job))
}

async fn status_handler(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.core.status().await?;
    Ok(Json(report))
}

async fn dlq_list_handler(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.core.dlq_list().await?;
    Ok(Json(jobs))
}

async fn dlq_retry_one_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.core.dlq_retry_one(id.clone()).await?;
    Ok(Json(MessageResponse {
        message: format!("job {id} re-queued"),
    }))
}

async fn dlq_retry_all_handler(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.core.dlq_retry_all().await?;
    Ok(Json(RetryAllResponse {
        message: format!("{count} dead jobs re-queued"),
        count,
    }))
}

async fn config_list_handler(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, ApiError> {
    require_loopback(&addr)?;
    let pairs = state.core.config_list().await?;
    let map: BTreeMap<String, String> = pairs.into_iter().collect();
    Ok(Json(map))
}

async fn config_get_handler(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_loopback(&addr)?;
    let (key, value) = state.core.config_get(key).await?;
    let mut map = BTreeMap::new();
    map.insert(key, value);
    Ok(Json(map))
}

async fn config_set_handler(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(key): Path<String>,
    Json(body): Json<ConfigSetBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_loopback(&addr)?;
    let value = match body.value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(ApiError::Queue(QueueError::Validation(format!(
                "config value must be a string or number, got {other}"
            ))));
        }
    };
    let (key, sanitized) = state.core.config_set(key, value).await?;
    let mut map = BTreeMap::new();
    map.insert(key, sanitized);
    Ok(Json(map))
}

async fn shutdown_handler(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, ApiError> {
    require_loopback(&addr)?;
    let message = state.core.shutdown().await?;
    Ok(Json(MessageResponse { message }))
}
