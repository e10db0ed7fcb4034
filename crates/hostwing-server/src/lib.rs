//! The Control API (C5): HTTP endpoints for instance lifecycle, state
//! query, and host stats, gated by a single shared-secret basic auth
//! check. Also wires in the session multiplexer (C6/C7) under the same
//! listener.

pub mod streaming;

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use hostwing_common::{AgentError, CreateRequest};
use hostwing_pipeline::{DeployOverrides, DeploymentPipeline, EditRequest};
use hostwing_runtime::RuntimeClient;
use hostwing_store::StateStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::instrument;

const AUTH_USERNAME: &str = "hostwing";

/// Shared process-wide state, constructed once at startup and handed to
/// every handler and every session.
pub struct AppState {
    pub runtime: Arc<RuntimeClient>,
    pub state_store: Arc<StateStore>,
    pub pipeline: Arc<DeploymentPipeline>,
    pub key: String,
    pub storage_root: std::path::PathBuf,
    pub started_at: Instant,
    pub sessions: streaming::SessionRegistry,
}

impl AppState {
    pub fn new(
        runtime: Arc<RuntimeClient>,
        state_store: Arc<StateStore>,
        pipeline: Arc<DeploymentPipeline>,
        key: String,
        storage_root: std::path::PathBuf,
    ) -> Self {
        Self {
            runtime,
            state_store,
            pipeline,
            key,
            storage_root,
            started_at: Instant::now(),
            sessions: streaming::SessionRegistry::default(),
        }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/instances/create", post(create_instance))
        .route("/instances/:id", delete(delete_instance))
        .route("/instances/redeploy/:id/:container_id", post(redeploy_instance))
        .route("/instances/reinstall/:id/:container_id", post(reinstall_instance))
        .route("/instances/edit/:id", put(edit_instance))
        .route("/state/:volume_id", get(get_state))
        .route("/stats", get(host_stats))
        .route("/ws/:kind/:container_id", get(streaming::ws_handler))
        .route("/ws/:kind/:container_id/:volume_id", get(streaming::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Errors map to status codes explicitly, never through a blanket
/// `From<AnyError> for StatusCode`.
struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

impl From<hostwing_pipeline::PipelineError> for ApiError {
    fn from(err: hostwing_pipeline::PipelineError) -> Self {
        Self(err.into())
    }
}

impl From<hostwing_store::StoreError> for ApiError {
    fn from(err: hostwing_store::StoreError) -> Self {
        Self(err.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AgentError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Conflict(_) => StatusCode::CONFLICT,
            AgentError::Runtime(_) | AgentError::Deployment(_) | AgentError::Gateway(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AgentError::Config(_) | AgentError::Io(_) | AgentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn check_auth(headers: &HeaderMap, expected_key: &str) -> bool {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    decoded == format!("{AUTH_USERNAME}:{expected_key}")
}

fn require_auth(headers: &HeaderMap, state: &AppState) -> std::result::Result<(), ApiError> {
    if check_auth(headers, &state.key) {
        Ok(())
    } else {
        Err(ApiError(AgentError::Unauthorized("unauthorized".to_string())))
    }
}

#[instrument(skip(state, headers, req))]
async fn create_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> std::result::Result<Response, ApiError> {
    require_auth(&headers, &state)?;
    let outcome = state.pipeline.create(req).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

#[instrument(skip(state, headers))]
async fn delete_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> std::result::Result<StatusCode, ApiError> {
    require_auth(&headers, &state)?;
    state.pipeline.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, headers, body))]
async fn redeploy_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((id, container_id)): AxumPath<(String, String)>,
    body: Option<Json<DeployOverrides>>,
) -> std::result::Result<Response, ApiError> {
    require_auth(&headers, &state)?;
    let overrides = body.map(|Json(o)| o).unwrap_or_default();
    let outcome = state.pipeline.redeploy(&id, &container_id, overrides).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

#[instrument(skip(state, headers, body))]
async fn reinstall_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath((id, container_id)): AxumPath<(String, String)>,
    body: Option<Json<DeployOverrides>>,
) -> std::result::Result<Response, ApiError> {
    require_auth(&headers, &state)?;
    let overrides = body.map(|Json(o)| o).unwrap_or_default();
    let outcome = state.pipeline.reinstall(&id, &container_id, overrides).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)).into_response())
}

#[instrument(skip(state, headers, body))]
async fn edit_instance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<EditRequest>,
) -> std::result::Result<Response, ApiError> {
    require_auth(&headers, &state)?;
    let instance = state.pipeline.edit(&id, body).await?;
    Ok(Json(instance).into_response())
}

#[instrument(skip(state, headers))]
async fn get_state(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(volume_id): AxumPath<String>,
) -> std::result::Result<Response, ApiError> {
    require_auth(&headers, &state)?;
    let document = state.state_store.read().await?;
    match document.get(&volume_id) {
        Some(record) => Ok(Json(record).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                message: format!("unknown instance {volume_id}"),
            }),
        )
            .into_response()),
    }
}

#[derive(Serialize)]
struct HostStats {
    total_host_stats: serde_json::Value,
    online_containers_count: usize,
    uptime: String,
}

#[instrument(skip(state, headers))]
async fn host_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    require_auth(&headers, &state)?;

    let info = state.runtime.info().await.map_err(AgentError::from)?;
    let containers = state.runtime.list_containers(false).await.map_err(AgentError::from)?;

    let body = HostStats {
        total_host_stats: serde_json::to_value(&info).unwrap_or(serde_json::Value::Null),
        online_containers_count: containers.len(),
        uptime: format_uptime(state.started_at.elapsed()),
    };
    Ok(Json(body).into_response())
}

/// `Nd Nh Nm`, omitting zero leading components, defaulting to `0m`.
fn format_uptime(elapsed: std::time::Duration) -> String {
    let total_minutes = elapsed.as_secs() / 60;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes % (24 * 60)) / 60;
    let minutes = total_minutes % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    parts.push(format!("{minutes}m"));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_uptime_defaults_to_0m() {
        assert_eq!(format_uptime(std::time::Duration::from_secs(0)), "0m");
    }

    #[test]
    fn format_uptime_omits_zero_leading_components() {
        assert_eq!(format_uptime(std::time::Duration::from_secs(65)), "1m");
        assert_eq!(format_uptime(std::time::Duration::from_secs(3660)), "1h 1m");
        assert_eq!(
            format_uptime(std::time::Duration::from_secs(90000)),
            "1d 1h 0m"
        );
    }

    #[test]
    fn check_auth_requires_matching_basic_credentials() {
        let mut headers = HeaderMap::new();
        let token = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(b"hostwing:secret")
        };
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Basic {token}").parse().unwrap(),
        );
        assert!(check_auth(&headers, "secret"));
        assert!(!check_auth(&headers, "wrong"));
    }

    #[test]
    fn check_auth_rejects_missing_header() {
        let headers = HeaderMap::new();
        assert!(!check_auth(&headers, "secret"));
    }
}
