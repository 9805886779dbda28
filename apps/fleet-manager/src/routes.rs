use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use panel_client::InstanceId;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics;
use crate::state::{ApplicationAction, FleetError, FleetState};
use crate::streaming::{StreamError, StreamState};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    instances: usize,
    build: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct StreamResponse {
    instance_id: InstanceId,
    stream_state: StreamState,
}

#[derive(Deserialize)]
struct ConsoleCommand {
    message: String,
}

#[derive(Deserialize)]
struct ActionRequest {
    action: ApplicationAction,
}

struct ApiFailure(FleetError);

impl From<FleetError> for ApiFailure {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            FleetError::Stream(StreamError::NotEligible { .. }) => StatusCode::CONFLICT,
            FleetError::ActionRefused { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            FleetError::Api(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "admin request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health(State(state): State<FleetState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.halt_signal().is_halted() { "halting" } else { "ok" },
        uptime_secs: state.uptime_secs(),
        instances: state.registry().len(),
        build: option_env!("FLEET_BUILD_ID").unwrap_or("dev"),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    let body = metrics::export_prometheus();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        body,
    )
}

async fn list_instances(State(state): State<FleetState>) -> impl IntoResponse {
    Json(state.roster())
}

async fn bootstrap_status(
    State(state): State<FleetState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiFailure> {
    Ok(Json(state.bootstrap_status(&InstanceId::new(id))?))
}

async fn start_stream(
    State(state): State<FleetState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiFailure> {
    let id = InstanceId::new(id);
    let stream_state = state.start_stream(&id).await?;
    Ok(Json(StreamResponse {
        instance_id: id,
        stream_state,
    }))
}

async fn stop_stream(
    State(state): State<FleetState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiFailure> {
    let id = InstanceId::new(id);
    state.stop_stream(&id).await?;
    Ok(Json(StreamResponse {
        instance_id: id,
        stream_state: StreamState::Stopped,
    }))
}

async fn next_console_batch(
    State(state): State<FleetState>,
    Path(id): Path<String>,
) -> Result<Response, ApiFailure> {
    Ok(match state.drain_plain_queue(&InstanceId::new(id))? {
        Some(batch) => (StatusCode::OK, batch).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn next_chat_entry(
    State(state): State<FleetState>,
    Path(id): Path<String>,
) -> Result<Response, ApiFailure> {
    Ok(match state.drain_chat_queue(&InstanceId::new(id))? {
        Some(entry) => Json(entry).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn send_console(
    State(state): State<FleetState>,
    Path(id): Path<String>,
    Json(body): Json<ConsoleCommand>,
) -> Result<StatusCode, ApiFailure> {
    state
        .send_console_message(&InstanceId::new(id), &body.message)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn application_action(
    State(state): State<FleetState>,
    Path(id): Path<String>,
    Json(body): Json<ActionRequest>,
) -> Result<StatusCode, ApiFailure> {
    state
        .application_action(&InstanceId::new(id), body.action)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub fn router(state: FleetState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/instances", get(list_instances))
        .route("/instances/:id/bootstrap", get(bootstrap_status))
        .route("/instances/:id/stream/start", post(start_stream))
        .route("/instances/:id/stream/stop", post(stop_stream))
        .route("/instances/:id/console/next", get(next_console_batch))
        .route("/instances/:id/chat/next", get(next_chat_entry))
        .route("/instances/:id/console", post(send_console))
        .route("/instances/:id/action", post(application_action))
        .with_state(state)
}
