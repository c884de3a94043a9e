//! HTTP surface of the gateway.
//!
//! | route | purpose |
//! |---|---|
//! | `POST /api/v1/messages` | serve one conversation turn |
//! | `GET /health` | liveness of the gateway itself |
//! | `GET /status` | failover snapshot |
//! | `GET /statistics` | runtime counters |
//! | `POST /admin/failover/rotate` | advance the alternate rotation |
//! | `POST /admin/failover/restore` | make the primary active again |
//! | `GET /admin/sessions/:id/transitions` | audit trail of one session |

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::FailoverError;
use llm::{PrimaryStatus, RequestEnvelope};
use memory::TransitionRecord;
use router::{ActiveState, Decision, RequestRouter, StatisticsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
}

impl AppState {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }
}

/// Routes without middleware; the binary adds CORS and tracing layers.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/messages", post(handle_messages))
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/statistics", get(handle_statistics))
        .route("/admin/failover/rotate", post(handle_rotate))
        .route("/admin/failover/restore", post(handle_restore))
        .route("/admin/sessions/:id/transitions", get(handle_transitions))
        .with_state(state)
}

/// Error body for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: String,
    pub status_code: u16,
    pub timestamp: String,
}

/// `FailoverError` rendered as an HTTP response.
pub struct ApiError(FailoverError);

impl From<FailoverError> for ApiError {
    fn from(e: FailoverError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(component = self.0.component(), "Request failed: {}", self.0);
        } else {
            warn!(component = self.0.component(), "Request rejected: {}", self.0);
        }

        let body = ErrorResponse {
            error: error_title(&self.0).to_string(),
            detail: format!("{}: {}", self.0.component(), self.0),
            status_code: code,
            timestamp: Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}

fn error_title(e: &FailoverError) -> &'static str {
    match e {
        FailoverError::InvalidRequest(_) => "Invalid request",
        FailoverError::Cancelled => "Request cancelled",
        _ => "Failed to process request",
    }
}

async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RequestEnvelope>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| FailoverError::InvalidRequest(rejection.body_text()))?;

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.metadata_str("session_id").map(str::to_string));

    // Dropping the handler future (client gone) cancels in-flight retries
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    let routed = state.router.handle(session_id, request, cancel).await?;

    let mut response = Json(routed.response).into_response();
    if let Ok(value) = HeaderValue::from_str(&routed.session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
    primary_status: &'static str,
    fallback_mode: String,
    active_provider: String,
    active_state: ActiveState,
    primary_available: bool,
    alternates_available: BTreeMap<String, bool>,
    persistence_available: bool,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusBody> {
    let router = &state.router;
    let controller = router.controller();
    let primary_status = router.primary_status();

    let primary_available = router.registry().contains(controller.primary_id())
        && primary_status != Some(PrimaryStatus::Down);
    let alternates_available = controller
        .alternates()
        .into_iter()
        .map(|id| {
            let available = router.registry().contains(&id);
            (id, available)
        })
        .collect();

    Json(StatusBody {
        status: "operational",
        primary_status: primary_status.map(|s| s.as_str()).unwrap_or("UNKNOWN"),
        fallback_mode: controller.mode().to_string(),
        active_provider: controller.active_provider(),
        active_state: controller.active_state(),
        primary_available,
        alternates_available,
        persistence_available: router.sessions().is_durable(),
    })
}

async fn handle_statistics(State(state): State<AppState>) -> Json<StatisticsSnapshot> {
    Json(state.router.statistics())
}

#[derive(Debug, Serialize)]
struct TransitionBody {
    from: String,
    to: String,
}

#[derive(Debug, Serialize)]
struct DecisionBody {
    active_provider: String,
    active_state: ActiveState,
    rotation_index: usize,
    transition: Option<TransitionBody>,
}

impl DecisionBody {
    fn new(decision: Decision, rotation_index: usize) -> Self {
        Self {
            active_provider: decision.provider,
            active_state: decision.state,
            rotation_index,
            transition: decision.transition.map(|t| TransitionBody {
                from: t.from,
                to: t.to,
            }),
        }
    }
}

async fn handle_rotate(State(state): State<AppState>) -> Result<Json<DecisionBody>, ApiError> {
    let decision = state.router.rotate_alternate()?;
    let index = state.router.controller().rotation_index();
    Ok(Json(DecisionBody::new(decision, index)))
}

async fn handle_restore(State(state): State<AppState>) -> Result<Json<DecisionBody>, ApiError> {
    let decision = state.router.restore_primary()?;
    let index = state.router.controller().rotation_index();
    Ok(Json(DecisionBody::new(decision, index)))
}

async fn handle_transitions(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<TransitionRecord>>, ApiError> {
    Ok(Json(state.router.transitions(&session_id)?))
}
