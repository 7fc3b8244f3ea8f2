//! HTTP transport: start runs, stream their events over SSE.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use run_relay_core::{Frame, RawRunRequest, SessionId};
use run_relay_session::{
    AdmissionPolicy, AttachError, BufferedRun, RunOrchestrator, SessionRegistry, StartError,
};
use tower_http::trace::TraceLayer;

use crate::protocol::{ErrorBody, Health, RunSnapshot, StartRunResponse};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RunOrchestrator>,
    pub registry: SessionRegistry,
}

impl AppState {
    #[must_use]
    pub fn new(orchestrator: Arc<RunOrchestrator>) -> Self {
        let registry = orchestrator.registry().clone();
        Self {
            orchestrator,
            registry,
        }
    }
}

/// API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request body: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Start(#[from] StartError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("Session not found: {0}")]
    UnknownSession(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Start(StartError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Start(StartError::AdmissionRejected) => StatusCode::CONFLICT,
            Self::Start(StartError::Cancelled | StartError::ShuttingDown) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Attach(AttachError::NotFound(_)) | Self::UnknownSession(_) => {
                StatusCode::NOT_FOUND
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Build the router for the orchestrator's admission policy.
///
/// Multi-session deployments expose `POST /runs`, `GET /runs/{id}` and the
/// `GET /runs/{id}/events` stream. Single-flight deployments expose a
/// blocking `POST /runs` only.
#[must_use]
pub fn router(state: AppState) -> Router {
    let runs = match state.orchestrator.admission().policy() {
        AdmissionPolicy::MultiSession => Router::new()
            .route("/runs", post(start_run))
            .route("/runs/{session_id}", get(run_snapshot))
            .route("/runs/{session_id}/events", get(attach_stream)),
        AdmissionPolicy::SingleFlight => Router::new().route("/runs", post(run_single_flight)),
    };

    Router::new()
        .route("/health", get(health))
        .merge(runs)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Health> {
    Json(Health { ok: true })
}

fn body(payload: Result<Json<RawRunRequest>, JsonRejection>) -> Result<RawRunRequest, ApiError> {
    payload
        .map(|Json(raw)| raw)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::UnknownSession(raw.to_string()))
}

async fn start_run(
    State(state): State<AppState>,
    payload: Result<Json<RawRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    let session_id = state.orchestrator.start(body(payload)?)?;
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { session_id })))
}

async fn run_single_flight(
    State(state): State<AppState>,
    payload: Result<Json<RawRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BufferedRun>), ApiError> {
    let result = state.orchestrator.run_buffered(body(payload)?).await?;
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(result)))
}

async fn run_snapshot(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let id = parse_session_id(&session_id)?;
    let session = state
        .registry
        .get(id)
        .ok_or(ApiError::Attach(AttachError::NotFound(id)))?;

    Ok(Json(RunSnapshot {
        session_id: id,
        state: session.state(),
        events: session.snapshot(),
        observers: session.observer_count(),
    }))
}

async fn attach_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let id = parse_session_id(&session_id)?;
    // The subscription lives inside the response body; the transport dropping
    // the body on disconnect is what detaches the observer.
    let subscription = state.registry.attach(id)?;
    Ok(Sse::new(
        subscription.map(|frame| Ok::<_, Infallible>(to_sse_event(&frame))),
    ))
}

/// Frame one relay frame as an SSE event.
#[must_use]
pub fn to_sse_event(frame: &Frame) -> Event {
    match frame {
        Frame::Event(event) => Event::default()
            .event(event.kind.as_str())
            .data(event.payload.to_string()),
        Frame::KeepAlive => Event::default().comment(""),
    }
}
