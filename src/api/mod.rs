//! Control API handlers
//!
//! Device listing and commands, session expiry, the SSE event stream and the two
//! endpoints a browser display uses to attach and pick up its stream URL.

use crate::adapters::web::PollOutcome;
use crate::adapters::DeviceStatus;
use crate::bus::SharedBus;
use crate::content::CacheStats;
use crate::error::DeviceError;
use crate::orchestrator::{Orchestrator, PlayError};
use crate::registry::DeviceSummary;
use crate::session::SessionSummary;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: SharedBus,
    pub started: Instant,
    /// Ends long-lived responses (SSE) when the process shuts down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, bus: SharedBus) -> Self {
        Self {
            shutdown: orchestrator.sessions().shutdown_token(),
            orchestrator,
            bus,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/devices", get(devices_handler))
        .route("/devices/{id}/status", get(device_status_handler))
        .route("/devices/{id}/play", post(play_handler))
        .route("/devices/{id}/stop", post(stop_handler))
        .route("/devices/{id}/pause", post(pause_handler))
        .route("/devices/{id}/resume", post(resume_handler))
        .route("/devices/{id}/session", delete(release_handler))
        .route("/sessions/{token}", delete(expire_session_handler))
        .route("/events", get(events_handler))
        .route("/web/api/register/{password}", get(web_register_handler))
        .route("/web/api/poll/{token}", get(web_poll_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn device_error_response(e: &DeviceError) -> Response {
    let status = match e {
        DeviceError::NotFound(_) => StatusCode::NOT_FOUND,
        DeviceError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        DeviceError::Unreachable(_) | DeviceError::Protocol(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, e)
}

fn ok_response() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"ok": true}))).into_response()
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub uptime_secs: u64,
    pub devices: usize,
    pub sessions: Vec<SessionSummary>,
    pub cache: CacheStats,
    pub bus_subscribers: usize,
}

/// GET /status - Service health and stream activity
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        service: "castbridge",
        version: env!("CASTBRIDGE_VERSION"),
        git_sha: env!("CASTBRIDGE_GIT_SHA"),
        uptime_secs: state.started.elapsed().as_secs(),
        devices: orchestrator.devices().len(),
        sessions: orchestrator.sessions().summaries().await,
        cache: orchestrator.sources().cache().stats().await,
        bus_subscribers: state.bus.subscriber_count(),
    })
}

// =============================================================================
// Device handlers
// =============================================================================

/// GET /devices - Configured devices in config order
pub async fn devices_handler(State(state): State<AppState>) -> Json<Vec<DeviceSummary>> {
    Json(state.orchestrator.devices().list())
}

#[derive(Serialize)]
pub struct DeviceStatusResponse {
    pub id: String,
    #[serde(flatten)]
    pub status: DeviceStatus,
    pub session: Option<String>,
}

/// GET /devices/{id}/status - Best-effort playback state
pub async fn device_status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.devices().status(&id).await {
        Ok(status) => Json(DeviceStatusResponse {
            session: state
                .orchestrator
                .active_session(&id)
                .map(|t| crate::bus::short_token(&t)),
            id,
            status,
        })
        .into_response(),
        Err(e) => device_error_response(&e),
    }
}

/// Play request body
#[derive(Deserialize)]
pub struct PlayRequest {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub resume_secs: Option<f64>,
}

/// POST /devices/{id}/play - Stream `url` to the device
pub async fn play_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PlayRequest>,
) -> impl IntoResponse {
    if url::Url::parse(&req.url).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "url is not an absolute URL");
    }

    match state
        .orchestrator
        .play_url(&id, &req.url, req.title, req.resume_secs.unwrap_or(0.0))
        .await
    {
        Ok(started) => (StatusCode::OK, Json(started)).into_response(),
        Err(PlayError::Device(e)) => device_error_response(&e),
        Err(e @ PlayError::Content(_)) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

/// POST /devices/{id}/stop - Stop playback; the session stays valid
pub async fn stop_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.stop(&id).await {
        Ok(()) => ok_response(),
        Err(e) => device_error_response(&e),
    }
}

/// POST /devices/{id}/pause
pub async fn pause_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.devices().pause(&id).await {
        Ok(()) => ok_response(),
        Err(e) => device_error_response(&e),
    }
}

/// POST /devices/{id}/resume
pub async fn resume_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.devices().resume(&id).await {
        Ok(()) => ok_response(),
        Err(e) => device_error_response(&e),
    }
}

/// DELETE /devices/{id}/session - Expire the session the device is playing
pub async fn release_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.orchestrator.devices().get(&id) {
        return device_error_response(&e);
    }
    if state.orchestrator.release(&id).await {
        ok_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "device has no active session")
    }
}

// =============================================================================
// Session handlers
// =============================================================================

/// DELETE /sessions/{token} - Explicit invalidation
pub async fn expire_session_handler(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    if state.orchestrator.expire(&token).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found")
    }
}

// =============================================================================
// SSE Events
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Only this device's events (plus session and stream events)
    pub device: Option<String>,
}

/// GET /events - Server-Sent Events stream, `?device=<id>` to narrow it
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state.bus.events(query.device).filter_map(|event| {
        serde_json::to_string(&event)
            .ok()
            .map(|json| Ok(Event::default().event(event.event_type()).data(json)))
    });

    let shutdown = state.shutdown.clone();
    let stream = futures::StreamExt::take_until(stream, async move { shutdown.cancelled().await });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

// =============================================================================
// Browser display
// =============================================================================

/// GET /web/api/register/{password} - Attach a browser, returning its client token
pub async fn web_register_handler(
    State(state): State<AppState>,
    Path(password): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.devices().register_browser(&password) {
        Some(token) => (StatusCode::OK, token).into_response(),
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

/// GET /web/api/poll/{token} - The stream URL to open, once; 302 means keep polling
pub async fn web_poll_handler(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.devices().poll_browser(&token) {
        PollOutcome::Play(url) => (StatusCode::OK, url).into_response(),
        PollOutcome::NothingPending => StatusCode::FOUND.into_response(),
        PollOutcome::UnknownClient => StatusCode::NOT_FOUND.into_response(),
        PollOutcome::Malformed => StatusCode::BAD_REQUEST.into_response(),
    }
}
