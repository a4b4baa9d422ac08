//! HTTP control surface for the BlueOS UI
//!
//! Handlers only translate between HTTP and [`AgentControl`]; validation and
//! lifecycle rules live in the core and supervisor crates. Every JSON body carries
//! `success`, and failures add `error`, `message` and, for validation errors,
//! `field`.

use crate::error::ApiError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt, future};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uros_core::agent::{ConfigCandidate, LooseInt};
use uros_core::{AgentState, AgentStatus};
use uros_supervisor::{AgentControl, HealthStatus};

/// Lines returned by `/logs` when no `tail` is given
pub const DEFAULT_TAIL: usize = 200;

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
struct AppState {
    control: Arc<dyn AgentControl>,
    shutdown: watch::Receiver<bool>,
}

/// Control API routes under `/micro-ros-agent`
///
/// Sending `true` on `shutdown` ends every open log stream, so graceful
/// shutdown of the server is not held up by long-lived SSE responses.
pub fn router(control: Arc<dyn AgentControl>, shutdown: watch::Receiver<bool>) -> Router {
    let routes = Router::new()
        .route("/settings", get(get_settings).put(put_settings))
        .route("/status", get(get_status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/logs", get(get_logs))
        .route("/logs/previous", get(get_previous_logs))
        .route("/logs/stream", get(stream_logs))
        .route("/get-enabled-state", get(get_enabled_state))
        .route("/save-enabled-state", post(save_enabled_state))
        .route("/get-settings", post(legacy_get_settings))
        .route("/save-settings", post(legacy_save_settings))
        .with_state(AppState { control, shutdown });

    Router::new().nest("/micro-ros-agent", routes)
}

/// Full application: control API, request tracing and the optional bundled UI
pub fn app(
    control: Arc<dyn AgentControl>,
    shutdown: watch::Receiver<bool>,
    static_dir: Option<&Path>,
) -> Router {
    let mut app = router(control, shutdown);
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }
    app.layer(TraceLayer::new_for_http())
}

async fn get_settings(State(state): State<AppState>) -> ApiResult {
    debug!("Getting the micro-ROS agent settings");
    let settings = state.control.settings().settings();
    Ok(Json(json!({ "success": true, "micro_ros_agent": settings })))
}

async fn put_settings(
    State(state): State<AppState>,
    body: Result<Json<ConfigCandidate>, JsonRejection>,
) -> ApiResult {
    let Json(candidate) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    info!("Saving the micro-ROS agent settings: {:?}", candidate);

    let config = state.control.configure(candidate).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Settings saved",
        "micro_ros_agent": config,
    })))
}

#[derive(Serialize)]
struct StatusBody {
    success: bool,
    running: bool,
    message: String,
    health: HealthStatus,
    uptime_secs: Option<u64>,
    #[serde(flatten)]
    status: AgentStatus,
}

fn status_body(control: &dyn AgentControl, status: AgentStatus) -> StatusBody {
    let message = match (status.state, &status.last_exit) {
        (AgentState::Crashed, Some(exit)) => format!("Crashed ({})", exit),
        (AgentState::Crashed, None) => "Crashed".to_string(),
        (AgentState::Stopped, _) => "Stopped".to_string(),
        (AgentState::Starting, _) => "Starting".to_string(),
        (AgentState::Running, _) => "Running".to_string(),
        (AgentState::Stopping, _) => "Stopping".to_string(),
    };
    StatusBody {
        success: true,
        running: status.state == AgentState::Running,
        message,
        health: control.health_check(),
        uptime_secs: status.uptime().map(|d| d.as_secs()),
        status,
    }
}

async fn get_status(State(state): State<AppState>) -> Json<StatusBody> {
    debug!("Getting the micro-ROS agent status");
    let status = state.control.status();
    Json(status_body(state.control.as_ref(), status))
}

async fn start(State(state): State<AppState>) -> Result<Json<StatusBody>, ApiError> {
    info!("Start the micro-ROS agent request received");
    let status = state.control.start().await?;
    Ok(Json(status_body(state.control.as_ref(), status)))
}

async fn stop(State(state): State<AppState>) -> Result<Json<StatusBody>, ApiError> {
    info!("Stop the micro-ROS agent request received");
    let status = state.control.stop().await?;
    Ok(Json(status_body(state.control.as_ref(), status)))
}

async fn restart(State(state): State<AppState>) -> Result<Json<StatusBody>, ApiError> {
    info!("Restart the micro-ROS agent request received");
    let status = state.control.restart().await?;
    Ok(Json(status_body(state.control.as_ref(), status)))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    tail: Option<usize>,
    /// Launch the cursor belongs to; a stale launch restarts from the beginning
    launch_id: Option<u64>,
    cursor: Option<u64>,
    limit: Option<usize>,
}

async fn get_logs(
    State(state): State<AppState>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let logs = state.control.logs();
    let bound = logs.max_lines();

    let page = match query.cursor {
        Some(cursor) => logs.since(
            query.launch_id,
            cursor,
            query.limit.unwrap_or(bound).min(bound),
        ),
        None => {
            let n = query.tail.unwrap_or(DEFAULT_TAIL).min(bound);
            let lines = logs.tail(n);
            let launch_id = lines
                .last()
                .map(|l| l.launch_id)
                .unwrap_or_else(|| logs.current_launch());
            let next_cursor = lines.last().map(|l| l.seq).unwrap_or(0);
            uros_supervisor::LogPage {
                launch_id,
                lines,
                next_cursor,
            }
        }
    };

    Ok(Json(json!({
        "success": true,
        "launch_id": page.launch_id,
        "next_cursor": page.next_cursor,
        "lines": page.lines,
    })))
}

async fn get_previous_logs(State(state): State<AppState>) -> ApiResult {
    let previous = state.control.logs().previous();
    Ok(Json(json!({ "success": true, "log": previous })))
}

async fn stream_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!("Log stream subscriber connected");
    let stream = BroadcastStream::new(state.control.logs().subscribe())
        .filter_map(|item| future::ready(log_event(item)))
        .map(Ok::<Event, Infallible>)
        .take_until(shutdown_requested(state.shutdown));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn log_event(
    item: Result<uros_supervisor::LogLine, BroadcastStreamRecvError>,
) -> Option<Event> {
    match item {
        Ok(line) => Event::default().event("log").json_data(&line).ok(),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(
            Event::default()
                .event("lagged")
                .data(skipped.to_string()),
        ),
    }
}

// Also resolves when the sender is gone
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    debug!("Closing log stream for shutdown");
}

async fn get_enabled_state(State(state): State<AppState>) -> ApiResult {
    debug!("Getting the micro-ROS agent enabled state");
    let enabled = state.control.settings().enabled();
    Ok(Json(json!({ "success": true, "enabled": enabled })))
}

#[derive(Debug, Deserialize)]
struct EnabledQuery {
    enabled: bool,
}

async fn save_enabled_state(
    State(state): State<AppState>,
    query: Result<Query<EnabledQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    state.control.set_enabled(query.enabled).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Enabled state saved: {}", query.enabled),
    })))
}

async fn legacy_get_settings(State(state): State<AppState>) -> ApiResult {
    let config = state.control.settings().get();
    Ok(Json(json!({
        "success": true,
        "micro_ros_agent": {
            "transport": config.transport,
            "port": config.port,
            "verbose": config.verbosity,
        },
    })))
}

#[derive(Debug, Deserialize)]
struct LegacySettingsQuery {
    transport: String,
    port: String,
    verbose: String,
}

async fn legacy_save_settings(
    State(state): State<AppState>,
    query: Result<Query<LegacySettingsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    info!(
        "Saving the micro-ROS agent settings: transport={}, port={}, verbose={}",
        query.transport, query.port, query.verbose
    );

    // Keep device, baudrate and extra flags; this form only knows three fields
    let current = state.control.settings().get();
    let candidate = ConfigCandidate {
        transport: query.transport,
        port: Some(LooseInt::Text(query.port)),
        verbosity: Some(LooseInt::Text(query.verbose)),
        device: current.device,
        baudrate: current.baudrate.map(|b| LooseInt::Int(b.into())),
        extra_flags: current.extra_flags,
    };
    state.control.configure(candidate).await?;
    Ok(Json(json!({ "success": true, "message": "Settings saved" })))
}
