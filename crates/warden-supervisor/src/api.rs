//! HTTP control surface.
//!
//! Handlers only translate between JSON and supervisor/hub calls; lifecycle rules live in the
//! supervisor. Log streaming is server-sent events, one event per entry, with the entry's
//! sequence as the event id so browsers resume through `Last-Event-ID`.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, info};
use warden_core::{
    Channel, InputError, LogEntry, ManagedProcess, PromptKind, StartError, StopError,
};

use crate::{
    config::GameCatalog,
    hub::{BroadcastHub, StreamItem},
    supervisor::Supervisor,
};

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub hub: BroadcastHub,
    pub catalog: Arc<GameCatalog>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/start-server", post(start_server))
        .route("/stop-server", post(stop_server))
        .route("/server-status", get(server_status))
        .route("/command", post(send_command))
        .route("/log-stream", get(log_stream))
        .route("/log-history", get(log_history))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        if err.is_precondition() {
            ApiError::bad_request(err.to_string())
        } else {
            ApiError::internal("failed to launch server process (spawn)")
        }
    }
}

impl From<StopError> for ApiError {
    fn from(err: StopError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<InputError> for ApiError {
    fn from(err: InputError) -> Self {
        match err {
            InputError::Io(_) => ApiError::internal("failed to deliver input to server (io)"),
            other => ApiError::bad_request(other.to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    game_id: Option<String>,
    #[serde(default, alias = "batFile", alias = "variant")]
    script: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    command: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: &'static str,
    pub game_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_prompt: Option<PromptKind>,
}

impl StatusView {
    pub fn from_process(process: &ManagedProcess, now: DateTime<Utc>) -> Self {
        Self {
            status: process.state.as_str(),
            game_id: process.game_id().to_string(),
            process_id: process
                .state
                .is_live()
                .then(|| process.id.to_string()),
            pid: process.pid,
            started_at: process.started_at,
            uptime: process.uptime_secs(now),
            exit_code: process.exit_code,
            pending_prompt: process.pending_prompt,
        }
    }
}

async fn start_server(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid start request: {err}")))?
    };

    let launch = state
        .catalog
        .resolve(request.game_id.as_deref(), request.script.as_deref())
        .and_then(|launch| launch.validate().map(|()| launch));
    let launch = match launch {
        Ok(launch) => launch,
        Err(err) => {
            state.supervisor.note_rejected_start(&err);
            return Err(err.into());
        }
    };

    let game_id = launch.game_id.clone();
    let process_id = state.supervisor.start(launch).await?;
    let snapshot = state.supervisor.status().await;
    info!(event = "api_start", game_id = %game_id, process_id = %process_id);
    Ok(Json(json!({
        "status": "running",
        "message": format!("server '{game_id}' started"),
        "processId": process_id,
        "state": snapshot.state,
    })))
}

async fn stop_server(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.supervisor.stop().await?;
    let snapshot = state.supervisor.status().await;
    info!(event = "api_stop", state = %snapshot.state);
    Ok(Json(json!({
        "status": "stopped",
        "message": "server stopped",
        "exitCode": snapshot.exit_code,
    })))
}

async fn server_status(State(state): State<AppState>) -> Json<StatusView> {
    let snapshot = state.supervisor.status().await;
    Json(StatusView::from_process(&snapshot, Utc::now()))
}

async fn send_command(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: CommandRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid command request: {err}")))?;
    state.supervisor.send_input(&request.command).await?;
    debug!(event = "api_command", bytes = request.command.len());
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    after: Option<u64>,
}

fn parse_channel(raw: Option<&str>) -> Result<Channel, ApiError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse()
            .map_err(|err: warden_core::ParseChannelError| ApiError::bad_request(err.to_string())),
        None => Ok(Channel::default()),
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// SSE data may span lines only through `\n`; a bare `\r` is not representable.
fn event_data(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn entry_event(entry: &LogEntry) -> Event {
    Event::default()
        .id(entry.sequence.to_string())
        .event(entry.channel.as_str())
        .data(event_data(&entry.display_text()))
}

async fn log_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let channel = parse_channel(query.channel.as_deref())?;
    let after = query.after.or_else(|| last_event_id(&headers));
    let mut subscription = state.hub.attach(channel, after);
    let conn_id = subscription.conn_id();

    let stream = async_stream::stream! {
        while let Some(item) = subscription.next().await {
            match item {
                StreamItem::Entry(entry) => yield Ok(entry_event(&entry)),
                StreamItem::KeepAlive => yield Ok(Event::default().comment("keep-alive")),
            }
        }
        debug!(event = "log_stream_closed", conn_id = conn_id, channel = %channel);
    };
    Ok(Sse::new(stream))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    after: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    sequence: u64,
    timestamp: DateTime<Utc>,
    text: String,
    error: bool,
}

impl From<LogEntry> for HistoryEntry {
    fn from(entry: LogEntry) -> Self {
        Self {
            sequence: entry.sequence,
            timestamp: entry.timestamp,
            text: entry.text,
            error: entry.error,
        }
    }
}

async fn log_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let channel = parse_channel(query.channel.as_deref())?;
    let limit = query
        .limit
        .unwrap_or(state.hub.config().buffer_capacity)
        .max(1);
    let entries: Vec<HistoryEntry> = state
        .hub
        .history(channel, query.after, limit)
        .into_iter()
        .map(HistoryEntry::from)
        .collect();
    Ok(Json(json!({
        "channel": channel,
        "entries": entries,
        "lastSequence": state.hub.last_sequence(channel),
    })))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use warden_core::{LaunchSpec, ProcessState};

    #[test]
    fn start_errors_map_to_status_codes() {
        let missing: ApiError = StartError::LaunchTargetMissing(PathBuf::from("/x")).into();
        assert_eq!(missing.status, StatusCode::BAD_REQUEST);
        assert_eq!(missing.message, "launch target not found: /x");

        let spawn: ApiError = StartError::Spawn("Permission denied (os error 13)".into()).into();
        assert_eq!(spawn.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!spawn.message.contains("Permission denied"));
    }

    #[test]
    fn input_errors_map_to_status_codes() {
        let empty: ApiError = InputError::EmptyInput.into();
        assert_eq!(empty.status, StatusCode::BAD_REQUEST);
        assert_eq!(empty.message, "command is required");
        let io: ApiError = InputError::Io("broken pipe".into()).into();
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn status_view_omits_absent_fields() {
        let process = ManagedProcess::new(LaunchSpec::new("survival", "/srv/start.sh"));
        let view = serde_json::to_value(StatusView::from_process(&process, Utc::now()))
            .expect("serialize");
        assert_eq!(view, json!({ "status": "stopped", "gameId": "survival" }));
    }

    #[test]
    fn status_view_reports_uptime_while_running() {
        let mut process = ManagedProcess::new(LaunchSpec::new("survival", "/srv/start.sh"));
        process.transition(ProcessState::Starting);
        process.transition(ProcessState::Running);
        process.pid = Some(42);
        let started = process.started_at.expect("started");
        let view = StatusView::from_process(&process, started + chrono::Duration::seconds(90));
        assert_eq!(view.status, "running");
        assert_eq!(view.uptime, Some(90));
        assert_eq!(view.pid, Some(42));
        assert!(view.process_id.is_some());
    }

    #[test]
    fn channel_query_parsing() {
        assert_eq!(parse_channel(None).expect("default"), Channel::Server);
        assert_eq!(parse_channel(Some("system")).expect("system"), Channel::System);
        assert!(parse_channel(Some("audit")).is_err());
    }

    #[test]
    fn carriage_returns_become_data_line_breaks() {
        assert_eq!(event_data("Loading 10%\rLoading 20%"), "Loading 10%\nLoading 20%");
        assert_eq!(event_data("a\r\nb"), "a\nb");
        assert_eq!(event_data("plain"), "plain");
    }

    #[test]
    fn last_event_id_header_is_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers), None);
        headers.insert(LAST_EVENT_ID, "17".parse().expect("header"));
        assert_eq!(last_event_id(&headers), Some(17));
    }
}
