//! HTTP control surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::ears::{AudioClip, SpeechToText};
use crate::error::{AgentError, SpeechError};

/// How many ports after the configured one are tried before giving up.
pub const PORT_FALLBACKS: u16 = 9;
const AUDIO_BODY_LIMIT: usize = 25 * 1024 * 1024;

pub struct AppState {
    pub agent: Arc<Agent>,
    pub speech: Option<SpeechToText>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({"error": message.into()}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<SpeechError> for ApiError {
    fn from(err: SpeechError) -> Self {
        match err {
            SpeechError::InvalidUpload(message) => Self::bad_request(message),
            SpeechError::Upstream { body, .. } => Self {
                status: StatusCode::BAD_GATEWAY,
                body: json!({"error": "Failed to transcribe", "details": body}),
            },
            SpeechError::Transport(message) => Self {
                status: StatusCode::BAD_GATEWAY,
                body: json!({"error": "Failed to transcribe", "details": message}),
            },
        }
    }
}

type ApiResult = Result<Json<Value>, ApiError>;
type Ctx = State<Arc<AppState>>;

#[derive(Debug, Default, Deserialize)]
struct StartPayload {
    goal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CommandPayload {
    command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GoalPayload {
    goal: Option<String>,
}

/// Parse an optional JSON body; an empty body reads as the default payload.
fn payload<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))
}

/// Run an agent entry point on the blocking pool. These take the session
/// lock, which a concurrent stop holds until the worker exits.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/command", post(command_handler))
        .route("/update_goal", post(update_goal_handler))
        .route("/stop", post(stop_handler))
        .route("/status", get(status_handler))
        .route("/debug", get(debug_handler))
        .route("/events", get(sse_handler))
        .route(
            "/transcribe_audio",
            post(transcribe_handler).layer(DefaultBodyLimit::max(AUDIO_BODY_LIMIT)),
        )
        .with_state(state)
}

/// Bind `host:port`, falling back to the next [`PORT_FALLBACKS`] ports.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let mut last_err = None;
    for p in port..=port.saturating_add(PORT_FALLBACKS) {
        match TcpListener::bind((host, p)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(port = p, error = %e, "port unavailable");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no port available")))
}

async fn start_handler(State(state): Ctx, body: Bytes) -> ApiResult {
    let StartPayload { goal } = payload(&body)?;
    let goal = non_empty(goal);
    info!(goal = goal.as_deref().unwrap_or_default(), "POST /start");
    let agent = state.agent.clone();
    let requested = goal.clone();
    blocking(move || agent.start(requested.as_deref())).await??;
    Ok(Json(json!({"status": "started", "goal": goal})))
}

async fn command_handler(State(state): Ctx, body: Bytes) -> ApiResult {
    if !state.agent.is_running() {
        return Err(AgentError::NotRunning.into());
    }
    let CommandPayload { command } = payload(&body)?;
    let command = non_empty(command).ok_or_else(|| ApiError::bad_request("missing command"))?;
    info!(%command, "POST /command");
    let agent = state.agent.clone();
    let queued = command.clone();
    blocking(move || agent.enqueue_command(&queued)).await??;
    Ok(Json(json!({"status": "queued", "command": command})))
}

async fn update_goal_handler(State(state): Ctx, body: Bytes) -> ApiResult {
    if !state.agent.is_running() {
        return Err(AgentError::NotRunning.into());
    }
    let GoalPayload { goal } = payload(&body)?;
    let goal = non_empty(goal).ok_or_else(|| ApiError::bad_request("missing goal"))?;
    info!(%goal, "POST /update_goal");
    let agent = state.agent.clone();
    let replacement = goal.clone();
    blocking(move || agent.update_goal(&replacement)).await??;
    Ok(Json(json!({"status": "updated", "goal": goal})))
}

async fn stop_handler(State(state): Ctx) -> ApiResult {
    if !state.agent.is_running() {
        return Ok(Json(json!({"status": "not_running"})));
    }
    info!("POST /stop");
    let agent = state.agent.clone();
    let stopped = blocking(move || agent.stop()).await?;
    let status = if stopped { "stopped" } else { "not_running" };
    Ok(Json(json!({"status": status})))
}

async fn status_handler(State(state): Ctx) -> Json<Value> {
    let s = state.agent.status();
    Json(json!({
        "running": s.running,
        "last_results": s.last_results,
        "current_url": s.current_url.as_deref().unwrap_or_default(),
        "current_goal": s.current_goal,
        "goals_history": s.goals_history,
        "update_id": s.update_id,
        "relevant_update": s.relevant_update,
    }))
}

async fn debug_handler(State(state): Ctx) -> Json<Value> {
    let s = state.agent.status();
    Json(json!({
        "running": s.running,
        "idle": s.idle,
        "thread_alive": s.thread_alive,
        "contents_len": s.contents_len,
        "contents_preview": s.contents_preview,
        "last_results": s.last_results,
        "current_goal": s.current_goal,
        "goals_history": s.goals_history,
        "update_id": s.update_id,
        "relevant_update": s.relevant_update,
        "page_url": s.current_url.as_deref().unwrap_or_default(),
    }))
}

async fn sse_handler(
    State(state): Ctx,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.agent.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn transcribe_handler(State(state): Ctx, mut multipart: Multipart) -> ApiResult {
    let Some(speech) = state.speech.as_ref() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "speech-to-text is not configured",
        ));
    };

    let mut clip = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("audio").to_string();
        let content_type = field.content_type().map(String::from);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        clip = Some(AudioClip {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
        break;
    }
    let clip = clip.ok_or_else(|| ApiError::bad_request("No file provided"))?;

    let text = speech.transcribe(clip).await?;
    info!(%text, "transcribed audio");
    if !text.is_empty() && state.agent.is_running() {
        let agent = state.agent.clone();
        let command = text.clone();
        if let Err(e) = blocking(move || agent.enqueue_command(&command)).await? {
            warn!(error = %e, "could not queue transcription");
        }
    }
    Ok(Json(json!({"status": "transcribed", "text": text})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentSettings, BrowserLauncher};
    use crate::coords::Viewport;
    use crate::hands::Browser;
    use crate::testing::{FakeBrowser, ScriptedModel};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn fresh_browsers() -> BrowserLauncher {
        Arc::new(|| Ok(Box::new(FakeBrowser::new(Viewport::default())) as Box<dyn Browser>))
    }

    fn app() -> Router {
        let browser = parking_lot::Mutex::new(Some(FakeBrowser::new(Viewport::default())));
        let launcher: BrowserLauncher = Arc::new(move || {
            browser
                .lock()
                .take()
                .map(|b| Box::new(b) as Box<dyn Browser>)
                .ok_or_else(|| crate::error::BrowserError::Launch("taken".into()))
        });
        let settings = AgentSettings {
            start_url: None,
            settle_delay: Duration::ZERO,
            idle_poll: Duration::from_millis(10),
            ..AgentSettings::default()
        };
        let agent = Agent::new(Arc::new(ScriptedModel::default()), launcher, settings);
        router(Arc::new(AppState {
            agent: Arc::new(agent),
            speech: None,
        }))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn status_before_start() {
        let app = app();
        let (status, body) = call(&app, "GET", "/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["update_id"], 0);
        assert_eq!(body["current_url"], "");
        assert!(body["goals_history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_calls_require_a_running_agent() {
        let app = app();
        let (status, body) = call(&app, "POST", "/command", r#"{"command": "scroll"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Agent not running");

        let (status, body) = call(&app, "POST", "/update_goal", r#"{"goal": "x"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Agent not running");

        let (status, body) = call(&app, "POST", "/stop", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "not_running");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_lifecycle() {
        let app = app();
        let (status, body) = call(&app, "POST", "/start", r#"{"goal": "open example.com"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "started", "goal": "open example.com"}));

        let (status, body) = call(&app, "POST", "/start", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Agent already running");

        let (status, body) = call(&app, "POST", "/command", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing command");

        let (status, body) = call(&app, "POST", "/command", r#"{"command": "scroll"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "queued", "command": "scroll"}));

        let (status, body) = call(&app, "POST", "/update_goal", r#"{"goal": ""}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing goal");

        let (status, body) = call(&app, "POST", "/update_goal", r#"{"goal": "read news"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "updated");

        let (_, body) = call(&app, "GET", "/status", "").await;
        assert_eq!(body["running"], true);
        assert_eq!(body["current_goal"], "read news");
        assert_eq!(body["goals_history"], json!(["open example.com"]));

        let (_, body) = call(&app, "GET", "/debug", "").await;
        assert_eq!(body["thread_alive"], true);
        assert!(body["contents_preview"].is_array());

        let (status, body) = call(&app, "POST", "/stop", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        let (_, body) = call(&app, "GET", "/status", "").await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn control_calls_wait_off_the_runtime_while_stopping() {
        let model = Arc::new(ScriptedModel::default());
        let gate = model.gated();
        let settings = AgentSettings {
            start_url: None,
            settle_delay: Duration::ZERO,
            join_timeout: Duration::from_millis(500),
            ..AgentSettings::default()
        };
        let agent = Arc::new(Agent::new(model.clone(), fresh_browsers(), settings));
        let app = router(Arc::new(AppState {
            agent: agent.clone(),
            speech: None,
        }));

        agent.start(Some("goal")).unwrap();
        while model.call_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stopper = {
            let agent = agent.clone();
            std::thread::spawn(move || agent.stop())
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let queued = tokio::spawn({
            let app = app.clone();
            async move { call(&app, "POST", "/command", r#"{"command": "scroll"}"#).await }
        });
        tokio::task::yield_now().await;
        let (status, _) = call(&app, "GET", "/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() < Duration::from_millis(300));

        gate.open();
        assert!(stopper.join().unwrap());
        let (status, body) = queued.await.unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Agent not running");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let app = app();
        let (status, body) = call(&app, "POST", "/start", "{goal").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid JSON"));
    }

    #[tokio::test]
    async fn transcription_needs_configuration() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/transcribe_audio")
            .header("content-type", "multipart/form-data; boundary=X")
            .body(Body::from("--X--\r\n"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn upstream_failures_map_to_bad_gateway() {
        let err = ApiError::from(SpeechError::Upstream {
            status: 401,
            body: "bad key".into(),
        });
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.body["details"], "bad key");
        assert_eq!(
            ApiError::from(AgentError::AlreadyRunning).body["error"],
            "Agent already running"
        );
    }
}
