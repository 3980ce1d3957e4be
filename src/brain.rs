//! Model service client: Gemini computer-use over REST.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::runtime::Handle;
use tracing::debug;

use crate::conversation::{Conversation, Turn};
use crate::error::ModelError;
use crate::types::{ActionCall, ModelPart, ModelTurn, SCREENSHOT_MIME};

pub const DEFAULT_MODEL: &str = "gemini-2.5-computer-use-preview-10-2025";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Anything that can turn a conversation into the next model turn.
///
/// Calls block the current thread; the agent worker is the only caller.
pub trait ModelClient: Send + Sync {
    fn generate(&self, conversation: &Conversation) -> Result<ModelTurn, ModelError>;
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Predefined computer-use functions the model must not call.
    pub excluded_functions: Vec<String>,
    pub timeout: Duration,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            excluded_functions: Vec::new(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct GeminiClient {
    http: Client,
    runtime: Handle,
    settings: GeminiSettings,
}

impl GeminiClient {
    /// `runtime` drives the HTTP calls; `generate` must not be invoked from
    /// one of its worker threads.
    pub fn new(settings: GeminiSettings, runtime: Handle) -> Result<Self, ModelError> {
        if settings.api_key.trim().is_empty() {
            return Err(ModelError::Config("API key is empty".into()));
        }
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;
        Ok(Self {
            http,
            runtime,
            settings,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }

    async fn post(&self, body: &GenerateRequest) -> Result<ModelTurn, ModelError> {
        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.settings.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &text));
        }
        let reply: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| ModelError::Decode(e.to_string()))?;
        decode_reply(reply)
    }
}

impl ModelClient for GeminiClient {
    fn generate(&self, conversation: &Conversation) -> Result<ModelTurn, ModelError> {
        let body = GenerateRequest {
            contents: encode_contents(conversation),
            tools: vec![json!({
                "computerUse": {
                    "environment": "ENVIRONMENT_BROWSER",
                    "excludedPredefinedFunctions": self.settings.excluded_functions,
                }
            })],
        };
        debug!(
            model = %self.settings.model,
            contents = body.contents.len(),
            "calling generateContent"
        );
        self.runtime.block_on(self.post(&body))
    }
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    tools: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ApiError,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<Value>,
}

fn inline_png(bytes: &[u8]) -> Value {
    json!({"inlineData": {"mimeType": SCREENSHOT_MIME, "data": BASE64.encode(bytes)}})
}

/// Serialize the conversation into role-tagged Gemini contents.
pub fn encode_contents(conversation: &Conversation) -> Vec<Content> {
    conversation
        .turns()
        .iter()
        .map(|turn| match turn {
            Turn::User { text, screenshot } => {
                let mut parts = vec![json!({"text": text})];
                if let Some(png) = screenshot.as_deref().filter(|b| !b.is_empty()) {
                    parts.push(inline_png(png));
                }
                Content {
                    role: "user".into(),
                    parts,
                }
            }
            Turn::Model(model) => Content {
                role: "model".into(),
                parts: model
                    .parts
                    .iter()
                    .map(|part| match part {
                        ModelPart::Text(text) => json!({"text": text}),
                        ModelPart::Call(call) => call.raw.clone().unwrap_or_else(|| {
                            json!({"functionCall": {"name": call.name, "args": call.args}})
                        }),
                        ModelPart::Other(raw) => raw.clone(),
                    })
                    .collect(),
            },
            Turn::ActionResults {
                results,
                url,
                screenshot,
            } => Content {
                role: "user".into(),
                parts: results
                    .iter()
                    .map(|(name, result)| {
                        let mut response = json!({
                            "name": name,
                            "response": result.with_url(url),
                        });
                        if !screenshot.is_empty() {
                            response["parts"] = json!([inline_png(screenshot)]);
                        }
                        json!({"functionResponse": response})
                    })
                    .collect(),
            },
        })
        .collect()
}

/// Turn the first candidate into a [`ModelTurn`], keeping each raw part.
pub fn decode_reply(reply: GenerateResponse) -> Result<ModelTurn, ModelError> {
    let Some(candidate) = reply.candidates.into_iter().next() else {
        let reason = reply
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.get("blockReason"))
            .and_then(Value::as_str)
            .unwrap_or("no candidates");
        return Err(ModelError::Decode(format!("empty response: {reason}")));
    };
    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    if parts.is_empty() {
        debug!(finish_reason = ?candidate.finish_reason, "candidate without parts");
    }
    Ok(ModelTurn {
        parts: parts.into_iter().map(decode_part).collect(),
    })
}

fn decode_part(part: Value) -> ModelPart {
    if let Some(call) = part.get("functionCall") {
        let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
        let args = match call.get("args") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        let id = call.get("id").and_then(Value::as_str).map(String::from);
        return ModelPart::Call(ActionCall {
            name: name.to_string(),
            args,
            id,
            raw: Some(part),
        });
    }
    let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
    match part.get("text").and_then(Value::as_str) {
        Some(text) if !is_thought => ModelPart::Text(text.to_string()),
        _ => ModelPart::Other(part),
    }
}

/// Map a non-success HTTP reply onto the error taxonomy.
pub fn classify_error(status: u16, body: &str) -> ModelError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let api = envelope.error;
    let message = if api.message.is_empty() {
        body.trim().to_string()
    } else {
        api.message
    };

    match (status, api.status.as_str()) {
        (429, _) | (_, "RESOURCE_EXHAUSTED") => ModelError::RateLimited {
            message,
            retry_after: api.details.iter().find_map(retry_info_delay),
        },
        (503, _) | (_, "UNAVAILABLE") => ModelError::Overloaded(message),
        (401 | 403, _) | (_, "UNAUTHENTICATED" | "PERMISSION_DENIED") => ModelError::Auth(message),
        _ => ModelError::Request { status, message },
    }
}

fn retry_info_delay(detail: &Value) -> Option<Duration> {
    let kind = detail.get("@type").and_then(Value::as_str)?;
    if !kind.ends_with("RetryInfo") {
        return None;
    }
    parse_retry_delay(detail.get("retryDelay")?.as_str()?)
}

/// Parse a protobuf duration string such as `"30s"` or `"30.9s"`.
pub fn parse_retry_delay(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().strip_suffix('s')?.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}
