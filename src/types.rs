use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Turns per inner cycle before control returns to the supervisory loop.
pub const DEFAULT_TURN_LIMIT: usize = 100;
/// Longest `relevant_update` kept, in characters.
pub const RELEVANT_UPDATE_MAX_CHARS: usize = 1000;
/// Reserved argument key carrying a safety confirmation request.
pub const SAFETY_DECISION_KEY: &str = "safety_decision";
pub const SCREENSHOT_MIME: &str = "image/png";

/// One action requested by the model, exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The original wire part, echoed back verbatim to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ActionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            args,
            id: None,
            raw: None,
        }
    }
}

/// Outcome of one action, reported back to the model.
///
/// Action specific keys plus an optional `error` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionResult(Map<String, Value>);

impl ActionResult {
    pub fn error(message: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("error".into(), Value::String(message.into()));
        Self(map)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.0.contains_key("error")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// The payload sent to the model: the page URL merged under the result.
    pub fn with_url(&self, url: &str) -> Map<String, Value> {
        let mut merged = Map::new();
        merged.insert("url".into(), Value::String(url.to_string()));
        merged.extend(self.0.clone());
        merged
    }
}

impl From<Value> for ActionResult {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            other => {
                let mut map = Map::new();
                map.insert("result".into(), other);
                Self(map)
            }
        }
    }
}

/// A piece of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelPart {
    Text(String),
    Call(ActionCall),
    /// Content the agent does not interpret but must echo back.
    Other(Value),
}

/// One model response: zero or more action calls and/or finishing text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTurn {
    pub parts: Vec<ModelPart>,
}

impl ModelTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ModelPart::Text(text.into())],
        }
    }

    pub fn calls(calls: impl IntoIterator<Item = ActionCall>) -> Self {
        Self {
            parts: calls.into_iter().map(ModelPart::Call).collect(),
        }
    }

    pub fn action_calls(&self) -> impl Iterator<Item = &ActionCall> {
        self.parts.iter().filter_map(|p| match p {
            ModelPart::Call(call) => Some(call),
            _ => None,
        })
    }

    pub fn has_action_calls(&self) -> bool {
        self.action_calls().next().is_some()
    }

    /// All text parts joined by a single space.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelPart::Text(t) if !t.is_empty() => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
