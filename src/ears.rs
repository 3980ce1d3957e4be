//! Speech-to-text through the ElevenLabs API.

use std::time::Duration;

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SpeechError;

pub const ELEVENLABS_STT_URL: &str = "https://api.elevenlabs.io/v1/speech-to-text";
pub const DEFAULT_STT_MODEL: &str = "scribe_v1";

/// An uploaded audio clip.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    text: String,
}

pub struct SpeechToText {
    http: Client,
    api_key: String,
    endpoint: String,
    model_id: String,
}

impl SpeechToText {
    pub fn new(api_key: impl Into<String>) -> Result<Self, SpeechError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SpeechError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            endpoint: ELEVENLABS_STT_URL.to_string(),
            model_id: DEFAULT_STT_MODEL.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Transcribe `clip`, returning the recognized text (possibly empty).
    pub async fn transcribe(&self, clip: AudioClip) -> Result<String, SpeechError> {
        let size = clip.bytes.len();
        let mut part = Part::bytes(clip.bytes).file_name(clip.file_name);
        if let Some(content_type) = clip.content_type.as_deref() {
            part = part
                .mime_str(content_type)
                .map_err(|e| SpeechError::InvalidUpload(e.to_string()))?;
        }
        let form = Form::new()
            .text("model_id", self.model_id.clone())
            .part("file", part);

        debug!(bytes = size, "sending audio for transcription");
        let response = self
            .http
            .post(&self.endpoint)
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SpeechError::Transport(e.to_string()))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "transcription failed");
            return Err(SpeechError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(transcript_text(&body))
    }
}

/// The `text` field of a transcription reply; anything unparsable reads as
/// an empty transcript.
pub fn transcript_text(body: &str) -> String {
    serde_json::from_str::<TranscriptResponse>(body)
        .map(|r| r.text.trim().to_string())
        .unwrap_or_default()
}
