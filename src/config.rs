//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::agent::AgentSettings;
use crate::brain::{DEFAULT_BASE_URL, DEFAULT_MODEL, GeminiSettings};
use crate::coords::Viewport;
use crate::hands::ChromeOptions;
use crate::retry::RetryPolicy;
use crate::types::DEFAULT_TURN_LIMIT;

#[derive(Debug, Clone, Parser)]
#[command(name = "agent", version, about = "Vision-model driven browser agent")]
pub struct Config {
    /// Gemini API key (GEMINI_API_KEY is accepted as well).
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "GEMINI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Predefined computer-use functions to disable, comma separated.
    #[arg(long, env = "EXCLUDED_FUNCTIONS", value_delimiter = ',')]
    pub excluded_functions: Vec<String>,

    #[arg(
        long,
        env = "HEADLESS",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub headless: bool,

    #[arg(long, env = "SCREEN_WIDTH", default_value_t = 1440)]
    pub screen_width: u32,

    #[arg(long, env = "SCREEN_HEIGHT", default_value_t = 900)]
    pub screen_height: u32,

    /// Page opened before the first goal is sent; empty to skip.
    #[arg(long, env = "START_URL", default_value = "https://www.google.com/")]
    pub start_url: String,

    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Persistent Chrome profile directory.
    #[arg(long, env = "CHROME_PROFILE_DIR")]
    pub profile_dir: Option<PathBuf>,

    /// DevTools websocket URL of a Chrome to attach to instead of launching.
    #[arg(long, env = "CHROME_ATTACH_WS")]
    pub attach_ws: Option<String>,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "ELEVENLABS_API_KEY", hide_env_values = true)]
    pub elevenlabs_api_key: Option<String>,

    #[arg(long, env = "TURN_LIMIT", default_value_t = DEFAULT_TURN_LIMIT)]
    pub turn_limit: usize,

    #[arg(long, env = "MODEL_MAX_ATTEMPTS", default_value_t = 5)]
    pub model_max_attempts: u32,

    /// Pause after each action batch, in milliseconds.
    #[arg(long, env = "SETTLE_MS", default_value_t = 1000)]
    pub settle_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl Config {
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.screen_width, self.screen_height)
    }

    pub fn chrome_options(&self) -> ChromeOptions {
        ChromeOptions {
            headless: self.headless,
            viewport: self.viewport(),
            chrome_path: self.chrome_path.clone(),
            profile_dir: self.profile_dir.clone().or_else(default_profile_dir),
            attach_ws: self.attach_ws.clone().filter(|ws| !ws.trim().is_empty()),
        }
    }

    pub fn gemini_settings(&self, api_key: String) -> GeminiSettings {
        GeminiSettings {
            api_key,
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            excluded_functions: self
                .excluded_functions
                .iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            ..GeminiSettings::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.model_max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn agent_settings(&self) -> AgentSettings {
        let start_url = Some(self.start_url.trim())
            .filter(|u| !u.is_empty())
            .map(String::from);
        AgentSettings {
            turn_limit: self.turn_limit.max(1),
            start_url,
            settle_delay: Duration::from_millis(self.settle_ms),
            ..AgentSettings::default()
        }
    }
}

fn default_profile_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("browser-pilot").join("profile"))
}
