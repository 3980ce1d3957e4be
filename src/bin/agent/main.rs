use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use browser_pilot::agent::{Agent, BrowserLauncher};
use browser_pilot::brain::GeminiClient;
use browser_pilot::config::Config;
use browser_pilot::ears::SpeechToText;
use browser_pilot::face::{self, AppState};
use browser_pilot::hands::{Browser, ChromeBrowser};
use browser_pilot::retry::RetryingClient;
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,browser_pilot=debug,headless_chrome=warn,hyper=warn";

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::parse();
    init_tracing(config.log_json);

    info!("starting browser agent");

    let api_key = config
        .api_key()
        .ok_or_else(|| anyhow!("GOOGLE_API_KEY (or GEMINI_API_KEY) not set in environment"))?;
    let gemini = GeminiClient::new(
        config.gemini_settings(api_key),
        tokio::runtime::Handle::current(),
    )?;
    let model = Arc::new(RetryingClient::new(gemini, config.retry_policy()));

    let chrome = config.chrome_options();
    let launcher: BrowserLauncher = Arc::new(move || {
        ChromeBrowser::launch(&chrome).map(|b| Box::new(b) as Box<dyn Browser>)
    });

    let agent = Arc::new(Agent::new(model, launcher, config.agent_settings()));

    let speech = match config.elevenlabs_api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Some(SpeechToText::new(key)?),
        _ => {
            warn!("ELEVENLABS_API_KEY not set, /transcribe_audio is disabled");
            None
        }
    };

    let app = face::router(Arc::new(AppState {
        agent: agent.clone(),
        speech,
    }));
    let listener = face::bind(&config.host, config.port)
        .await
        .with_context(|| format!("could not bind {}:{}", config.host, config.port))?;
    info!(addr = %listener.local_addr()?, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    tokio::task::spawn_blocking(move || agent.stop()).await?;
    Ok(())
}
