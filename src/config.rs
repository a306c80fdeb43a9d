use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::audio::CaptureConfig;
use crate::protocol::{BackendClient, ClientConfig};
use crate::session::OrchestratorConfig;

/// Default location, resolved with any extension the config crate knows
pub const DEFAULT_CONFIG_PATH: &str = "config/agent-voice";

/// Prefix of environment overrides, e.g. `AGENT_VOICE__AUTH__TOKEN`
pub const ENV_PREFIX: &str = "AGENT_VOICE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// API root of the request/response endpoints
    pub http_url: String,
    /// Base of the streaming socket; the agent id is appended
    pub ws_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_url: "http://localhost:8000/api".into(),
            ws_url: "ws://localhost:8000/api/ws".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub min_artifact_bytes: usize,
    pub frame_ms: u64,
    pub capture_tail_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            min_artifact_bytes: 100,
            frame_ms: 100,
            capture_tail_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub tick_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { tick_ms: 250 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub transport: Transport,
}

/// How captures reach the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Persistent socket with chunked reply audio
    #[default]
    Streaming,
    /// One HTTP request per turn
    Request,
}

impl Config {
    /// Layer built-in defaults, the optional file at `path` and the environment
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {path}"))?;

        let cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            bail!("audio.sample_rate must be positive");
        }
        if self.playback.tick_ms == 0 {
            bail!("playback.tick_ms must be positive");
        }
        if !self.server.ws_url.starts_with("ws://") && !self.server.ws_url.starts_with("wss://") {
            bail!("server.ws_url must be a ws:// or wss:// URL, got {}", self.server.ws_url);
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            frame_ms: self.audio.frame_ms,
            ..CaptureConfig::with_sample_rate(self.audio.sample_rate)
        }
    }

    pub fn client_config(&self, agent_id: &str) -> ClientConfig {
        ClientConfig {
            ws_url: self.server.ws_url.clone(),
            agent_id: agent_id.to_string(),
            token: self.auth.token.clone(),
        }
    }

    pub fn backend_client(&self, agent_id: &str) -> BackendClient {
        BackendClient::new(&self.server.http_url, agent_id).with_token(&self.auth.token)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            capture: self.capture_config(),
            min_artifact_bytes: self.audio.min_artifact_bytes,
            capture_tail: Duration::from_millis(self.audio.capture_tail_ms),
        }
    }

    pub fn playback_tick(&self) -> Duration {
        Duration::from_millis(self.playback.tick_ms)
    }
}
