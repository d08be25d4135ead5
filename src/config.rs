//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Configuration file (config.toml / config.json / config.yaml, whichever exists)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_MODELS__LLM_URL`, ...)
//! 3. Configuration file
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **models**: endpoints of the transcription, language model and speech synthesis servers
//! - **vad**: voice activity detection threshold
//! - **performance**: session limit and WebSocket liveness timing

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each group maps to one concern of the voice server, and each can be
/// handed to the component that needs it without exposing the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub vad: VadConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Model collaborator endpoints.
///
/// ## Fields:
/// - `transcription_url`: OpenAI-compatible `/v1/audio/transcriptions` endpoint
/// - `transcription_model`: model name sent with every transcription request
/// - `llm_url`: base URL of an Ollama server (`/api/generate` is appended)
/// - `llm_model`: which language model generates replies (e.g., "llama3.1:8b")
/// - `system_prompt`: instructions sent with every prompt; empty means none
/// - `tts_url`: speech synthesis endpoint accepting `{"text": ...}`
/// - `request_timeout_secs`: upper bound for one transcription or synthesis request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub transcription_url: String,
    pub transcription_model: String,
    pub llm_url: String,
    pub llm_model: String,
    pub system_prompt: String,
    pub tts_url: String,
    pub request_timeout_secs: u64,
}

/// Voice activity detection settings.
///
/// `energy_threshold` is the RMS level (in raw 16-bit sample units) at or above
/// which a 30ms frame counts as speech.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    pub energy_threshold: f32,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: WebSocket upgrades beyond this are refused with 503
/// - `heartbeat_interval_secs`: how often the server pings each connection
/// - `client_timeout_secs`: connections silent for longer than this are closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                transcription_url: "http://127.0.0.1:8000/v1/audio/transcriptions".to_string(),
                transcription_model: "whisper-1".to_string(),
                llm_url: "http://127.0.0.1:11434".to_string(),
                llm_model: "llama3.1:8b".to_string(),
                system_prompt: "You are a helpful voice assistant. Keep answers short and conversational."
                    .to_string(),
                tts_url: "http://127.0.0.1:5000/synthesize".to_string(),
                request_timeout_secs: 30,
            },
            vad: VadConfig {
                energy_threshold: 500.0,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_MODELS__LLM_MODEL=phi3`: Override the reply model
    /// - `APP_VAD__ENERGY_THRESHOLD=300`: More sensitive speech detection
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special case for deployment platforms
    ///
    /// Section and field are separated by a double underscore because field
    /// names themselves contain underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        for (name, url) in [
            ("models.transcription_url", &self.models.transcription_url),
            ("models.llm_url", &self.models.llm_url),
            ("models.tts_url", &self.models.tts_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!("{} must be an http(s) URL, got '{}'", name, url));
            }
        }

        if self.models.llm_model.trim().is_empty() {
            return Err(anyhow::anyhow!("models.llm_model cannot be empty"));
        }

        if self.models.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        if !self.vad.energy_threshold.is_finite() || self.vad.energy_threshold < 0.0 {
            return Err(anyhow::anyhow!("VAD energy threshold must be a non-negative number"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        // A client must get at least one ping before it can be timed out.
        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.performance.client_timeout_secs,
                self.performance.heartbeat_interval_secs
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example,
    /// `{"vad": {"energy_threshold": 300}}` changes only the VAD threshold.
    ///
    /// The VAD threshold applies to running sessions immediately. Model endpoints
    /// are read when a collaborator is first built, so changes to `models` apply
    /// after a restart.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(models) = partial_config.get("models") {
            let text_fields: [(&str, &mut String); 6] = [
                ("transcription_url", &mut self.models.transcription_url),
                ("transcription_model", &mut self.models.transcription_model),
                ("llm_url", &mut self.models.llm_url),
                ("llm_model", &mut self.models.llm_model),
                ("system_prompt", &mut self.models.system_prompt),
                ("tts_url", &mut self.models.tts_url),
            ];
            for (key, field) in text_fields {
                if let Some(value) = models.get(key).and_then(|v| v.as_str()) {
                    *field = value.to_string();
                }
            }
            if let Some(timeout) = models.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                self.models.request_timeout_secs = timeout;
            }
        }

        if let Some(vad) = partial_config.get("vad") {
            if let Some(threshold) = vad.get("energy_threshold").and_then(|v| v.as_f64()) {
                self.vad.energy_threshold = threshold as f32;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(interval) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = performance.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.performance.client_timeout_secs = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }
}
