//! # Configuration Management
//!
//! Loads and manages application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values built into the code
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, ...)
//! 2. Configuration file (config.toml)
//! 3. Defaults (the `Default` impl below)
//!
//! Collaborator API keys deliberately do NOT live here: they are read from
//! plain environment variables at startup (see `main.rs`) so secrets never
//! end up in a checked-in TOML file or the `/api/v1/config` response.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::pipeline::AudioSettings;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub llm: LlmConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-engine model selection.
///
/// ## Fields:
/// - `stt_model`: recognizer model identifier
/// - `language_code`: recognizer language hint
/// - `tts_voice_id`: synthesis voice
/// - `tts_model`: synthesis model identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub stt_model: String,
    pub language_code: String,
    pub tts_voice_id: String,
    pub tts_model: String,
}

/// Reply-generation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Trailing transcript entries sent as chat history; bounds prompt
    /// growth over long calls
    pub history_window: usize,
}

/// Streaming-audio constants for the call pipeline.
///
/// ## Tuning guidelines:
/// - `buffer_threshold_bytes`: bytes of 8 kHz mu-law audio that trigger a
///   processing cycle. 16000 is ~2 s: long enough to carry an utterance
///   fragment, short enough to keep the conversation moving.
/// - `chunk_bytes` / `chunk_interval_ms`: playback pacing. 640 bytes is
///   80 ms of line audio; pacing prevents overrunning the transport buffer.
/// - `initial_turn_delay_ms`: settle time between call start and the
///   opening statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub buffer_threshold_bytes: usize,
    pub chunk_bytes: usize,
    pub chunk_interval_ms: u64,
    pub initial_turn_delay_ms: u64,
    pub recognizer_rate: u32,
    pub synthesis_rate: u32,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            speech: SpeechConfig {
                stt_model: "scribe_v2".to_string(),
                language_code: "eng".to_string(),
                tts_voice_id: "EXAVITQu4vr4xnSDxMaL".to_string(),
                tts_model: "eleven_turbo_v2_5".to_string(),
            },
            llm: LlmConfig {
                model: "gpt-4o-mini".to_string(),
                max_tokens: 150,
                temperature: 0.7,
                history_window: 6,
            },
            audio: AudioConfig {
                buffer_threshold_bytes: 16000,
                chunk_bytes: 640,
                chunk_interval_ms: 10,
                initial_turn_delay_ms: 1000,
                recognizer_rate: 16000,
                synthesis_rate: 22050,
            },
            performance: PerformanceConfig {
                max_concurrent_calls: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then config.toml (if present), then
    /// `APP_`-prefixed environment variables, then the bare `HOST`/`PORT`
    /// overrides deployment platforms like to set.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot possibly run.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.buffer_threshold_bytes == 0 {
            return Err(anyhow::anyhow!("Audio buffer threshold must be greater than 0"));
        }

        if self.audio.chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Outbound chunk size must be greater than 0"));
        }

        if self.audio.recognizer_rate == 0 || self.audio.synthesis_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        Ok(())
    }

    /// The pipeline-facing slice of this configuration.
    pub fn audio_settings(&self) -> AudioSettings {
        AudioSettings {
            recognizer_rate: self.audio.recognizer_rate,
            synthesis_rate: self.audio.synthesis_rate,
            chunk_bytes: self.audio.chunk_bytes,
            chunk_interval: Duration::from_millis(self.audio.chunk_interval_ms),
        }
    }

    /// Apply a partial update from a JSON document (runtime config endpoint).
    ///
    /// Only fields present in the JSON change; the result is re-validated
    /// so a bad update cannot leave the server with an unusable config.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(speech) = partial.get("speech") {
            if let Some(model) = speech.get("stt_model").and_then(|v| v.as_str()) {
                self.speech.stt_model = model.to_string();
            }
            if let Some(code) = speech.get("language_code").and_then(|v| v.as_str()) {
                self.speech.language_code = code.to_string();
            }
            if let Some(voice) = speech.get("tts_voice_id").and_then(|v| v.as_str()) {
                self.speech.tts_voice_id = voice.to_string();
            }
            if let Some(model) = speech.get("tts_model").and_then(|v| v.as_str()) {
                self.speech.tts_model = model.to_string();
            }
        }

        if let Some(llm) = partial.get("llm") {
            if let Some(model) = llm.get("model").and_then(|v| v.as_str()) {
                self.llm.model = model.to_string();
            }
            if let Some(max_tokens) = llm.get("max_tokens").and_then(|v| v.as_u64()) {
                self.llm.max_tokens = max_tokens as u32;
            }
            if let Some(temperature) = llm.get("temperature").and_then(|v| v.as_f64()) {
                self.llm.temperature = temperature as f32;
            }
            if let Some(window) = llm.get("history_window").and_then(|v| v.as_u64()) {
                self.llm.history_window = window as usize;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(threshold) = audio.get("buffer_threshold_bytes").and_then(|v| v.as_u64()) {
                self.audio.buffer_threshold_bytes = threshold as usize;
            }
            if let Some(chunk) = audio.get("chunk_bytes").and_then(|v| v.as_u64()) {
                self.audio.chunk_bytes = chunk as usize;
            }
            if let Some(interval) = audio.get("chunk_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.chunk_interval_ms = interval;
            }
            if let Some(delay) = audio.get("initial_turn_delay_ms").and_then(|v| v.as_u64()) {
                self.audio.initial_turn_delay_ms = delay;
            }
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(calls) = performance.get("max_concurrent_calls").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_calls = calls as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}
