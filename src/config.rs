//! # Configuration Management
//!
//! This module handles loading and managing the session configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_CONNECTION__URL, APP_PRESENCE__DEBOUNCE_MS, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The access credential is deliberately absent: it is short-lived, supplied by an
//! external collaborator, and handed straight to `connect()`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Main configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps onto one component (status server, connection, audio pipelines,
/// presence inference, response requests), so a component only ever sees its own slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub presence: PresenceConfig,
    pub response: ResponseConfig,
}

/// Status server settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only the local application can read session status
/// - `enabled = false`: Run the session without any HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

/// Remote conversational-audio service settings.
///
/// ## Fields:
/// - `url`: WebSocket target (`wss://...`)
/// - `base_delay_ms`: Reconnect delay unit; attempt `n` waits `base_delay_ms * n`
/// - `max_attempts`: Consecutive reconnect attempts before giving up
/// - `connect_timeout_ms`: Upper bound on a single establishment attempt
/// - `headers`: Extra handshake headers sent with every connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub url: String,
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `sample_rate`: Rate of both captured and rendered PCM (24kHz for the realtime service)
/// - `chunk_samples`: Fixed capture chunk length; constant for the life of a pipeline
/// - `playback_mode`: `"sequenced"` (queue deltas back to back) or `"immediate"`
/// - `input_device` / `output_device`: Backend names, see `device::DeviceBackend`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk_samples: usize,
    pub playback_mode: String,
    pub input_device: String,
    pub output_device: String,
}

/// Presence inference settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Silence window after the last speaking trigger before presence drops back
    pub debounce_ms: u64,
}

/// What the session asks the remote service for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Modalities listed in every response request
    pub modalities: Vec<String>,
    /// Optional instructions pushed with a session update after each connect
    pub instructions: Option<String>,
    /// Optional voice pushed with a session update after each connect
    pub voice: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("OpenAI-Beta".to_string(), "realtime=v1".to_string());

        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                enabled: true,
            },
            connection: ConnectionConfig {
                url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
                base_delay_ms: 1000,
                max_attempts: 5,
                connect_timeout_ms: 10_000,
                headers,
            },
            audio: AudioConfig {
                sample_rate: 24_000,
                chunk_samples: 4096,
                playback_mode: "sequenced".to_string(),
                input_device: "default".to_string(),
                output_device: "default".to_string(),
            },
            presence: PresenceConfig { debounce_ms: 150 },
            response: ResponseConfig {
                modalities: vec!["audio".to_string(), "text".to_string()],
                instructions: None,
                voice: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_CONNECTION__URL=wss://example.test/realtime`: Override the target
    /// - `APP_CONNECTION__MAX_ATTEMPTS=10`: Allow more reconnects
    /// - `APP_PRESENCE__DEBOUNCE_MS=250`: Longer speaking debounce
    /// - `HOST=0.0.0.0` / `PORT=3000`: Status server, for deployment platforms
    ///
    /// Nested keys use a double underscore so field names keep their own underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("response.modalities")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.enabled && self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.connection.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Connection url must not be empty"));
        }

        if self.connection.max_attempts == 0 {
            return Err(anyhow::anyhow!("Max reconnect attempts must be greater than 0"));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.chunk_samples == 0 {
            return Err(anyhow::anyhow!("Audio chunk size must be greater than 0"));
        }

        if self.audio.playback_mode.parse::<crate::audio::playback::PlaybackMode>().is_err() {
            return Err(anyhow::anyhow!(
                "Unknown playback mode '{}'",
                self.audio.playback_mode
            ));
        }

        if self.presence.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Presence debounce window must be greater than 0"));
        }

        if self.response.modalities.is_empty() {
            return Err(anyhow::anyhow!("At least one response modality is required"));
        }

        Ok(())
    }
}

impl ConnectionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl PresenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
