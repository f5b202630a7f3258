use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub negotiation: NegotiationConfig,
    pub media: MediaConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Negotiation behaviour of a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Attach local tracks before answering an incoming call instead of
    /// waiting for an explicit `send_streams`
    pub attach_tracks_on_answer: bool,
    /// Default wait for a session event in `SessionHandle::wait_for`
    pub event_timeout_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            attach_tracks_on_answer: false,
            event_timeout_ms: 5000,
        }
    }
}

impl NegotiationConfig {
    #[must_use]
    pub const fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
}

/// Local capture constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Settings handed to the `webrtc` peer connection engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// ICE server URLs passed through unchanged (empty = host candidates only)
    pub ice_servers: Vec<String>,
    /// Upper bound on waiting for ICE gathering before a description is sent
    pub gather_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            gather_timeout_ms: 2000,
        }
    }
}

impl WebRtcConfig {
    #[must_use]
    pub const fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // DUOCALL_LOGGING__LEVEL, DUOCALL_NEGOTIATION__EVENT_TIMEOUT_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("DUOCALL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration for values that would break a session
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if crate::logging::LogFormat::parse(&self.logging.format).is_err() {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level \"{}\" is not a valid level", self.logging.level));
        }
        if self.negotiation.event_timeout_ms == 0 {
            errors.push("negotiation.event_timeout_ms must be greater than zero".to_string());
        }
        if !self.media.audio && !self.media.video {
            errors.push("media must request at least one of audio or video".to_string());
        }
        for url in &self.webrtc.ice_servers {
            if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                errors.push(format!("webrtc.ice_servers entry \"{url}\" is not a stun:/turn: URL"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
