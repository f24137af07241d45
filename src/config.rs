//! Configuration for the proctoring telemetry pipeline.

use crate::feed::DEFAULT_MAX_EVENTS;
use crate::risk::{PatternWeights, RiskLedger, RiskThresholds, ScoreWeights};
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the streaming endpoint; the session id or `dashboard`
    /// is appended
    pub endpoint: String,

    pub transport: TransportSettings,

    pub producers: ProducerSettings,

    pub feed: FeedSettings,

    pub risk: RiskSettings,

    pub server: ServerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000/ws".to_string(),
            transport: TransportSettings::default(),
            producers: ProducerSettings::default(),
            feed: FeedSettings::default(),
            risk: RiskSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            Self::from_json(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("proctor-telemetry")
            .join("config.json")
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub max_reconnect_attempts: u32,
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Frames buffered per direction on an open connection
    pub outbound_buffer: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_delay: defaults.reconnect_delay,
            connect_timeout: defaults.connect_timeout,
            outbound_buffer: 256,
        }
    }
}

impl TransportSettings {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Producer cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    #[serde(with = "duration_ms")]
    pub gaze_interval: Duration,
    #[serde(with = "duration_ms")]
    pub audio_interval: Duration,
    /// Fixed seed for reproducible sessions
    pub seed: Option<u64>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            gaze_interval: Duration::from_secs(1),
            audio_interval: Duration::from_secs(2),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub max_events: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub suspicious: u32,
    pub flagged: u32,
    /// Scoring window
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// Sequence scoring; `null` turns it off
    pub patterns: Option<PatternWeights>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        let thresholds = RiskThresholds::default();
        Self {
            suspicious: thresholds.suspicious,
            flagged: thresholds.flagged,
            window: Duration::from_secs(10),
            patterns: Some(PatternWeights::default()),
        }
    }
}

impl RiskSettings {
    pub fn thresholds(&self) -> RiskThresholds {
        RiskThresholds {
            suspicious: self.suspicious,
            flagged: self.flagged,
        }
    }

    /// Ledger scoring with these thresholds, window and patterns.
    pub fn ledger(&self) -> RiskLedger {
        let ledger =
            RiskLedger::new(ScoreWeights::default(), self.thresholds()).with_window(self.window);
        match self.patterns {
            Some(patterns) => ledger.with_patterns(patterns),
            None => ledger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
