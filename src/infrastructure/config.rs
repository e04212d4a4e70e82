use crate::domain::coalescer::EmitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const MIN_BUFFER_CAPACITY: usize = 60;
const MAX_BUFFER_CAPACITY: usize = 100_000;
/// One year.
const MAX_HISTORY_HOURS: f64 = 24.0 * 365.0;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub host: HostSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostSettings {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Per-source timing policy and entity binding.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceConfig {
    pub entity: String,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(rename = "minEmitMs", alias = "min_emit_ms", default = "default_min_emit_ms")]
    pub min_emit_ms: u64,
    #[serde(rename = "coalesceMs", alias = "coalesce_ms", default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
    #[serde(rename = "maxDelayMs", alias = "max_delay_ms", default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(rename = "emitOnSameValue", alias = "emit_on_same_value", default)]
    pub emit_on_same_value: bool,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryConfig {
    #[serde(default)]
    pub preload: bool,
    #[serde(default = "default_history_hours")]
    pub hours: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("source `{0}`: entity id must not be blank")]
    BlankEntity(String),
    #[error("source `{0}`: window_seconds must be greater than zero")]
    ZeroWindow(String),
    #[error("source `{0}`: buffer_size must be greater than zero")]
    ZeroBufferSize(String),
    #[error("source `{name}`: history hours must be a positive number, got {hours}")]
    InvalidHistoryHours { name: String, hours: f64 },
    #[error("source `{name}`: history hours must be at most {max}, got {hours}")]
    HistoryHoursTooLarge { name: String, hours: f64, max: f64 },
}

impl SourceConfig {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            attribute: None,
            window_seconds: default_window_seconds(),
            min_emit_ms: default_min_emit_ms(),
            coalesce_ms: default_coalesce_ms(),
            max_delay_ms: default_max_delay_ms(),
            emit_on_same_value: false,
            history: None,
            buffer_size: None,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.entity.trim().is_empty() {
            return Err(ConfigError::BlankEntity(name.to_string()));
        }
        if self.window_seconds == 0 {
            return Err(ConfigError::ZeroWindow(name.to_string()));
        }
        if self.buffer_size == Some(0) {
            return Err(ConfigError::ZeroBufferSize(name.to_string()));
        }
        if let Some(history) = &self.history {
            if history.preload && !(history.hours.is_finite() && history.hours > 0.0) {
                return Err(ConfigError::InvalidHistoryHours {
                    name: name.to_string(),
                    hours: history.hours,
                });
            }
            if history.preload && history.hours > MAX_HISTORY_HOURS {
                return Err(ConfigError::HistoryHoursTooLarge {
                    name: name.to_string(),
                    hours: history.hours,
                    max: MAX_HISTORY_HOURS,
                });
            }
        }
        Ok(())
    }

    pub fn emit_policy(&self) -> EmitPolicy {
        EmitPolicy {
            min_emit: Duration::from_millis(self.min_emit_ms),
            coalesce: Duration::from_millis(self.coalesce_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            emit_on_same_value: self.emit_on_same_value,
        }
    }

    /// Explicit `buffer_size`, otherwise enough slots for one window at the
    /// fastest allowed emission rate.
    pub fn buffer_capacity(&self) -> usize {
        if let Some(size) = self.buffer_size {
            return size;
        }
        let window_ms = self.window_seconds.saturating_mul(1_000);
        let per_slot = self.min_emit_ms.max(1);
        let slots = window_ms.div_ceil(per_slot);
        usize::try_from(slots)
            .unwrap_or(MAX_BUFFER_CAPACITY)
            .clamp(MIN_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY)
    }

    /// Hours of history to preload, if preloading is enabled.
    pub fn preload_hours(&self) -> Option<f64> {
        self.history
            .as_ref()
            .filter(|h| h.preload)
            .map(|h| h.hours)
    }
}

#[cfg(test)]
impl SourceConfig {
    pub fn with_policy(mut self, min_emit_ms: u64, coalesce_ms: u64, max_delay_ms: u64) -> Self {
        self.min_emit_ms = min_emit_ms;
        self.coalesce_ms = coalesce_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_history(mut self, hours: f64) -> Self {
        self.history = Some(HistoryConfig {
            preload: true,
            hours,
        });
        self
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_window_seconds() -> u64 {
    3_600
}

fn default_min_emit_ms() -> u64 {
    100
}

fn default_coalesce_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    1_000
}

fn default_history_hours() -> f64 {
    1.0
}

/// Load the service configuration from `path` (extension optional) layered
/// with `ENTITY_STREAM__*` environment variables.
pub fn load_config(path: &str) -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("ENTITY_STREAM").separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
