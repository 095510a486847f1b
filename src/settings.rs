//! Host settings, merged from defaults, an optional TOML file, and
//! `RUST_LAB_*` environment variables.

use crate::device::AdapterOptions;
use crate::error::AppResult;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Adapter supervision defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// Bound on device creation plus validation, per candidate address.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Sleep between failed reconnection attempts.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Whether reconnection loops wait one interval before the first
    /// attempt.
    pub initial_wait: bool,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
            initial_wait: false,
        }
    }
}

impl AdapterSettings {
    /// Adapter options seeded from these settings.
    pub fn options(&self) -> AdapterOptions {
        AdapterOptions {
            connect_timeout: self.connect_timeout,
            retry_interval: self.retry_interval,
            initial_wait: self.initial_wait,
            ..AdapterOptions::default()
        }
    }
}

/// Execution engine tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Capacity of per-program event channels.
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { event_buffer: 16 }
    }
}

/// Top-level host settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Adapter supervision defaults.
    pub adapter: AdapterSettings,
    /// Execution engine tuning.
    pub engine: EngineSettings,
}

impl Settings {
    /// Load settings, layering an optional TOML file and the environment
    /// over the defaults.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("RUST_LAB_").split("__"))
            .extract()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.adapter.connect_timeout, Duration::from_secs(1));
        assert_eq!(settings.adapter.retry_interval, Duration::from_secs(1));
        assert!(!settings.adapter.initial_wait);
        assert_eq!(settings.engine.event_buffer, 16);
    }

    #[test]
    fn test_load_without_file_matches_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_adapter_options_seeded_from_settings() {
        let settings = AdapterSettings {
            retry_interval: Duration::from_millis(250),
            ..AdapterSettings::default()
        };
        let options = settings.options();
        assert_eq!(options.retry_interval, Duration::from_millis(250));
        assert!(options.reconnect);
    }
}
