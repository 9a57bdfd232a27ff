//! Engine tunables.
//!
//! Durations are expressed in milliseconds in JSON and in the `PEERCALL_*`
//! environment overrides, e.g. `PEERCALL_CONNECT_TIMEOUT_MS=15000`.

use std::path::Path;
use std::time::Duration;

use pccore::backoff::Backoff;
use pccore::rate_limit::RateLimiter;
use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "PEERCALL_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidOverride { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Ceiling from entering `connecting` (or `disconnected`) to `connected`.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "relay_init_timeout_ms", with = "millis")]
    pub relay_init_timeout: Duration,
    /// Bounds media acquisition and peer-connection construction.
    #[serde(rename = "transport_setup_timeout_ms", with = "millis")]
    pub transport_setup_timeout: Duration,
    #[serde(rename = "min_call_spacing_ms", with = "millis")]
    pub min_call_spacing: Duration,
    #[serde(rename = "rate_window_ms", with = "millis")]
    pub rate_window: Duration,
    pub max_calls_per_window: usize,
    pub max_reconnect_attempts: u32,
    #[serde(rename = "reconnect_base_delay_ms", with = "millis")]
    pub reconnect_base_delay: Duration,
    #[serde(rename = "reconnect_max_delay_ms", with = "millis")]
    pub reconnect_max_delay: Duration,
    /// In-place ICE restarts a session attempts on its own while the relay is online.
    pub max_ice_restarts: u32,
    pub upload_max_attempts: u32,
    #[serde(rename = "upload_base_delay_ms", with = "millis")]
    pub upload_base_delay: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            relay_init_timeout: Duration::from_secs(10),
            transport_setup_timeout: Duration::from_secs(10),
            min_call_spacing: Duration::from_secs(5),
            rate_window: Duration::from_secs(60),
            max_calls_per_window: 10,
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(16),
            max_ice_restarts: 2,
            upload_max_attempts: 3,
            upload_base_delay: Duration::from_secs(1),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Applies `PEERCALL_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(
            std::env::vars().filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX).map(|key| (key.to_ascii_lowercase(), v))
            }),
        )
    }

    /// Applies `(field, value)` pairs; field names match the JSON keys.
    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in overrides {
            let (key, value) = (key.as_ref(), value.as_ref());
            let invalid = || ConfigError::InvalidOverride {
                key: key.to_string(),
                value: value.to_string(),
            };
            let ms = || value.trim().parse::<u64>().map(Duration::from_millis);
            match key {
                "connect_timeout_ms" => self.connect_timeout = ms().map_err(|_| invalid())?,
                "relay_init_timeout_ms" => self.relay_init_timeout = ms().map_err(|_| invalid())?,
                "transport_setup_timeout_ms" => {
                    self.transport_setup_timeout = ms().map_err(|_| invalid())?
                }
                "min_call_spacing_ms" => self.min_call_spacing = ms().map_err(|_| invalid())?,
                "rate_window_ms" => self.rate_window = ms().map_err(|_| invalid())?,
                "max_calls_per_window" => {
                    self.max_calls_per_window = value.trim().parse().map_err(|_| invalid())?
                }
                "max_reconnect_attempts" => {
                    self.max_reconnect_attempts = value.trim().parse().map_err(|_| invalid())?
                }
                "reconnect_base_delay_ms" => {
                    self.reconnect_base_delay = ms().map_err(|_| invalid())?
                }
                "reconnect_max_delay_ms" => self.reconnect_max_delay = ms().map_err(|_| invalid())?,
                "max_ice_restarts" => {
                    self.max_ice_restarts = value.trim().parse().map_err(|_| invalid())?
                }
                "upload_max_attempts" => {
                    self.upload_max_attempts = value.trim().parse().map_err(|_| invalid())?
                }
                "upload_base_delay_ms" => self.upload_base_delay = ms().map_err(|_| invalid())?,
                "ice_servers" => {
                    self.ice_servers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                other => log::debug!(target: "Call/Config", "Ignoring unknown override {other}"),
            }
        }
        Ok(self)
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.min_call_spacing,
            self.rate_window,
            self.max_calls_per_window,
        )
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(self.reconnect_base_delay, self.reconnect_max_delay)
    }

    pub fn upload_backoff(&self) -> Backoff {
        Backoff::new(self.upload_base_delay, self.upload_base_delay.saturating_mul(8))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
