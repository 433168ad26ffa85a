//! Client configuration
//!
//! Values are layered: defaults, then an optional TOML file, then `RTA_*`
//! environment variables. Each layer is folded in with [`RtaConfig::merge`],
//! and the result is checked with [`RtaConfig::validate`].
//!
//! ```toml
//! endpoint = "wss://rta.xboxlive.com/connect"
//! timeout_window_secs = 120
//!
//! [backoff]
//! initial_backoff_ms = 250
//! max_backoff_ms = 30000
//! ```

use crate::backoff::BackoffPolicy;
use crate::error::{Result, RtaError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default service endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://rta.xboxlive.com/connect";

/// Default WebSocket sub-protocol
pub const DEFAULT_SUB_PROTOCOL: &str = "rta.xboxlive.com.V2";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "RTA_";

/// Real-time activity configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtaConfig {
    /// WebSocket endpoint the connection is opened against
    pub endpoint: String,

    /// Value sent in `Sec-WebSocket-Protocol`
    pub sub_protocol: String,

    /// Reconnect backoff
    pub backoff: BackoffPolicy,

    /// How long a connect episode may keep failing before consumers are
    /// told the connection is gone
    pub timeout_window_secs: u64,

    /// Recycle a healthy socket after this many seconds (0 disables)
    pub max_connection_lifetime_secs: u64,

    /// Per-principal activation count above which a warning is logged
    pub activation_soft_limit: u32,

    /// Enable diagnostic warnings
    pub diagnostics_enabled: bool,
}

impl Default for RtaConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sub_protocol: DEFAULT_SUB_PROTOCOL.to_string(),
            backoff: BackoffPolicy::default(),
            timeout_window_secs: 300,
            max_connection_lifetime_secs: 90 * 60,
            activation_soft_limit: 5,
            diagnostics_enabled: true,
        }
    }
}

impl RtaConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the sub-protocol
    pub fn with_sub_protocol(mut self, sub_protocol: impl Into<String>) -> Self {
        self.sub_protocol = sub_protocol.into();
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the timeout window
    pub fn with_timeout_window(mut self, window: Duration) -> Self {
        self.timeout_window_secs = window.as_secs();
        self
    }

    /// Set the maximum connection lifetime; `None` disables recycling
    pub fn with_max_connection_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_connection_lifetime_secs = lifetime.map(|l| l.as_secs()).unwrap_or(0);
        self
    }

    /// Set the activation soft limit
    pub fn with_activation_soft_limit(mut self, limit: u32) -> Self {
        self.activation_soft_limit = limit;
        self
    }

    /// Enable or disable diagnostics
    pub fn with_diagnostics(mut self, enabled: bool) -> Self {
        self.diagnostics_enabled = enabled;
        self
    }

    /// Timeout window as a duration
    pub fn timeout_window(&self) -> Duration {
        Duration::from_secs(self.timeout_window_secs)
    }

    /// Maximum connection lifetime, if recycling is enabled
    pub fn max_connection_lifetime(&self) -> Option<Duration> {
        match self.max_connection_lifetime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Build configuration from `RTA_*` environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(endpoint) = get_env("ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(sub_protocol) = get_env("SUB_PROTOCOL") {
            config.sub_protocol = sub_protocol;
        }
        if let Some(ms) = get_env_parse("INITIAL_BACKOFF_MS")? {
            config.backoff.initial_backoff_ms = ms;
        }
        if let Some(multiplier) = get_env_parse("BACKOFF_MULTIPLIER")? {
            config.backoff.backoff_multiplier = multiplier;
        }
        if let Some(ms) = get_env_parse("MAX_BACKOFF_MS")? {
            config.backoff.max_backoff_ms = ms;
        }
        if let Some(jitter) = get_env_bool("BACKOFF_JITTER")? {
            config.backoff.jitter = jitter;
        }
        if let Some(secs) = get_env_parse("TIMEOUT_WINDOW_SECS")? {
            config.timeout_window_secs = secs;
        }
        if let Some(secs) = get_env_parse("MAX_CONNECTION_LIFETIME_SECS")? {
            config.max_connection_lifetime_secs = secs;
        }
        if let Some(limit) = get_env_parse("ACTIVATION_SOFT_LIMIT")? {
            config.activation_soft_limit = limit;
        }
        if let Some(enabled) = get_env_bool("DIAGNOSTICS")? {
            config.diagnostics_enabled = enabled;
        }

        Ok(config)
    }

    /// Overlay every field of `other` that differs from the default
    pub fn merge(&mut self, other: Self) {
        let defaults = Self::default();

        if other.endpoint != defaults.endpoint {
            self.endpoint = other.endpoint;
        }
        if other.sub_protocol != defaults.sub_protocol {
            self.sub_protocol = other.sub_protocol;
        }
        if other.backoff != defaults.backoff {
            self.backoff = other.backoff;
        }
        if other.timeout_window_secs != defaults.timeout_window_secs {
            self.timeout_window_secs = other.timeout_window_secs;
        }
        if other.max_connection_lifetime_secs != defaults.max_connection_lifetime_secs {
            self.max_connection_lifetime_secs = other.max_connection_lifetime_secs;
        }
        if other.activation_soft_limit != defaults.activation_soft_limit {
            self.activation_soft_limit = other.activation_soft_limit;
        }
        if other.diagnostics_enabled != defaults.diagnostics_enabled {
            self.diagnostics_enabled = other.diagnostics_enabled;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(RtaError::Config(format!(
                "endpoint must be a ws:// or wss:// url, got '{}'",
                self.endpoint
            )));
        }

        if self.sub_protocol.trim().is_empty() {
            return Err(RtaError::Config("sub_protocol cannot be empty".to_string()));
        }

        if self.backoff.initial_backoff_ms == 0 {
            return Err(RtaError::Config(
                "backoff.initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.backoff.backoff_multiplier < 1.0 {
            return Err(RtaError::Config(
                "backoff.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.backoff.max_backoff_ms < self.backoff.initial_backoff_ms {
            return Err(RtaError::Config(
                "backoff.max_backoff_ms must not be below initial_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }
}

fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|value| !value.is_empty())
}

fn get_env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match get_env(name) {
        Some(value) => value.parse().map(Some).map_err(|_| {
            RtaError::Config(format!(
                "Failed to parse {}{}: '{}'",
                ENV_PREFIX, name, value
            ))
        }),
        None => Ok(None),
    }
}

fn get_env_bool(name: &str) -> Result<Option<bool>> {
    match get_env(name) {
        Some(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(RtaError::Config(format!(
                "Invalid boolean value for {}{}: {}",
                ENV_PREFIX, name, value
            ))),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RtaConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.sub_protocol, DEFAULT_SUB_PROTOCOL);
        assert_eq!(config.timeout_window(), Duration::from_secs(300));
        assert_eq!(config.max_connection_lifetime(), Some(Duration::from_secs(5400)));
        assert_eq!(config.activation_soft_limit, 5);
        assert!(config.diagnostics_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RtaConfig::new()
            .with_endpoint("ws://localhost:9000/connect")
            .with_timeout_window(Duration::from_secs(10))
            .with_max_connection_lifetime(None)
            .with_activation_soft_limit(2)
            .with_diagnostics(false);

        assert_eq!(config.endpoint, "ws://localhost:9000/connect");
        assert_eq!(config.timeout_window_secs, 10);
        assert_eq!(config.max_connection_lifetime(), None);
        assert_eq!(config.activation_soft_limit, 2);
        assert!(!config.diagnostics_enabled);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RtaConfig::from_toml(
            r#"
            timeout_window_secs = 120

            [backoff]
            initial_backoff_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.timeout_window_secs, 120);
        assert_eq!(config.backoff.initial_backoff_ms, 250);
        assert_eq!(config.backoff.backoff_multiplier, 3.0);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("rta-config-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "endpoint = \"ws://127.0.0.1:7000/rta\"").unwrap();
        drop(file);

        let config = RtaConfig::from_file(&path).unwrap();
        assert_eq!(config.endpoint, "ws://127.0.0.1:7000/rta");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_file_missing() {
        let result = RtaConfig::from_file("/nonexistent/rta.toml");
        assert!(matches!(result, Err(RtaError::Io(_))));
    }

    #[test]
    fn test_invalid_toml() {
        let result = RtaConfig::from_toml("timeout_window_secs = \"soon\"");
        assert!(matches!(result, Err(RtaError::Toml(_))));
    }

    #[test]
    fn test_from_env() {
        env::set_var("RTA_TIMEOUT_WINDOW_SECS", "42");
        env::set_var("RTA_BACKOFF_JITTER", "yes");
        env::set_var("RTA_SUB_PROTOCOL", "custom.V1");

        let config = RtaConfig::from_env().unwrap();
        assert_eq!(config.timeout_window_secs, 42);
        assert!(config.backoff.jitter);
        assert_eq!(config.sub_protocol, "custom.V1");

        // Variables share one process, so the failure case runs in the same test
        env::set_var("RTA_ACTIVATION_SOFT_LIMIT", "many");
        let result = RtaConfig::from_env();
        assert!(matches!(result, Err(RtaError::Config(_))));

        env::remove_var("RTA_ACTIVATION_SOFT_LIMIT");
        env::remove_var("RTA_TIMEOUT_WINDOW_SECS");
        env::remove_var("RTA_BACKOFF_JITTER");
        env::remove_var("RTA_SUB_PROTOCOL");
    }

    #[test]
    fn test_merge_overrides_non_defaults() {
        let mut base = RtaConfig::default().with_endpoint("ws://file/connect");
        let overlay = RtaConfig::default().with_activation_soft_limit(9);

        base.merge(overlay);

        assert_eq!(base.endpoint, "ws://file/connect");
        assert_eq!(base.activation_soft_limit, 9);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = RtaConfig::default().with_endpoint("https://not-a-socket");
        assert!(config.validate().is_err());

        let config = RtaConfig::default().with_sub_protocol("  ");
        assert!(config.validate().is_err());

        let config = RtaConfig::default()
            .with_backoff(BackoffPolicy::default().with_multiplier(0.5));
        assert!(config.validate().is_err());

        let config = RtaConfig::default().with_backoff(
            BackoffPolicy::new(Duration::from_secs(10)).with_max_backoff(Duration::from_secs(1)),
        );
        assert!(config.validate().is_err());
    }
}
