use crate::alert::AlertResetPolicy;
use crate::error::{AppError, Result};
use crate::ws::protocol::validate_target_id;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub persistence: Option<PersistenceConfig>,
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

/// Live stream settings. Defaults match the upstream dashboard: 15s heartbeat,
/// 1.5s fixed reconnect delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_target_id")]
    pub target_id: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_base_url() -> String {
    "ws://localhost:8001/ws/monitor/meter".into()
}

fn default_target_id() -> String {
    "METER001".into()
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_500
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            target_id: default_target_id(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub reset: AlertResetPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub path: PathBuf,
}

/// Trend-fetch HTTP service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Config {
    /// Load configuration from a YAML file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding `$(VAR_NAME)` placeholders
    /// and applying the `METER_ID` override.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);

        let mut config: Config = serde_yaml::from_str(&expanded)?;

        if let Ok(meter_id) = std::env::var("METER_ID") {
            config.stream.target_id = meter_id;
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let base_url = self.stream.base_url.trim();
        if base_url.is_empty() {
            return Err(AppError::Config(
                "stream.base_url cannot be empty".to_string(),
            ));
        }

        if !base_url.starts_with("ws://") && !base_url.starts_with("wss://") {
            return Err(AppError::Config(format!(
                "stream.base_url must use ws:// or wss://, got {}",
                base_url
            )));
        }

        validate_target_id(&self.stream.target_id)
            .map_err(|e| AppError::Config(format!("stream.target_id: {}", e)))?;

        if self.stream.heartbeat_interval_ms == 0 {
            return Err(AppError::Config(
                "stream.heartbeat_interval_ms cannot be 0".to_string(),
            ));
        }

        if self.stream.reconnect_delay_ms == 0 {
            return Err(AppError::Config(
                "stream.reconnect_delay_ms cannot be 0".to_string(),
            ));
        }

        if let Some(persistence) = &self.persistence {
            if persistence.path.as_os_str().is_empty() {
                return Err(AppError::Config(
                    "persistence.path cannot be empty".to_string(),
                ));
            }
        }

        if let Some(api) = &self.api {
            if api.base_url.trim().is_empty() {
                return Err(AppError::Config("api.base_url cannot be empty".to_string()));
            }
        }

        Ok(())
    }
}

/// Expand environment variables in the format $(VAR_NAME)
fn expand_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    let re = match regex::Regex::new(r"\$\(([A-Z_][A-Z0-9_]*)\)") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(full_match, &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_METER_BASE", "ws://example:9000/ws");

        let input = "base_url: $(TEST_METER_BASE)";
        let output = expand_env_vars(input);

        assert_eq!(output, "base_url: ws://example:9000/ws");

        std::env::remove_var("TEST_METER_BASE");
    }

    #[test]
    fn test_expand_env_vars_not_found() {
        let input = "path: $(NONEXISTENT_METER_VAR)";
        let output = expand_env_vars(input);

        // Should leave it unchanged if not found
        assert_eq!(output, "path: $(NONEXISTENT_METER_VAR)");
    }

    #[test]
    #[serial]
    fn test_defaults_from_empty_document() {
        std::env::remove_var("METER_ID");
        let config = Config::from_yaml("{}").unwrap();

        assert_eq!(config.stream.base_url, "ws://localhost:8001/ws/monitor/meter");
        assert_eq!(config.stream.target_id, "METER001");
        assert_eq!(config.stream.heartbeat_interval(), Duration::from_millis(15_000));
        assert_eq!(config.stream.reconnect_delay(), Duration::from_millis(1_500));
        assert_eq!(config.alerts.reset, AlertResetPolicy::Never);
        assert!(config.persistence.is_none());
        assert!(config.api.is_none());
    }

    #[test]
    #[serial]
    fn test_meter_id_env_override() {
        std::env::set_var("METER_ID", "METER042");
        let config = Config::from_yaml("stream:\n  target_id: METER001\n").unwrap();
        std::env::remove_var("METER_ID");

        assert_eq!(config.stream.target_id, "METER042");
    }

    #[test]
    #[serial]
    fn test_rejects_http_base_url() {
        std::env::remove_var("METER_ID");
        let err = Config::from_yaml("stream:\n  base_url: http://localhost:8001\n").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_rejects_invalid_target() {
        std::env::remove_var("METER_ID");
        let err = Config::from_yaml("stream:\n  target_id: \"meter/1\"\n").unwrap_err();
        assert!(err.to_string().contains("stream.target_id"));
    }

    #[test]
    #[serial]
    fn test_rejects_zero_heartbeat() {
        std::env::remove_var("METER_ID");
        let err = Config::from_yaml("stream:\n  heartbeat_interval_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_ms"));
    }
}
