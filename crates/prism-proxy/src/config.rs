use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("idle_timeout_secs must be greater than zero")]
    ZeroIdleTimeout,
}

/// Runtime configuration. Defaults match a bare deployment: listen on
/// `:8080`, read the blocklist from `blocked` in the working directory,
/// and pick up the root CA pair from `certs/`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub blocklist_path: String,
    pub ca_cert_path: String,
    pub ca_key_path: String,
    pub idle_timeout_secs: u64,
    pub upstream_tls_insecure_skip_verify: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            blocklist_path: "blocked".to_string(),
            ca_cert_path: "certs/rootCA.pem".to_string(),
            ca_key_path: "certs/rootCA.key".to_string(),
            idle_timeout_secs: 30,
            upstream_tls_insecure_skip_verify: true,
        }
    }
}

impl ProxyConfig {
    pub fn load_json(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyField("listen_addr"));
        }
        if self.blocklist_path.trim().is_empty() {
            return Err(ConfigError::EmptyField("blocklist_path"));
        }
        if self.ca_cert_path.trim().is_empty() {
            return Err(ConfigError::EmptyField("ca_cert_path"));
        }
        if self.ca_key_path.trim().is_empty() {
            return Err(ConfigError::EmptyField("ca_key_path"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
