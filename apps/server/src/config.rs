//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides,
//! layered defaults -> file -> env -> CLI (§10.3).

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to bind the HTTP/WebSocket server to.
    /// Override: `SYNCROOM_BIND_HOST`
    pub bind_host: IpAddr,

    /// Port to bind the HTTP/WebSocket server to.
    /// Override: `SYNCROOM_BIND_PORT`
    pub bind_port: u16,

    /// Redis connection URL. When unset, the server runs single-instance
    /// with an in-process state store and event bus.
    /// Override: `SYNCROOM_REDIS_URL`
    pub redis_url: Option<String>,

    /// Prefix applied to every Redis key, so multiple deployments can share
    /// one Redis database.
    pub redis_key_prefix: String,

    /// Allowed CORS origins. `["*"]` allows any origin.
    pub cors_origins: Vec<String>,

    /// Milliseconds of inbound-frame silence before a connection is treated
    /// as dead and closed (§4.I heartbeat).
    pub ping_timeout_ms: u64,

    /// Milliseconds between server-initiated keepalive pings (§4.I heartbeat).
    pub ping_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([0, 0, 0, 0]),
            bind_port: 8080,
            redis_url: None,
            redis_key_prefix: "syncroom:".to_string(),
            cors_origins: vec!["*".to_string()],
            ping_timeout_ms: 10_000,
            ping_interval_ms: 25_000,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides, then validates eagerly (§10.3: the process refuses to
    /// start on invalid configuration rather than failing lazily).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SYNCROOM_BIND_HOST") {
            if let Ok(host) = val.parse() {
                self.bind_host = host;
            }
        }
        if let Ok(val) = std::env::var("SYNCROOM_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("SYNCROOM_REDIS_URL") {
            self.redis_url = Some(val);
        }
        if let Ok(val) = std::env::var("SYNCROOM_CORS_ORIGINS") {
            self.cors_origins = val.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(val) = std::env::var("SYNCROOM_PING_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.ping_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("SYNCROOM_PING_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.ping_interval_ms = ms;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.bind_port == 0 {
            anyhow::bail!("bind_port must be nonzero");
        }
        if self.redis_key_prefix.is_empty() {
            anyhow::bail!("redis_key_prefix must be non-empty");
        }
        if self.ping_timeout_ms == 0 || self.ping_interval_ms == 0 {
            anyhow::bail!("ping_timeout_ms and ping_interval_ms must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = ServerConfig::default();
        config.bind_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_ping_timeout_is_rejected() {
        let mut config = ServerConfig::default();
        config.ping_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_redis_key_prefix_is_rejected() {
        let mut config = ServerConfig::default();
        config.redis_key_prefix = String::new();
        assert!(config.validate().is_err());
    }
}
