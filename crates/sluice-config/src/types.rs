//! Configuration types

use serde::{Deserialize, Serialize};
use sluice_core::{HeaderRules, ProxySettings};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Upstream base address and pool settings
    pub proxy: ProxySettings,

    /// Front server
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Header rewrite rules applied to every forward
    #[serde(default)]
    pub headers: HeadersConfig,

    /// Observability
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Gateway (front server) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Prefix removed from inbound paths before they are used as the
    /// upstream target, e.g. `/api`
    #[serde(default)]
    pub strip_prefix: Option<String>,

    /// Graceful shutdown timeout (wait for in-flight requests)
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            strip_prefix: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Header rewrite rules per direction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeadersConfig {
    /// Applied to outbound request headers
    pub request: HeaderRules,

    /// Applied to upstream response headers
    pub response: HeaderRules,
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8080))
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.listen.to_string(), "127.0.0.1:8080");
        assert_eq!(gateway.shutdown_timeout, Duration::from_secs(30));
        assert!(gateway.strip_prefix.is_none());
    }

    #[test]
    fn test_observability_default() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_json::from_str(r#"{"proxy":{"base":"http://127.0.0.1:3000"}}"#).unwrap();
        assert_eq!(config.proxy.base, "http://127.0.0.1:3000");
        assert_eq!(config.proxy.pool.pipelining, 1);
        assert!(config.headers.request.is_empty());
    }
}
