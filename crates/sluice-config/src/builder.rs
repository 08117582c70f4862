//! Configuration builder

use crate::types::{Config, GatewayConfig, HeadersConfig, ObservabilityConfig};
use sluice_core::{Error, HeaderRules, PoolSettings, ProxySettings, Result};
use std::net::SocketAddr;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: Option<String>,
    pool: PoolSettings,
    gateway: GatewayConfig,
    headers: HeadersConfig,
    observability: ObservabilityConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the upstream base address
    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Set pool settings
    pub fn pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Set gateway configuration
    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Set listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.gateway.listen = addr;
        self
    }

    /// Set request header rules
    pub fn request_headers(mut self, rules: HeaderRules) -> Self {
        self.headers.request = rules;
        self
    }

    /// Set response header rules
    pub fn response_headers(mut self, rules: HeaderRules) -> Self {
        self.headers.response = rules;
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.observability.logging.level = level.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let base = self
            .base
            .ok_or_else(|| Error::Config("proxy base is required".to_string()))?;

        Ok(Config {
            proxy: ProxySettings::new(base).with_pool(self.pool),
            gateway: self.gateway,
            headers: self.headers,
            observability: self.observability,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        let pool = PoolSettings {
            pipelining: 10,
            ..PoolSettings::default()
        };

        let config = ConfigBuilder::new()
            .base("http://127.0.0.1:3000")
            .pool(pool)
            .listen(addr)
            .log_level("debug")
            .build()
            .unwrap();

        assert_eq!(config.gateway.listen, addr);
        assert_eq!(config.proxy.pool.pipelining, 10);
        assert_eq!(config.observability.logging.level, "debug");
    }

    #[test]
    fn test_builder_missing_base() {
        let result = ConfigBuilder::new().build();
        assert!(result.is_err());
    }
}
