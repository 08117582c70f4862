//! Configuration validation

use crate::Config;
use http::{HeaderName, HeaderValue};
use sluice_core::{Error, HeaderRules, Result};
use std::time::Duration;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_proxy(config)?;
    validate_gateway(config)?;
    validate_headers(config)?;
    validate_observability(config)?;
    Ok(())
}

fn validate_proxy(config: &Config) -> Result<()> {
    config.proxy.validate()?;

    let pool = &config.proxy.pool;
    if pool.request_timeout > Duration::from_secs(300) {
        tracing::warn!("pool.request_timeout is very high (>5 minutes)");
    }
    if pool.pipelining > 1 && pool.connections == 1 {
        tracing::debug!(
            pipelining = pool.pipelining,
            "all traffic will share a single pipelined connection"
        );
    }

    Ok(())
}

fn validate_gateway(config: &Config) -> Result<()> {
    if config.gateway.shutdown_timeout.is_zero() {
        return Err(Error::Config(
            "gateway.shutdown_timeout must be > 0".to_string(),
        ));
    }

    if let Some(prefix) = &config.gateway.strip_prefix {
        if !prefix.starts_with('/') {
            return Err(Error::Config(
                "gateway.strip_prefix must start with '/'".to_string(),
            ));
        }
        if prefix.len() > 1 && prefix.ends_with('/') {
            return Err(Error::Config(
                "gateway.strip_prefix must not end with '/'".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_headers(config: &Config) -> Result<()> {
    validate_rules("headers.request", &config.headers.request)?;
    validate_rules("headers.response", &config.headers.response)
}

fn validate_rules(section: &str, rules: &HeaderRules) -> Result<()> {
    for name in rules.remove.iter().chain(rules.set.keys()) {
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            Error::Config(format!("{section}: invalid header name '{name}'"))
        })?;
    }

    for (name, value) in &rules.set {
        HeaderValue::from_str(value).map_err(|_| {
            Error::Config(format!("{section}: invalid value for header '{name}'"))
        })?;
    }

    Ok(())
}

fn validate_observability(config: &Config) -> Result<()> {
    let logging = &config.observability.logging;

    if !LOG_LEVELS.contains(&logging.level.to_lowercase().as_str()) {
        return Err(Error::Config(format!(
            "Invalid log level: {} (must be one of {})",
            logging.level,
            LOG_LEVELS.join(", ")
        )));
    }

    match logging.format.as_str() {
        "text" | "json" => Ok(()),
        other => Err(Error::Config(format!(
            "Invalid log format: {other} (must be text or json)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigBuilder;

    fn config() -> Config {
        ConfigBuilder::new()
            .base("http://127.0.0.1:3000")
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&config()).is_ok());
    }

    #[test]
    fn test_invalid_base() {
        let mut config = config();
        config.proxy.base = "ftp://127.0.0.1".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_pool() {
        let mut config = config();
        config.proxy.pool.connections = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_strip_prefix() {
        let mut config = config();
        config.gateway.strip_prefix = Some("api".to_string());
        assert!(validate_config(&config).is_err());

        config.gateway.strip_prefix = Some("/api/".to_string());
        assert!(validate_config(&config).is_err());

        config.gateway.strip_prefix = Some("/api".to_string());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_invalid_header_rules() {
        let mut config = config();
        config.headers.response.remove.push("bad header".to_string());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("headers.response"));
    }

    #[test]
    fn test_invalid_logging() {
        let mut config = config();
        config.observability.logging.level = "loud".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = self::config();
        config.observability.logging.format = "xml".to_string();
        assert!(validate_config(&config).is_err());
    }
}
