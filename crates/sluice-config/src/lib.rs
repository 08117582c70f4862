//! # Sluice Configuration
//!
//! One file describes a gateway: the upstream base and pool limits, the
//! listen address and mount prefix, header rules for each direction, and
//! logging. YAML, TOML and JSON are accepted; `${VAR}` and `${VAR:-default}`
//! are expanded from the environment before parsing.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod loader;
pub mod types;
pub mod validator;

pub use builder::ConfigBuilder;
pub use loader::{load_config, load_from_file, load_from_str};
pub use types::{Config, GatewayConfig, HeadersConfig, LoggingConfig, ObservabilityConfig};
pub use validator::validate_config;

use sluice_core::{Error, Result};
use std::path::Path;

/// Configuration file format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                Error::Config(format!("{} has no file extension", path.display()))
            })?;

        match ext.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(Error::Config(format!("Unsupported config format: {ext}"))),
        }
    }
}
