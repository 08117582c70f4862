//! Configuration loading

use crate::{Config, ConfigFormat};
use regex::Regex;
use sluice_core::{Error, Result};
use std::env;
use std::fs;
use std::path::Path;

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand `${VAR}` and `${VAR:-default}` references
fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match (env::var(var_name), default_value) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(Error::Config(format!(
                    "Environment variable '{var_name}' not set and no default provided"
                )));
            }
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    let expanded = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded)
            .map_err(|e| Error::Config(format!("Failed to parse JSON: {e}")))?,
    };

    Ok(config)
}

/// Load a configuration file and validate it
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}
