//! Settings loader
//!
//! Loads [`ResilienceSettings`] from TOML or JSON text and files, then applies
//! environment overrides to the defaults.
//!
//! ## Environment Variables
//! Every field of every defaults section can be overridden with
//! `BULWARK_<SECTION>_<FIELD>`, for example:
//! - `BULWARK_CIRCUIT_BREAKER_FAILURE_RATE_THRESHOLD=25`
//! - `BULWARK_RETRY_MAX_ATTEMPTS=5`
//! - `BULWARK_RATE_LIMITER_TIMEOUT_DURATION=250ms`
//! - `BULWARK_BULKHEAD_MAX_CONCURRENT_CALLS=50`
//!
//! Values are read as numbers or booleans where they parse as such, and as
//! strings otherwise (durations accept the `"5s"` form or plain
//! milliseconds).

#[cfg(feature = "config")]
use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use super::settings::ResilienceSettings;
use crate::resilience::{ConfigError, ConfigResult};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "BULWARK";

impl ResilienceSettings {
    /// Parse settings from TOML text
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown fields.
    #[cfg(feature = "config")]
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::Parse { message: format!("Invalid TOML format: {e}") })
    }

    /// Parse settings from JSON text
    pub fn from_json_str(contents: &str) -> ConfigResult<Self> {
        serde_json::from_str(contents)
            .map_err(|e| ConfigError::Parse { message: format!("Invalid JSON format: {e}") })
    }

    /// Load settings from a `.toml` or `.json` file
    ///
    /// The format is chosen by extension; files without one are read as TOML.
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] for malformed content or an unsupported
    /// extension.
    #[cfg(feature = "config")]
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading resilience settings");

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("toml") {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            other => Err(ConfigError::Parse {
                message: format!("Unsupported settings format: {other}"),
            }),
        }
    }

    /// Apply `BULWARK_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `BULWARK_*` overrides read through `lookup`
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] when a value does not fit its field.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut defaults = serde_json::to_value(&self.defaults)
            .map_err(|e| ConfigError::Parse { message: e.to_string() })?;
        let mut applied = 0_usize;

        if let Value::Object(sections) = &mut defaults {
            for (section, fields) in sections.iter_mut() {
                let Value::Object(fields) = fields else { continue };
                for (field, value) in fields.iter_mut() {
                    let key = env_key(section, field);
                    if let Some(raw) = lookup(&key) {
                        debug!(key = %key, "Applying environment override");
                        *value = env_value(&raw);
                        applied += 1;
                    }
                }
            }
        }

        if applied == 0 {
            return Ok(());
        }
        self.defaults = serde_json::from_value(defaults).map_err(|e| ConfigError::Parse {
            message: format!("Invalid environment override: {e}"),
        })?;
        info!(applied, "Environment overrides applied to resilience defaults");
        Ok(())
    }
}

fn env_key(section: &str, field: &str) -> String {
    format!("{ENV_PREFIX}_{section}_{field}").to_ascii_uppercase()
}

fn env_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(trimmed.to_string()),
    }
}
