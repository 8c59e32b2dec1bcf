//! Application settings loaded from `topsheet.toml` and the environment.
//!
//! The settings file is optional; every field has a default so a bare
//! deployment works with just `DATABASE_URL` in the environment (or nothing
//! at all, for the default local SQLite file).

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Top-level application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    /// Database connection URL; `DATABASE_URL` in the environment wins
    #[serde(default = "super::database::get_database_url")]
    pub database_url: String,
    /// Endpoint cache tuning
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Endpoint cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Whether cached endpoint bodies are served at all
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
}

const fn default_cache_enabled() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_url: super::database::get_database_url(),
            cache: CacheSettings::default(),
        }
    }
}

/// Loads application settings.
///
/// Reads `.env` first (non-fatal if absent), then `topsheet.toml` from the
/// working directory when present, falling back to defaults otherwise.
pub fn load_app_settings() -> Result<AppSettings> {
    dotenvy::dotenv().ok();

    let path = Path::new("topsheet.toml");
    if !path.exists() {
        info!("No topsheet.toml found, using default settings.");
        return Ok(AppSettings::default());
    }

    let raw = std::fs::read_to_string(path)?;
    let settings: AppSettings = toml::from_str(&raw).map_err(|e| Error::Config {
        message: format!("failed to parse topsheet.toml: {e}"),
    })?;
    info!("Loaded settings from topsheet.toml.");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = AppSettings::default();
        assert!(settings.cache.enabled);
        assert!(settings.database_url.starts_with("sqlite://"));
    }

    #[test]
    fn parses_partial_toml() {
        let settings: AppSettings = toml::from_str("[cache]\nenabled = false\n").unwrap();
        assert!(!settings.cache.enabled);
    }
}
