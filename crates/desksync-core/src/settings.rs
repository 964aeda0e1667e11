//! Runtime settings.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working configuration; a settings file only needs to name the fields it
//! overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading settings.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SettingsError {
    /// The file could not be read.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML is invalid.
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings shared by every subsystem of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path of the shared configuration database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory holding the cross-process signal files.
    #[serde(default = "default_bus_dir")]
    pub bus_dir: PathBuf,

    /// How long change-ledger entries are retained, in seconds.
    ///
    /// Must dwarf cross-process notification latency; readers stalled past
    /// the window converge through their next boot-time full reload.
    #[serde(default = "default_change_retention_secs")]
    pub change_retention_secs: u64,

    /// Maximum in-flight liveness checks during registry validation.
    #[serde(default = "default_liveness_concurrency")]
    pub liveness_concurrency: usize,

    /// Bound on readiness waits, in seconds.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Age past which a broadcast envelope is discarded as stale, seconds.
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,

    /// Version stamped into newly created repositories.
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bus_dir: default_bus_dir(),
            change_retention_secs: default_change_retention_secs(),
            liveness_concurrency: default_liveness_concurrency(),
            ready_timeout_secs: default_ready_timeout_secs(),
            signal_ttl_secs: default_signal_ttl_secs(),
            app_version: default_app_version(),
        }
    }
}

impl Settings {
    /// Loads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(content)?)
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("app.db")
}

fn default_bus_dir() -> PathBuf {
    PathBuf::from("bus")
}

fn default_change_retention_secs() -> u64 {
    3600
}

fn default_liveness_concurrency() -> usize {
    32
}

fn default_ready_timeout_secs() -> u64 {
    60
}

fn default_signal_ttl_secs() -> u64 {
    10
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.change_retention_secs, 3600);
        assert_eq!(settings.liveness_concurrency, 32);
        assert_eq!(settings.ready_timeout_secs, 60);
        assert_eq!(settings.signal_ttl_secs, 10);
        assert_eq!(settings.db_path, PathBuf::from("app.db"));
    }

    #[test]
    fn overrides_apply_and_defaults_fill_the_rest() {
        let settings = Settings::from_toml(
            r#"
            db_path = "/var/lib/desksync/state.db"
            change_retention_secs = 7200
            "#,
        )
        .unwrap();
        assert_eq!(settings.db_path, PathBuf::from("/var/lib/desksync/state.db"));
        assert_eq!(settings.change_retention_secs, 7200);
        assert_eq!(settings.liveness_concurrency, 32);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Settings::from_toml("db_path = [").is_err());
    }
}
