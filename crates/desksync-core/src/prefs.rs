//! Typed views over the singleton preference keys.
//!
//! These are the reference consumers of singleton-mode keys: load the single
//! row if present, save through the service with the caller deciding whether
//! peers should be notified, and reload on `cfgchanged:<key>`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ConfigService;
use crate::store::StoreError;

/// Singleton key holding the UI theme.
pub const THEME_KEY: &str = "light";

/// Singleton key holding the locale choice.
pub const LANG_KEY: &str = "lang";

/// Errors raised by preference access.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PrefError {
    /// The store refused or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The stored document does not have the expected shape.
    #[error("preference value malformed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// UI theme, persisted as `{"mode": "light" | "dark"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemePref {
    /// The selected mode.
    pub mode: ThemeMode,
}

/// The two theme modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    /// Light theme.
    Light,
    /// Dark theme.
    Dark,
}

impl ThemePref {
    /// Loads the persisted theme, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read or decoded.
    pub fn load(service: &ConfigService) -> Result<Option<Self>, PrefError> {
        load_first(service, THEME_KEY)
    }

    /// Persists the theme.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written.
    pub fn save(self, service: &ConfigService, notify: bool) -> Result<(), PrefError> {
        service.upsert_by_key(THEME_KEY, &serde_json::to_value(self)?, notify)?;
        Ok(())
    }
}

/// Locale choice, persisted as `{"lang": "<bcp-47 tag>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LangPref {
    /// The selected locale tag.
    pub lang: String,
}

impl LangPref {
    /// Loads the persisted locale, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be read or decoded.
    pub fn load(service: &ConfigService) -> Result<Option<Self>, PrefError> {
        load_first(service, LANG_KEY)
    }

    /// Persists the locale.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be written.
    pub fn save(&self, service: &ConfigService, notify: bool) -> Result<(), PrefError> {
        service.upsert_by_key(LANG_KEY, &serde_json::to_value(self)?, notify)?;
        Ok(())
    }
}

fn load_first<T: serde::de::DeserializeOwned>(
    service: &ConfigService,
    key: &str,
) -> Result<Option<T>, PrefError> {
    let records = service.get_by_key(key)?;
    match records.into_iter().next() {
        Some(record) => Ok(Some(serde_json::from_value(record.value)?)),
        None => Ok(None),
    }
}
