//! Persisted upload preferences.
//!
//! Preferences live in a small key-value table next to the queue so that the
//! scheduler configuration survives restarts together with the data it
//! governs.

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::debug;

use uplink_types::{Constraints, EpochMillis};

use crate::error::Result;
use crate::store::Store;

/// Minimum interval between periodic uploads, in minutes.
pub const MIN_UPLOAD_INTERVAL_MINUTES: u32 = 15;

const KEY_WIFI_ONLY: &str = "wifi_only";
const KEY_REQUIRES_CHARGING: &str = "requires_charging";
const KEY_UPLOAD_INTERVAL: &str = "upload_interval_minutes";
const KEY_AUTO_UPLOAD: &str = "auto_upload_enabled";
const KEY_LAST_UPLOAD: &str = "last_successful_upload";

/// Upload preference block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    /// Upload only on an unmetered connection.
    pub wifi_only: bool,
    /// Upload only while charging.
    pub requires_charging: bool,
    /// Periodic upload interval in minutes (never below 15).
    pub upload_interval_minutes: u32,
    /// Whether periodic uploads are scheduled at all.
    pub auto_upload_enabled: bool,
    /// Time of the last run that uploaded at least one row.
    pub last_successful_upload: Option<EpochMillis>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            wifi_only: true,
            requires_charging: false,
            upload_interval_minutes: MIN_UPLOAD_INTERVAL_MINUTES,
            auto_upload_enabled: true,
            last_successful_upload: None,
        }
    }
}

impl Preferences {
    /// Constraints for scheduled upload runs.
    pub fn constraints(&self) -> Constraints {
        Constraints {
            wifi_only: self.wifi_only,
            requires_charging: self.requires_charging,
        }
    }

    /// Upload interval with the floor applied.
    pub fn effective_interval_minutes(&self) -> u32 {
        self.upload_interval_minutes.max(MIN_UPLOAD_INTERVAL_MINUTES)
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

// Preference operations
impl Store {
    fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM preferences WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_pref(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO preferences (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            [key, value],
        )?;
        Ok(())
    }

    /// Load the preference block, filling absent keys with defaults.
    pub fn preferences(&self) -> Result<Preferences> {
        let defaults = Preferences::default();
        Ok(Preferences {
            wifi_only: parse_bool(self.get_pref(KEY_WIFI_ONLY)?, defaults.wifi_only),
            requires_charging: parse_bool(
                self.get_pref(KEY_REQUIRES_CHARGING)?,
                defaults.requires_charging,
            ),
            upload_interval_minutes: self
                .get_pref(KEY_UPLOAD_INTERVAL)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.upload_interval_minutes)
                .max(MIN_UPLOAD_INTERVAL_MINUTES),
            auto_upload_enabled: parse_bool(
                self.get_pref(KEY_AUTO_UPLOAD)?,
                defaults.auto_upload_enabled,
            ),
            last_successful_upload: self
                .get_pref(KEY_LAST_UPLOAD)?
                .and_then(|v| v.parse().ok()),
        })
    }

    /// Persist the preference block in one transaction.
    ///
    /// The upload interval is stored with the floor applied.
    pub fn save_preferences(&self, prefs: &Preferences) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.set_pref(KEY_WIFI_ONLY, &prefs.wifi_only.to_string())?;
        self.set_pref(KEY_REQUIRES_CHARGING, &prefs.requires_charging.to_string())?;
        self.set_pref(
            KEY_UPLOAD_INTERVAL,
            &prefs.effective_interval_minutes().to_string(),
        )?;
        self.set_pref(KEY_AUTO_UPLOAD, &prefs.auto_upload_enabled.to_string())?;
        match prefs.last_successful_upload {
            Some(ts) => self.set_pref(KEY_LAST_UPLOAD, &ts.to_string())?,
            None => {
                tx.execute("DELETE FROM preferences WHERE key = ?", [KEY_LAST_UPLOAD])?;
            }
        }
        tx.commit()?;

        debug!(?prefs, "Saved preferences");
        Ok(())
    }

    /// Record the time of the last successful upload.
    pub fn set_last_successful_upload(&self, at: EpochMillis) -> Result<()> {
        self.set_pref(KEY_LAST_UPLOAD, &at.to_string())
    }
}
