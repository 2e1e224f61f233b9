//! Text and JSON rendering for the `status` and `batches` commands.

use std::fmt;
use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use uplink_core::EpochMillis;
use uplink_store::{PendingCounts, Preferences, Store, UploadBatch};

/// Format epoch milliseconds as RFC 3339, falling back to the raw number.
pub fn format_millis(millis: EpochMillis) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| millis.to_string())
}

/// Queue and preference snapshot printed by `uplink status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub database: PathBuf,
    pub pending: PendingCounts,
    pub preferences: Preferences,
}

impl StatusReport {
    /// Read the snapshot from `store`.
    pub fn collect(store: &Store, database: PathBuf) -> uplink_store::Result<Self> {
        Ok(Self {
            database,
            pending: store.pending_counts()?,
            preferences: store.preferences()?,
        })
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefs = &self.preferences;
        writeln!(f, "Database: {}", self.database.display())?;
        writeln!(f)?;
        writeln!(f, "Pending:")?;
        writeln!(f, "  sensor readings  {}", self.pending.sensor_readings)?;
        writeln!(f, "  events           {}", self.pending.events)?;
        writeln!(f, "  device states    {}", self.pending.device_states)?;
        writeln!(f, "  upload batches   {}", self.pending.upload_batches)?;
        writeln!(f)?;
        writeln!(f, "Preferences:")?;
        writeln!(f, "  wifi only          {}", prefs.wifi_only)?;
        writeln!(f, "  requires charging  {}", prefs.requires_charging)?;
        writeln!(f, "  interval           {} min", prefs.upload_interval_minutes)?;
        writeln!(f, "  auto upload        {}", prefs.auto_upload_enabled)?;
        match prefs.last_successful_upload {
            Some(at) => write!(f, "  last upload        {}", format_millis(at)),
            None => write!(f, "  last upload        never"),
        }
    }
}

/// Render upload-queue rows as an aligned table.
pub fn format_batches(batches: &[UploadBatch]) -> String {
    if batches.is_empty() {
        return "No upload batches".to_string();
    }

    let mut out = format!(
        "{:<36}  {:<13}  {:>5}  {:<9}  {:>5}  {:>8}  {}\n",
        "BATCH", "KIND", "ITEMS", "STATUS", "RETRY", "PRIORITY", "SCHEDULED"
    );
    for batch in batches {
        let _ = writeln!(
            out,
            "{:<36}  {:<13}  {:>5}  {:<9}  {:>5}  {:>8}  {}",
            batch.batch_id,
            batch.data_kind.as_str(),
            batch.item_count,
            batch.upload_status.as_str(),
            batch.retry_count,
            batch.priority,
            format_millis(batch.scheduled_at)
        );
    }
    out.truncate(out.trim_end().len());
    out
}
