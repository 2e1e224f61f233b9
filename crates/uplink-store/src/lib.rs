//! Durable local queue for telemetry awaiting upload.
//!
//! This crate provides SQLite-based storage for sensor readings, events and
//! device-state snapshots captured while offline, plus the upload-queue
//! table that groups them into batches and a small preference block.
//!
//! # Features
//!
//! - One upload state machine shared by every table ([`StatusTable`])
//! - FIFO pending queries and retry-eligible failed queries
//! - Bulk status updates that never move a row out of `Uploaded`
//! - Query by owner, kind and time range
//! - Item rows linked to the upload-queue batch they were sent under
//! - Retention sweep of uploaded rows
//!
//! # Example
//!
//! ```no_run
//! use uplink_store::{SensorReading, Store};
//!
//! let store = Store::open_default()?;
//!
//! let payload = serde_json::json!({"x": 0.1, "y": 0.0, "z": 9.8});
//! let reading = SensorReading::new(
//!     "participant-1",
//!     "accelerometer",
//!     1_700_000_000_000,
//!     payload.as_object().cloned().unwrap_or_default(),
//! );
//! store.insert_sensor_reading(&reading)?;
//!
//! let pending = store.pending::<SensorReading>(100)?;
//! # Ok::<(), uplink_store::Error>(())
//! ```

mod error;
mod models;
mod prefs;
mod queries;
mod schema;
mod status;
mod store;

pub use error::{Error, Result};
pub use models::{DeviceState, Event, PendingCounts, PurgeCounts, SensorReading, UploadBatch};
pub use prefs::{MIN_UPLOAD_INTERVAL_MINUTES, Preferences};
pub use queries::RecordQuery;
pub use status::{BatchMember, StatusTable};
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/uplink/telemetry.db`
/// - macOS: `~/Library/Application Support/uplink/telemetry.db`
/// - Windows: `C:\Users\<user>\AppData\Local\uplink\telemetry.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("uplink")
        .join("telemetry.db")
}
