//! Command-line collector and uploader for durable telemetry.
//!
//! The `uplink` binary wires the [`uplink_core`] pipeline to a local SQLite
//! queue and a remote ingestion API:
//!
//! - `uplink run [--simulate]` keeps the scheduler (and optionally a synthetic
//!   producer) running until Ctrl-C
//! - `uplink upload` performs one upload run now
//! - `uplink status`, `uplink batches` inspect the queue
//! - `uplink prefs`, `uplink purge`, `uplink login`, `uplink logout` manage it
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/uplink/uplink.toml`:
//!
//! ```toml
//! [storage]
//! path = "~/.local/share/uplink/telemetry.db"
//! retention_days = 7
//!
//! [api]
//! base_url = "https://ingest.example.org/v1"
//! study_code = "default-study"
//! timeout_secs = 30
//!
//! [upload]
//! owner_id = "participant"
//! page_size = 100
//! max_retries = 3
//! initial_backoff_secs = 30
//! max_backoff_secs = 3600
//!
//! [producer]
//! sensor_kind = "accelerometer"
//! sampling_rate_hz = 5
//! batch_size = 50
//! flush_interval_secs = 10
//! ```
//!
//! Upload preferences (network, charging, interval) are stored in the
//! database and edited with `uplink prefs`.

pub mod config;
pub mod host;
pub mod report;

pub use config::{
    ApiConfig, Config, ConfigError, ProducerConfig, StorageConfig, UploadConfig, ValidationError,
};
pub use host::{HostProbe, SyntheticSource};
pub use report::{StatusReport, format_batches, format_millis};
