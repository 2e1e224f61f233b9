//! Durable telemetry upload pipeline.
//!
//! This crate moves locally captured telemetry to a remote ingestion API
//! under unreliable connectivity. Everything is written to the
//! [`uplink_store`] SQLite queue first; an [`UploadWorker`] later drains the
//! backlog in groups, and an [`UploadScheduler`] decides when that happens.
//!
//! # Features
//!
//! - **Producer adapter**: throttled, batched persistence of pushed sensor samples
//! - **Upload worker**: claim, send, and record outcomes per group with retry budget
//! - **Scheduling**: immediate and periodic runs gated on network and charging
//! - **Backoff**: exponential delays with jitter between failed attempts
//! - **Auth**: bearer tokens persisted to disk and refreshed before expiry
//! - **Mocks**: in-memory boundaries with failure injection for tests
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Producer`] | [`SampleSource`] → pending sensor readings |
//! | [`UploadWorker`] | pending rows → [`IngestClient`] → uploaded/failed |
//! | [`UploadScheduler`] | preferences → [`JobScheduler`] registrations |
//! | [`LocalJobRunner`] | tokio implementation of [`JobScheduler`] |
//! | [`ApiClient`] | `reqwest` implementation of [`IngestClient`] |
//! | [`TokenAuth`] | persisted-token implementation of [`AuthProvider`] |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tokio::sync::Mutex;
//! use uplink_core::{ApiClient, SharedStore, TokenAuth, UploadWorker, WorkerOptions};
//! use uplink_store::Store;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: SharedStore = Arc::new(Mutex::new(Store::open_default()?));
//!     let timeout = Duration::from_secs(30);
//!     let client = ApiClient::new("https://api.example.org/v1", "default-study", timeout)?;
//!     let auth = TokenAuth::load("https://api.example.org/v1", timeout, "tokens.json".as_ref())?;
//!
//!     let worker = UploadWorker::new(store, Arc::new(auth), Arc::new(client), WorkerOptions::default());
//!     println!("{}", worker.run().await);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod client;
pub mod error;
pub mod mock;
pub mod producer;
pub mod runner;
pub mod scheduler;
pub mod traits;
pub mod util;
pub mod worker;

/// Store handle shared between the producer, the worker and the CLI.
///
/// `rusqlite::Connection` is not `Sync`; every access locks, performs one
/// store operation and releases.
pub type SharedStore = std::sync::Arc<tokio::sync::Mutex<uplink_store::Store>>;

pub use auth::{DEFAULT_REFRESH_BUFFER, TokenAuth, TokenSet};
pub use backoff::{BackoffPolicy, with_retry};
pub use client::{ApiClient, IDEMPOTENCY_HEADER};
pub use error::{Error, Result};
pub use producer::{Producer, ProducerOptions, ProducerOptionsBuilder, ProducerStatus};
pub use runner::{DEFAULT_CONSTRAINT_POLL, Job, LocalJobRunner};
pub use scheduler::{
    ExistingWorkPolicy, IMMEDIATE_WORK_NAME, MIN_PERIODIC_INTERVAL, PERIODIC_WORK_NAME,
    UploadScheduler, WorkKind, WorkRequest, WorkState,
};
pub use traits::{
    AuthProvider, ConstraintProbe, IngestClient, IngestReceipt, JobScheduler, SampleSource,
};
pub use util::{days_to_millis, now_millis};
pub use worker::{UploadWorker, WorkResult, WorkerOptions};

// Re-export from uplink-types
pub use uplink_types::{Constraints, DataKind, EpochMillis, NetworkKind, Sample, UploadStatus};
