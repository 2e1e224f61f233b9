//! Trait abstractions for the pipeline's external collaborators.
//!
//! Each boundary has a production implementation in this crate and a mock in
//! [`crate::mock`]:
//!
//! | Trait | Production | Mock |
//! |-------|------------|------|
//! | [`AuthProvider`] | [`TokenAuth`](crate::TokenAuth) | [`MockAuth`](crate::mock::MockAuth) |
//! | [`IngestClient`] | [`ApiClient`](crate::ApiClient) | [`MockIngest`](crate::mock::MockIngest) |
//! | [`SampleSource`] | platform sensor bindings | [`MockSource`](crate::mock::MockSource) |
//! | [`JobScheduler`] | [`LocalJobRunner`](crate::LocalJobRunner) | [`RecordingScheduler`](crate::mock::RecordingScheduler) |
//! | [`ConstraintProbe`] | platform connectivity/power APIs | [`StaticProbe`](crate::mock::StaticProbe) |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use uplink_store::{DeviceState, Event, SensorReading};
use uplink_types::{NetworkKind, Sample};

use crate::error::Result;
use crate::scheduler::{ExistingWorkPolicy, WorkRequest, WorkState};

/// Source of bearer credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Whether a credential is stored at all.
    async fn is_logged_in(&self) -> bool;

    /// Full `Authorization` header value (`Bearer <token>`), refreshing the
    /// token first if it is close to expiry. `None` when no usable
    /// credential is available.
    async fn authorization_header(&self) -> Option<String>;
}

/// Acknowledgement returned by the ingestion endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Human-readable confirmation.
    #[serde(default)]
    pub message: String,
    /// Number of items the remote accepted, if reported.
    #[serde(default)]
    pub count: Option<u64>,
}

/// Remote ingestion boundary: one call per upload group.
///
/// `authorization` is the full header value from [`AuthProvider`];
/// `batch_id` travels as the idempotency key.
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Submit readings of one sensor kind.
    async fn submit_sensor_readings(
        &self,
        authorization: &str,
        batch_id: &str,
        sensor_kind: &str,
        readings: &[SensorReading],
    ) -> Result<IngestReceipt>;

    /// Submit events.
    async fn submit_events(
        &self,
        authorization: &str,
        batch_id: &str,
        events: &[Event],
    ) -> Result<IngestReceipt>;

    /// Submit device-state snapshots.
    async fn submit_device_states(
        &self,
        authorization: &str,
        batch_id: &str,
        states: &[DeviceState],
    ) -> Result<IngestReceipt>;
}

/// A sensor that pushes raw samples.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Sensor kind tag, e.g. `accelerometer`.
    fn sensor_kind(&self) -> &str;

    /// Whether the sensor exists on this device.
    fn is_available(&self) -> bool;

    /// Start pushing samples onto `sink` until [`SampleSource::stop`] is
    /// called or the receiver is dropped.
    async fn start(&self, sink: mpsc::Sender<Sample>) -> Result<()>;

    /// Stop pushing samples.
    async fn stop(&self);
}

/// Current device conditions relevant to upload constraints.
#[async_trait]
pub trait ConstraintProbe: Send + Sync {
    /// Current connectivity.
    async fn network(&self) -> NetworkKind;

    /// Whether the device is charging.
    async fn is_charging(&self) -> bool;
}

/// Platform job scheduling boundary.
///
/// Implementations run the registered work at least once per request,
/// honoring its constraints, and back off when the work asks to retry.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Register work under a unique name.
    async fn enqueue_unique(&self, name: &str, request: WorkRequest, policy: ExistingWorkPolicy);

    /// Remove the registration with this name. An in-flight run finishes.
    async fn cancel_unique(&self, name: &str);

    /// State of the registration with this name, if any.
    async fn state(&self, name: &str) -> Option<WorkState>;
}
