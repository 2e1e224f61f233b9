//! In-memory implementations of the pipeline's boundaries for testing.
//!
//! Every mock records what it was asked to do and supports failure
//! injection, so worker, producer and scheduler behavior can be exercised
//! without a network, a sensor or a platform job scheduler.
//!
//! ```
//! use std::sync::Arc;
//! use uplink_core::mock::{MockAuth, MockIngest};
//!
//! # async fn example() {
//! let ingest = MockIngest::new();
//! ingest.fail_group("accelerometer").await;
//! let auth = Arc::new(MockAuth::logged_in("token"));
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use uplink_store::{DeviceState, Event, SensorReading};
use uplink_types::{NetworkKind, Sample};

use crate::error::{Error, Result};
use crate::scheduler::{ExistingWorkPolicy, WorkRequest, WorkState};
use crate::traits::{
    AuthProvider, ConstraintProbe, IngestClient, IngestReceipt, JobScheduler, SampleSource,
};

// ==========================================================================
// MockIngest
// ==========================================================================

/// One call received by [`MockIngest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestCall {
    /// Sensor kind, `events` or `device_states`.
    pub group: String,
    /// Idempotency key sent with the call.
    pub batch_id: String,
    /// Authorization header value.
    pub authorization: String,
    /// Number of items in the call.
    pub count: usize,
    /// Row IDs of the items, in call order.
    pub ids: Vec<i64>,
}

/// [`IngestClient`] that accepts or rejects calls as configured.
#[derive(Debug, Default)]
pub struct MockIngest {
    calls: RwLock<Vec<IngestCall>>,
    failing_groups: RwLock<HashSet<String>>,
    rejecting_groups: RwLock<HashSet<String>>,
    fail_all: AtomicBool,
    reject_auth: AtomicBool,
    latency_ms: AtomicU64,
}

impl MockIngest {
    /// Create a mock that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail calls for `group` (a sensor kind, `events` or `device_states`)
    /// with a 500.
    pub async fn fail_group(&self, group: &str) {
        self.failing_groups.write().await.insert(group.to_string());
    }

    /// Answer calls for `group` with 401.
    pub async fn reject_group(&self, group: &str) {
        self.rejecting_groups.write().await.insert(group.to_string());
    }

    /// Fail every call with a 500, or stop doing so.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::Relaxed);
    }

    /// Answer every call with 401, or stop doing so.
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::Relaxed);
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// All calls received so far.
    pub async fn calls(&self) -> Vec<IngestCall> {
        self.calls.read().await.clone()
    }

    /// Number of calls received so far.
    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    async fn handle(
        &self,
        group: &str,
        authorization: &str,
        batch_id: &str,
        ids: Vec<i64>,
    ) -> Result<IngestReceipt> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let count = ids.len();
        self.calls.write().await.push(IngestCall {
            group: group.to_string(),
            batch_id: batch_id.to_string(),
            authorization: authorization.to_string(),
            count,
            ids,
        });

        if self.reject_auth.load(Ordering::Relaxed)
            || self.rejecting_groups.read().await.contains(group)
        {
            return Err(Error::Unauthenticated);
        }
        if self.fail_all.load(Ordering::Relaxed) || self.failing_groups.read().await.contains(group)
        {
            return Err(Error::Api {
                status: 500,
                message: format!("mock failure for {group}"),
            });
        }

        Ok(IngestReceipt {
            message: format!("Accepted {count} items"),
            count: Some(count as u64),
        })
    }
}

#[async_trait]
impl IngestClient for MockIngest {
    async fn submit_sensor_readings(
        &self,
        authorization: &str,
        batch_id: &str,
        sensor_kind: &str,
        readings: &[SensorReading],
    ) -> Result<IngestReceipt> {
        let ids = readings.iter().map(|r| r.id).collect();
        self.handle(sensor_kind, authorization, batch_id, ids).await
    }

    async fn submit_events(
        &self,
        authorization: &str,
        batch_id: &str,
        events: &[Event],
    ) -> Result<IngestReceipt> {
        let ids = events.iter().map(|e| e.id).collect();
        self.handle("events", authorization, batch_id, ids).await
    }

    async fn submit_device_states(
        &self,
        authorization: &str,
        batch_id: &str,
        states: &[DeviceState],
    ) -> Result<IngestReceipt> {
        let ids = states.iter().map(|s| s.id).collect();
        self.handle("device_states", authorization, batch_id, ids)
            .await
    }
}

// ==========================================================================
// MockAuth
// ==========================================================================

/// [`AuthProvider`] holding a fixed token.
#[derive(Debug)]
pub struct MockAuth {
    token: RwLock<Option<String>>,
    header_requests: AtomicU32,
}

impl MockAuth {
    /// A provider that is logged in with `token`.
    pub fn logged_in(token: &str) -> Self {
        Self {
            token: RwLock::new(Some(token.to_string())),
            header_requests: AtomicU32::new(0),
        }
    }

    /// A provider with no credential.
    pub fn logged_out() -> Self {
        Self {
            token: RwLock::new(None),
            header_requests: AtomicU32::new(0),
        }
    }

    /// Replace the stored token.
    pub async fn set_token(&self, token: Option<&str>) {
        *self.token.write().await = token.map(String::from);
    }

    /// How often a header was requested.
    pub fn header_requests(&self) -> u32 {
        self.header_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn is_logged_in(&self) -> bool {
        self.token.read().await.is_some()
    }

    async fn authorization_header(&self) -> Option<String> {
        self.header_requests.fetch_add(1, Ordering::Relaxed);
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| format!("Bearer {t}"))
    }
}

// ==========================================================================
// MockSource
// ==========================================================================

/// [`SampleSource`] that replays scripted samples.
///
/// Samples are sent `spacing` apart. After the script ends the channel stays
/// open until [`SampleSource::stop`] is called.
#[derive(Debug)]
pub struct MockSource {
    sensor_kind: String,
    available: AtomicBool,
    samples: RwLock<Vec<Sample>>,
    spacing: Duration,
    stop_token: CancellationToken,
    starts: AtomicU32,
}

impl MockSource {
    /// Create an available source with no samples.
    pub fn new(sensor_kind: &str) -> Self {
        Self {
            sensor_kind: sensor_kind.to_string(),
            available: AtomicBool::new(true),
            samples: RwLock::new(Vec::new()),
            spacing: Duration::ZERO,
            stop_token: CancellationToken::new(),
            starts: AtomicU32::new(0),
        }
    }

    /// Set the samples replayed on start.
    #[must_use]
    pub fn with_samples(mut self, samples: Vec<Sample>) -> Self {
        self.samples = RwLock::new(samples);
        self
    }

    /// Set the delay before each sample.
    #[must_use]
    pub fn with_spacing(mut self, spacing: Duration) -> Self {
        self.spacing = spacing;
        self
    }

    /// Mark the sensor present or absent.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Whether [`SampleSource::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// How often the source was started.
    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SampleSource for MockSource {
    fn sensor_kind(&self) -> &str {
        &self.sensor_kind
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn start(&self, sink: mpsc::Sender<Sample>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::SensorUnavailable(self.sensor_kind.clone()));
        }
        self.starts.fetch_add(1, Ordering::Relaxed);

        let samples = self.samples.read().await.clone();
        let spacing = self.spacing;
        let token = self.stop_token.clone();
        tokio::spawn(async move {
            for sample in samples {
                if !spacing.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(spacing) => {}
                    }
                }
                if token.is_cancelled() || sink.send(sample).await.is_err() {
                    return;
                }
            }
            token.cancelled().await;
        });
        Ok(())
    }

    async fn stop(&self) {
        self.stop_token.cancel();
    }
}

// ==========================================================================
// StaticProbe
// ==========================================================================

/// [`ConstraintProbe`] reporting settable conditions.
#[derive(Debug)]
pub struct StaticProbe {
    network: RwLock<NetworkKind>,
    charging: AtomicBool,
}

impl StaticProbe {
    /// Create a probe reporting `network` and `charging`.
    pub fn new(network: NetworkKind, charging: bool) -> Self {
        Self {
            network: RwLock::new(network),
            charging: AtomicBool::new(charging),
        }
    }

    /// Change the reported network.
    pub async fn set_network(&self, network: NetworkKind) {
        *self.network.write().await = network;
    }

    /// Change the reported charging state.
    pub fn set_charging(&self, charging: bool) {
        self.charging.store(charging, Ordering::Relaxed);
    }
}

#[async_trait]
impl ConstraintProbe for StaticProbe {
    async fn network(&self) -> NetworkKind {
        *self.network.read().await
    }

    async fn is_charging(&self) -> bool {
        self.charging.load(Ordering::Relaxed)
    }
}

// ==========================================================================
// RecordingScheduler
// ==========================================================================

/// One registration received by [`RecordingScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    /// Unique work name.
    pub name: String,
    /// The request.
    pub request: WorkRequest,
    /// Policy for an existing registration.
    pub policy: ExistingWorkPolicy,
}

/// [`JobScheduler`] that only records what it is asked to do.
///
/// Registrations follow the policy rules (replace, update, keep) so the
/// current registration per name can be inspected; nothing ever runs.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    enqueued: RwLock<Vec<Enqueued>>,
    cancelled: RwLock<Vec<String>>,
    current: RwLock<HashMap<String, WorkRequest>>,
}

impl RecordingScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every enqueue call, in order.
    pub async fn enqueued(&self) -> Vec<Enqueued> {
        self.enqueued.read().await.clone()
    }

    /// Every cancelled name, in order.
    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.read().await.clone()
    }

    /// The live registration for `name`.
    pub async fn current(&self, name: &str) -> Option<WorkRequest> {
        self.current.read().await.get(name).copied()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn enqueue_unique(&self, name: &str, request: WorkRequest, policy: ExistingWorkPolicy) {
        self.enqueued.write().await.push(Enqueued {
            name: name.to_string(),
            request,
            policy,
        });

        let mut current = self.current.write().await;
        if policy == ExistingWorkPolicy::Keep && current.contains_key(name) {
            return;
        }
        current.insert(name.to_string(), request);
    }

    async fn cancel_unique(&self, name: &str) {
        self.cancelled.write().await.push(name.to_string());
        self.current.write().await.remove(name);
    }

    async fn state(&self, name: &str) -> Option<WorkState> {
        self.current
            .read()
            .await
            .get(name)
            .map(|_| WorkState::Enqueued)
    }
}
