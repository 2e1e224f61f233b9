//! Batched persistence of pushed sensor samples.
//!
//! A [`Producer`] takes a [`SampleSource`], throttles its samples to the
//! configured rate and writes them to the store as `pending`
//! [`SensorReading`]s in batches. Writes happen on spawned tasks so a slow
//! store never stalls sampling.
//!
//! Stopping the producer is graceful: intake stops, the periodic flush is
//! cancelled, in-flight writes finish and whatever is left in memory is
//! written before [`Producer::stop`] returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use uplink_store::SensorReading;
use uplink_types::{EpochMillis, Sample};

use crate::SharedStore;
use crate::error::{Error, Result};
use crate::traits::SampleSource;

/// Options for a [`Producer`].
///
/// ```
/// use std::time::Duration;
/// use uplink_core::ProducerOptions;
///
/// let options = ProducerOptions::builder()
///     .owner_id("participant-7")
///     .sampling_rate_hz(10)
///     .flush_interval(Duration::from_secs(5))
///     .build();
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Owner recorded on every reading.
    pub owner_id: String,
    /// Target sampling rate; faster samples are dropped. Default: 5 Hz.
    pub sampling_rate_hz: u32,
    /// Flush once this many samples are buffered. Default: 50.
    pub batch_size: usize,
    /// Flush at least this often while samples are buffered. Default: 10 s.
    pub flush_interval: Duration,
    /// Capacity of the source-to-consumer channel. Default: 256.
    pub channel_capacity: usize,
    /// Readings kept in memory after failed writes. Default: 1000.
    pub max_retained: usize,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            owner_id: "participant".to_string(),
            sampling_rate_hz: 5,
            batch_size: 50,
            flush_interval: Duration::from_secs(10),
            channel_capacity: 256,
            max_retained: 1000,
        }
    }
}

impl ProducerOptions {
    /// Create a new builder for ProducerOptions.
    pub fn builder() -> ProducerOptionsBuilder {
        ProducerOptionsBuilder::default()
    }

    /// Minimum spacing between accepted samples.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.sampling_rate_hz.max(1)))
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::invalid_config("owner_id must not be empty"));
        }
        if self.sampling_rate_hz == 0 {
            return Err(Error::invalid_config("sampling_rate_hz must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::invalid_config("flush_interval must be > 0"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::invalid_config("channel_capacity must be > 0"));
        }
        Ok(())
    }
}

/// Builder for ProducerOptions.
#[derive(Debug, Clone, Default)]
pub struct ProducerOptionsBuilder {
    options: ProducerOptions,
}

impl ProducerOptionsBuilder {
    /// Set the owner recorded on every reading.
    #[must_use]
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.options.owner_id = owner_id.into();
        self
    }

    /// Set the target sampling rate.
    #[must_use]
    pub fn sampling_rate_hz(mut self, hz: u32) -> Self {
        self.options.sampling_rate_hz = hz;
        self
    }

    /// Set the size-triggered flush threshold.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.options.batch_size = size;
        self
    }

    /// Set the time-triggered flush interval.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.options.flush_interval = interval;
        self
    }

    /// Set the channel capacity.
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.options.channel_capacity = capacity;
        self
    }

    /// Set how many readings survive failed writes.
    #[must_use]
    pub fn max_retained(mut self, max: usize) -> Self {
        self.options.max_retained = max;
        self
    }

    /// Build the ProducerOptions.
    #[must_use]
    pub fn build(self) -> ProducerOptions {
        self.options
    }
}

/// Point-in-time view of a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerStatus {
    /// Sensor kind being collected.
    pub sensor_kind: String,
    /// Whether samples are still being accepted.
    pub is_collecting: bool,
    /// Samples accepted since start.
    pub total_collected: u64,
    /// Samples dropped for arriving faster than the sampling rate.
    pub dropped_by_throttle: u64,
    /// Readings discarded because the retry buffer was full.
    pub dropped_on_overflow: u64,
    /// Capture time of the last accepted sample.
    pub last_sample_at: Option<EpochMillis>,
    /// Readings held in memory (current batch plus retry buffer).
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct Batch {
    readings: Vec<SensorReading>,
    last_sample_at: Option<EpochMillis>,
}

#[derive(Debug)]
struct Shared {
    sensor_kind: String,
    owner_id: String,
    sampling_rate_hz: u32,
    batch_size: usize,
    max_retained: usize,
    batch: Mutex<Batch>,
    retained: Mutex<VecDeque<SensorReading>>,
    collecting: AtomicBool,
    collected: AtomicU64,
    throttled: AtomicU64,
    overflowed: AtomicU64,
}

impl Shared {
    fn to_reading(&self, sample: Sample) -> SensorReading {
        let metadata = json!({
            "accuracy": sample.accuracy,
            "sampling_rate_hz": self.sampling_rate_hz,
        });
        let reading = SensorReading::new(
            &self.owner_id,
            &self.sensor_kind,
            sample.timestamp,
            sample.values,
        );
        match metadata {
            serde_json::Value::Object(map) => reading.with_metadata(map),
            _ => reading,
        }
    }

    /// Append a reading; returns the batch snapshot when it is full.
    async fn push(&self, reading: SensorReading) -> Option<Vec<SensorReading>> {
        let mut batch = self.batch.lock().await;
        batch.last_sample_at = Some(reading.timestamp);
        batch.readings.push(reading);
        self.collected.fetch_add(1, Ordering::Relaxed);
        if batch.readings.len() >= self.batch_size {
            Some(std::mem::take(&mut batch.readings))
        } else {
            None
        }
    }

    async fn take(&self) -> Vec<SensorReading> {
        std::mem::take(&mut self.batch.lock().await.readings)
    }

    /// The current batch, when it or the retry buffer has anything to write.
    async fn take_due(&self) -> Option<Vec<SensorReading>> {
        let snapshot = self.take().await;
        if snapshot.is_empty() && self.retained.lock().await.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    async fn requeue(&self, readings: Vec<SensorReading>) {
        let mut retained = self.retained.lock().await;
        retained.extend(readings);
        let excess = retained.len().saturating_sub(self.max_retained);
        if excess > 0 {
            retained.drain(..excess);
            self.overflowed.fetch_add(excess as u64, Ordering::Relaxed);
            warn!(
                sensor_kind = %self.sensor_kind,
                "Retry buffer full, dropped {} oldest readings",
                excess
            );
        }
    }
}

/// Write `readings`, preceded by anything left over from failed writes.
///
/// On failure every reading goes back into the retry buffer.
async fn write_snapshot(
    shared: &Shared,
    store: &SharedStore,
    readings: Vec<SensorReading>,
) -> Result<usize> {
    let mut snapshot: Vec<SensorReading> = shared.retained.lock().await.drain(..).collect();
    snapshot.extend(readings);
    if snapshot.is_empty() {
        return Ok(0);
    }

    let result = store.lock().await.insert_sensor_readings(&snapshot);
    match result {
        Ok(ids) => {
            debug!(sensor_kind = %shared.sensor_kind, count = ids.len(), "Flushed readings");
            Ok(ids.len())
        }
        Err(e) => {
            warn!(
                sensor_kind = %shared.sensor_kind,
                "Failed to write {} readings, keeping them for the next flush: {}",
                snapshot.len(),
                e
            );
            shared.requeue(snapshot).await;
            Err(e.into())
        }
    }
}

/// Running collection from one [`SampleSource`].
pub struct Producer {
    source: Arc<dyn SampleSource>,
    store: SharedStore,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
    flushes: TaskTracker,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("sensor_kind", &self.shared.sensor_kind)
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Start collecting from `source`.
    ///
    /// Fails with [`Error::SensorUnavailable`] if the source reports itself
    /// unavailable, or [`Error::InvalidConfig`] for invalid options.
    pub async fn start(
        source: Arc<dyn SampleSource>,
        store: SharedStore,
        options: ProducerOptions,
    ) -> Result<Self> {
        options.validate()?;
        let sensor_kind = source.sensor_kind().to_string();
        if !source.is_available() {
            return Err(Error::SensorUnavailable(sensor_kind));
        }

        let (tx, rx) = mpsc::channel(options.channel_capacity);
        source.start(tx).await?;

        let shared = Arc::new(Shared {
            sensor_kind,
            owner_id: options.owner_id.clone(),
            sampling_rate_hz: options.sampling_rate_hz,
            batch_size: options.batch_size,
            max_retained: options.max_retained,
            batch: Mutex::new(Batch::default()),
            retained: Mutex::new(VecDeque::new()),
            collecting: AtomicBool::new(true),
            collected: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        });
        let flushes = TaskTracker::new();
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(consume(
            Arc::clone(&shared),
            Arc::clone(&store),
            rx,
            flushes.clone(),
            cancel_token.clone(),
            options.sample_interval(),
            options.flush_interval,
        ));

        info!(
            sensor_kind = %shared.sensor_kind,
            rate_hz = options.sampling_rate_hz,
            batch_size = options.batch_size,
            "Collection started"
        );

        Ok(Self {
            source,
            store,
            shared,
            handle,
            flushes,
            cancel_token,
        })
    }

    /// Snapshot of the producer's counters.
    pub async fn status(&self) -> ProducerStatus {
        let (batched, last_sample_at) = {
            let batch = self.shared.batch.lock().await;
            (batch.readings.len(), batch.last_sample_at)
        };
        let retained = self.shared.retained.lock().await.len();
        ProducerStatus {
            sensor_kind: self.shared.sensor_kind.clone(),
            is_collecting: self.shared.collecting.load(Ordering::Relaxed),
            total_collected: self.shared.collected.load(Ordering::Relaxed),
            dropped_by_throttle: self.shared.throttled.load(Ordering::Relaxed),
            dropped_on_overflow: self.shared.overflowed.load(Ordering::Relaxed),
            last_sample_at,
            buffered: batched + retained,
        }
    }

    /// Stop collecting and write everything still held in memory.
    ///
    /// Returns the final status. If the last write fails the error is
    /// returned and the unwritten readings are lost with the producer.
    pub async fn stop(mut self) -> Result<ProducerStatus> {
        self.source.stop().await;
        self.shared.collecting.store(false, Ordering::Relaxed);
        self.cancel_token.cancel();

        if let Err(e) = (&mut self.handle).await {
            warn!("Producer task ended abnormally: {}", e);
        }
        self.flushes.close();
        self.flushes.wait().await;

        let remaining = self.shared.take().await;
        let written = write_snapshot(&self.shared, &self.store, remaining).await?;
        let status = self.status().await;
        info!(
            sensor_kind = %status.sensor_kind,
            collected = status.total_collected,
            final_flush = written,
            "Collection stopped"
        );
        Ok(status)
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn consume(
    shared: Arc<Shared>,
    store: SharedStore,
    mut rx: mpsc::Receiver<Sample>,
    flushes: TaskTracker,
    cancel_token: CancellationToken,
    sample_interval: Duration,
    flush_interval: Duration,
) {
    let mut last_accepted: Option<Instant> = None;
    let flush_timer = sleep(flush_interval);
    tokio::pin!(flush_timer);

    let spawn_write = |readings: Vec<SensorReading>| {
        let shared = Arc::clone(&shared);
        let store = Arc::clone(&store);
        flushes.spawn(async move {
            // Failures are logged and re-queued inside write_snapshot.
            let _ = write_snapshot(&shared, &store, readings).await;
        });
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Producer cancelled, stopping intake");
                break;
            }
            _ = &mut flush_timer => {
                if let Some(snapshot) = shared.take_due().await {
                    spawn_write(snapshot);
                }
                flush_timer.as_mut().reset(Instant::now() + flush_interval);
            }
            sample = rx.recv() => {
                let Some(sample) = sample else {
                    debug!("Sample source closed");
                    if let Some(snapshot) = shared.take_due().await {
                        spawn_write(snapshot);
                    }
                    break;
                };

                let now = Instant::now();
                if last_accepted.is_some_and(|last| now.duration_since(last) < sample_interval) {
                    shared.throttled.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                last_accepted = Some(now);

                if let Some(snapshot) = shared.push(shared.to_reading(sample)).await {
                    spawn_write(snapshot);
                    flush_timer.as_mut().reset(Instant::now() + flush_interval);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplink_types::ValueMap;

    fn shared(max_retained: usize) -> Shared {
        Shared {
            sensor_kind: "accelerometer".into(),
            owner_id: "p1".into(),
            sampling_rate_hz: 5,
            batch_size: 3,
            max_retained,
            batch: Mutex::new(Batch::default()),
            retained: Mutex::new(VecDeque::new()),
            collecting: AtomicBool::new(true),
            collected: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_default_options() {
        let options = ProducerOptions::default();
        assert_eq!(options.sampling_rate_hz, 5);
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.flush_interval, Duration::from_secs(10));
        assert_eq!(options.max_retained, 1000);
        assert_eq!(options.sample_interval(), Duration::from_millis(200));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        assert!(ProducerOptions::builder().sampling_rate_hz(0).build().validate().is_err());
        assert!(ProducerOptions::builder().batch_size(0).build().validate().is_err());
        assert!(ProducerOptions::builder().owner_id(" ").build().validate().is_err());
        assert!(
            ProducerOptions::builder()
                .flush_interval(Duration::ZERO)
                .build()
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_reading_metadata() {
        let shared = shared(10);
        let mut values = ValueMap::new();
        values.insert("x".into(), json!(0.5));
        let reading = shared.to_reading(Sample::new(1_000, values).with_accuracy(3));

        assert_eq!(reading.owner_id, "p1");
        assert_eq!(reading.sensor_kind, "accelerometer");
        let metadata = reading.metadata.unwrap();
        assert_eq!(metadata["accuracy"], 3);
        assert_eq!(metadata["sampling_rate_hz"], 5);
    }

    #[tokio::test]
    async fn test_push_returns_full_batch() {
        let shared = shared(10);
        for ts in 0..2 {
            let reading = shared.to_reading(Sample::new(ts, ValueMap::new()));
            assert!(shared.push(reading).await.is_none());
        }
        let full = shared
            .push(shared.to_reading(Sample::new(2, ValueMap::new())))
            .await
            .unwrap();
        assert_eq!(full.len(), 3);
        assert!(shared.take().await.is_empty());
        assert_eq!(shared.batch.lock().await.last_sample_at, Some(2));
    }

    #[tokio::test]
    async fn test_requeue_drops_oldest() {
        let shared = shared(4);
        let readings: Vec<_> = (0..6)
            .map(|ts| shared.to_reading(Sample::new(ts, ValueMap::new())))
            .collect();
        shared.requeue(readings).await;

        let retained = shared.retained.lock().await;
        assert_eq!(retained.len(), 4);
        assert_eq!(retained.front().map(|r| r.timestamp), Some(2));
        assert_eq!(shared.overflowed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_retained_readings_are_due_without_a_batch() {
        let shared = shared(10);
        assert!(shared.take_due().await.is_none());

        shared
            .requeue(vec![shared.to_reading(Sample::new(1, ValueMap::new()))])
            .await;
        let due = shared.take_due().await.unwrap();
        assert!(due.is_empty());
        assert_eq!(shared.retained.lock().await.len(), 1);
    }
}
