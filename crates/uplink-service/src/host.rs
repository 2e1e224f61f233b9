//! Host-side boundaries for the `uplink` binary.
//!
//! A desktop or server host has no battery or radio to inspect, so
//! [`HostProbe`] reports a wired, powered machine. [`SyntheticSource`]
//! produces a noisy three-axis signal for exercising the pipeline without
//! hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use uplink_core::{ConstraintProbe, Error, NetworkKind, Result, Sample, SampleSource, now_millis};

/// [`ConstraintProbe`] for a wired, mains-powered host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

#[async_trait]
impl ConstraintProbe for HostProbe {
    async fn network(&self) -> NetworkKind {
        NetworkKind::Ethernet
    }

    async fn is_charging(&self) -> bool {
        true
    }
}

/// Gravity on the z axis, in m/s².
const GRAVITY: f64 = 9.81;

/// [`SampleSource`] emitting a slow oscillation with random noise.
#[derive(Debug)]
pub struct SyntheticSource {
    sensor_kind: String,
    period: Duration,
    running: AtomicBool,
    token: CancellationToken,
}

impl SyntheticSource {
    /// Create a source emitting `rate_hz` samples per second.
    pub fn new(sensor_kind: &str, rate_hz: u32) -> Self {
        Self {
            sensor_kind: sensor_kind.to_string(),
            period: Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1))),
            running: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    /// Delay between emitted samples.
    pub fn period(&self) -> Duration {
        self.period
    }
}

fn synthetic_sample(step: u64) -> Sample {
    let mut rng = rand::rng();
    let phase = step as f64 / 10.0;
    let values = json!({
        "x": phase.sin() + rng.random_range(-0.05..0.05),
        "y": phase.cos() + rng.random_range(-0.05..0.05),
        "z": GRAVITY + rng.random_range(-0.05..0.05),
    });
    let values = values.as_object().cloned().unwrap_or_default();
    Sample::new(now_millis(), values).with_accuracy(3)
}

#[async_trait]
impl SampleSource for SyntheticSource {
    fn sensor_kind(&self) -> &str {
        &self.sensor_kind
    }

    fn is_available(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn start(&self, sink: mpsc::Sender<Sample>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::SensorUnavailable(self.sensor_kind.clone()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(kind = %self.sensor_kind, period = ?self.period, "Starting synthetic source");

        let period = self.period;
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut step = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if sink.send(synthetic_sample(step)).await.is_err() {
                            break;
                        }
                        step += 1;
                    }
                }
            }
            debug!(samples = step, "Synthetic source stopped");
        });
        Ok(())
    }

    async fn stop(&self) {
        self.token.cancel();
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_probe_satisfies_strict_constraints() {
        let probe = HostProbe;
        let constraints = uplink_core::Constraints {
            wifi_only: true,
            requires_charging: true,
        };
        assert!(constraints.is_satisfied_by(probe.network().await, probe.is_charging().await));
    }

    #[test]
    fn test_period_from_rate() {
        assert_eq!(SyntheticSource::new("accelerometer", 5).period(), Duration::from_millis(200));
        assert_eq!(SyntheticSource::new("accelerometer", 0).period(), Duration::from_secs(1));
    }

    #[test]
    fn test_sample_has_three_axes() {
        let sample = synthetic_sample(0);
        assert_eq!(sample.values.len(), 3);
        let z = sample.values["z"].as_f64().unwrap();
        assert!((z - GRAVITY).abs() < 0.1);
        assert_eq!(sample.accuracy, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_until_stopped() {
        let source = SyntheticSource::new("gyroscope", 10);
        let (tx, mut rx) = mpsc::channel(64);
        source.start(tx).await.unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        source.stop().await;
        assert!(!source.is_available());

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 5);

        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(source.start(tx).await, Err(Error::SensorUnavailable(_))));
    }
}
