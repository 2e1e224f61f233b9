//! When upload runs happen.
//!
//! [`UploadScheduler`] turns upload preferences into registrations on a
//! [`JobScheduler`]: one immediate run under [`IMMEDIATE_WORK_NAME`] and one
//! recurring run under [`PERIODIC_WORK_NAME`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use uplink_store::{MIN_UPLOAD_INTERVAL_MINUTES, Preferences};
use uplink_types::Constraints;

use crate::backoff::BackoffPolicy;
use crate::traits::JobScheduler;

/// Unique name of the immediate upload registration.
pub const IMMEDIATE_WORK_NAME: &str = "telemetry_upload";

/// Unique name of the recurring upload registration.
pub const PERIODIC_WORK_NAME: &str = "telemetry_upload_periodic";

/// Shortest allowed interval between periodic runs.
pub const MIN_PERIODIC_INTERVAL: Duration =
    Duration::from_secs(MIN_UPLOAD_INTERVAL_MINUTES as u64 * 60);

/// Whether work runs once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkKind {
    /// Run once, retrying on `Retry` until it stops asking.
    OneShot,
    /// Run every `interval`.
    Periodic {
        /// Time between runs.
        interval: Duration,
    },
}

/// A unit of work handed to a [`JobScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// One-shot or periodic.
    pub kind: WorkKind,
    /// Conditions that must hold before a run starts.
    pub constraints: Constraints,
    /// Delay between a `Retry` result and the next attempt.
    pub backoff: BackoffPolicy,
}

impl WorkRequest {
    /// A single run.
    pub fn one_shot(constraints: Constraints, backoff: BackoffPolicy) -> Self {
        Self {
            kind: WorkKind::OneShot,
            constraints,
            backoff,
        }
    }

    /// A recurring run. Intervals below [`MIN_PERIODIC_INTERVAL`] are raised to it.
    pub fn periodic(interval: Duration, constraints: Constraints, backoff: BackoffPolicy) -> Self {
        Self {
            kind: WorkKind::Periodic {
                interval: interval.max(MIN_PERIODIC_INTERVAL),
            },
            constraints,
            backoff,
        }
    }

    /// Interval of a periodic request.
    pub fn interval(&self) -> Option<Duration> {
        match self.kind {
            WorkKind::OneShot => None,
            WorkKind::Periodic { interval } => Some(interval),
        }
    }

    /// Whether the request recurs.
    pub fn is_periodic(&self) -> bool {
        matches!(self.kind, WorkKind::Periodic { .. })
    }
}

/// What to do when a registration with the same name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingWorkPolicy {
    /// Drop the existing registration and start over.
    Replace,
    /// Keep the existing registration's timing, adopt the new request.
    Update,
    /// Leave the existing registration untouched.
    Keep,
}

/// Lifecycle of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Waiting for its start time.
    Enqueued,
    /// Start time reached, waiting for constraints to hold.
    Blocked,
    /// Work is executing.
    Running,
    /// One-shot work finished successfully.
    Succeeded,
    /// One-shot work finished with a failure.
    Failed,
    /// The registration was cancelled.
    Cancelled,
}

impl WorkState {
    /// Whether the registration will not run again.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkState::Succeeded | WorkState::Failed | WorkState::Cancelled
        )
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkState::Enqueued => "enqueued",
            WorkState::Blocked => "blocked",
            WorkState::Running => "running",
            WorkState::Succeeded => "succeeded",
            WorkState::Failed => "failed",
            WorkState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Registers upload runs with a [`JobScheduler`].
pub struct UploadScheduler {
    jobs: Arc<dyn JobScheduler>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for UploadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadScheduler")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl UploadScheduler {
    /// Create a scheduler with the default backoff policy.
    pub fn new(jobs: Arc<dyn JobScheduler>) -> Self {
        Self {
            jobs,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Set the backoff policy attached to every request.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run one upload as soon as `constraints` hold, replacing any immediate
    /// run that has not started yet.
    pub async fn schedule_immediate(&self, constraints: Constraints) {
        let request = WorkRequest::one_shot(constraints, self.backoff);
        self.jobs
            .enqueue_unique(IMMEDIATE_WORK_NAME, request, ExistingWorkPolicy::Replace)
            .await;
        info!(?constraints, "Immediate upload scheduled");
    }

    /// Run uploads every `interval_minutes` (at least
    /// [`MIN_UPLOAD_INTERVAL_MINUTES`]). Returns the interval in effect.
    pub async fn schedule_periodic(&self, interval_minutes: u32, constraints: Constraints) -> Duration {
        let minutes = interval_minutes.max(MIN_UPLOAD_INTERVAL_MINUTES);
        let interval = Duration::from_secs(u64::from(minutes) * 60);
        let request = WorkRequest::periodic(interval, constraints, self.backoff);
        self.jobs
            .enqueue_unique(PERIODIC_WORK_NAME, request, ExistingWorkPolicy::Update)
            .await;
        info!(minutes, ?constraints, "Periodic upload scheduled");
        interval
    }

    /// Stop future periodic runs.
    pub async fn cancel_periodic(&self) {
        self.jobs.cancel_unique(PERIODIC_WORK_NAME).await;
    }

    /// Clear both registrations. A run already in progress completes.
    pub async fn cancel_all(&self) {
        self.jobs.cancel_unique(IMMEDIATE_WORK_NAME).await;
        self.jobs.cancel_unique(PERIODIC_WORK_NAME).await;
        info!("All upload work cancelled");
    }

    /// Schedule or cancel periodic uploads to match `prefs`.
    ///
    /// Returns the periodic interval when auto-upload is enabled.
    pub async fn apply_preferences(&self, prefs: &Preferences) -> Option<Duration> {
        if prefs.auto_upload_enabled {
            Some(
                self.schedule_periodic(prefs.upload_interval_minutes, prefs.constraints())
                    .await,
            )
        } else {
            self.cancel_periodic().await;
            None
        }
    }

    /// State of the immediate run.
    pub async fn immediate_state(&self) -> Option<WorkState> {
        self.jobs.state(IMMEDIATE_WORK_NAME).await
    }

    /// State of the periodic registration.
    pub async fn periodic_state(&self) -> Option<WorkState> {
        self.jobs.state(PERIODIC_WORK_NAME).await
    }

    /// Whether an immediate run is executing.
    pub async fn is_upload_running(&self) -> bool {
        self.immediate_state().await == Some(WorkState::Running)
    }

    /// Whether an immediate run is waiting to start.
    pub async fn is_upload_enqueued(&self) -> bool {
        matches!(
            self.immediate_state().await,
            Some(WorkState::Enqueued | WorkState::Blocked)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_interval_floor() {
        let request = WorkRequest::periodic(
            Duration::from_secs(60),
            Constraints::default(),
            BackoffPolicy::default(),
        );
        assert_eq!(request.interval(), Some(Duration::from_secs(900)));
        assert!(request.is_periodic());
    }

    #[test]
    fn test_one_shot_has_no_interval() {
        let request = WorkRequest::one_shot(Constraints::any_network(), BackoffPolicy::default());
        assert_eq!(request.interval(), None);
        assert!(!request.is_periodic());
    }

    #[test]
    fn test_work_state_finished() {
        assert!(WorkState::Succeeded.is_finished());
        assert!(WorkState::Cancelled.is_finished());
        assert!(!WorkState::Blocked.is_finished());
        assert_eq!(WorkState::Running.to_string(), "running");
    }
}
