//! Process-local job scheduling.
//!
//! [`LocalJobRunner`] implements [`JobScheduler`] with one tokio task per
//! unique registration. Each task waits for its constraints (polling a
//! [`ConstraintProbe`]), runs the job, and then either finishes, sleeps until
//! the next periodic run, or backs off when the job returned
//! [`WorkResult::Retry`]. Cancelling a registration stops its task at the
//! next wait; a run already in progress always completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use uplink_types::Constraints;

use crate::scheduler::{ExistingWorkPolicy, WorkRequest, WorkState};
use crate::traits::{ConstraintProbe, JobScheduler};
use crate::worker::{UploadWorker, WorkResult};

/// How often unmet constraints are re-checked by default.
pub const DEFAULT_CONSTRAINT_POLL: Duration = Duration::from_secs(30);

/// The work a runner executes for every registration.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, WorkResult> + Send + Sync>;

struct Registration {
    token: CancellationToken,
    request: watch::Sender<WorkRequest>,
    state: watch::Receiver<WorkState>,
    handle: JoinHandle<()>,
}

impl Registration {
    fn is_finished(&self) -> bool {
        self.token.is_cancelled() || self.state.borrow().is_finished() || self.handle.is_finished()
    }
}

/// [`JobScheduler`] backed by tokio tasks.
pub struct LocalJobRunner {
    job: Job,
    probe: Arc<dyn ConstraintProbe>,
    poll_interval: Duration,
    registrations: RwLock<HashMap<String, Registration>>,
}

impl std::fmt::Debug for LocalJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalJobRunner")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl LocalJobRunner {
    /// Create a runner executing `job`.
    pub fn new(job: Job, probe: Arc<dyn ConstraintProbe>) -> Self {
        Self {
            job,
            probe,
            poll_interval: DEFAULT_CONSTRAINT_POLL,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Create a runner whose job is one [`UploadWorker::run`].
    pub fn for_worker(worker: Arc<UploadWorker>, probe: Arc<dyn ConstraintProbe>) -> Self {
        let job: Job = Arc::new(move || {
            let worker = Arc::clone(&worker);
            async move { worker.run().await }.boxed()
        });
        Self::new(job, probe)
    }

    /// Set how often unmet constraints are re-checked.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Names of registrations that may still run.
    pub async fn active(&self) -> Vec<String> {
        let registrations = self.registrations.read().await;
        let mut names: Vec<String> = registrations
            .iter()
            .filter(|(_, r)| !r.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Cancel every registration and wait for the tasks to exit.
    ///
    /// Runs in progress complete first.
    pub async fn shutdown(&self) {
        let drained: Vec<Registration> = {
            let mut registrations = self.registrations.write().await;
            registrations.drain().map(|(_, r)| r).collect()
        };
        for registration in &drained {
            registration.token.cancel();
        }
        join_all(drained.into_iter().map(|r| r.handle))
            .await
            .into_iter()
            .for_each(|result| {
                if let Err(error) = result {
                    warn!(%error, "Job task panicked");
                }
            });
        info!("Job runner stopped");
    }

    fn spawn(&self, name: &str, request: WorkRequest) -> Registration {
        let token = CancellationToken::new();
        let (request_tx, request_rx) = watch::channel(request);
        let (state_tx, state_rx) = watch::channel(WorkState::Enqueued);

        let task = Task {
            job: Arc::clone(&self.job),
            probe: Arc::clone(&self.probe),
            poll_interval: self.poll_interval,
            request: request_rx,
            state: state_tx,
            token: token.clone(),
        };
        let span = info_span!("job", job.name = %name);
        let handle = tokio::spawn(task.drive().instrument(span));

        Registration {
            token,
            request: request_tx,
            state: state_rx,
            handle,
        }
    }
}

impl Drop for LocalJobRunner {
    fn drop(&mut self) {
        for registration in self.registrations.get_mut().values() {
            registration.token.cancel();
        }
    }
}

#[async_trait]
impl JobScheduler for LocalJobRunner {
    async fn enqueue_unique(&self, name: &str, request: WorkRequest, policy: ExistingWorkPolicy) {
        let mut registrations = self.registrations.write().await;

        if let Some(existing) = registrations.get(name)
            && !existing.is_finished()
        {
            match policy {
                ExistingWorkPolicy::Keep => {
                    debug!(name, "Keeping existing registration");
                    return;
                }
                ExistingWorkPolicy::Update => {
                    existing.request.send_replace(request);
                    debug!(name, "Updated existing registration");
                    return;
                }
                ExistingWorkPolicy::Replace => {
                    existing.token.cancel();
                    debug!(name, "Replacing existing registration");
                }
            }
        }

        let registration = self.spawn(name, request);
        registrations.insert(name.to_string(), registration);
        info!(name, periodic = request.is_periodic(), "Work enqueued");
    }

    async fn cancel_unique(&self, name: &str) {
        if let Some(registration) = self.registrations.read().await.get(name) {
            registration.token.cancel();
            info!(name, "Work cancelled");
        }
    }

    async fn state(&self, name: &str) -> Option<WorkState> {
        self.registrations
            .read()
            .await
            .get(name)
            .map(|r| *r.state.borrow())
    }
}

struct Task {
    job: Job,
    probe: Arc<dyn ConstraintProbe>,
    poll_interval: Duration,
    request: watch::Receiver<WorkRequest>,
    state: watch::Sender<WorkState>,
    token: CancellationToken,
}

impl Task {
    async fn drive(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let constraints = self.request.borrow_and_update().constraints;
            if !self.wait_for_constraints(constraints).await {
                break;
            }

            self.state.send_replace(WorkState::Running);
            let result = (self.job)().await;
            let finished_at = Instant::now();
            let request = *self.request.borrow_and_update();

            let delay = match &result {
                WorkResult::Retry => {
                    let delay = request.backoff.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(attempt, ?delay, "Job asked to retry, backing off");
                    delay
                }
                other => {
                    attempt = 0;
                    match request.interval() {
                        Some(interval) => interval,
                        None => {
                            let state = if other.is_success() {
                                WorkState::Succeeded
                            } else {
                                WorkState::Failed
                            };
                            self.state.send_replace(state);
                            debug!(%state, "One-shot job finished");
                            return;
                        }
                    }
                }
            };

            self.state.send_replace(WorkState::Enqueued);
            if !self.wait(finished_at, delay, attempt > 0).await {
                break;
            }
        }

        self.state.send_replace(WorkState::Cancelled);
        debug!("Job task exiting");
    }

    /// Poll until `constraints` hold. Returns false when cancelled.
    async fn wait_for_constraints(&self, constraints: Constraints) -> bool {
        loop {
            if self.token.is_cancelled() {
                return false;
            }
            let network = self.probe.network().await;
            let charging = self.probe.is_charging().await;
            if constraints.is_satisfied_by(network, charging) {
                return true;
            }

            self.state.send_replace(WorkState::Blocked);
            debug!(%network, charging, "Constraints not met, waiting");
            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Sleep `delay` from `from`. A periodic interval changed through
    /// [`ExistingWorkPolicy::Update`] moves the deadline unless the task is
    /// backing off. Returns false when cancelled.
    async fn wait(&mut self, from: Instant, delay: Duration, backing_off: bool) -> bool {
        let mut deadline = from + delay;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = sleep_until(deadline) => return true,
                changed = self.request.changed() => {
                    if changed.is_err() {
                        // Registration dropped without cancelling.
                        return false;
                    }
                    if !backing_off
                        && let Some(interval) = self.request.borrow_and_update().interval()
                    {
                        deadline = from + interval;
                        debug!(?interval, "Periodic interval updated");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::mock::StaticProbe;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uplink_types::NetworkKind;

    fn counting_job(counter: Arc<AtomicU32>, result: WorkResult) -> Job {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            let result = result.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                result
            }
            .boxed()
        })
    }

    fn success() -> WorkResult {
        WorkResult::Success {
            uploaded: 0,
            failed: 0,
            message: "No data to upload".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_runs_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let runner = LocalJobRunner::new(
            counting_job(Arc::clone(&runs), success()),
            Arc::new(StaticProbe::new(NetworkKind::Wifi, false)),
        );

        let request = WorkRequest::one_shot(Constraints::default(), BackoffPolicy::default());
        runner
            .enqueue_unique("once", request, ExistingWorkPolicy::Replace)
            .await;
        sleep(Duration::from_secs(3600)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.state("once").await, Some(WorkState::Succeeded));
        assert!(runner.active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_until_constraints_hold() {
        let runs = Arc::new(AtomicU32::new(0));
        let probe = Arc::new(StaticProbe::new(NetworkKind::Cellular, false));
        let runner = LocalJobRunner::new(counting_job(Arc::clone(&runs), success()), probe.clone())
            .poll_interval(Duration::from_secs(10));

        let request = WorkRequest::one_shot(Constraints::default(), BackoffPolicy::default());
        runner
            .enqueue_unique("wifi", request, ExistingWorkPolicy::Replace)
            .await;
        sleep(Duration::from_secs(25)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(runner.state("wifi").await, Some(WorkState::Blocked));

        probe.set_network(NetworkKind::Wifi).await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_policy_ignores_second_request() {
        let runs = Arc::new(AtomicU32::new(0));
        let runner = LocalJobRunner::new(
            counting_job(Arc::clone(&runs), success()),
            Arc::new(StaticProbe::new(NetworkKind::Wifi, false)),
        );
        let interval = Duration::from_secs(15 * 60);
        let request = WorkRequest::periodic(interval, Constraints::default(), BackoffPolicy::default());

        runner
            .enqueue_unique("p", request, ExistingWorkPolicy::Keep)
            .await;
        runner
            .enqueue_unique("p", request, ExistingWorkPolicy::Keep)
            .await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        runner.shutdown().await;
        assert!(runner.active().await.is_empty());
    }
}
