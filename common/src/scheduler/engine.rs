// Scheduler engine implementation

use crate::errors::SchedulerError;
use crate::job::{Invocation, Job, NewJob};
use crate::job_store::JobStore;
use crate::task::JobRunner;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on how long the loop sleeps between passes (in milliseconds)
    pub poll_interval_ms: u64,
    /// A single task invocation is cancelled after this long (in seconds)
    pub task_timeout_seconds: u64,
    /// How long `stop` waits for the loop and in-flight invocations (in seconds)
    pub shutdown_timeout_seconds: u64,
    /// Maximum number of jobs fired per pass
    pub max_jobs_per_poll: usize,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            task_timeout_seconds: 300,
            shutdown_timeout_seconds: 330,
            max_jobs_per_poll: 100,
        }
    }
}

/// Scheduler trait for job scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register a job and persist it; an existing job with the same id is replaced
    async fn add_job(&self, job: NewJob) -> Result<Job, SchedulerError>;

    /// Remove a job from the table and the store. Returns whether it was scheduled;
    /// unknown ids are not an error.
    async fn unschedule_job(&self, job_id: &str) -> Result<bool, SchedulerError>;

    /// Remove `old_job_id` and register `replacement` as one step: nothing can fire
    /// between the two.
    async fn reschedule_job(
        &self,
        old_job_id: Option<&str>,
        replacement: Option<NewJob>,
    ) -> Result<Option<Job>, SchedulerError>;

    /// Snapshot of the live jobs, ordered by next run time
    async fn get_jobs(&self) -> Vec<Job>;

    /// Start the firing loop; a no-op when already running
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Stop the firing loop and wait for it to exit; a no-op when not running
    async fn stop(&self) -> Result<(), SchedulerError>;

    /// Fire every job due now and wait for those invocations to finish.
    /// Returns how many were fired.
    async fn process_due_jobs(&self) -> Result<usize, SchedulerError>;
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    /// Cancels invocations still running when the shutdown window closes
    cancel: CancellationToken,
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
    running: Mutex<Option<RunningLoop>>,
}

struct EngineInner {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    /// The one lock guarding every read-modify-write of the job table
    jobs: Mutex<HashMap<String, Job>>,
    wakeup: Notify,
    /// Invocations fired by the loop; the loop never waits on them
    in_flight: TaskTracker,
}

impl SchedulerEngine {
    /// Create a new scheduler engine
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                runner,
                jobs: Mutex::new(HashMap::new()),
                wakeup: Notify::new(),
                in_flight: TaskTracker::new(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Load the persisted job table into memory, replacing what is there.
    /// Jobs whose run time passed while the process was down fire on the next pass.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, SchedulerError> {
        let persisted = self.inner.store.jobs().await?;
        let restored = persisted.len();

        let mut jobs = self.inner.jobs.lock().await;
        jobs.clear();
        for job in persisted {
            debug!(job_id = %job.id, next_run_time = %job.next_run_time, "Restored job");
            jobs.insert(job.id.clone(), job);
        }
        telemetry::update_scheduled_jobs(jobs.len());
        drop(jobs);

        self.inner.wakeup.notify_one();
        info!(restored, "Job table restored from store");
        Ok(restored)
    }

    /// Look up one live job
    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Number of task invocations currently running
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl EngineInner {
    fn build_job(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, SchedulerError> {
        new_job.trigger.validate()?;

        let id = new_job
            .id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let next_run_time = new_job
            .trigger
            .next_fire_time(None, now)?
            .ok_or_else(|| SchedulerError::NoNextFireTime { job_id: id.clone() })?;

        Ok(Job {
            id,
            task_name: new_job.task_name,
            trigger: new_job.trigger,
            args: new_job.args,
            context: new_job.context,
            next_run_time,
        })
    }

    async fn insert_locked(
        &self,
        jobs: &mut HashMap<String, Job>,
        job: Job,
    ) -> Result<(), SchedulerError> {
        self.store.add_job(&job).await?;

        info!(
            job_id = %job.id,
            task_name = %job.task_name,
            trigger = %job.trigger,
            next_run_time = %job.next_run_time,
            "Job scheduled"
        );
        let job_id = job.id.clone();
        if jobs.insert(job_id.clone(), job).is_some() {
            info!(job_id = %job_id, "Replaced existing job with the same id");
        }
        telemetry::update_scheduled_jobs(jobs.len());
        Ok(())
    }

    async fn remove_locked(
        &self,
        jobs: &mut HashMap<String, Job>,
        job_id: &str,
    ) -> Result<bool, SchedulerError> {
        self.store.remove_job(job_id).await?;

        let removed = jobs.remove(job_id).is_some();
        if removed {
            info!(job_id = %job_id, "Job unscheduled");
        } else {
            debug!(job_id = %job_id, "Job not scheduled, nothing to remove");
        }
        telemetry::update_scheduled_jobs(jobs.len());
        Ok(removed)
    }

    /// Advance (or drop) every due job under the table lock and hand back what to fire.
    ///
    /// Rescheduling happens before the task runs, so a slow or failing task never blocks
    /// its own next slot and a job cannot be claimed twice for the same slot.
    async fn claim_due_jobs(&self, now: DateTime<Utc>) -> Vec<Invocation> {
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|job| job.next_run_time <= now)
            .map(|job| (job.next_run_time, job.id.clone()))
            .collect();
        if due.is_empty() {
            return Vec::new();
        }
        due.sort();
        due.truncate(self.config.max_jobs_per_poll);

        let mut invocations = Vec::with_capacity(due.len());
        for (_, job_id) in due {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            invocations.push(job.invocation());

            let next = if job.trigger.is_one_shot() {
                None
            } else {
                match job.trigger.next_fire_time(Some(job.next_run_time), now) {
                    Ok(next) => next,
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "Failed to compute next fire time");
                        None
                    }
                }
            };

            match next {
                Some(next_run_time) => {
                    job.next_run_time = next_run_time;
                    if let Err(e) = self.store.update_job(job).await {
                        warn!(job_id = %job_id, error = %e, "Failed to persist rescheduled job");
                    }
                    debug!(job_id = %job_id, next_run_time = %next_run_time, "Job rescheduled");
                }
                None => {
                    jobs.remove(&job_id);
                    if let Err(e) = self.store.remove_job(&job_id).await {
                        warn!(job_id = %job_id, error = %e, "Failed to remove finished job from store");
                    }
                    debug!(job_id = %job_id, "Job finished, removed");
                }
            }
        }
        telemetry::update_scheduled_jobs(jobs.len());

        invocations
    }

    /// Spawn the claimed invocations onto the in-flight tracker and return without
    /// waiting for them. Each invocation logs and records its own outcome.
    fn fire(
        &self,
        invocations: Vec<Invocation>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        invocations
            .into_iter()
            .map(|invocation| {
                self.in_flight.spawn(run_invocation(
                    self.runner.clone(),
                    invocation,
                    self.config.task_timeout(),
                    cancel.clone(),
                ))
            })
            .collect()
    }

    async fn process_due_jobs(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let invocations = self.claim_due_jobs(now).await;
        if invocations.is_empty() {
            return Vec::new();
        }
        debug!(job_count = invocations.len(), "Firing due jobs");
        self.fire(invocations, cancel)
    }

    /// Sleep until the nearest next run time, capped at the poll interval
    async fn next_wakeup(&self, now: DateTime<Utc>) -> Duration {
        let poll_interval = self.config.poll_interval();
        self.jobs
            .lock()
            .await
            .values()
            .map(|job| job.next_run_time)
            .min()
            .map(|next| {
                (next - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(poll_interval)
            })
            .unwrap_or(poll_interval)
    }
}

/// One task invocation. Failures, panics and timeouts are logged here and never reach
/// the loop.
async fn run_invocation(
    runner: Arc<dyn JobRunner>,
    invocation: Invocation,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let run = AssertUnwindSafe(runner.run(&invocation)).catch_unwind();

    let outcome = tokio::select! {
        outcome = tokio::time::timeout(timeout, run) => outcome,
        _ = cancel.cancelled() => {
            warn!(
                job_id = %invocation.job_id,
                task_name = %invocation.task_name,
                "Task execution cancelled by scheduler shutdown"
            );
            telemetry::record_job_failure(&invocation.task_name, "cancelled");
            return;
        }
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(Ok(Ok(()))) => {
            info!(
                job_id = %invocation.job_id,
                task_name = %invocation.task_name,
                duration_ms = elapsed.as_millis() as u64,
                "Job fired successfully"
            );
            telemetry::record_job_success(&invocation.task_name);
            telemetry::record_job_duration(&invocation.task_name, elapsed.as_secs_f64());
        }
        Ok(Ok(Err(e))) => {
            error!(
                job_id = %invocation.job_id,
                task_name = %invocation.task_name,
                error = %e,
                "Task execution failed"
            );
            telemetry::record_job_failure(&invocation.task_name, "error");
            telemetry::record_job_duration(&invocation.task_name, elapsed.as_secs_f64());
        }
        Ok(Err(_)) => {
            error!(
                job_id = %invocation.job_id,
                task_name = %invocation.task_name,
                "Task invocation panicked"
            );
            telemetry::record_job_failure(&invocation.task_name, "panic");
        }
        Err(_) => {
            warn!(
                job_id = %invocation.job_id,
                task_name = %invocation.task_name,
                timeout_ms = elapsed.as_millis() as u64,
                "Task execution timed out and was cancelled"
            );
            telemetry::record_job_failure(&invocation.task_name, "timeout");
        }
    }
}

async fn run_loop(
    inner: Arc<EngineInner>,
    mut shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    info!(
        poll_interval_ms = inner.config.poll_interval_ms,
        "Scheduler loop started"
    );

    loop {
        // Handles are dropped: invocations stay tracked but the loop moves on
        let fired = inner.process_due_jobs(Utc::now(), &cancel).await.len();
        if fired > 0 {
            debug!(jobs_fired = fired, "Scheduler pass complete");
        }

        let wait = inner.next_wakeup(Utc::now()).await;
        tokio::select! {
            _ = sleep(wait) => {}
            _ = inner.wakeup.notified() => {
                debug!("Job table changed, re-evaluating");
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, stopping scheduler loop");
                    break;
                }
            }
        }
    }

    info!("Scheduler loop stopped");
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self, job), fields(task_name = %job.task_name))]
    async fn add_job(&self, job: NewJob) -> Result<Job, SchedulerError> {
        let job = self.inner.build_job(job, Utc::now())?;

        let mut jobs = self.inner.jobs.lock().await;
        self.inner.insert_locked(&mut jobs, job.clone()).await?;
        drop(jobs);

        self.inner.wakeup.notify_one();
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn unschedule_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let mut jobs = self.inner.jobs.lock().await;
        self.inner.remove_locked(&mut jobs, job_id).await
    }

    #[instrument(skip(self, replacement))]
    async fn reschedule_job(
        &self,
        old_job_id: Option<&str>,
        replacement: Option<NewJob>,
    ) -> Result<Option<Job>, SchedulerError> {
        let now = Utc::now();
        let replacement = match replacement.map(|job| self.inner.build_job(job, now)) {
            Some(Err(SchedulerError::NoNextFireTime { job_id })) => {
                warn!(
                    job_id = %job_id,
                    "Replacement trigger never fires again, not scheduling it"
                );
                None
            }
            other => other.transpose()?,
        };

        let mut jobs = self.inner.jobs.lock().await;
        if let Some(old_job_id) = old_job_id {
            self.inner.remove_locked(&mut jobs, old_job_id).await?;
        }
        if let Some(job) = &replacement {
            self.inner.insert_locked(&mut jobs, job.clone()).await?;
        }
        drop(jobs);

        self.inner.wakeup.notify_one();
        Ok(replacement)
    }

    async fn get_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.lock().await.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.next_run_time
                .cmp(&b.next_run_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        jobs
    }

    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("Scheduler already running");
                return Ok(());
            }
        }

        info!(
            poll_interval_ms = self.inner.config.poll_interval_ms,
            task_timeout_seconds = self.inner.config.task_timeout_seconds,
            "Starting scheduler engine"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(self.inner.clone(), shutdown_rx, cancel.clone()));
        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
            cancel,
        });
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        let Some(running) = self.running.lock().await.take() else {
            debug!("Scheduler not running");
            return Ok(());
        };

        info!("Stopping scheduler engine");
        let _ = running.shutdown_tx.send(true);

        let shutdown_timeout = self.inner.config.shutdown_timeout();
        let deadline = Instant::now() + shutdown_timeout;

        let mut handle = running.handle;
        match tokio::time::timeout(shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => debug!("Scheduler loop exited"),
            Ok(Err(e)) => error!(error = %e, "Scheduler loop terminated abnormally"),
            Err(_) => {
                warn!(
                    timeout_seconds = shutdown_timeout.as_secs(),
                    "Scheduler loop did not stop in time, aborting it"
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        // Let running invocations finish inside the same window, then cancel the rest
        self.inner.in_flight.close();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, self.inner.in_flight.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.inner.in_flight.len(),
                timeout_seconds = shutdown_timeout.as_secs(),
                "Task invocations still running at shutdown deadline, cancelling them"
            );
            running.cancel.cancel();
            self.inner.in_flight.wait().await;
        }
        self.inner.in_flight.reopen();

        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn process_due_jobs(&self) -> Result<usize, SchedulerError> {
        let handles = self
            .inner
            .process_due_jobs(Utc::now(), &CancellationToken::new())
            .await;
        let fired = handles.len();
        futures::future::join_all(handles).await;
        Ok(fired)
    }
}
