// Control request handler: administrative operations on the running scheduler

use crate::control::protocol::{ControlOperation, ControlReply, ControlRequest, ControlSettings};
use crate::job::{immediate_job_id, NewJob, TaskContext};
use crate::persistence::{Backend, ConnectionSettings, Locator};
use crate::scheduler::Scheduler;
use crate::task::TaskDefinition;
use crate::telemetry;
use crate::trigger::Trigger;
use anyhow::{anyhow, Context};
use std::future::Future;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Serves control requests against one scheduler.
///
/// `get_jobs` answers directly. `reset_task` and `run_task` touch the persistence
/// backend, so they are handed to a worker task and acknowledged with "OK" straight
/// away; the caller only sees the effect on a later `get_jobs`. Worker failures are
/// logged and never reach the caller.
pub struct ControlHandler {
    workers: Workers,
    default_connection: ConnectionSettings,
    tracker: TaskTracker,
}

/// Everything a worker needs, cloned into each spawned task
#[derive(Clone)]
struct Workers {
    scheduler: Arc<dyn Scheduler>,
    backend: Arc<dyn Backend>,
    locator: Arc<dyn Locator>,
    container_path: Arc<str>,
}

impl ControlHandler {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        backend: Arc<dyn Backend>,
        locator: Arc<dyn Locator>,
        container_path: &str,
        default_connection: ConnectionSettings,
    ) -> Self {
        Self {
            workers: Workers {
                scheduler,
                backend,
                locator,
                container_path: Arc::from(container_path),
            },
            default_connection,
            tracker: TaskTracker::new(),
        }
    }

    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn handle(&self, request: ControlRequest) -> ControlReply {
        telemetry::record_control_request(request.operation.as_str(), "accepted");
        match request.operation {
            ControlOperation::GetJobs => ControlReply::Jobs(self.get_jobs().await),
            ControlOperation::ResetTask => self.reset_task(request.settings),
            ControlOperation::RunTask => self.run_task(request.settings),
        }
    }

    /// Decode and handle a raw request; undecodable payloads get an error reply
    pub async fn handle_payload(&self, payload: &[u8]) -> ControlReply {
        match serde_json::from_slice::<ControlRequest>(payload) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!(error = %e, "Malformed control request");
                telemetry::record_control_request("unknown", "rejected");
                ControlReply::error(format!("malformed request: {}", e))
            }
        }
    }

    /// Descriptions of every live job
    pub async fn get_jobs(&self) -> Vec<String> {
        self.workers
            .scheduler
            .get_jobs()
            .await
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Replace the schedule of `settings.task_name` with the task's current trigger
    pub fn reset_task(&self, settings: ControlSettings) -> ControlReply {
        let workers = self.workers.clone();
        let connection = self.connection_for(&settings);
        self.spawn_worker(ControlOperation::ResetTask, async move {
            workers.reset_task(settings, connection).await
        });
        ControlReply::ok()
    }

    /// Fire `settings.task_name` once, as soon as the scheduler picks it up
    pub fn run_task(&self, settings: ControlSettings) -> ControlReply {
        let workers = self.workers.clone();
        let connection = self.connection_for(&settings);
        self.spawn_worker(ControlOperation::RunTask, async move {
            workers.run_task(settings, connection).await
        });
        ControlReply::ok()
    }

    /// Wait for every worker spawned so far to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Number of workers still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn connection_for(&self, settings: &ControlSettings) -> ConnectionSettings {
        settings
            .connection
            .clone()
            .unwrap_or_else(|| self.default_connection.clone())
    }

    fn spawn_worker<F>(&self, operation: ControlOperation, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        debug!(operation = %operation, "Spawning control worker");
        self.tracker.spawn(async move {
            if let Err(e) = work.await {
                error!(
                    operation = %operation,
                    error = %format!("{:#}", e),
                    "Control worker failed"
                );
                telemetry::record_control_request(operation.as_str(), "failed");
            }
        });
    }
}

impl Workers {
    /// Open a fresh session, drop any inherited state and look the task up
    async fn locate_task(
        &self,
        connection: &ConnectionSettings,
        task_name: &str,
    ) -> anyhow::Result<Option<TaskDefinition>> {
        let mut session = self
            .backend
            .open(connection)
            .await
            .context("Failed to open persistence session")?;
        session.abort();

        let container = self
            .locator
            .resolve(session.as_mut(), &self.container_path)
            .await;
        // Read-only: never commit from a control worker
        session.abort();

        let container = container?
            .ok_or_else(|| anyhow!("Container '{}' not found", self.container_path))?;
        Ok(container.task(task_name).cloned())
    }

    async fn resolve(
        &self,
        operation: ControlOperation,
        settings: &ControlSettings,
        connection: &ConnectionSettings,
    ) -> anyhow::Result<Option<(String, TaskDefinition)>> {
        let Some(task_name) = settings.task_name.as_deref() else {
            warn!(operation = %operation, "Control request without task_name, ignoring");
            return Ok(None);
        };

        match self.locate_task(connection, task_name).await? {
            Some(task) => Ok(Some((task_name.to_string(), task))),
            None => {
                warn!(
                    operation = %operation,
                    task_name = %task_name,
                    "Task not found, nothing to do"
                );
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, fields(task_name = ?settings.task_name, job_id = ?settings.job_id))]
    async fn reset_task(
        &self,
        settings: ControlSettings,
        connection: ConnectionSettings,
    ) -> anyhow::Result<()> {
        let Some((task_name, task)) = self
            .resolve(ControlOperation::ResetTask, &settings, &connection)
            .await?
        else {
            return Ok(());
        };

        let replacement = task.trigger().cloned().map(|trigger| {
            NewJob::new(task_name, trigger, TaskContext::scheduled(connection))
                .with_id(task.internal_id.clone())
        });

        match self
            .scheduler
            .reschedule_job(settings.job_id.as_deref(), replacement)
            .await?
        {
            Some(job) => info!(job = %job, "Task schedule reset"),
            None => info!(
                internal_id = %task.internal_id,
                "Task has no future run, schedule cleared"
            ),
        }
        Ok(())
    }

    #[instrument(skip_all, fields(task_name = ?settings.task_name))]
    async fn run_task(
        &self,
        settings: ControlSettings,
        connection: ConnectionSettings,
    ) -> anyhow::Result<()> {
        let Some((task_name, task)) = self
            .resolve(ControlOperation::RunTask, &settings, &connection)
            .await?
        else {
            return Ok(());
        };

        let job = self
            .scheduler
            .add_job(
                NewJob::new(task_name, Trigger::immediate(), TaskContext::immediate(connection))
                    .with_id(immediate_job_id(&task.internal_id)),
            )
            .await?;
        info!(job = %job, "Immediate run scheduled");
        Ok(())
    }
}
