// Scheduler process: wires the job store, scheduler and control handler together

use crate::config::Settings;
use crate::control::{ControlChannel, ControlHandler};
use crate::errors::{ProcessError, SchedulerError};
use crate::job::{NewJob, TaskContext};
use crate::job_store::PersistentJobStore;
use crate::persistence::{Backend, ConnectionSettings, Locator, PathLocator};
use crate::scheduler::{Scheduler, SchedulerEngine};
use crate::task::{TaskExecutor, TaskJobRunner};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// One deployable scheduler bound to one container and one control channel
pub struct SchedulerProcess {
    scheduler: Arc<SchedulerEngine>,
    handler: Arc<ControlHandler>,
    channel: Arc<dyn ControlChannel>,
    backend: Arc<dyn Backend>,
    locator: Arc<dyn Locator>,
    connection: ConnectionSettings,
    container_path: String,
}

impl SchedulerProcess {
    /// Build the process and load the persisted job table.
    ///
    /// Tasks in the container that have a trigger but no job yet are registered, so a
    /// fresh deployment starts with every recurring task scheduled.
    #[instrument(skip_all, fields(container_path = %settings.persistence.container_path))]
    pub async fn new(
        settings: &Settings,
        backend: Arc<dyn Backend>,
        executor: Arc<dyn TaskExecutor>,
        channel: Arc<dyn ControlChannel>,
    ) -> Result<Self, ProcessError> {
        settings.validate().map_err(ProcessError::Configuration)?;

        let container_path = settings.persistence.container_path.clone();
        let connection = settings.connection_settings();
        let locator: Arc<dyn Locator> = Arc::new(PathLocator::default());

        let store = Arc::new(PersistentJobStore::new(
            backend.clone(),
            connection.clone(),
            &container_path,
        ));
        let runner = Arc::new(TaskJobRunner::new(
            backend.clone(),
            locator.clone(),
            container_path.clone(),
            executor,
        ));
        let scheduler = Arc::new(SchedulerEngine::new(
            settings.scheduler_config(),
            store,
            runner,
        ));
        scheduler.restore().await?;

        let handler = Arc::new(ControlHandler::new(
            scheduler.clone(),
            backend.clone(),
            locator.clone(),
            &container_path,
            connection.clone(),
        ));

        let process = Self {
            scheduler,
            handler,
            channel,
            backend,
            locator,
            connection,
            container_path,
        };
        process.register_tasks().await?;

        info!("Scheduler process created");
        Ok(process)
    }

    /// Schedule every task with a trigger whose recurring job is missing.
    /// Returns how many jobs were added.
    #[instrument(skip(self))]
    pub async fn register_tasks(&self) -> Result<usize, ProcessError> {
        let mut session = self.backend.open(&self.connection).await?;
        let container = self
            .locator
            .resolve(session.as_mut(), &self.container_path)
            .await;
        session.abort();

        let Some(container) = container? else {
            warn!("Container not found, no tasks to register");
            return Ok(0);
        };

        let mut registered = 0;
        for (task_name, task) in &container.tasks {
            let Some(trigger) = task.trigger().cloned() else {
                continue;
            };
            if self.scheduler.job(&task.internal_id).await.is_some() {
                continue;
            }

            let job = NewJob::new(
                task_name.clone(),
                trigger,
                TaskContext::scheduled(self.connection.clone()),
            )
            .with_id(task.internal_id.clone());

            match self.scheduler.add_job(job).await {
                Ok(_) => registered += 1,
                Err(SchedulerError::NoNextFireTime { job_id }) => {
                    warn!(job_id = %job_id, "Task trigger never fires again, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(registered, "Tasks registered");
        Ok(registered)
    }

    /// Start the scheduler, then serve control requests until `shutdown` is called.
    ///
    /// On the way out the in-flight control workers are drained and the scheduler is
    /// stopped before the channel is closed.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ProcessError> {
        self.scheduler.start().await?;
        info!("Scheduler started, serving control channel");

        let served = self.channel.serve(self.handler.clone()).await;
        if let Err(e) = &served {
            error!(error = %e, "Control channel failed");
        }

        self.handler.drain().await;
        self.scheduler.stop().await?;
        self.channel.close().await?;
        info!("Scheduler process stopped");

        served.map_err(ProcessError::from)
    }

    /// Make a running `run` return
    pub fn shutdown(&self) {
        info!("Scheduler process shutdown requested");
        self.channel.shutdown();
    }

    /// Stop the scheduler, reload the job table from the store and start again.
    /// The control channel keeps serving throughout.
    #[instrument(skip(self))]
    pub async fn restart(&self) -> Result<(), ProcessError> {
        self.scheduler.stop().await?;
        self.scheduler.restore().await?;
        self.scheduler.start().await?;
        info!("Scheduler restarted");
        Ok(())
    }

    pub fn scheduler(&self) -> &Arc<SchedulerEngine> {
        &self.scheduler
    }

    pub fn handler(&self) -> &Arc<ControlHandler> {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::errors::ChannelError;
    use crate::job::Invocation;
    use crate::persistence::{ContainerNode, MemoryBackend, Session};
    use crate::task::TaskDefinition;
    use crate::trigger::Trigger;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Channel that serves nothing and returns on shutdown
    #[derive(Default)]
    struct IdleChannel {
        token: CancellationToken,
    }

    #[async_trait]
    impl ControlChannel for IdleChannel {
        async fn serve(&self, _handler: Arc<ControlHandler>) -> Result<(), ChannelError> {
            self.token.cancelled().await;
            Ok(())
        }

        fn shutdown(&self) {
            self.token.cancel();
        }

        async fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl TaskExecutor for NoopExecutor {
        async fn execute(
            &self,
            _task: &TaskDefinition,
            _invocation: &Invocation,
            _session: &mut dyn Session,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.persistence.backend = BackendKind::Memory;
        settings.persistence.url = "memory://".to_string();
        settings.scheduler.poll_interval_ms = 20;
        settings
    }

    async fn seeded_backend(settings: &Settings) -> MemoryBackend {
        let connection = settings.connection_settings();
        let backend = MemoryBackend::new();
        let root = ContainerNode::default().with_child("scheduler", "node:scheduler");
        let container = ContainerNode::default()
            .with_task(
                "report",
                TaskDefinition::new("report-1").with_trigger(Trigger::interval(3600)),
            )
            .with_task("manual", TaskDefinition::new("manual-1"))
            .with_task(
                "retired",
                TaskDefinition::new("retired-1").with_trigger(Trigger::Cron {
                    expression: "0 0 4 * * *".to_string(),
                    timezone: chrono_tz::UTC,
                    end_date: Some(chrono::Utc::now() - chrono::Duration::days(1)),
                }),
            );
        backend
            .seed(&connection, "root", serde_json::to_value(root).unwrap())
            .await;
        backend
            .seed(
                &connection,
                "node:scheduler",
                serde_json::to_value(container).unwrap(),
            )
            .await;
        backend
    }

    async fn process(backend: &MemoryBackend) -> SchedulerProcess {
        SchedulerProcess::new(
            &settings(),
            Arc::new(backend.clone()),
            Arc::new(NoopExecutor),
            Arc::new(IdleChannel::default()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_registers_tasks_with_triggers() {
        let backend = seeded_backend(&settings()).await;
        let process = process(&backend).await;

        let jobs = process.scheduler().get_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "report-1");
        assert_eq!(jobs[0].task_name, "report");
    }

    #[tokio::test]
    async fn test_jobs_survive_process_restart() {
        let backend = seeded_backend(&settings()).await;
        let first = process(&backend).await;
        let original = first.scheduler().job("report-1").await.unwrap();
        drop(first);

        let second = process(&backend).await;
        assert_eq!(second.scheduler().get_jobs().await, vec![original]);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let backend = seeded_backend(&settings()).await;
        let process = Arc::new(process(&backend).await);

        let running = tokio::spawn({
            let process = process.clone();
            async move { process.run().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(process.scheduler().is_running().await);

        process.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!process.scheduler().is_running().await);
    }

    #[tokio::test]
    async fn test_restart_reloads_store() {
        let backend = seeded_backend(&settings()).await;
        let process = process(&backend).await;
        process.scheduler().start().await.unwrap();

        process.restart().await.unwrap();

        assert!(process.scheduler().is_running().await);
        assert!(process.scheduler().job("report-1").await.is_some());
        process.scheduler().stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let mut settings = settings();
        settings.scheduler.max_jobs_per_poll = 0;
        let result = SchedulerProcess::new(
            &settings,
            Arc::new(MemoryBackend::new()),
            Arc::new(NoopExecutor),
            Arc::new(IdleChannel::default()),
        )
        .await;
        assert!(matches!(result, Err(ProcessError::Configuration(_))));
    }
}
