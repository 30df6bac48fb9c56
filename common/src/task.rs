// Tasks and the path from a fired job to task execution

use crate::job::Invocation;
use crate::persistence::{Backend, Locator, Session};
use crate::trigger::Trigger;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A task as stored in the scheduler's container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Stable identity; also the id of the task's recurring job
    pub internal_id: String,
    /// Recurring schedule, if the task has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    /// Opaque task configuration, forwarded to the executor
    #[serde(default)]
    pub payload: Value,
}

impl TaskDefinition {
    pub fn new(internal_id: impl Into<String>) -> Self {
        Self {
            internal_id: internal_id.into(),
            trigger: None,
            payload: Value::Null,
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }
}

/// The scheduler's owning container, resolved from a session
#[derive(Debug, Clone)]
pub struct Container {
    pub path: String,
    /// Backend key the container was loaded from
    pub key: String,
    pub tasks: BTreeMap<String, TaskDefinition>,
}

impl Container {
    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }
}

/// Performs the actual work of a task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` for one firing. `session` is the task's own transaction; it is
    /// committed when this returns `Ok` and aborted otherwise.
    async fn execute(
        &self,
        task: &TaskDefinition,
        invocation: &Invocation,
        session: &mut dyn Session,
    ) -> anyhow::Result<()>;
}

/// What the scheduler calls when a job fires
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> anyhow::Result<()>;
}

/// Opens a fresh session from the invocation's connection descriptor, finds the task in
/// the container and hands it to the executor
pub struct TaskJobRunner {
    backend: Arc<dyn Backend>,
    locator: Arc<dyn Locator>,
    container_path: String,
    executor: Arc<dyn TaskExecutor>,
}

impl TaskJobRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        locator: Arc<dyn Locator>,
        container_path: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            backend,
            locator,
            container_path: container_path.into(),
            executor,
        }
    }
}

#[async_trait]
impl JobRunner for TaskJobRunner {
    #[instrument(skip(self, invocation), fields(
        job_id = %invocation.job_id,
        task_name = %invocation.task_name,
        immediate = invocation.context.immediate
    ))]
    async fn run(&self, invocation: &Invocation) -> anyhow::Result<()> {
        let mut session = self
            .backend
            .open(&invocation.context.connection)
            .await
            .context("Failed to open persistence session")?;

        let container = self
            .locator
            .resolve(session.as_mut(), &self.container_path)
            .await?
            .ok_or_else(|| anyhow!("Container '{}' not found", self.container_path))?;

        let task = container
            .task(&invocation.task_name)
            .ok_or_else(|| anyhow!("Task '{}' not found", invocation.task_name))?;

        match self.executor.execute(task, invocation, session.as_mut()).await {
            Ok(()) => {
                session.commit().await?;
                debug!("Task transaction committed");
                Ok(())
            }
            Err(e) => {
                session.abort();
                Err(e)
            }
        }
    }
}
