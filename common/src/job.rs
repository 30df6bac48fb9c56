// Job model: one scheduled unit of work

use crate::persistence::ConnectionSettings;
use crate::trigger::Trigger;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Settings handed to every task invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Descriptor the task uses to open its own persistence session
    pub connection: ConnectionSettings,
    /// True for one-shot runs requested through `run_task`
    #[serde(default)]
    pub immediate: bool,
}

impl TaskContext {
    pub fn scheduled(connection: ConnectionSettings) -> Self {
        Self {
            connection,
            immediate: false,
        }
    }

    pub fn immediate(connection: ConnectionSettings) -> Self {
        Self {
            connection,
            immediate: true,
        }
    }
}

/// Job represents a task bound to a concrete trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Name of the task inside the scheduler's container
    pub task_name: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub args: Vec<Value>,
    pub context: TaskContext,
    pub next_run_time: DateTime<Utc>,
}

impl Job {
    /// Build the invocation for the slot currently recorded in `next_run_time`
    pub fn invocation(&self) -> Invocation {
        Invocation {
            job_id: self.id.clone(),
            task_name: self.task_name.clone(),
            args: self.args.clone(),
            context: self.context.clone(),
            scheduled_run_time: self.next_run_time,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (trigger: {}, next run at: {})",
            self.id,
            self.trigger,
            self.next_run_time.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Request to register a job; the scheduler assigns an id unless one is given
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Option<String>,
    pub task_name: String,
    pub trigger: Trigger,
    pub args: Vec<Value>,
    pub context: TaskContext,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>, trigger: Trigger, context: TaskContext) -> Self {
        Self {
            id: None,
            task_name: task_name.into(),
            trigger,
            args: Vec::new(),
            context,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Everything a task needs for one firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub job_id: String,
    pub task_name: String,
    pub args: Vec<Value>,
    pub context: TaskContext,
    pub scheduled_run_time: DateTime<Utc>,
}

static LAST_IMMEDIATE_NANOS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Id for a one-shot run of a task: "<internal_id>::<timestamp>".
///
/// Timestamps are strictly increasing within the process, so two runs requested in the
/// same instant still get distinct ids.
pub fn immediate_job_id(internal_id: &str) -> String {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
    let mut last = LAST_IMMEDIATE_NANOS.load(Ordering::SeqCst);
    let stamp = loop {
        let candidate = now.max(last.saturating_add(1));
        match LAST_IMMEDIATE_NANOS.compare_exchange(
            last,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => break candidate,
            Err(current) => last = current,
        }
    };

    format!(
        "{}::{}",
        internal_id,
        DateTime::from_timestamp_nanos(stamp).to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}
