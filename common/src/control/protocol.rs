// Control channel message format

use crate::persistence::ConnectionSettings;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const OK: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOperation {
    GetJobs,
    ResetTask,
    RunTask,
}

impl ControlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOperation::GetJobs => "get_jobs",
            ControlOperation::ResetTask => "reset_task",
            ControlOperation::RunTask => "run_task",
        }
    }
}

impl fmt::Display for ControlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings payload carried by every control request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Job to unschedule before a reset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Task inside the scheduler's container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Connection descriptor the worker opens its session with. When absent the
    /// scheduler's own descriptor is used.
    #[serde(
        rename = "zeo",
        alias = "connection",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection: Option<ConnectionSettings>,
}

impl ControlSettings {
    pub fn for_task(task_name: impl Into<String>) -> Self {
        Self {
            task_name: Some(task_name.into()),
            ..Self::default()
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = Some(connection);
        self
    }
}

/// One request on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub operation: ControlOperation,
    #[serde(default)]
    pub settings: ControlSettings,
}

impl ControlRequest {
    pub fn get_jobs() -> Self {
        Self {
            operation: ControlOperation::GetJobs,
            settings: ControlSettings::default(),
        }
    }

    pub fn reset_task(settings: ControlSettings) -> Self {
        Self {
            operation: ControlOperation::ResetTask,
            settings,
        }
    }

    pub fn run_task(settings: ControlSettings) -> Self {
        Self {
            operation: ControlOperation::RunTask,
            settings,
        }
    }
}

/// Reply to a control request.
///
/// `Status("OK")` means the request was accepted for asynchronous processing, not that
/// it has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Jobs(Vec<String>),
    Status(String),
    Error { error: String },
}

impl ControlReply {
    pub fn ok() -> Self {
        ControlReply::Status(OK.to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlReply::Error {
            error: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ControlReply::Status(status) if status == OK)
    }
}
