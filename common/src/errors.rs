// Error handling framework

use thiserror::Error;

/// Trigger-related errors
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid trigger configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Fire time calculation failed: {0}")]
    CalculationFailed(String),
}

/// Persistence backend errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to connect to persistence backend: {0}")]
    ConnectionFailed(String),

    #[error("Persistence operation timed out: {0}")]
    Timeout(String),

    #[error("Failed to read '{key}': {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Transaction commit failed: {0}")]
    CommitFailed(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Job store error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Trigger for job '{job_id}' will never fire")]
    NoNextFireTime { job_id: String },
}

/// Control channel and task dispatch errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to connect to NATS: {0}")]
    Connection(String),

    #[error("Failed to subscribe: {0}")]
    Subscribe(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Remote handler rejected request: {0}")]
    Rejected(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

/// Process lifecycle errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl From<redis::RedisError> for PersistenceError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            PersistenceError::Timeout(err.to_string())
        } else if err.is_connection_refusal() || err.is_connection_dropped() {
            PersistenceError::ConnectionFailed(err.to_string())
        } else {
            PersistenceError::CommitFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::InvalidData(err.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::DeserializationFailed(err.to_string())
    }
}
