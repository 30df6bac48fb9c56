// Task dispatch to NATS JetStream

use crate::config::DispatchConfig;
use crate::errors::ChannelError;
use crate::job::Invocation;
use crate::persistence::{ConnectionSettings, Session};
use crate::task::{TaskDefinition, TaskExecutor};
use async_nats::jetstream::{
    context::PublishAckFuture,
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JetStreamContext,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, instrument};

/// Message published for every fired job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: String,
    pub task_name: String,
    pub internal_id: String,
    pub args: Vec<Value>,
    /// Descriptor the consumer opens its own persistence session with
    pub connection: ConnectionSettings,
    pub immediate: bool,
    pub scheduled_run_time: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    /// Task configuration as stored in the container
    pub payload: Value,
}

impl TaskMessage {
    pub fn new(task: &TaskDefinition, invocation: &Invocation) -> Self {
        Self {
            job_id: invocation.job_id.clone(),
            task_name: invocation.task_name.clone(),
            internal_id: task.internal_id.clone(),
            args: invocation.args.clone(),
            connection: invocation.context.connection.clone(),
            immediate: invocation.context.immediate,
            scheduled_run_time: invocation.scheduled_run_time,
            published_at: Utc::now(),
            payload: task.payload.clone(),
        }
    }

    /// JetStream de-duplication key: one message per job and slot
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}",
            self.job_id,
            self.scheduled_run_time
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// Executes tasks by handing them to downstream workers over JetStream
pub struct NatsTaskExecutor {
    jetstream: JetStreamContext,
    config: DispatchConfig,
}

impl NatsTaskExecutor {
    pub fn new(client: async_nats::Client, config: DispatchConfig) -> Self {
        Self {
            jetstream: async_nats::jetstream::new(client),
            config,
        }
    }

    /// Create the task stream if it does not exist yet
    #[instrument(skip(self), fields(stream_name = %self.config.stream_name))]
    pub async fn initialize_stream(&self) -> Result<(), ChannelError> {
        info!("Initializing JetStream stream");

        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(self.config.max_age_seconds),
            max_messages: self.config.max_messages,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| ChannelError::StreamCreation(e.to_string()))?;

        info!("Stream initialized successfully");
        Ok(())
    }

    fn subject(&self, internal_id: &str) -> String {
        task_subject(&self.config.subject_prefix, internal_id)
    }

    fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.config.publish_timeout_seconds.max(1))
    }

    async fn publish(&self, message: &TaskMessage) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ChannelError::SerializationFailed(e.to_string()))?;
        let subject = self.subject(&message.internal_id);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.idempotency_key().as_str());
        headers.insert("Job-Id", message.job_id.as_str());

        let ack: PublishAckFuture = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| ChannelError::PublishFailed(e.to_string()))?;

        match tokio::time::timeout(self.publish_timeout(), ack).await {
            Ok(Ok(_)) => {
                info!(subject = %subject, "Task message published");
                Ok(())
            }
            Ok(Err(e)) => Err(ChannelError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(ChannelError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout()
            ))),
        }
    }
}

/// Subject a task's messages are published on. Characters NATS treats specially are
/// replaced so an id never spans several tokens.
pub fn task_subject(prefix: &str, internal_id: &str) -> String {
    let token: String = internal_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", prefix, token)
}

#[async_trait]
impl TaskExecutor for NatsTaskExecutor {
    #[instrument(skip_all, fields(job_id = %invocation.job_id, internal_id = %task.internal_id))]
    async fn execute(
        &self,
        task: &TaskDefinition,
        invocation: &Invocation,
        session: &mut dyn Session,
    ) -> anyhow::Result<()> {
        let message = TaskMessage::new(task, invocation);
        self.publish(&message).await?;

        session.stage(
            &format!("dispatch:{}", task.internal_id),
            json!({
                "job_id": message.job_id,
                "scheduled_run_time": message.scheduled_run_time,
                "published_at": message.published_at,
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TaskContext;
    use chrono::TimeZone;

    fn invocation() -> Invocation {
        Invocation {
            job_id: "report-1::2026-01-01T00:00:00.000000001Z".to_string(),
            task_name: "report".to_string(),
            args: vec![json!("weekly")],
            context: TaskContext::immediate(ConnectionSettings::new("redis://localhost", "prod")),
            scheduled_run_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_task_message_from_invocation() {
        let task = TaskDefinition::new("report-1").with_payload(json!({ "format": "pdf" }));
        let message = TaskMessage::new(&task, &invocation());

        assert_eq!(message.internal_id, "report-1");
        assert!(message.immediate);
        assert_eq!(message.connection.namespace, "prod");
        assert_eq!(message.payload["format"], "pdf");
        assert_eq!(
            message.idempotency_key(),
            "report-1::2026-01-01T00:00:00.000000001Z:2026-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn test_task_subject_is_single_token() {
        assert_eq!(task_subject("tasks", "report-1"), "tasks.report-1");
        assert_eq!(task_subject("tasks", "a.b c>*"), "tasks.a_b_c__");
    }

    #[tokio::test]
    #[ignore] // Requires a running NATS server with JetStream
    async fn test_publish_task_message() {
        let client = async_nats::connect("nats://localhost:4222").await.unwrap();
        let config = DispatchConfig {
            stream_name: "TASKS_TEST".to_string(),
            subject_prefix: "tasks_test".to_string(),
            max_age_seconds: 60,
            max_messages: 1_000,
            publish_timeout_seconds: 5,
        };
        let executor = NatsTaskExecutor::new(client, config);
        executor.initialize_stream().await.unwrap();

        let task = TaskDefinition::new("report-1");
        let message = TaskMessage::new(&task, &invocation());
        executor.publish(&message).await.unwrap();
    }
}
