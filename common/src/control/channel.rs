// NATS request/reply transport for control requests

use crate::config::ControlConfig;
use crate::control::handler::ControlHandler;
use crate::control::protocol::{ControlReply, ControlRequest, ControlSettings};
use crate::errors::ChannelError;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Transport that feeds control requests to a handler
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Serve requests until `shutdown` is called
    async fn serve(&self, handler: Arc<ControlHandler>) -> Result<(), ChannelError>;

    /// Ask a running `serve` to return
    fn shutdown(&self);

    /// Release the transport; called after the scheduler has stopped
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Serves the control subject over NATS request/reply.
///
/// Each request is handled on its own task, so a slow reply never holds up the
/// subscription.
pub struct NatsControlServer {
    client: async_nats::Client,
    subject: String,
    shutdown: CancellationToken,
}

impl NatsControlServer {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect to the NATS server and serve `subject`
    #[instrument(skip(subject))]
    pub async fn connect(url: &str, subject: impl Into<String>) -> Result<Self, ChannelError> {
        info!("Connecting to NATS server");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        info!("Connected to NATS server successfully");
        Ok(Self::new(client, subject))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

async fn reply(
    client: async_nats::Client,
    handler: Arc<ControlHandler>,
    message: async_nats::Message,
) {
    let Some(reply_subject) = message.reply.clone() else {
        debug!(subject = %message.subject, "Control message without reply subject, ignoring");
        return;
    };

    let reply = handler.handle_payload(&message.payload).await;
    let payload = match serde_json::to_vec(&reply) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Failed to serialize control reply");
            return;
        }
    };

    if let Err(e) = client.publish(reply_subject, payload.into()).await {
        warn!(error = %e, "Failed to publish control reply");
    }
}

#[async_trait]
impl ControlChannel for NatsControlServer {
    #[instrument(skip(self, handler), fields(subject = %self.subject))]
    async fn serve(&self, handler: Arc<ControlHandler>) -> Result<(), ChannelError> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;
        info!("Serving control requests");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping control server");
                    break;
                }
                message = subscriber.next() => {
                    let Some(message) = message else {
                        warn!("Control subscription closed by server");
                        break;
                    };
                    tokio::spawn(reply(self.client.clone(), handler.clone(), message));
                }
            }
        }

        if let Err(e) = subscriber.unsubscribe().await {
            warn!(error = %e, "Failed to unsubscribe from control subject");
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.client
            .flush()
            .await
            .map_err(|e| ChannelError::Connection(format!("Failed to flush: {}", e)))?;
        info!("Control channel closed");
        Ok(())
    }
}

/// Client side of the control channel
pub struct ControlClient {
    client: async_nats::Client,
    subject: String,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Client for the subject and timeout of a deployment's control section
    pub fn from_config(client: async_nats::Client, config: &ControlConfig) -> Self {
        Self::new(client, config.subject.clone())
            .with_timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[instrument(skip(self, request), fields(operation = %request.operation))]
    pub async fn request(&self, request: &ControlRequest) -> Result<ControlReply, ChannelError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ChannelError::SerializationFailed(e.to_string()))?;

        let response = tokio::time::timeout(
            self.timeout,
            self.client.request(self.subject.clone(), payload.into()),
        )
        .await
        .map_err(|_| {
            ChannelError::Timeout(format!("No control reply after {:?}", self.timeout))
        })?
        .map_err(|e| ChannelError::RequestFailed(e.to_string()))?;

        match serde_json::from_slice::<ControlReply>(&response.payload)? {
            ControlReply::Error { error } => Err(ChannelError::Rejected(error)),
            reply => Ok(reply),
        }
    }

    pub async fn get_jobs(&self) -> Result<Vec<String>, ChannelError> {
        match self.request(&ControlRequest::get_jobs()).await? {
            ControlReply::Jobs(jobs) => Ok(jobs),
            other => Err(unexpected(other)),
        }
    }

    /// Returns once the request is accepted; the reset itself happens asynchronously
    pub async fn reset_task(&self, settings: ControlSettings) -> Result<(), ChannelError> {
        self.expect_ok(ControlRequest::reset_task(settings)).await
    }

    /// Returns once the request is accepted; the run itself happens asynchronously
    pub async fn run_task(&self, settings: ControlSettings) -> Result<(), ChannelError> {
        self.expect_ok(ControlRequest::run_task(settings)).await
    }

    async fn expect_ok(&self, request: ControlRequest) -> Result<(), ChannelError> {
        match self.request(&request).await? {
            reply if reply.is_ok() => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: ControlReply) -> ChannelError {
    ChannelError::DeserializationFailed(format!("Unexpected control reply: {:?}", reply))
}
