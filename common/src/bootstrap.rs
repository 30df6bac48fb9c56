// Bootstrap utilities for binary initialization

use crate::config::{BackendKind, Settings};
use crate::dispatch::NatsTaskExecutor;
use crate::persistence::{Backend, MemoryBackend, RedisBackend};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Initialize the persistence backend selected in the settings.
/// The Redis backend is health-checked before it is handed out.
///
/// # Errors
/// Returns error if Redis does not answer
#[tracing::instrument(skip(settings), fields(backend = ?settings.persistence.backend))]
pub async fn init_backend(settings: &Settings) -> Result<Arc<dyn Backend>> {
    match settings.persistence.backend {
        BackendKind::Redis => {
            info!("Initializing Redis backend");
            let backend = RedisBackend::new();
            backend
                .health_check(&settings.connection_settings())
                .await
                .context("Redis backend health check failed")?;
            info!("Redis backend initialized");
            Ok(Arc::new(backend))
        }
        BackendKind::Memory => {
            warn!("Using in-memory backend, jobs will not survive a restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

/// Connect to the NATS server used for control requests and task dispatch
///
/// # Errors
/// Returns error if the connection cannot be established
#[tracing::instrument(skip(settings), fields(url = %settings.control.nats_url))]
pub async fn init_nats_client(settings: &Settings) -> Result<async_nats::Client> {
    info!("Connecting to NATS server");

    let client = async_nats::connect(&settings.control.nats_url)
        .await
        .context("Failed to connect to NATS")?;

    info!("NATS client initialized");
    Ok(client)
}

/// Build the JetStream task executor and make sure its stream exists
///
/// # Errors
/// Returns error if the stream cannot be created
#[tracing::instrument(skip_all)]
pub async fn init_task_executor(
    settings: &Settings,
    client: async_nats::Client,
) -> Result<Arc<NatsTaskExecutor>> {
    let executor = NatsTaskExecutor::new(client, settings.dispatch.clone());
    executor
        .initialize_stream()
        .await
        .context("Failed to initialize task stream")?;

    info!(
        stream_name = %settings.dispatch.stream_name,
        subject_prefix = %settings.dispatch.subject_prefix,
        "Task executor initialized"
    );
    Ok(Arc::new(executor))
}
