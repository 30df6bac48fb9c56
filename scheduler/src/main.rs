// Scheduler binary entry point

use anyhow::Context;
use common::bootstrap::{init_backend, init_nats_client, init_task_executor};
use common::config::Settings;
use common::control::NatsControlServer;
use common::process::SchedulerProcess;
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        nats_url = %settings.control.nats_url,
        control_subject = %settings.control.subject,
        backend = ?settings.persistence.backend,
        container_path = %settings.persistence.container_path,
        "Starting task scheduler"
    );

    let backend = init_backend(&settings).await?;
    let nats_client = init_nats_client(&settings).await?;
    let executor = init_task_executor(&settings, nats_client.clone()).await?;
    let channel = Arc::new(NatsControlServer::new(
        nats_client,
        settings.control.subject.clone(),
    ));

    let process = Arc::new(
        SchedulerProcess::new(&settings, backend, executor, channel)
            .await
            .context("Failed to create scheduler process")?,
    );

    // Handle SIGINT for graceful shutdown
    let process_for_shutdown = process.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal, initiating graceful shutdown");
                process_for_shutdown.shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    let result = process.run().await;
    telemetry::shutdown_tracer();

    if let Err(e) = result {
        error!(error = %e, "Scheduler process failed");
        return Err(e.into());
    }

    info!("Scheduler stopped");
    Ok(())
}
