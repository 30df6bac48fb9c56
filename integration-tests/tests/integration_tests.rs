// Integration tests for the task scheduler
// These tests drive a full SchedulerProcess (in-memory backend, in-process control channel)
// through the scenarios an operator would run against a deployment.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::{BackendKind, Settings};
use common::control::{
    ControlChannel, ControlClient, ControlHandler, ControlReply, ControlRequest, ControlSettings,
    NatsControlServer,
};
use common::errors::ChannelError;
use common::job::{Invocation, NewJob, TaskContext};
use common::persistence::{ContainerNode, MemoryBackend, Session};
use common::process::SchedulerProcess;
use common::scheduler::Scheduler;
use common::task::{TaskDefinition, TaskExecutor};
use common::trigger::Trigger;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

type Envelope = (ControlRequest, oneshot::Sender<ControlReply>);

/// In-process control channel: requests arrive over an mpsc queue
struct LocalChannel {
    requests: AsyncMutex<mpsc::Receiver<Envelope>>,
    token: CancellationToken,
}

#[async_trait]
impl ControlChannel for LocalChannel {
    async fn serve(&self, handler: Arc<ControlHandler>) -> Result<(), ChannelError> {
        let mut requests = self.requests.lock().await;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                envelope = requests.recv() => {
                    let Some((request, reply_to)) = envelope else { break };
                    let reply = handler.handle(request).await;
                    let _ = reply_to.send(reply);
                }
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.token.cancel();
    }

    async fn close(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[derive(Clone)]
struct LocalClient {
    requests: mpsc::Sender<Envelope>,
}

impl LocalClient {
    async fn call(&self, request: ControlRequest) -> ControlReply {
        let (reply_to, reply) = oneshot::channel();
        self.requests
            .send((request, reply_to))
            .await
            .expect("control channel closed");
        reply.await.expect("no reply")
    }
}

/// One recorded task execution
#[derive(Debug, Clone)]
struct Fired {
    job_id: String,
    internal_id: String,
    scheduled_run_time: DateTime<Utc>,
    immediate: bool,
}

/// Records every execution; tasks whose payload sets `fail` return an error
#[derive(Default)]
struct RecordingExecutor {
    fired: Mutex<Vec<Fired>>,
}

impl RecordingExecutor {
    fn fired_for(&self, internal_id: &str) -> Vec<Fired> {
        self.fired
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.internal_id == internal_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(
        &self,
        task: &TaskDefinition,
        invocation: &Invocation,
        session: &mut dyn Session,
    ) -> anyhow::Result<()> {
        self.fired.lock().unwrap().push(Fired {
            job_id: invocation.job_id.clone(),
            internal_id: task.internal_id.clone(),
            scheduled_run_time: invocation.scheduled_run_time,
            immediate: invocation.context.immediate,
        });
        session.stage(
            &format!("last_run:{}", task.internal_id),
            serde_json::json!({ "job_id": invocation.job_id }),
        );
        if task.payload["fail"] == serde_json::json!(true) {
            return Err(anyhow!("task {} failed on purpose", task.internal_id));
        }
        Ok(())
    }
}

struct Harness {
    process: Arc<SchedulerProcess>,
    client: LocalClient,
    executor: Arc<RecordingExecutor>,
    backend: MemoryBackend,
    running: Option<JoinHandle<()>>,
}

impl Harness {
    async fn new(tasks: ContainerNode) -> Self {
        let settings = settings();
        let connection = settings.connection_settings();
        let backend = MemoryBackend::new();
        let root = ContainerNode::default().with_child("scheduler", "node:scheduler");
        backend
            .seed(&connection, "root", serde_json::to_value(root).unwrap())
            .await;
        backend
            .seed(
                &connection,
                "node:scheduler",
                serde_json::to_value(tasks).unwrap(),
            )
            .await;

        let (requests_tx, requests_rx) = mpsc::channel(16);
        let channel = Arc::new(LocalChannel {
            requests: AsyncMutex::new(requests_rx),
            token: CancellationToken::new(),
        });
        let executor = Arc::new(RecordingExecutor::default());

        let process = SchedulerProcess::new(
            &settings,
            Arc::new(backend.clone()),
            executor.clone(),
            channel,
        )
        .await
        .expect("Failed to create scheduler process");

        Self {
            process: Arc::new(process),
            client: LocalClient {
                requests: requests_tx,
            },
            executor,
            backend,
            running: None,
        }
    }

    fn start(&mut self) {
        let process = self.process.clone();
        self.running = Some(tokio::spawn(async move {
            process.run().await.expect("Scheduler process failed");
        }));
    }

    async fn stop(&mut self) {
        self.process.shutdown();
        if let Some(running) = self.running.take() {
            timeout(Duration::from_secs(10), running)
                .await
                .expect("Process did not stop in time")
                .unwrap();
        }
    }

    async fn job_ids(&self) -> Vec<String> {
        match self.client.call(ControlRequest::get_jobs()).await {
            ControlReply::Jobs(jobs) => jobs
                .iter()
                .map(|description| description.split(' ').next().unwrap().to_string())
                .collect(),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    /// Wait until every control worker accepted so far has finished
    async fn settle(&self) {
        self.process.handler().drain().await;
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.persistence.backend = BackendKind::Memory;
    settings.persistence.url = "memory://".to_string();
    settings.persistence.namespace = "integration".to_string();
    settings.scheduler.poll_interval_ms = 50;
    settings.scheduler.task_timeout_seconds = 5;
    settings.scheduler.shutdown_timeout_seconds = 10;
    settings
}

fn tasks() -> ContainerNode {
    ContainerNode::default()
        .with_task(
            "report",
            TaskDefinition::new("report-1").with_trigger(Trigger::interval(3600)),
        )
        .with_task("manual", TaskDefinition::new("manual-1"))
        .with_task(
            "broken",
            TaskDefinition::new("broken-1").with_payload(serde_json::json!({ "fail": true })),
        )
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_one_second_interval_fires_repeatedly() {
    let started = Instant::now();
    let container = ContainerNode::default().with_task(
        "heartbeat",
        TaskDefinition::new("heartbeat-1").with_trigger(Trigger::interval(1)),
    );
    let mut harness = Harness::new(container).await;
    harness.start();

    sleep(Duration::from_millis(3_500).saturating_sub(started.elapsed())).await;
    harness.stop().await;

    let fired = harness.executor.fired_for("heartbeat-1");
    assert!(fired.len() >= 3, "fired only {} times", fired.len());
    for pair in fired.windows(2) {
        let gap = pair[1].scheduled_run_time - pair[0].scheduled_run_time;
        assert!(gap >= chrono::Duration::seconds(1), "gap was {}", gap);
    }

    // Each firing ran in its own committed session
    let connection = settings().connection_settings();
    assert!(harness
        .backend
        .get(&connection, "last_run:heartbeat-1")
        .await
        .is_some());
}

#[tokio::test]
async fn test_reset_task_without_trigger_removes_job() {
    let mut harness = Harness::new(tasks()).await;
    harness
        .process
        .scheduler()
        .add_job(
            NewJob::new(
                "manual",
                Trigger::interval(60),
                TaskContext::scheduled(settings().connection_settings()),
            )
            .with_id("X"),
        )
        .await
        .unwrap();
    harness.start();

    let reply = harness
        .client
        .call(ControlRequest::reset_task(
            ControlSettings::for_task("manual").with_job_id("X"),
        ))
        .await;
    assert!(reply.is_ok());
    harness.settle().await;

    assert_eq!(harness.job_ids().await, vec!["report-1"]);
    harness.stop().await;
}

#[tokio::test]
async fn test_reset_task_keeps_one_job_per_task() {
    let mut harness = Harness::new(tasks()).await;
    harness.start();

    for _ in 0..5 {
        let reply = harness
            .client
            .call(ControlRequest::reset_task(
                ControlSettings::for_task("report").with_job_id("report-1"),
            ))
            .await;
        assert!(reply.is_ok());
    }
    harness.settle().await;

    let ids = harness.job_ids().await;
    assert_eq!(ids.iter().filter(|id| *id == "report-1").count(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_reset_unknown_task_answers_ok_without_change() {
    let mut harness = Harness::new(tasks()).await;
    harness.start();
    let before = harness.job_ids().await;

    let reply = harness
        .client
        .call(ControlRequest::reset_task(
            ControlSettings::for_task("does-not-exist").with_job_id("report-1"),
        ))
        .await;
    assert_eq!(reply, ControlReply::ok());
    harness.settle().await;

    assert_eq!(harness.job_ids().await, before);
    harness.stop().await;
}

#[tokio::test]
async fn test_run_task_fires_once_then_disappears() {
    let mut harness = Harness::new(tasks()).await;

    // Accept the request while the scheduler is stopped so the job is observable
    let reply = harness
        .process
        .handler()
        .handle(ControlRequest::run_task(ControlSettings::for_task("manual")))
        .await;
    assert!(reply.is_ok());
    harness.settle().await;

    let immediate: Vec<String> = harness
        .process
        .scheduler()
        .get_jobs()
        .await
        .into_iter()
        .map(|job| job.id)
        .filter(|id| id.starts_with("manual-1::"))
        .collect();
    assert_eq!(immediate.len(), 1);

    harness.start();
    let executor = harness.executor.clone();
    let fired_once = || !executor.fired_for("manual-1").is_empty();
    assert!(wait_until(fired_once, Duration::from_secs(5)).await);
    sleep(Duration::from_millis(300)).await;

    let fired = harness.executor.fired_for("manual-1");
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].job_id, immediate[0]);
    assert!(fired[0].immediate);
    assert!(!harness
        .job_ids()
        .await
        .iter()
        .any(|id| id.starts_with("manual-1::")));
    harness.stop().await;
}

#[tokio::test]
async fn test_failing_task_does_not_stop_other_jobs() {
    let mut harness = Harness::new(tasks()).await;
    harness.start();

    for task in ["broken", "manual"] {
        let reply = harness
            .client
            .call(ControlRequest::run_task(ControlSettings::for_task(task)))
            .await;
        assert!(reply.is_ok());
    }
    harness.settle().await;

    let executor = harness.executor.clone();
    let both_fired = || {
        !executor.fired_for("broken-1").is_empty() && !executor.fired_for("manual-1").is_empty()
    };
    assert!(wait_until(both_fired, Duration::from_secs(5)).await);

    // The failed run aborted its session; the successful one committed
    let connection = settings().connection_settings();
    assert!(harness
        .backend
        .get(&connection, "last_run:broken-1")
        .await
        .is_none());
    assert!(harness
        .backend
        .get(&connection, "last_run:manual-1")
        .await
        .is_some());
    harness.stop().await;
}

#[tokio::test]
async fn test_stop_then_start_does_not_duplicate_firings() {
    let mut harness = Harness::new(tasks()).await;
    harness.start();

    harness
        .client
        .call(ControlRequest::run_task(ControlSettings::for_task("manual")))
        .await;
    harness.settle().await;
    let executor = harness.executor.clone();
    let fired_once = || !executor.fired_for("manual-1").is_empty();
    assert!(wait_until(fired_once, Duration::from_secs(5)).await);

    harness.process.restart().await.unwrap();
    sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.executor.fired_for("manual-1").len(), 1);
    harness.stop().await;
}

#[tokio::test]
#[ignore] // Requires NATS server to be running
async fn test_control_roundtrip_over_nats() {
    let nats_url =
        std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let subject = format!("scheduler.control.test.{}", std::process::id());

    let mut settings = settings();
    settings.control.nats_url = nats_url.clone();
    settings.control.subject = subject.clone();

    let backend = MemoryBackend::new();
    let connection = settings.connection_settings();
    let root = ContainerNode::default().with_child("scheduler", "node:scheduler");
    backend
        .seed(&connection, "root", serde_json::to_value(root).unwrap())
        .await;
    backend
        .seed(
            &connection,
            "node:scheduler",
            serde_json::to_value(tasks()).unwrap(),
        )
        .await;

    let server = Arc::new(
        NatsControlServer::connect(&nats_url, subject)
            .await
            .expect("Failed to connect to NATS"),
    );
    let process = Arc::new(
        SchedulerProcess::new(
            &settings,
            Arc::new(backend),
            Arc::new(RecordingExecutor::default()),
            server,
        )
        .await
        .unwrap(),
    );
    let running = tokio::spawn({
        let process = process.clone();
        async move { process.run().await }
    });
    sleep(Duration::from_millis(200)).await;

    let client = ControlClient::from_config(
        async_nats::connect(&nats_url).await.unwrap(),
        &settings.control,
    );

    let jobs = client.get_jobs().await.unwrap();
    assert!(jobs.iter().any(|job| job.starts_with("report-1 ")));

    client
        .reset_task(ControlSettings::for_task("report").with_job_id("report-1"))
        .await
        .unwrap();
    client
        .run_task(ControlSettings::for_task("manual").with_connection(connection))
        .await
        .unwrap();

    process.shutdown();
    timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
