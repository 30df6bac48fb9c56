// Configuration management with layered configuration (file, env)

use crate::persistence::ConnectionSettings;
use crate::scheduler::SchedulerConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub control: ControlConfig,
    pub persistence: PersistenceConfig,
    pub scheduler: SchedulerSettings,
    pub dispatch: DispatchConfig,
    pub observability: ObservabilityConfig,
}

/// Where the process listens for control requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    pub nats_url: String,
    /// Request/reply subject the control handler serves
    pub subject: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub backend: BackendKind,
    pub url: String,
    pub namespace: String,
    /// Path of the container owning this scheduler's tasks
    pub container_path: String,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

fn default_connect_timeout_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub poll_interval_ms: u64,
    pub task_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub max_jobs_per_poll: usize,
}

/// JetStream stream fired tasks are published to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub stream_name: String,
    pub subject_prefix: String,
    pub max_age_seconds: u64,
    pub max_messages: i64,
    pub publish_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.control.nats_url.is_empty() {
            return Err("Control nats_url cannot be empty".to_string());
        }
        if self.control.subject.is_empty() {
            return Err("Control subject cannot be empty".to_string());
        }

        if self.persistence.backend == BackendKind::Redis && self.persistence.url.is_empty() {
            return Err("Persistence URL cannot be empty for the redis backend".to_string());
        }
        if self.persistence.namespace.is_empty() {
            return Err("Persistence namespace cannot be empty".to_string());
        }
        if !self.persistence.container_path.starts_with('/') {
            return Err("Persistence container_path must be absolute".to_string());
        }

        if self.scheduler.poll_interval_ms == 0 {
            return Err("Scheduler poll_interval_ms must be greater than 0".to_string());
        }
        if self.scheduler.task_timeout_seconds == 0 {
            return Err("Scheduler task_timeout_seconds must be greater than 0".to_string());
        }
        if self.scheduler.shutdown_timeout_seconds < self.scheduler.task_timeout_seconds {
            return Err(
                "Scheduler shutdown_timeout_seconds must not be shorter than task_timeout_seconds"
                    .to_string(),
            );
        }
        if self.scheduler.max_jobs_per_poll == 0 {
            return Err("Scheduler max_jobs_per_poll must be greater than 0".to_string());
        }

        if self.dispatch.stream_name.is_empty() {
            return Err("Dispatch stream_name cannot be empty".to_string());
        }
        if self.dispatch.subject_prefix.is_empty() || self.dispatch.subject_prefix.contains('>') {
            return Err("Dispatch subject_prefix must be a plain subject".to_string());
        }

        Ok(())
    }

    /// Descriptor every worker and fired task uses to open its own session
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            url: self.persistence.url.clone(),
            namespace: self.persistence.namespace.clone(),
            connect_timeout_seconds: self.persistence.connect_timeout_seconds,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval_ms: self.scheduler.poll_interval_ms,
            task_timeout_seconds: self.scheduler.task_timeout_seconds,
            shutdown_timeout_seconds: self.scheduler.shutdown_timeout_seconds,
            max_jobs_per_poll: self.scheduler.max_jobs_per_poll,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            control: ControlConfig {
                nats_url: "nats://localhost:4222".to_string(),
                subject: "scheduler.control".to_string(),
                request_timeout_seconds: 10,
            },
            persistence: PersistenceConfig {
                backend: BackendKind::Redis,
                url: "redis://localhost:6379".to_string(),
                namespace: "scheduler".to_string(),
                container_path: "/scheduler".to_string(),
                connect_timeout_seconds: default_connect_timeout_seconds(),
            },
            scheduler: SchedulerSettings {
                poll_interval_ms: scheduler.poll_interval_ms,
                task_timeout_seconds: scheduler.task_timeout_seconds,
                shutdown_timeout_seconds: scheduler.shutdown_timeout_seconds,
                max_jobs_per_poll: scheduler.max_jobs_per_poll,
            },
            dispatch: DispatchConfig {
                stream_name: "TASKS".to_string(),
                subject_prefix: "tasks".to_string(),
                max_age_seconds: 86400, // 24 hours
                max_messages: 1_000_000,
                publish_timeout_seconds: 5,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
