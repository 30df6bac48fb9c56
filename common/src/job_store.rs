// Durable job table backing the scheduler's in-memory jobs

use crate::errors::PersistenceError;
use crate::job::Job;
use crate::persistence::{load_as, Backend, ConnectionSettings};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// JobStore persists jobs across process restarts
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the job keyed by `job.id`
    async fn add_job(&self, job: &Job) -> Result<(), PersistenceError>;

    /// Re-persist the state of a job the store already holds
    async fn update_job(&self, job: &Job) -> Result<(), PersistenceError>;

    /// Delete a job; removing an unknown id is a no-op
    async fn remove_job(&self, job_id: &str) -> Result<(), PersistenceError>;

    /// Every persisted job
    async fn jobs(&self) -> Result<Vec<Job>, PersistenceError>;
}

/// Volatile store for tests and throwaway deployments
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<BTreeMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(&self, job: &Job) -> Result<(), PersistenceError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), PersistenceError> {
        match self.jobs.write().await.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(PersistenceError::NotFound(format!("job '{}'", job.id))),
        }
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), PersistenceError> {
        self.jobs.write().await.remove(job_id);
        Ok(())
    }

    async fn jobs(&self) -> Result<Vec<Job>, PersistenceError> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

/// Stores the job table as one object in the persistence backend, next to the container
/// it belongs to. Every operation runs in its own session.
pub struct PersistentJobStore {
    backend: Arc<dyn Backend>,
    settings: ConnectionSettings,
    key: String,
}

impl PersistentJobStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        settings: ConnectionSettings,
        container_path: &str,
    ) -> Self {
        Self {
            backend,
            settings,
            key: format!("jobs:{}", container_path),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the table, apply `change`, commit
    async fn modify<F>(&self, change: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut BTreeMap<String, Job>) -> Result<(), PersistenceError> + Send,
    {
        let mut session = self.backend.open(&self.settings).await?;
        let mut table = load_as::<BTreeMap<String, Job>>(session.as_mut(), &self.key)
            .await?
            .unwrap_or_default();

        if let Err(e) = change(&mut table) {
            session.abort();
            return Err(e);
        }

        session.stage(&self.key, serde_json::to_value(&table)?);
        session.commit().await
    }
}

#[async_trait]
impl JobStore for PersistentJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn add_job(&self, job: &Job) -> Result<(), PersistenceError> {
        self.modify(|table| {
            table.insert(job.id.clone(), job.clone());
            Ok(())
        })
        .await?;
        debug!("Job persisted");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update_job(&self, job: &Job) -> Result<(), PersistenceError> {
        self.modify(|table| match table.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(PersistenceError::NotFound(format!("job '{}'", job.id))),
        })
        .await
    }

    #[instrument(skip(self))]
    async fn remove_job(&self, job_id: &str) -> Result<(), PersistenceError> {
        self.modify(|table| {
            if table.remove(job_id).is_some() {
                debug!("Job removed from store");
            }
            Ok(())
        })
        .await
    }

    async fn jobs(&self) -> Result<Vec<Job>, PersistenceError> {
        let mut session = self.backend.open(&self.settings).await?;
        let table = load_as::<BTreeMap<String, Job>>(session.as_mut(), &self.key)
            .await?
            .unwrap_or_default();
        session.abort();
        Ok(table.into_values().collect())
    }
}
