// Redis persistence backend
//
// Objects are stored as JSON strings under "<namespace>:<key>"; a commit applies all staged
// writes in one MULTI/EXEC pipeline. Sessions are cheap: each one clones a connection manager
// shared by every session against the same URL.

use super::{Backend, ConnectionSettings, Session, SessionState};
use crate::errors::PersistenceError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Redis backend keeping one connection manager per URL
#[derive(Clone, Default)]
pub struct RedisBackend {
    managers: Arc<Mutex<HashMap<String, ConnectionManager>>>,
}

impl RedisBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection manager for `settings.url`, created on first use
    async fn connection(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionManager, PersistenceError> {
        if let Some(manager) = self.managers.lock().await.get(&settings.url) {
            return Ok(manager.clone());
        }

        // Connect without holding the lock so one slow URL doesn't block the others
        let manager = connect(settings).await?;
        info!("Redis connection manager created");

        Ok(self
            .managers
            .lock()
            .await
            .entry(settings.url.clone())
            .or_insert(manager)
            .clone())
    }

    /// Health check - verify the backend answers PING
    #[instrument(skip(self, settings))]
    pub async fn health_check(&self, settings: &ConnectionSettings) -> Result<(), PersistenceError> {
        let mut conn = self.connection(settings).await?;

        let response: String = redis::cmd("PING").query_async(&mut conn).await?;

        if response != "PONG" {
            return Err(PersistenceError::ConnectionFailed(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

async fn connect(settings: &ConnectionSettings) -> Result<ConnectionManager, PersistenceError> {
    let client = Client::open(settings.url.as_str()).map_err(|e| {
        PersistenceError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
    })?;

    tokio::time::timeout(settings.connect_timeout(), ConnectionManager::new(client))
        .await
        .map_err(|_| {
            PersistenceError::Timeout(format!(
                "Connecting to Redis took longer than {:?}",
                settings.connect_timeout()
            ))
        })?
        .map_err(|e| {
            PersistenceError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })
}

#[async_trait]
impl Backend for RedisBackend {
    #[instrument(skip(self, settings), fields(namespace = %settings.namespace))]
    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Session>, PersistenceError> {
        let conn = self.connection(settings).await?;
        debug!("Redis session opened");

        Ok(Box::new(RedisSession {
            conn,
            settings: settings.clone(),
            state: SessionState::default(),
        }))
    }
}

struct RedisSession {
    conn: ConnectionManager,
    settings: ConnectionSettings,
    state: SessionState,
}

#[async_trait]
impl Session for RedisSession {
    async fn load(&mut self, key: &str) -> Result<Option<Value>, PersistenceError> {
        if let Some(cached) = self.state.cached(key) {
            return Ok(cached);
        }

        let raw: Option<String> = self
            .conn
            .get(self.settings.qualify(key))
            .await
            .map_err(|e| PersistenceError::ReadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let value = match raw {
            Some(raw) => Some(serde_json::from_str::<Value>(&raw)?),
            None => None,
        };
        self.state.remember(key, value.clone());
        Ok(value)
    }

    fn stage(&mut self, key: &str, value: Value) {
        self.state.stage(key, value);
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        let writes = self.state.take_writes();
        if !writes.is_empty() {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (key, value) in &writes {
                pipe.set(self.settings.qualify(key), serde_json::to_string(value)?)
                    .ignore();
            }

            let _: () = pipe.query_async(&mut self.conn).await?;
            debug!(objects = writes.len(), "Redis transaction committed");
        }
        self.state.reset();
        Ok(())
    }

    fn abort(&mut self) {
        self.state.reset();
    }
}
