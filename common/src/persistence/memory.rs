// In-process persistence backend, used for tests and single-node development

use super::{Backend, ConnectionSettings, Session, SessionState};
use crate::errors::PersistenceError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared object map; every session opened from a clone sees the same data
#[derive(Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, Value>>>,
    sessions_opened: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an object directly, outside of any session
    pub async fn seed(&self, settings: &ConnectionSettings, key: &str, value: Value) {
        self.objects
            .write()
            .await
            .insert(settings.qualify(key), value);
    }

    /// Read an object directly, outside of any session
    pub async fn get(&self, settings: &ConnectionSettings, key: &str) -> Option<Value> {
        self.objects.read().await.get(&settings.qualify(key)).cloned()
    }

    /// Number of sessions opened so far
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Session>, PersistenceError> {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            objects: self.objects.clone(),
            settings: settings.clone(),
            state: SessionState::default(),
        }))
    }
}

struct MemorySession {
    objects: Arc<RwLock<HashMap<String, Value>>>,
    settings: ConnectionSettings,
    state: SessionState,
}

#[async_trait]
impl Session for MemorySession {
    async fn load(&mut self, key: &str) -> Result<Option<Value>, PersistenceError> {
        if let Some(cached) = self.state.cached(key) {
            return Ok(cached);
        }
        let value = self
            .objects
            .read()
            .await
            .get(&self.settings.qualify(key))
            .cloned();
        self.state.remember(key, value.clone());
        Ok(value)
    }

    fn stage(&mut self, key: &str, value: Value) {
        self.state.stage(key, value);
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        let writes = self.state.take_writes();
        if !writes.is_empty() {
            let mut objects = self.objects.write().await;
            for (key, value) in writes {
                objects.insert(self.settings.qualify(&key), value);
            }
        }
        self.state.reset();
        Ok(())
    }

    fn abort(&mut self) {
        self.state.reset();
    }
}
