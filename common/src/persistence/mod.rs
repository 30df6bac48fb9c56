// Persistence backend seam
//
// The scheduler only relies on three things from the backend: opening a session from a
// serializable connection descriptor, reading/staging objects inside that session, and
// atomic commit/abort. Everything else (the object tree, the task container) is layered on
// top through the `Locator`.

pub mod locator;
pub mod memory;
pub mod redis_backend;

pub use locator::{ContainerNode, Locator, PathLocator};
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

use crate::errors::PersistenceError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Descriptor sufficient to re-open a session to the persistence backend.
///
/// Passed by value into every worker and every fired task; never shared live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Backend URL, credentials included (e.g. "redis://:secret@localhost:6379/0")
    pub url: String,
    /// Key namespace all objects of this deployment live under
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

fn default_namespace() -> String {
    "scheduler".to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    5
}

impl ConnectionSettings {
    pub fn new(url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: namespace.into(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.max(1))
    }

    /// Fully qualified key for an object inside this namespace
    pub fn qualify(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

/// Opens sessions against a persistence backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a fresh session. The connection is released when the session is dropped.
    async fn open(&self, settings: &ConnectionSettings)
        -> Result<Box<dyn Session>, PersistenceError>;
}

/// One transaction-scoped view of the backend
#[async_trait]
pub trait Session: Send {
    /// Read an object. Staged writes are visible to later reads in the same session, and
    /// repeated reads return the value first observed until the session commits or aborts.
    async fn load(&mut self, key: &str) -> Result<Option<Value>, PersistenceError>;

    /// Stage a write; nothing reaches the backend before `commit`
    fn stage(&mut self, key: &str, value: Value);

    /// Atomically apply all staged writes
    async fn commit(&mut self) -> Result<(), PersistenceError>;

    /// Drop staged writes and forget everything read so far
    fn abort(&mut self);
}

/// Load and deserialize an object
pub async fn load_as<T: DeserializeOwned>(
    session: &mut dyn Session,
    key: &str,
) -> Result<Option<T>, PersistenceError> {
    match session.load(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| PersistenceError::InvalidData(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// Read cache and write buffer shared by the session implementations
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    reads: HashMap<String, Option<Value>>,
    writes: BTreeMap<String, Value>,
}

impl SessionState {
    pub(crate) fn cached(&self, key: &str) -> Option<Option<Value>> {
        if let Some(value) = self.writes.get(key) {
            return Some(Some(value.clone()));
        }
        self.reads.get(key).cloned()
    }

    pub(crate) fn remember(&mut self, key: &str, value: Option<Value>) {
        self.reads.insert(key.to_string(), value);
    }

    pub(crate) fn stage(&mut self, key: &str, value: Value) {
        self.writes.insert(key.to_string(), value);
    }

    pub(crate) fn take_writes(&mut self) -> BTreeMap<String, Value> {
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn reset(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }
}
