// Root-to-container traversal

use super::{load_as, Session};
use crate::errors::PersistenceError;
use crate::task::{Container, TaskDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Locates the scheduler's owning container inside an open session
#[async_trait]
pub trait Locator: Send + Sync {
    /// Resolve `path` starting from the session's root object.
    /// Returns `None` when any segment of the path does not exist.
    async fn resolve(
        &self,
        session: &mut dyn Session,
        path: &str,
    ) -> Result<Option<Container>, PersistenceError>;
}

/// Stored shape of every object in the tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerNode {
    /// Child segment name -> key of the child object
    #[serde(default)]
    pub children: BTreeMap<String, String>,
    /// Tasks held directly by this object, keyed by name
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDefinition>,
}

impl ContainerNode {
    pub fn with_child(mut self, segment: &str, key: &str) -> Self {
        self.children.insert(segment.to_string(), key.to_string());
        self
    }

    pub fn with_task(mut self, name: &str, task: TaskDefinition) -> Self {
        self.tasks.insert(name.to_string(), task);
        self
    }
}

/// Walks `root -> children[segment] -> ...` one path segment at a time
#[derive(Debug, Clone)]
pub struct PathLocator {
    root_key: String,
}

impl PathLocator {
    pub fn new(root_key: impl Into<String>) -> Self {
        Self {
            root_key: root_key.into(),
        }
    }
}

impl Default for PathLocator {
    fn default() -> Self {
        Self::new("root")
    }
}

#[async_trait]
impl Locator for PathLocator {
    async fn resolve(
        &self,
        session: &mut dyn Session,
        path: &str,
    ) -> Result<Option<Container>, PersistenceError> {
        let mut key = self.root_key.clone();
        let Some(mut node) = load_as::<ContainerNode>(session, &key).await? else {
            debug!(root_key = %key, "Root object not found");
            return Ok(None);
        };

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            key = match node.children.get(segment) {
                Some(child) => child.clone(),
                None => {
                    debug!(path = %path, segment = %segment, "Path segment not found");
                    return Ok(None);
                }
            };
            node = match load_as::<ContainerNode>(session, &key).await? {
                Some(node) => node,
                None => {
                    debug!(path = %path, key = %key, "Dangling child reference");
                    return Ok(None);
                }
            };
        }

        Ok(Some(Container {
            path: path.to_string(),
            key,
            tasks: node.tasks,
        }))
    }
}
