//! Process handle and launcher seams.
//!
//! The harness orchestrates server processes but never spawns them itself:
//! a `ProcessHandle` is handed in by a `NodeLauncher` (the in-tree mock, or
//! an external integration wrapping real OS processes) and owned
//! exclusively by the topology that requested it.

use crate::client::Transport;
use crate::errors::HarnessResult;
use crate::types::{NodeAddr, NodeId, NodeKind};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Arbitrary key→value launch options for one process.
///
/// Keys are server options ("replSet", "shardsvr", ...); the harness treats
/// them as opaque apart from the ones it sets itself.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    options: BTreeMap<String, Value>,
}

impl ProcessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.options.iter()
    }
}

/// Handle to one launched server process.
///
/// Created by a `NodeLauncher` on topology start; the liveness flag flips
/// false on stop or crash; the process is terminated on topology teardown
/// or explicit stop.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn id(&self) -> &NodeId;

    fn addr(&self) -> NodeAddr;

    fn config(&self) -> &ProcessConfig;

    async fn is_alive(&self) -> bool;

    /// (Re)start the process with its existing configuration.
    async fn start(&self) -> HarnessResult<()>;

    /// Stop the process, allowing `grace` for a clean shutdown.
    async fn stop(&self, grace: Duration) -> HarnessResult<()>;

    /// A transport bound to this process's endpoint.
    fn transport(&self) -> Arc<dyn Transport>;
}

/// Factory for process handles.
#[async_trait]
pub trait NodeLauncher: Send + Sync {
    /// Launch one process of the given kind with the given options.
    async fn launch(
        &self,
        kind: NodeKind,
        config: ProcessConfig,
    ) -> HarnessResult<Arc<dyn ProcessHandle>>;
}
