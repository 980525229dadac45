//! In-process mock cluster.
//!
//! Implements the launcher/process/transport seams entirely in memory; no
//! network sockets are opened, which keeps CI runs hermetic. Nodes speak
//! the same command documents a real deployment would: replica sets hold a
//! single primary and elect a successor after step-down, killed nodes fail
//! exchanges with transport-classified errors, and routers route writes by
//! shard-key range. Three generic fail points (`failCommand`,
//! `pauseCommand`, `delayCommand`) gate error injection, deterministic
//! pauses, and simulated latency.

mod dispatch;
mod state;

pub use dispatch::{DELAY_COMMAND, FAIL_COMMAND, PAUSE_COMMAND};
pub use state::log_ids;

use crate::client::{CommandClient, Transport};
use crate::command::{CommandRequest, CommandResponse};
use crate::errors::HarnessResult;
use crate::topology::process::{NodeLauncher, ProcessConfig, ProcessHandle};
use crate::types::{NodeAddr, NodeId, NodeKind, ReplSetRole};
use async_trait::async_trait;
use serde_json::json;
use state::{ClusterShared, NodeShared, NodeState};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Behavior knobs for a mock cluster.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Delay between a primary vacancy and the successor election.
    pub election_delay: Duration,
    /// Whether a stepdown resets the connection that issued it, as the
    /// corpus expects of a real deployment.
    pub stepdown_resets_connection: bool,
    /// First port handed out to launched nodes.
    pub base_port: u16,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            election_delay: Duration::from_millis(50),
            stepdown_resets_connection: true,
            base_port: 27017,
        }
    }
}

/// An in-process cluster of mock nodes. Cloning shares the registry.
#[derive(Clone)]
pub struct MockCluster {
    shared: Arc<ClusterShared>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::with_options(MockOptions::default())
    }

    pub fn with_options(options: MockOptions) -> Self {
        Self {
            shared: Arc::new(ClusterShared::new(options)),
        }
    }

    /// This cluster as the launcher seam the topology fixtures consume.
    pub fn launcher(&self) -> Arc<dyn NodeLauncher> {
        Arc::new(self.clone())
    }

    /// Client bound to an already-launched node.
    pub fn client_at(&self, addr: &NodeAddr) -> Option<CommandClient> {
        let node = self.shared.node_at(addr)?;
        Some(CommandClient::new(Arc::new(MockTransport {
            node,
            cluster: Arc::clone(&self.shared),
        })))
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeLauncher for MockCluster {
    async fn launch(
        &self,
        kind: NodeKind,
        config: ProcessConfig,
    ) -> HarnessResult<Arc<dyn ProcessHandle>> {
        let addr = self.shared.allocate_addr();
        let prefix = match kind {
            NodeKind::ReplSetMember => "node",
            NodeKind::ConfigServer => "config",
            NodeKind::Router => "router",
        };
        let id = NodeId::new(format!("{prefix}-{}", addr.port));
        let node = Arc::new(NodeShared {
            id,
            addr: addr.clone(),
            kind,
            config,
            state: Mutex::new(NodeState::new()),
            notify: Notify::new(),
        });
        node.log_event(
            log_ids::NODE_STARTED,
            "node started",
            json!({ "addr": addr.to_string() }),
        );
        self.shared.register(Arc::clone(&node));
        info!(addr = %addr, ?kind, "mock node launched");
        Ok(Arc::new(MockNode {
            node,
            cluster: Arc::clone(&self.shared),
        }))
    }
}

/// Process handle over one mock node.
pub struct MockNode {
    node: Arc<NodeShared>,
    cluster: Arc<ClusterShared>,
}

#[async_trait]
impl ProcessHandle for MockNode {
    fn id(&self) -> &NodeId {
        &self.node.id
    }

    fn addr(&self) -> NodeAddr {
        self.node.addr.clone()
    }

    fn config(&self) -> &ProcessConfig {
        &self.node.config
    }

    async fn is_alive(&self) -> bool {
        self.node.is_alive_now()
    }

    async fn start(&self) -> HarnessResult<()> {
        {
            let mut state = self.node.state.lock().expect("node state poisoned");
            if state.alive {
                return Ok(());
            }
            state.alive = true;
            // A restarted member rejoins as a secondary and must win an
            // election before taking writes again.
            if state.repl.set_name.is_some() && !state.repl.arbiter {
                state.repl.role = ReplSetRole::Secondary;
            }
            let addr = self.node.addr.to_string();
            state.log_event(log_ids::NODE_STARTED, "node started", json!({ "addr": addr }));
        }
        self.node.notify.notify_waiters();
        if let Some(set_name) = self.set_name() {
            self.cluster.schedule_election(set_name);
        }
        Ok(())
    }

    async fn stop(&self, _grace: Duration) -> HarnessResult<()> {
        let set_name = {
            let mut state = self.node.state.lock().expect("node state poisoned");
            if !state.alive {
                return Ok(());
            }
            let addr = self.node.addr.to_string();
            state.log_event(
                log_ids::NODE_SHUTDOWN,
                "shutting down",
                json!({ "addr": addr }),
            );
            state.alive = false;
            let was_primary = state.repl.role == ReplSetRole::Primary;
            if was_primary {
                state.repl.role = ReplSetRole::Secondary;
            }
            if was_primary { state.repl.set_name.clone() } else { None }
        };
        // In-flight exchanges observe the kill through the notifier.
        self.node.notify.notify_waiters();
        if let Some(set_name) = set_name {
            self.cluster.schedule_election(set_name);
        }
        Ok(())
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MockTransport {
            node: Arc::clone(&self.node),
            cluster: Arc::clone(&self.cluster),
        })
    }
}

impl MockNode {
    fn set_name(&self) -> Option<String> {
        self.node
            .state
            .lock()
            .expect("node state poisoned")
            .repl
            .set_name
            .clone()
    }
}

/// Transport bound to one mock node.
struct MockTransport {
    node: Arc<NodeShared>,
    cluster: Arc<ClusterShared>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(&self, request: &CommandRequest) -> HarnessResult<CommandResponse> {
        dispatch::dispatch(&self.cluster, &self.node, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServerErrorCode;
    use serde_json::json;

    async fn launch_standalone(cluster: &MockCluster) -> Arc<dyn ProcessHandle> {
        cluster
            .launcher()
            .launch(NodeKind::ReplSetMember, ProcessConfig::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        let client = CommandClient::new(node.transport());
        client
            .run_expecting_success(CommandRequest::new(node.addr(), json!({ "ping": 1 })))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_killed_node_fails_with_transport_error() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        node.stop(Duration::ZERO).await.unwrap();
        let client = CommandClient::new(node.transport());
        let err = client
            .run(CommandRequest::new(node.addr(), json!({ "ping": 1 })))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_restart_revives_node() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        node.stop(Duration::ZERO).await.unwrap();
        assert!(!node.is_alive().await);
        node.start().await.unwrap();
        assert!(node.is_alive().await);
        let client = CommandClient::new(node.transport());
        client
            .run_expecting_success(CommandRequest::new(node.addr(), json!({ "ping": 1 })))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_standalone_crud() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        let client = CommandClient::new(node.transport());

        client
            .run_expecting_success(CommandRequest::new(
                node.addr(),
                json!({ "insert": "users", "documents": [
                    { "_id": 1, "name": "ada" },
                    { "_id": 2, "name": "grace" },
                ]}),
            ))
            .await
            .unwrap();

        let payload = client
            .run_expecting_success(CommandRequest::new(
                node.addr(),
                json!({ "count": "users" }),
            ))
            .await
            .unwrap();
        assert_eq!(payload["n"], json!(2));

        let payload = client
            .run_expecting_success(CommandRequest::new(
                node.addr(),
                json!({ "find": "users", "filter": { "name": "ada" } }),
            ))
            .await
            .unwrap();
        let batch = payload.pointer("/cursor/firstBatch").unwrap();
        assert_eq!(batch.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        let client = CommandClient::new(node.transport());
        client
            .run_expecting_success(CommandRequest::new(
                node.addr(),
                json!({ "insert": "t", "documents": [{ "_id": 7 }] }),
            ))
            .await
            .unwrap();
        client
            .run_expecting_failure(
                CommandRequest::new(node.addr(), json!({ "insert": "t", "documents": [{ "_id": 7 }] })),
                ServerErrorCode::DuplicateKey,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fail_command_fail_point() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        let client = CommandClient::new(node.transport());
        client
            .run_expecting_success(CommandRequest::new(
                node.addr(),
                json!({
                    "configureFailPoint": FAIL_COMMAND,
                    "mode": { "times": 1 },
                    "data": { "errorCode": 50, "commands": ["count"] },
                }),
            ))
            .await
            .unwrap();

        client
            .run_expecting_failure(
                CommandRequest::new(node.addr(), json!({ "count": "t" })),
                ServerErrorCode::MaxTimeExpired,
            )
            .await
            .unwrap();

        // Times-mode disarms after one hit.
        client
            .run_expecting_success(CommandRequest::new(node.addr(), json!({ "count": "t" })))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sleep_command_honors_max_time() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        let client = CommandClient::new(node.transport());
        client
            .run_expecting_failure(
                CommandRequest::new(node.addr(), json!({ "sleep": 1, "millis": 1000 }))
                    .with_max_time(Duration::from_millis(10)),
                ServerErrorCode::MaxTimeExpired,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        let client = CommandClient::new(node.transport());
        client
            .run_expecting_failure(
                CommandRequest::new(node.addr(), json!({ "frobnicate": 1 })),
                ServerErrorCode::CommandNotFound,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_at_resolves_launched_nodes() {
        let cluster = MockCluster::new();
        let node = launch_standalone(&cluster).await;
        assert!(cluster.client_at(&node.addr()).is_some());
        assert!(
            cluster
                .client_at(&NodeAddr::new("localhost", 1))
                .is_none()
        );
    }
}
