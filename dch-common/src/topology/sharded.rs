//! Sharded cluster fixture.
//!
//! One replica set per shard, one config-server replica set, one or more
//! routers. Shards are registered through the router with addShard. A
//! bring-up failure at any stage tears down everything already started;
//! a partially built cluster never leaks processes.

use crate::client::CommandClient;
use crate::command::CommandRequest;
use crate::config::TopologySettings;
use crate::errors::{HarnessError, HarnessResult};
use crate::poll::{self, PollOpts};
use crate::topology::process::{NodeLauncher, ProcessConfig, ProcessHandle};
use crate::topology::replset::ReplicaSetFixture;
use crate::types::{MemberSpec, NodeKind};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Shape of a sharded cluster to bring up.
#[derive(Debug, Clone)]
pub struct ShardedClusterSpec {
    /// Member specs per shard; one replica set each.
    pub shards: Vec<Vec<MemberSpec>>,
    /// Member specs for the config-server replica set.
    pub config_servers: Vec<MemberSpec>,
    /// Number of routers.
    pub routers: usize,
}

impl ShardedClusterSpec {
    /// `shard_count` single-member shards, one config server, one router.
    pub fn minimal(shard_count: usize) -> Self {
        Self {
            shards: (0..shard_count)
                .map(|_| vec![MemberSpec::data_node()])
                .collect(),
            config_servers: vec![MemberSpec::data_node()],
            routers: 1,
        }
    }
}

/// A running sharded cluster owned by the harness.
pub struct ShardedClusterFixture {
    config_servers: ReplicaSetFixture,
    shards: Vec<ReplicaSetFixture>,
    routers: Vec<Arc<dyn ProcessHandle>>,
    settings: TopologySettings,
}

impl ShardedClusterFixture {
    pub async fn start(
        launcher: Arc<dyn NodeLauncher>,
        spec: ShardedClusterSpec,
        settings: TopologySettings,
    ) -> HarnessResult<Self> {
        if spec.shards.is_empty() {
            return Err(HarnessError::TopologyInit(
                "sharded cluster needs at least one shard".into(),
            ));
        }
        if spec.routers == 0 {
            return Err(HarnessError::TopologyInit(
                "sharded cluster needs at least one router".into(),
            ));
        }

        info!(
            shards = spec.shards.len(),
            routers = spec.routers,
            "starting sharded cluster"
        );

        let config_servers = ReplicaSetFixture::start_with_options(
            launcher.clone(),
            "configRepl",
            spec.config_servers,
            settings.clone(),
            NodeKind::ConfigServer,
            ProcessConfig::new().set("configsvr", true),
        )
        .await?;

        let mut shards: Vec<ReplicaSetFixture> = Vec::with_capacity(spec.shards.len());
        for (index, member_specs) in spec.shards.into_iter().enumerate() {
            let name = format!("shard{index}");
            let started = ReplicaSetFixture::start_with_options(
                launcher.clone(),
                &name,
                member_specs,
                settings.clone(),
                NodeKind::ReplSetMember,
                ProcessConfig::new().set("shardsvr", true),
            )
            .await;
            match started {
                Ok(fixture) => shards.push(fixture),
                Err(err) => {
                    warn!(shard = %name, %err, "shard bring-up failed, tearing down partial cluster");
                    teardown_sets(&shards, &config_servers).await;
                    return Err(err);
                }
            }
        }

        let mut routers: Vec<Arc<dyn ProcessHandle>> = Vec::with_capacity(spec.routers);
        for _ in 0..spec.routers {
            let config = ProcessConfig::new()
                .set("configdb", config_servers.connection_string());
            match launcher.launch(NodeKind::Router, config).await {
                Ok(handle) => routers.push(handle),
                Err(err) => {
                    warn!(%err, "router launch failed, tearing down partial cluster");
                    stop_routers(&routers, &settings).await;
                    teardown_sets(&shards, &config_servers).await;
                    return Err(HarnessError::TopologyInit(format!(
                        "router launch failed: {err}"
                    )));
                }
            }
        }

        let fixture = Self {
            config_servers,
            shards,
            routers,
            settings,
        };

        if let Err(err) = fixture.register_shards().await {
            let _ = fixture.teardown().await;
            return Err(err);
        }
        if let Err(err) = fixture.await_stable_state().await {
            let _ = fixture.teardown().await;
            return Err(err);
        }
        Ok(fixture)
    }

    /// Issue addShard for every shard through the first router.
    async fn register_shards(&self) -> HarnessResult<()> {
        let client = self.router_client(0);
        let addr = self.routers[0].addr();
        for shard in &self.shards {
            client
                .run_expecting_success(CommandRequest::new(
                    addr.clone(),
                    json!({ "addShard": shard.connection_string() }),
                ))
                .await
                .map_err(|err| {
                    HarnessError::TopologyInit(format!(
                        "addShard for '{}' failed: {err}",
                        shard.set_name()
                    ))
                })?;
        }
        Ok(())
    }

    pub fn kind(&self) -> crate::types::TopologyKind {
        crate::types::TopologyKind::ShardedCluster
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> &ReplicaSetFixture {
        &self.shards[index]
    }

    pub fn shards(&self) -> &[ReplicaSetFixture] {
        &self.shards
    }

    pub fn config_servers(&self) -> &ReplicaSetFixture {
        &self.config_servers
    }

    pub fn router(&self, index: usize) -> &Arc<dyn ProcessHandle> {
        &self.routers[index]
    }

    /// Client bound to router `index`.
    pub fn router_client(&self, index: usize) -> CommandClient {
        CommandClient::new(self.routers[index].transport())
    }

    /// Converge on a stable cluster: every shard has exactly one primary,
    /// and the router is reachable and reports every registered shard.
    pub async fn await_stable_state(&self) -> HarnessResult<()> {
        for shard in &self.shards {
            shard.await_stable_state().await?;
        }
        self.config_servers.await_stable_state().await?;

        let client = self.router_client(0);
        let addr = self.routers[0].addr();
        let expected = self.shards.len();
        let opts = PollOpts::default().with_timeout(self.settings.stable_timeout());
        poll::wait_until("router reports all shards", opts, || {
            let client = client.clone();
            let addr = addr.clone();
            async move {
                let payload = client
                    .run_expecting_success(CommandRequest::new(addr, json!({ "listShards": 1 })))
                    .await?;
                let count = payload
                    .get("shards")
                    .and_then(|v| v.as_array())
                    .map(Vec::len)
                    .unwrap_or(0);
                Ok(count == expected)
            }
        })
        .await
    }

    /// Stop routers, shards, and config servers, best-effort: every
    /// component gets a stop attempt; the last error is returned.
    pub async fn teardown(&self) -> HarnessResult<()> {
        info!("tearing down sharded cluster");
        let mut last_error = None;

        if let Some(err) = stop_routers(&self.routers, &self.settings).await {
            last_error = Some(err);
        }
        for shard in &self.shards {
            if let Err(err) = shard.teardown().await {
                last_error = Some(err);
            }
        }
        if let Err(err) = self.config_servers.teardown().await {
            last_error = Some(err);
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn teardown_sets(shards: &[ReplicaSetFixture], config_servers: &ReplicaSetFixture) {
    for shard in shards {
        let _ = shard.teardown().await;
    }
    let _ = config_servers.teardown().await;
}

async fn stop_routers(
    routers: &[Arc<dyn ProcessHandle>],
    settings: &TopologySettings,
) -> Option<HarnessError> {
    let mut last_error = None;
    for router in routers {
        if let Err(err) = router.stop(settings.stop_grace()).await {
            warn!(addr = %router.addr(), %err, "router stop failed");
            last_error = Some(err);
        }
    }
    last_error
}
