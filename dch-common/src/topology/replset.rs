//! Replica set fixture.
//!
//! Launches N members, initiates the set with a role-tagged config
//! document, and exposes election-aware accessors. A set may transiently
//! have zero visible primaries during an election; `await_stable_state`
//! converges on exactly one.

use crate::client::CommandClient;
use crate::command::CommandRequest;
use crate::config::TopologySettings;
use crate::errors::{HarnessError, HarnessResult};
use crate::poll::{self, PollOpts};
use crate::topology::process::{NodeLauncher, ProcessConfig, ProcessHandle};
use crate::topology::probe_role;
use crate::types::{MemberSpec, NodeAddr, NodeKind, ReplSetRole};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval while watching election state.
const ELECTION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default stepdown period requested from the server.
const STEPDOWN_SECS: u64 = 60;

/// One launched member plus the spec it was launched with.
#[derive(Clone)]
pub struct Member {
    handle: Arc<dyn ProcessHandle>,
    spec: MemberSpec,
}

impl Member {
    pub fn handle(&self) -> &Arc<dyn ProcessHandle> {
        &self.handle
    }

    pub fn spec(&self) -> &MemberSpec {
        &self.spec
    }

    pub fn addr(&self) -> NodeAddr {
        self.handle.addr()
    }

    /// A command client bound to this member.
    pub fn client(&self) -> CommandClient {
        CommandClient::new(self.handle.transport())
    }

    pub async fn is_alive(&self) -> bool {
        self.handle.is_alive().await
    }
}

/// A running replica set owned by the harness.
pub struct ReplicaSetFixture {
    set_name: String,
    members: Vec<Member>,
    config_version: u64,
    settings: TopologySettings,
    launcher: Arc<dyn NodeLauncher>,
    kind: NodeKind,
    extra_options: ProcessConfig,
}

impl std::fmt::Debug for ReplicaSetFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSetFixture")
            .field("set_name", &self.set_name)
            .field("member_count", &self.members.len())
            .field("config_version", &self.config_version)
            .field("settings", &self.settings)
            .field("kind", &self.kind)
            .field("extra_options", &self.extra_options)
            .finish_non_exhaustive()
    }
}

impl ReplicaSetFixture {
    /// Launch and initiate a replica set with default process options.
    pub async fn start(
        launcher: Arc<dyn NodeLauncher>,
        set_name: &str,
        specs: Vec<MemberSpec>,
        settings: TopologySettings,
    ) -> HarnessResult<Self> {
        Self::start_with_options(
            launcher,
            set_name,
            specs,
            settings,
            NodeKind::ReplSetMember,
            ProcessConfig::new(),
        )
        .await
    }

    /// Launch and initiate a replica set whose members carry extra process
    /// options (config-server and shard members of a sharded cluster).
    pub async fn start_with_options(
        launcher: Arc<dyn NodeLauncher>,
        set_name: &str,
        specs: Vec<MemberSpec>,
        settings: TopologySettings,
        kind: NodeKind,
        extra_options: ProcessConfig,
    ) -> HarnessResult<Self> {
        if specs.is_empty() {
            return Err(HarnessError::TopologyInit(format!(
                "replica set '{set_name}' needs at least one member"
            )));
        }

        info!(set = set_name, members = specs.len(), "starting replica set");
        let mut members: Vec<Member> = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let mut config = extra_options.clone().set("replSet", set_name);
            if spec.arbiter_only {
                config = config.set("arbiterOnly", true);
            }
            match launcher.launch(kind, config).await {
                Ok(handle) => members.push(Member {
                    handle,
                    spec: spec.clone(),
                }),
                Err(err) => {
                    warn!(set = set_name, index, %err, "member launch failed, cleaning up");
                    stop_all(&members, settings.stop_grace()).await;
                    return Err(HarnessError::TopologyInit(format!(
                        "launch of member {index} of '{set_name}' failed: {err}"
                    )));
                }
            }
        }

        let fixture = Self {
            set_name: set_name.to_string(),
            members,
            config_version: 1,
            settings,
            launcher,
            kind,
            extra_options,
        };

        if let Err(err) = fixture.bring_up().await {
            let _ = fixture.teardown().await;
            return Err(err);
        }
        Ok(fixture)
    }

    /// Wait for every member to answer ping, initiate, and settle.
    async fn bring_up(&self) -> HarnessResult<()> {
        let reachable_opts = PollOpts::fast().with_timeout(self.settings.init_timeout());
        for member in &self.members {
            let client = member.client();
            let addr = member.addr();
            poll::wait_until(
                &format!("member {addr} of '{}' reachable", self.set_name),
                reachable_opts,
                || {
                    let client = client.clone();
                    let addr = addr.clone();
                    async move {
                        client
                            .run(CommandRequest::new(addr, json!({ "ping": 1 })))
                            .await
                            .map(|resp| resp.ok)
                    }
                },
            )
            .await
            .map_err(|err| HarnessError::TopologyInit(err.to_string()))?;
        }

        self.initiate().await?;
        self.await_stable_state().await
    }

    /// Send the initiate command carrying the member config document.
    async fn initiate(&self) -> HarnessResult<()> {
        let config = self.config_document();
        let seed = &self.members[0];
        debug!(set = %self.set_name, "initiating replica set");
        seed.client()
            .run_expecting_success(CommandRequest::new(
                seed.addr(),
                json!({ "replSetInitiate": config }),
            ))
            .await
            .map_err(|err| HarnessError::TopologyInit(err.to_string()))?;
        Ok(())
    }

    /// The member config document at the current configuration version.
    fn config_document(&self) -> Value {
        let members: Vec<Value> = self
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| {
                json!({
                    "_id": index,
                    "host": member.addr().to_string(),
                    "priority": member.spec.priority,
                    "votes": member.spec.votes,
                    "arbiterOnly": member.spec.arbiter_only,
                    "tags": member.spec.tags,
                })
            })
            .collect();
        json!({
            "_id": self.set_name,
            "version": self.config_version,
            "members": members,
        })
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn kind(&self) -> crate::types::TopologyKind {
        crate::types::TopologyKind::ReplicaSet
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, index: usize) -> &Member {
        &self.members[index]
    }

    /// Configuration version, incremented by every membership change.
    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    /// Addresses of all members, for seed lists and addShard strings.
    pub fn member_addrs(&self) -> Vec<NodeAddr> {
        self.members.iter().map(Member::addr).collect()
    }

    /// Connection string: `setName/host:port,host:port`.
    pub fn connection_string(&self) -> String {
        let hosts: Vec<String> = self.members.iter().map(|m| m.addr().to_string()).collect();
        format!("{}/{}", self.set_name, hosts.join(","))
    }

    /// Indexes of members currently observed as primary. Unreachable
    /// members are skipped, not counted.
    pub async fn observed_primaries(&self) -> Vec<usize> {
        let mut primaries = Vec::new();
        for (index, member) in self.members.iter().enumerate() {
            if !member.is_alive().await {
                continue;
            }
            if let Ok(ReplSetRole::Primary) = probe_role(&member.client(), member.addr()).await {
                primaries.push(index);
            }
        }
        primaries
    }

    /// Converge on a stable set: exactly one visible primary.
    pub async fn await_stable_state(&self) -> HarnessResult<()> {
        let opts = PollOpts::new(ELECTION_POLL_INTERVAL, self.settings.stable_timeout());
        poll::wait_until(
            &format!("exactly one primary in '{}'", self.set_name),
            opts,
            move || async move {
                let primaries = self.observed_primaries().await;
                Ok(primaries.len() == 1)
            },
        )
        .await
    }

    /// Wait for a primary and return its index.
    pub async fn await_primary(&self) -> HarnessResult<usize> {
        let opts = PollOpts::new(ELECTION_POLL_INTERVAL, self.settings.stable_timeout());
        poll::wait_for(
            &format!("a primary in '{}'", self.set_name),
            opts,
            move || async move {
                let primaries = self.observed_primaries().await;
                Ok(if primaries.len() == 1 {
                    Some(primaries[0])
                } else {
                    None
                })
            },
        )
        .await
    }

    /// Client bound to the current primary.
    pub async fn primary_client(&self) -> HarnessResult<CommandClient> {
        let index = self.await_primary().await?;
        Ok(self.members[index].client())
    }

    /// Clients bound to every data-bearing secondary.
    pub async fn secondary_clients(&self) -> HarnessResult<Vec<CommandClient>> {
        let mut clients = Vec::new();
        for member in &self.members {
            if !member.is_alive().await || member.spec.arbiter_only {
                continue;
            }
            if let Ok(ReplSetRole::Secondary) = probe_role(&member.client(), member.addr()).await {
                clients.push(member.client());
            }
        }
        Ok(clients)
    }

    /// Ask a specific member to run for primary, then wait for the set to
    /// settle on it.
    pub async fn step_up(&self, index: usize) -> HarnessResult<()> {
        let member = &self.members[index];
        info!(set = %self.set_name, index, "requesting step-up");
        member
            .client()
            .run_expecting_success(CommandRequest::new(
                member.addr(),
                json!({ "replSetStepUp": 1 }),
            ))
            .await?;
        self.await_stable_state().await
    }

    /// Ask the current primary to step down.
    ///
    /// A stepdown legitimately interrupts the connection that issued it,
    /// so a transport-classified failure of this one command is treated as
    /// success; a well-formed rejection still propagates.
    pub async fn step_down(&self) -> HarnessResult<()> {
        let index = self.await_primary().await?;
        let member = &self.members[index];
        info!(set = %self.set_name, index, "requesting step-down");
        let request = CommandRequest::new(
            member.addr(),
            json!({ "replSetStepDown": STEPDOWN_SECS }),
        );
        match member.client().run(request).await {
            Ok(resp) if resp.ok => Ok(()),
            Ok(resp) => {
                let error = resp.error.unwrap_or_else(|| crate::command::CommandError {
                    code: 0,
                    code_name: String::new(),
                    message: "failure response without error detail".into(),
                });
                Err(HarnessError::CommandFailed {
                    command: "replSetStepDown".into(),
                    code: error.code,
                    message: error.message,
                })
            }
            Err(err) if err.is_transport() => {
                debug!(set = %self.set_name, "stepdown dropped its own connection (expected)");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Launch and add a new member, bumping the config version.
    pub async fn add_member(&mut self, spec: MemberSpec) -> HarnessResult<()> {
        let mut config = self.extra_options.clone().set("replSet", &*self.set_name);
        if spec.arbiter_only {
            config = config.set("arbiterOnly", true);
        }
        let handle = self.launcher.launch(self.kind, config).await?;
        self.members.push(Member { handle, spec });
        self.config_version += 1;
        self.reconfig().await
    }

    /// Stop and remove the member at `index`, bumping the config version.
    pub async fn remove_member(&mut self, index: usize) -> HarnessResult<()> {
        let member = self.members.remove(index);
        let _ = member.handle.stop(self.settings.stop_grace()).await;
        self.config_version += 1;
        self.reconfig().await
    }

    async fn reconfig(&self) -> HarnessResult<()> {
        let config = self.config_document();
        let index = self.await_primary().await?;
        let primary = &self.members[index];
        primary
            .client()
            .run_expecting_success(CommandRequest::new(
                primary.addr(),
                json!({ "replSetReconfig": config }),
            ))
            .await?;
        Ok(())
    }

    /// Stop one member without removing it from the set.
    pub async fn stop_member(&self, index: usize) -> HarnessResult<()> {
        self.members[index]
            .handle
            .stop(self.settings.stop_grace())
            .await
    }

    /// Restart a stopped member.
    pub async fn restart_member(&self, index: usize) -> HarnessResult<()> {
        self.members[index].handle.start().await
    }

    /// Stop every member, best-effort: every member gets a stop attempt
    /// regardless of earlier failures; the last error is returned.
    pub async fn teardown(&self) -> HarnessResult<()> {
        info!(set = %self.set_name, "tearing down replica set");
        match stop_all(&self.members, self.settings.stop_grace()).await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Stop all members; returns the last error encountered, if any.
async fn stop_all(members: &[Member], grace: Duration) -> Option<HarnessError> {
    let mut last_error = None;
    for member in members {
        if let Err(err) = member.handle.stop(grace).await {
            warn!(addr = %member.addr(), %err, "member stop failed");
            last_error = Some(err);
        }
    }
    last_error
}
