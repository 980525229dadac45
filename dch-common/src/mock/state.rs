//! Shared state behind the mock cluster.
//!
//! Node state sits behind a std `Mutex` and is never held across an await;
//! blocking behaviors (fail-point pauses, simulated latency) re-check state
//! in a notify loop instead.

use crate::topology::process::ProcessConfig;
use crate::types::{NodeAddr, NodeId, NodeKind, ReplSetRole};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

use super::MockOptions;

/// Structured log event ids emitted by mock nodes.
pub mod log_ids {
    pub const NODE_STARTED: i64 = 23015;
    pub const NODE_SHUTDOWN: i64 = 23016;
    pub const REPLSET_INITIATED: i64 = 21356;
    pub const ELECTION_WON: i64 = 21215;
    pub const STEPPED_DOWN: i64 = 21358;
    pub const FAIL_POINT_HIT: i64 = 23058;
    pub const CHUNK_MIGRATION_STARTED: i64 = 22016;
    pub const CHUNK_MIGRATION_COMMITTED: i64 = 22017;
}

/// Fail point activation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FpMode {
    Off,
    AlwaysOn,
    Times(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct FailPointState {
    pub mode: FpMode,
    pub data: Value,
    pub times_entered: u64,
}

impl FailPointState {
    pub fn off() -> Self {
        Self {
            mode: FpMode::Off,
            data: Value::Null,
            times_entered: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, FpMode::Off)
    }

    /// Whether this fail point applies to `command`. A `commands` list in
    /// the data payload restricts the scope; no list means every command.
    pub fn applies_to(&self, command: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.data.get("commands").and_then(Value::as_array) {
            Some(commands) => commands.iter().any(|c| c.as_str() == Some(command)),
            None => true,
        }
    }

    /// Consume one activation: bumps the hit counter and, in times-mode,
    /// decrements toward auto-disarm.
    pub fn consume(&mut self) {
        self.times_entered += 1;
        if let FpMode::Times(remaining) = &mut self.mode {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.mode = FpMode::Off;
            }
        }
    }
}

/// Replica-set view of one node.
#[derive(Debug, Clone)]
pub(crate) struct ReplState {
    pub set_name: Option<String>,
    pub role: ReplSetRole,
    pub priority: f64,
    pub arbiter: bool,
    pub config_version: u64,
    /// Node refuses to run for primary until this instant.
    pub stepdown_until: Option<Instant>,
}

impl ReplState {
    fn new() -> Self {
        Self {
            set_name: None,
            role: ReplSetRole::Startup,
            priority: 1.0,
            arbiter: false,
            config_version: 0,
            stepdown_until: None,
        }
    }

    pub fn eligible(&self, now: Instant) -> bool {
        self.set_name.is_some()
            && !self.arbiter
            && self.stepdown_until.is_none_or(|until| until <= now)
    }
}

/// One registered shard, as seen by a router.
#[derive(Debug, Clone)]
pub(crate) struct ShardEntry {
    pub name: String,
    pub connection_string: String,
}

/// One contiguous shard-key range. `min` inclusive, `max` exclusive.
#[derive(Debug, Clone)]
pub(crate) struct Chunk {
    pub min: f64,
    pub max: f64,
    pub shard: String,
}

impl Chunk {
    pub fn contains(&self, key: f64) -> bool {
        key >= self.min && key < self.max
    }
}

/// Routing metadata for one sharded namespace.
#[derive(Debug, Clone)]
pub(crate) struct ShardedNs {
    pub key_field: String,
    pub chunks: Vec<Chunk>,
}

impl ShardedNs {
    pub fn owning_shard(&self, key: f64) -> Option<&str> {
        self.chunks
            .iter()
            .find(|c| c.contains(key))
            .map(|c| c.shard.as_str())
    }
}

/// Mutable state of one mock node.
pub(crate) struct NodeState {
    pub alive: bool,
    pub repl: ReplState,
    pub collections: HashMap<String, Vec<Value>>,
    pub fail_points: HashMap<String, FailPointState>,
    pub log: Vec<Value>,
    pub params: HashMap<String, Value>,
    pub ops: HashMap<u64, Value>,
    pub next_op_id: u64,
    // Router-only.
    pub shards: Vec<ShardEntry>,
    pub sharded: HashMap<String, ShardedNs>,
}

impl NodeState {
    pub fn new() -> Self {
        let mut params = HashMap::new();
        params.insert(
            "featureCompatibilityVersion".to_string(),
            json!({ "version": "8.0" }),
        );
        Self {
            alive: true,
            repl: ReplState::new(),
            collections: HashMap::new(),
            fail_points: HashMap::new(),
            log: Vec::new(),
            params,
            ops: HashMap::new(),
            next_op_id: 1,
            shards: Vec::new(),
            sharded: HashMap::new(),
        }
    }

    /// Append a structured log event.
    pub fn log_event(&mut self, id: i64, msg: &str, attr: Value) {
        self.log.push(json!({
            "t": chrono::Utc::now().to_rfc3339(),
            "s": "I",
            "id": id,
            "msg": msg,
            "attr": attr,
        }));
    }
}

/// One mock node: identity plus lockable state plus a wakeup channel.
pub(crate) struct NodeShared {
    pub id: NodeId,
    pub addr: NodeAddr,
    pub kind: NodeKind,
    pub config: ProcessConfig,
    pub state: Mutex<NodeState>,
    /// Woken on stop/start and fail-point reconfiguration.
    pub notify: Notify,
}

impl NodeShared {
    pub fn is_alive_now(&self) -> bool {
        self.state.lock().expect("node state poisoned").alive
    }

    pub fn log_event(&self, id: i64, msg: &str, attr: Value) {
        self.state
            .lock()
            .expect("node state poisoned")
            .log_event(id, msg, attr);
    }

    pub fn role(&self) -> ReplSetRole {
        self.state.lock().expect("node state poisoned").repl.role
    }
}

/// Registry and options shared by every node of one mock cluster.
pub(crate) struct ClusterShared {
    pub nodes: RwLock<Vec<Arc<NodeShared>>>,
    pub options: MockOptions,
    pub next_port: AtomicU16,
}

impl ClusterShared {
    pub fn new(options: MockOptions) -> Self {
        let base_port = options.base_port;
        Self {
            nodes: RwLock::new(Vec::new()),
            options,
            next_port: AtomicU16::new(base_port),
        }
    }

    pub fn allocate_addr(&self) -> NodeAddr {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        NodeAddr::new("localhost", port)
    }

    pub fn register(&self, node: Arc<NodeShared>) {
        self.nodes.write().expect("registry poisoned").push(node);
    }

    pub fn node_at(&self, addr: &NodeAddr) -> Option<Arc<NodeShared>> {
        self.nodes
            .read()
            .expect("registry poisoned")
            .iter()
            .find(|n| &n.addr == addr)
            .cloned()
    }

    /// All nodes initiated into the named replica set.
    pub fn set_members(&self, set_name: &str) -> Vec<Arc<NodeShared>> {
        self.nodes
            .read()
            .expect("registry poisoned")
            .iter()
            .filter(|n| {
                n.state
                    .lock()
                    .expect("node state poisoned")
                    .repl
                    .set_name
                    .as_deref()
                    == Some(set_name)
            })
            .cloned()
            .collect()
    }

    /// The current primary of a set, if one is visible.
    pub fn set_primary(&self, set_name: &str) -> Option<Arc<NodeShared>> {
        self.set_members(set_name).into_iter().find(|n| {
            let state = n.state.lock().expect("node state poisoned");
            state.alive && state.repl.role == ReplSetRole::Primary
        })
    }

    /// Promote the best eligible member of `set_name` if no live primary
    /// exists. Returns the promoted node.
    pub fn elect_now(&self, set_name: &str) -> Option<Arc<NodeShared>> {
        if self.set_primary(set_name).is_some() {
            return None;
        }
        let now = Instant::now();
        let members = self.set_members(set_name);
        let mut best: Option<(f64, Arc<NodeShared>)> = None;
        let mut fallback: Option<(f64, Arc<NodeShared>)> = None;
        for member in members {
            let state = member.state.lock().expect("node state poisoned");
            let eligible = state.alive && state.repl.eligible(now);
            let candidate = state.alive && state.repl.set_name.is_some() && !state.repl.arbiter;
            let priority = state.repl.priority;
            drop(state);
            if priority <= 0.0 {
                continue;
            }
            if eligible && best.as_ref().is_none_or(|(p, _)| priority > *p) {
                best = Some((priority, Arc::clone(&member)));
            }
            if candidate && fallback.as_ref().is_none_or(|(p, _)| priority > *p) {
                fallback = Some((priority, member));
            }
        }
        // With every candidate in stepdown cooldown (a one-node set after
        // stepdown), the freeze effectively expires early rather than
        // leaving the set primaryless forever.
        let (_, winner) = best.or(fallback)?;
        {
            let mut state = winner.state.lock().expect("node state poisoned");
            state.repl.role = ReplSetRole::Primary;
            let set = set_name.to_string();
            let host = winner.addr.to_string();
            state.log_event(
                log_ids::ELECTION_WON,
                "election succeeded, assuming primary role",
                json!({ "set": set, "host": host }),
            );
        }
        debug!(set = set_name, winner = %winner.addr, "mock election complete");
        winner.notify.notify_waiters();
        Some(winner)
    }

    /// Run an election for `set_name` after the configured delay.
    pub fn schedule_election(self: &Arc<Self>, set_name: String) {
        let cluster = Arc::clone(self);
        let delay = self.options.election_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cluster.elect_now(&set_name);
        });
    }
}

/// Registration of one in-flight operation in a node's currentOp table;
/// deregisters on drop, including cancellation paths.
pub(crate) struct OpGuard {
    node: Arc<NodeShared>,
    pub op_id: u64,
}

impl OpGuard {
    pub fn register(node: &Arc<NodeShared>, command: &str, comment: Option<&str>) -> Self {
        let mut state = node.state.lock().expect("node state poisoned");
        let op_id = state.next_op_id;
        state.next_op_id += 1;
        let mut doc = json!({
            "opid": op_id,
            "op": "command",
            "command": command,
            "active": true,
        });
        if let Some(comment) = comment {
            doc["comment"] = json!(comment);
        }
        state.ops.insert(op_id, doc);
        drop(state);
        Self {
            node: Arc::clone(node),
            op_id,
        }
    }

    /// Tag this operation as paused at a fail point (visible in currentOp).
    pub fn set_failpoint_msg(&self, name: &str) {
        let mut state = self.node.state.lock().expect("node state poisoned");
        if let Some(doc) = state.ops.get_mut(&self.op_id) {
            doc["failpointMsg"] = json!(name);
        }
    }

    pub fn clear_failpoint_msg(&self) {
        let mut state = self.node.state.lock().expect("node state poisoned");
        if let Some(doc) = state.ops.get_mut(&self.op_id)
            && let Some(obj) = doc.as_object_mut()
        {
            obj.remove("failpointMsg");
        }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.node.state.lock() {
            state.ops.remove(&self.op_id);
        }
    }
}

/// Kill-aware sleep: resolves early with `Err` when the node stops.
pub(crate) async fn sleep_watching_kill(
    node: &Arc<NodeShared>,
    duration: Duration,
) -> Result<(), ()> {
    let deadline = Instant::now() + duration;
    loop {
        if !node.is_alive_now() {
            return Err(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let chunk = (deadline - now).min(Duration::from_millis(20));
        tokio::select! {
            _ = tokio::time::sleep(chunk) => {}
            _ = node.notify.notified() => {}
        }
    }
}
