//! Command dispatch for mock nodes.
//!
//! Every command funnels through [`dispatch`]: liveness check, the
//! failCommand/pauseCommand/delayCommand fail points, simulated latency
//! against the request's max-time bound, then per-command execution.
//! Router nodes route CRUD by shard-key range and scatter-gather reads;
//! data-bearing nodes apply CRUD locally and replicate writes to their
//! set.

use crate::command::{CommandRequest, CommandResponse};
use crate::errors::{HarnessError, HarnessResult, ServerErrorCode, TransportKind};
use crate::types::{NodeAddr, NodeKind, ReplSetRole};
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::state::{
    Chunk, ClusterShared, FailPointState, FpMode, NodeShared, OpGuard, ShardEntry, ShardedNs,
    log_ids, sleep_watching_kill,
};

/// Names of the generic fail points every mock node understands.
pub const FAIL_COMMAND: &str = "failCommand";
pub const PAUSE_COMMAND: &str = "pauseCommand";
pub const DELAY_COMMAND: &str = "delayCommand";

fn ok(payload: Value) -> HarnessResult<CommandResponse> {
    Ok(CommandResponse::success(payload))
}

fn fail(code: ServerErrorCode, message: impl Into<String>) -> HarnessResult<CommandResponse> {
    Ok(CommandResponse::failure(code.code(), message))
}

fn reset(node: &NodeShared) -> HarnessError {
    HarnessError::transport(&node.addr, TransportKind::ConnectionReset)
}

/// Entry point for one exchange against one mock node.
pub(crate) async fn dispatch(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    request: &CommandRequest,
) -> HarnessResult<CommandResponse> {
    if !node.is_alive_now() {
        return Err(HarnessError::transport(
            &node.addr,
            TransportKind::ConnectionRefused,
        ));
    }

    let wire = request.to_wire();
    let command = request.command_name().to_string();
    trace!(node = %node.addr, %command, "dispatching");

    if let Some(response) = consume_fail_command(node, &command) {
        return Ok(response);
    }

    let guard = OpGuard::register(node, &command, request.comment.as_deref());

    match wait_while_paused(node, &guard, &command, request.max_time).await {
        PauseOutcome::Resumed => {}
        PauseOutcome::MaxTimeExpired => {
            return fail(
                ServerErrorCode::MaxTimeExpired,
                "operation exceeded time limit while paused at a fail point",
            );
        }
        PauseOutcome::Killed => return Err(reset(node)),
    }

    let mut latency = consume_delay(node, &command);
    if command == "sleep" {
        let millis = wire.get("millis").and_then(Value::as_u64).unwrap_or(0);
        latency += Duration::from_millis(millis);
    }
    if !latency.is_zero() {
        if let Some(max_time) = request.max_time
            && max_time < latency
        {
            if sleep_watching_kill(node, max_time).await.is_err() {
                return Err(reset(node));
            }
            return fail(
                ServerErrorCode::MaxTimeExpired,
                "operation exceeded time limit",
            );
        }
        if sleep_watching_kill(node, latency).await.is_err() {
            return Err(reset(node));
        }
    }

    if !node.is_alive_now() {
        return Err(reset(node));
    }

    let response = execute(cluster, node, &command, &wire).await;
    drop(guard);
    response
}

/// Boxed re-entry used by router fan-out; breaks async recursion.
fn dispatch_boxed<'a>(
    cluster: &'a Arc<ClusterShared>,
    node: &'a Arc<NodeShared>,
    request: &'a CommandRequest,
) -> Pin<Box<dyn Future<Output = HarnessResult<CommandResponse>> + Send + 'a>> {
    Box::pin(dispatch(cluster, node, request))
}

/// The failCommand fail point: matching commands are rejected with the
/// configured error code without executing.
fn consume_fail_command(node: &Arc<NodeShared>, command: &str) -> Option<CommandResponse> {
    let mut state = node.state.lock().expect("node state poisoned");
    let fp = state.fail_points.get_mut(FAIL_COMMAND)?;
    if !fp.applies_to(command) {
        return None;
    }
    let code = fp
        .data
        .get("errorCode")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| ServerErrorCode::OperationFailed.code() as i64) as i32;
    fp.consume();
    state.log_event(
        log_ids::FAIL_POINT_HIT,
        "fail point hit",
        json!({ "failPoint": FAIL_COMMAND, "command": command, "errorCode": code }),
    );
    Some(CommandResponse::failure(
        code,
        format!("failing command '{command}' via '{FAIL_COMMAND}' fail point"),
    ))
}

/// The delayCommand fail point: injected execution latency.
fn consume_delay(node: &Arc<NodeShared>, command: &str) -> Duration {
    let mut state = node.state.lock().expect("node state poisoned");
    let Some(fp) = state.fail_points.get_mut(DELAY_COMMAND) else {
        return Duration::ZERO;
    };
    if !fp.applies_to(command) {
        return Duration::ZERO;
    }
    let millis = fp.data.get("millis").and_then(Value::as_u64).unwrap_or(0);
    fp.consume();
    Duration::from_millis(millis)
}

enum PauseOutcome {
    Resumed,
    MaxTimeExpired,
    Killed,
}

/// Block while the pauseCommand fail point applies to this command. The
/// pause is observable: the hit is counted, logged, and tagged onto the
/// operation's currentOp entry before this function first yields.
async fn wait_while_paused(
    node: &Arc<NodeShared>,
    guard: &OpGuard,
    command: &str,
    max_time: Option<Duration>,
) -> PauseOutcome {
    let started = Instant::now();
    let mut hit_recorded = false;
    loop {
        let paused = {
            let mut state = node.state.lock().expect("node state poisoned");
            if !state.alive {
                return PauseOutcome::Killed;
            }
            match state.fail_points.get_mut(PAUSE_COMMAND) {
                Some(fp) if fp.applies_to(command) => {
                    if !hit_recorded {
                        fp.consume();
                        hit_recorded = true;
                        state.log_event(
                            log_ids::FAIL_POINT_HIT,
                            "fail point hit",
                            json!({ "failPoint": PAUSE_COMMAND, "command": command }),
                        );
                    }
                    true
                }
                _ => false,
            }
        };
        if paused && hit_recorded {
            guard.set_failpoint_msg(PAUSE_COMMAND);
        }
        if !paused {
            if hit_recorded {
                guard.clear_failpoint_msg();
            }
            return PauseOutcome::Resumed;
        }
        if let Some(max_time) = max_time
            && started.elapsed() >= max_time
        {
            return PauseOutcome::MaxTimeExpired;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            _ = node.notify.notified() => {}
        }
    }
}

async fn execute(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    command: &str,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    match command {
        "ping" => ok(json!({})),
        "sleep" => ok(json!({})),
        "hello" => hello(cluster, node),
        "replSetInitiate" => repl_set_initiate(cluster, node, wire),
        "replSetReconfig" => repl_set_reconfig(cluster, node, wire),
        "replSetGetStatus" => repl_set_get_status(cluster, node),
        "replSetStepUp" => repl_set_step_up(cluster, node),
        "replSetStepDown" => repl_set_step_down(cluster, node, wire),
        "configureFailPoint" => configure_fail_point(node, wire),
        "getLog" => get_log(node),
        "currentOp" => current_op(node),
        "getParameter" => get_parameter(node, wire),
        "setParameter" => set_parameter(node, wire),
        "setFeatureCompatibilityVersion" => set_fcv(node, wire),
        "addShard" => add_shard(cluster, node, wire),
        "listShards" => list_shards(node),
        "shardCollection" => shard_collection(node, wire),
        "split" => split_chunk(node, wire),
        "moveChunk" => move_chunk(cluster, node, wire).await,
        "insert" | "find" | "count" | "distinct" | "delete" | "create" | "drop" => {
            if node.kind == NodeKind::Router {
                route_crud(cluster, node, command, wire).await
            } else {
                local_crud(cluster, node, command, wire)
            }
        }
        other => fail(
            ServerErrorCode::CommandNotFound,
            format!("no such command: '{other}'"),
        ),
    }
}

// ── Topology & replication commands ────────────────────────────────────────

fn hello(cluster: &Arc<ClusterShared>, node: &Arc<NodeShared>) -> HarnessResult<CommandResponse> {
    let (set_name, role) = {
        let state = node.state.lock().expect("node state poisoned");
        (state.repl.set_name.clone(), state.repl.role)
    };
    let mut payload = json!({
        "isWritablePrimary": role == ReplSetRole::Primary,
        "secondary": role == ReplSetRole::Secondary,
        "arbiterOnly": role == ReplSetRole::Arbiter,
        "maxWireVersion": 25,
    });
    if let Some(set_name) = set_name {
        let hosts: Vec<String> = cluster
            .set_members(&set_name)
            .iter()
            .map(|m| m.addr.to_string())
            .collect();
        payload["setName"] = json!(set_name);
        payload["hosts"] = json!(hosts);
        if let Some(primary) = cluster.set_primary(&set_name) {
            payload["primary"] = json!(primary.addr.to_string());
        }
    }
    if node.kind == NodeKind::Router {
        payload["msg"] = json!("isdbgrid");
    }
    ok(payload)
}

fn parse_addr(host: &str) -> Option<NodeAddr> {
    let (name, port) = host.rsplit_once(':')?;
    Some(NodeAddr::new(name, port.parse().ok()?))
}

fn repl_set_initiate(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    if node.state.lock().expect("node state poisoned").repl.set_name.is_some() {
        return fail(
            ServerErrorCode::IllegalOperation,
            "replica set already initiated",
        );
    }
    let config = &wire["replSetInitiate"];
    let Some(set_name) = config.get("_id").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "config document missing _id");
    };
    let Some(members) = config.get("members").and_then(Value::as_array) else {
        return fail(ServerErrorCode::BadValue, "config document missing members");
    };
    if members.is_empty() {
        return fail(ServerErrorCode::BadValue, "config needs at least 1 member");
    }
    let version = config.get("version").and_then(Value::as_u64).unwrap_or(1);

    for member in members {
        let Some(host) = member.get("host").and_then(Value::as_str) else {
            return fail(ServerErrorCode::BadValue, "member missing host");
        };
        let Some(addr) = parse_addr(host) else {
            return fail(ServerErrorCode::BadValue, format!("bad host '{host}'"));
        };
        let Some(target) = cluster.node_at(&addr) else {
            return fail(
                ServerErrorCode::NodeNotFound,
                format!("no node listening on {host}"),
            );
        };
        let arbiter = member
            .get("arbiterOnly")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut state = target.state.lock().expect("node state poisoned");
        state.repl.set_name = Some(set_name.to_string());
        state.repl.priority = member
            .get("priority")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        state.repl.arbiter = arbiter;
        state.repl.role = if arbiter {
            ReplSetRole::Arbiter
        } else {
            ReplSetRole::Secondary
        };
        state.repl.config_version = version;
    }

    node.log_event(
        log_ids::REPLSET_INITIATED,
        "replica set initiated",
        json!({ "set": set_name, "members": members.len() }),
    );
    cluster.elect_now(set_name);
    ok(json!({}))
}

fn repl_set_reconfig(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    if node.role() != ReplSetRole::Primary {
        return fail(ServerErrorCode::NotWritablePrimary, "not primary");
    }
    let config = &wire["replSetReconfig"];
    let Some(set_name) = config.get("_id").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "config document missing _id");
    };
    let Some(members) = config.get("members").and_then(Value::as_array) else {
        return fail(ServerErrorCode::BadValue, "config document missing members");
    };
    let version = config.get("version").and_then(Value::as_u64).unwrap_or(1);
    let current_version = node
        .state
        .lock()
        .expect("node state poisoned")
        .repl
        .config_version;
    if version <= current_version {
        return fail(
            ServerErrorCode::NewReplicaSetConfigurationIncompatible,
            format!("config version {version} is not newer than {current_version}"),
        );
    }

    let mut listed_addrs = Vec::new();
    for member in members {
        let Some(addr) = member
            .get("host")
            .and_then(Value::as_str)
            .and_then(parse_addr)
        else {
            return fail(ServerErrorCode::BadValue, "member missing host");
        };
        listed_addrs.push(addr.clone());
        if let Some(target) = cluster.node_at(&addr) {
            let mut state = target.state.lock().expect("node state poisoned");
            let arbiter = member
                .get("arbiterOnly")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            state.repl.set_name = Some(set_name.to_string());
            state.repl.priority = member
                .get("priority")
                .and_then(Value::as_f64)
                .unwrap_or(1.0);
            state.repl.arbiter = arbiter;
            state.repl.config_version = version;
            if state.repl.role == ReplSetRole::Startup {
                state.repl.role = if arbiter {
                    ReplSetRole::Arbiter
                } else {
                    ReplSetRole::Secondary
                };
            }
        }
    }

    // Members dropped from the config leave the set.
    for member in cluster.set_members(set_name) {
        if !listed_addrs.contains(&member.addr) {
            let mut state = member.state.lock().expect("node state poisoned");
            state.repl.set_name = None;
            state.repl.role = ReplSetRole::Startup;
        }
    }
    ok(json!({}))
}

fn repl_set_get_status(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
) -> HarnessResult<CommandResponse> {
    let (set_name, my_role) = {
        let state = node.state.lock().expect("node state poisoned");
        (state.repl.set_name.clone(), state.repl.role)
    };
    let Some(set_name) = set_name else {
        return fail(ServerErrorCode::NotYetInitialized, "no replica set config");
    };
    let members: Vec<Value> = cluster
        .set_members(&set_name)
        .iter()
        .enumerate()
        .map(|(index, member)| {
            let state = member.state.lock().expect("node state poisoned");
            let state_str = if !state.alive {
                "(not reachable/healthy)"
            } else {
                match state.repl.role {
                    ReplSetRole::Primary => "PRIMARY",
                    ReplSetRole::Secondary => "SECONDARY",
                    ReplSetRole::Arbiter => "ARBITER",
                    ReplSetRole::Startup => "STARTUP",
                }
            };
            json!({
                "_id": index,
                "name": member.addr.to_string(),
                "stateStr": state_str,
                "health": if state.alive { 1 } else { 0 },
            })
        })
        .collect();
    ok(json!({
        "set": set_name,
        "myState": match my_role {
            ReplSetRole::Primary => 1,
            ReplSetRole::Secondary => 2,
            ReplSetRole::Arbiter => 7,
            ReplSetRole::Startup => 0,
        },
        "members": members,
    }))
}

fn repl_set_step_up(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
) -> HarnessResult<CommandResponse> {
    let (set_name, role, arbiter) = {
        let state = node.state.lock().expect("node state poisoned");
        (
            state.repl.set_name.clone(),
            state.repl.role,
            state.repl.arbiter,
        )
    };
    let Some(set_name) = set_name else {
        return fail(ServerErrorCode::NotYetInitialized, "node is not in a set");
    };
    if arbiter {
        return fail(ServerErrorCode::IllegalOperation, "arbiters cannot step up");
    }
    if role == ReplSetRole::Primary {
        return ok(json!({}));
    }

    if let Some(primary) = cluster.set_primary(&set_name)
        && primary.addr != node.addr
    {
        let mut state = primary.state.lock().expect("node state poisoned");
        state.repl.role = ReplSetRole::Secondary;
        let host = primary.addr.to_string();
        state.log_event(
            log_ids::STEPPED_DOWN,
            "stepping down from primary",
            json!({ "set": set_name, "host": host, "reason": "stepUp request" }),
        );
        primary.notify.notify_waiters();
    }
    {
        let mut state = node.state.lock().expect("node state poisoned");
        state.repl.role = ReplSetRole::Primary;
        state.repl.stepdown_until = None;
        let host = node.addr.to_string();
        state.log_event(
            log_ids::ELECTION_WON,
            "election succeeded, assuming primary role",
            json!({ "set": set_name, "host": host }),
        );
    }
    node.notify.notify_waiters();
    ok(json!({}))
}

fn repl_set_step_down(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    let secs = wire
        .get("replSetStepDown")
        .and_then(Value::as_u64)
        .unwrap_or(60);
    let set_name = {
        let mut state = node.state.lock().expect("node state poisoned");
        if state.repl.role != ReplSetRole::Primary {
            return fail(ServerErrorCode::NotWritablePrimary, "not primary");
        }
        state.repl.role = ReplSetRole::Secondary;
        state.repl.stepdown_until = Some(Instant::now() + Duration::from_secs(secs));
        let set_name = state.repl.set_name.clone().unwrap_or_default();
        let host = node.addr.to_string();
        state.log_event(
            log_ids::STEPPED_DOWN,
            "stepping down from primary",
            json!({ "set": set_name, "host": host, "secs": secs }),
        );
        set_name
    };
    node.notify.notify_waiters();
    cluster.schedule_election(set_name);

    if cluster.options.stepdown_resets_connection {
        // A stepdown tears down the connection that issued it.
        Err(reset(node))
    } else {
        ok(json!({}))
    }
}

// ── Admin commands ─────────────────────────────────────────────────────────

fn configure_fail_point(node: &Arc<NodeShared>, wire: &Value) -> HarnessResult<CommandResponse> {
    let Some(name) = wire.get("configureFailPoint").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "missing fail point name");
    };
    let mode = match wire.get("mode") {
        Some(Value::String(s)) if s == "off" => FpMode::Off,
        Some(Value::String(s)) if s == "alwaysOn" => FpMode::AlwaysOn,
        Some(Value::Object(o)) => match o.get("times").and_then(Value::as_u64) {
            Some(n) if n > 0 => FpMode::Times(n as u32),
            _ => return fail(ServerErrorCode::BadValue, "bad times mode"),
        },
        None => FpMode::AlwaysOn,
        _ => return fail(ServerErrorCode::BadValue, "unrecognized fail point mode"),
    };
    let data = wire.get("data").cloned().unwrap_or(Value::Null);

    let count = {
        let mut state = node.state.lock().expect("node state poisoned");
        let entry = state
            .fail_points
            .entry(name.to_string())
            .or_insert_with(FailPointState::off);
        let count = entry.times_entered;
        entry.mode = mode;
        entry.data = data;
        count
    };
    // Wake operations blocked on this fail point.
    node.notify.notify_waiters();
    ok(json!({ "count": count }))
}

fn get_log(node: &Arc<NodeShared>) -> HarnessResult<CommandResponse> {
    let state = node.state.lock().expect("node state poisoned");
    ok(json!({
        "log": state.log.clone(),
        "totalLinesWritten": state.log.len(),
    }))
}

fn current_op(node: &Arc<NodeShared>) -> HarnessResult<CommandResponse> {
    let state = node.state.lock().expect("node state poisoned");
    let inprog: Vec<Value> = state.ops.values().cloned().collect();
    ok(json!({ "inprog": inprog }))
}

const RESERVED_FIELDS: &[&str] = &[
    "getParameter",
    "setParameter",
    "comment",
    "maxTimeMS",
    "writeConcern",
    "readConcern",
];

fn get_parameter(node: &Arc<NodeShared>, wire: &Value) -> HarnessResult<CommandResponse> {
    let state = node.state.lock().expect("node state poisoned");
    let mut result = serde_json::Map::new();
    let Some(requested) = wire.as_object() else {
        return fail(ServerErrorCode::BadValue, "malformed getParameter");
    };
    for key in requested.keys() {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match state.params.get(key) {
            Some(value) => {
                result.insert(key.clone(), value.clone());
            }
            None => {
                return fail(
                    ServerErrorCode::InvalidOptions,
                    format!("unknown parameter '{key}'"),
                );
            }
        }
    }
    ok(Value::Object(result))
}

fn set_parameter(node: &Arc<NodeShared>, wire: &Value) -> HarnessResult<CommandResponse> {
    let Some(requested) = wire.as_object() else {
        return fail(ServerErrorCode::BadValue, "malformed setParameter");
    };
    let mut state = node.state.lock().expect("node state poisoned");
    let mut previous = serde_json::Map::new();
    for (key, value) in requested {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if let Some(old) = state.params.insert(key.clone(), value.clone()) {
            previous.insert(format!("was_{key}"), old);
        }
    }
    ok(Value::Object(previous))
}

fn set_fcv(node: &Arc<NodeShared>, wire: &Value) -> HarnessResult<CommandResponse> {
    let Some(version) = wire
        .get("setFeatureCompatibilityVersion")
        .and_then(Value::as_str)
    else {
        return fail(ServerErrorCode::BadValue, "missing version");
    };
    if !matches!(version, "7.0" | "8.0" | "8.1") {
        return fail(
            ServerErrorCode::InvalidOptions,
            format!("invalid feature compatibility version '{version}'"),
        );
    }
    let mut state = node.state.lock().expect("node state poisoned");
    state.params.insert(
        "featureCompatibilityVersion".to_string(),
        json!({ "version": version }),
    );
    ok(json!({}))
}

// ── Sharding commands (router) ─────────────────────────────────────────────

fn require_router(node: &Arc<NodeShared>) -> Option<HarnessResult<CommandResponse>> {
    if node.kind != NodeKind::Router {
        Some(fail(
            ServerErrorCode::IllegalOperation,
            "command is only valid on a router",
        ))
    } else {
        None
    }
}

fn add_shard(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    if let Some(err) = require_router(node) {
        return err;
    }
    let Some(conn) = wire.get("addShard").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "missing shard connection string");
    };
    let Some((set_name, _hosts)) = conn.split_once('/') else {
        return fail(
            ServerErrorCode::BadValue,
            format!("expected setName/host list, got '{conn}'"),
        );
    };
    if cluster.set_members(set_name).is_empty() {
        return fail(
            ServerErrorCode::HostUnreachable,
            format!("no members of '{set_name}' are reachable"),
        );
    }

    let mut state = node.state.lock().expect("node state poisoned");
    if state.shards.iter().any(|s| s.name == set_name) {
        return ok(json!({ "shardAdded": set_name }));
    }
    state.shards.push(ShardEntry {
        name: set_name.to_string(),
        connection_string: conn.to_string(),
    });
    ok(json!({ "shardAdded": set_name }))
}

fn list_shards(node: &Arc<NodeShared>) -> HarnessResult<CommandResponse> {
    if let Some(err) = require_router(node) {
        return err;
    }
    let state = node.state.lock().expect("node state poisoned");
    let shards: Vec<Value> = state
        .shards
        .iter()
        .map(|s| json!({ "_id": s.name, "host": s.connection_string }))
        .collect();
    ok(json!({ "shards": shards }))
}

fn shard_collection(node: &Arc<NodeShared>, wire: &Value) -> HarnessResult<CommandResponse> {
    if let Some(err) = require_router(node) {
        return err;
    }
    let Some(ns) = wire.get("shardCollection").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "missing namespace");
    };
    let Some(key_field) = wire
        .get("key")
        .and_then(Value::as_object)
        .and_then(|k| k.keys().next().cloned())
    else {
        return fail(ServerErrorCode::BadValue, "missing shard key pattern");
    };

    let mut state = node.state.lock().expect("node state poisoned");
    let Some(first_shard) = state.shards.first().map(|s| s.name.clone()) else {
        return fail(
            ServerErrorCode::IllegalOperation,
            "cannot shard a collection before any shard is added",
        );
    };
    if state.sharded.contains_key(ns) {
        return ok(json!({ "collectionsharded": ns }));
    }
    state.sharded.insert(
        ns.to_string(),
        ShardedNs {
            key_field,
            chunks: vec![Chunk {
                min: f64::NEG_INFINITY,
                max: f64::INFINITY,
                shard: first_shard,
            }],
        },
    );
    ok(json!({ "collectionsharded": ns }))
}

fn split_chunk(node: &Arc<NodeShared>, wire: &Value) -> HarnessResult<CommandResponse> {
    if let Some(err) = require_router(node) {
        return err;
    }
    let Some(ns) = wire.get("split").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "missing namespace");
    };
    let mut state = node.state.lock().expect("node state poisoned");
    let key_field = match state.sharded.get(ns) {
        Some(sharded) => sharded.key_field.clone(),
        None => {
            return fail(
                ServerErrorCode::NamespaceNotFound,
                format!("'{ns}' is not sharded"),
            );
        }
    };
    let Some(middle) = wire
        .get("middle")
        .and_then(|m| m.get(&key_field))
        .and_then(Value::as_f64)
    else {
        return fail(ServerErrorCode::BadValue, "missing split point");
    };
    let sharded = state.sharded.get_mut(ns).expect("checked above");
    let Some(index) = sharded.chunks.iter().position(|c| c.contains(middle)) else {
        return fail(ServerErrorCode::BadValue, "split point not owned");
    };
    let chunk = &sharded.chunks[index];
    if chunk.min == middle {
        return fail(ServerErrorCode::BadValue, "split point is a chunk bound");
    }
    let upper = Chunk {
        min: middle,
        max: chunk.max,
        shard: chunk.shard.clone(),
    };
    sharded.chunks[index].max = middle;
    sharded.chunks.insert(index + 1, upper);
    ok(json!({}))
}

async fn move_chunk(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    if let Some(err) = require_router(node) {
        return err;
    }
    let Some(ns) = wire.get("moveChunk").and_then(Value::as_str) else {
        return fail(ServerErrorCode::BadValue, "missing namespace");
    };
    let Some(to_shard) = wire.get("to").and_then(Value::as_str).map(String::from) else {
        return fail(ServerErrorCode::BadValue, "missing destination shard");
    };

    // Resolve the chunk under the router lock, then move data outside it.
    let (key_field, range, from_shard) = {
        let state = node.state.lock().expect("node state poisoned");
        let Some(sharded) = state.sharded.get(ns) else {
            return fail(
                ServerErrorCode::NamespaceNotFound,
                format!("'{ns}' is not sharded"),
            );
        };
        if !state.shards.iter().any(|s| s.name == to_shard) {
            return fail(
                ServerErrorCode::ShardNotFound,
                format!("no shard named '{to_shard}'"),
            );
        }
        let Some(key) = wire
            .get("find")
            .and_then(|f| f.get(&sharded.key_field))
            .and_then(Value::as_f64)
        else {
            return fail(ServerErrorCode::BadValue, "missing find document");
        };
        let Some(chunk) = sharded.chunks.iter().find(|c| c.contains(key)) else {
            return fail(ServerErrorCode::BadValue, "no chunk owns the key");
        };
        (
            sharded.key_field.clone(),
            (chunk.min, chunk.max),
            chunk.shard.clone(),
        )
    };

    if from_shard == to_shard {
        return ok(json!({ "millis": 0 }));
    }

    node.log_event(
        log_ids::CHUNK_MIGRATION_STARTED,
        "starting chunk migration",
        json!({ "ns": ns, "from": from_shard, "to": to_shard }),
    );
    let started = Instant::now();

    // Drain in-range documents from the source set.
    let Some(source_primary) = cluster.set_primary(&from_shard) else {
        return fail(
            ServerErrorCode::HostUnreachable,
            format!("shard '{from_shard}' has no primary"),
        );
    };
    let moved: Vec<Value> = {
        let mut state = source_primary.state.lock().expect("node state poisoned");
        let docs = state.collections.entry(ns.to_string()).or_default();
        let (moving, staying): (Vec<Value>, Vec<Value>) = docs.drain(..).partition(|doc| {
            doc.get(&key_field)
                .and_then(Value::as_f64)
                .map(|k| k >= range.0 && k < range.1)
                .unwrap_or(false)
        });
        *docs = staying;
        moving
    };
    replicate_collection(cluster, &source_primary, ns);

    // Land them on the destination set.
    let Some(dest_primary) = cluster.set_primary(&to_shard) else {
        return fail(
            ServerErrorCode::HostUnreachable,
            format!("shard '{to_shard}' has no primary"),
        );
    };
    {
        let mut state = dest_primary.state.lock().expect("node state poisoned");
        state
            .collections
            .entry(ns.to_string())
            .or_default()
            .extend(moved.iter().cloned());
    }
    replicate_collection(cluster, &dest_primary, ns);

    // Commit the routing change.
    {
        let mut state = node.state.lock().expect("node state poisoned");
        if let Some(sharded) = state.sharded.get_mut(ns) {
            for chunk in &mut sharded.chunks {
                if chunk.min == range.0 && chunk.max == range.1 {
                    chunk.shard = to_shard.clone();
                }
            }
        }
    }
    node.log_event(
        log_ids::CHUNK_MIGRATION_COMMITTED,
        "chunk migration committed",
        json!({ "ns": ns, "from": from_shard, "to": to_shard, "documents": moved.len() }),
    );
    ok(json!({ "millis": started.elapsed().as_millis() as u64 }))
}

// ── CRUD: router routing ───────────────────────────────────────────────────

/// Routing target resolution for one namespace.
enum RouteTarget {
    /// Sharded namespace: key field plus owning-shard lookup.
    Sharded(ShardedNs),
    /// Unsharded namespace: lands wholesale on the first shard.
    Unsharded(String),
}

fn resolve_route(node: &Arc<NodeShared>, ns: &str) -> Result<RouteTarget, CommandResponse> {
    let state = node.state.lock().expect("node state poisoned");
    if let Some(sharded) = state.sharded.get(ns) {
        return Ok(RouteTarget::Sharded(sharded.clone()));
    }
    match state.shards.first() {
        Some(first) => Ok(RouteTarget::Unsharded(first.name.clone())),
        None => Err(CommandResponse::failure(
            ServerErrorCode::ShardNotFound.code(),
            "no shards registered",
        )),
    }
}

fn shard_names(node: &Arc<NodeShared>) -> Vec<String> {
    let state = node.state.lock().expect("node state poisoned");
    state.shards.iter().map(|s| s.name.clone()).collect()
}

async fn forward(
    cluster: &Arc<ClusterShared>,
    shard: &str,
    body: Value,
) -> HarnessResult<CommandResponse> {
    let Some(primary) = cluster.set_primary(shard) else {
        return fail(
            ServerErrorCode::HostUnreachable,
            format!("shard '{shard}' has no primary"),
        );
    };
    let request = CommandRequest::new(primary.addr.clone(), body);
    dispatch_boxed(cluster, &primary, &request).await
}

async fn route_crud(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    command: &str,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    let Some(ns) = wire.get(command).and_then(Value::as_str).map(String::from) else {
        return fail(ServerErrorCode::BadValue, "missing collection name");
    };
    let target = match resolve_route(node, &ns) {
        Ok(target) => target,
        Err(response) => return Ok(response),
    };

    match (command, &target) {
        // Writes to a sharded namespace route document-by-document.
        ("insert", RouteTarget::Sharded(sharded)) => {
            let Some(documents) = wire.get("documents").and_then(Value::as_array) else {
                return fail(ServerErrorCode::BadValue, "missing documents");
            };
            let mut inserted = 0u64;
            for doc in documents {
                let Some(key) = doc.get(&sharded.key_field).and_then(Value::as_f64) else {
                    return fail(
                        ServerErrorCode::TypeMismatch,
                        format!("document missing numeric shard key '{}'", sharded.key_field),
                    );
                };
                let Some(shard) = sharded.owning_shard(key) else {
                    return fail(ServerErrorCode::StaleConfig, "no chunk owns the key");
                };
                let body = json!({ "insert": ns, "documents": [doc] });
                let response = forward(cluster, shard, body).await?;
                if !response.ok {
                    return Ok(response);
                }
                inserted += 1;
            }
            ok(json!({ "n": inserted }))
        }
        // Reads against a sharded namespace scatter-gather.
        ("find", RouteTarget::Sharded(_)) => {
            let mut batch = Vec::new();
            for shard in shard_names(node) {
                let response = forward(cluster, &shard, wire.clone()).await?;
                if !response.ok {
                    return Ok(response);
                }
                if let Some(docs) = response
                    .payload
                    .pointer("/cursor/firstBatch")
                    .and_then(Value::as_array)
                {
                    batch.extend(docs.iter().cloned());
                }
            }
            if let Some(sort) = wire.get("sort") {
                sort_documents(&mut batch, sort);
            }
            ok(json!({ "cursor": { "id": 0, "ns": ns, "firstBatch": batch } }))
        }
        ("count", RouteTarget::Sharded(_)) => {
            let mut total = 0u64;
            for shard in shard_names(node) {
                let response = forward(cluster, &shard, wire.clone()).await?;
                if !response.ok {
                    return Ok(response);
                }
                total += response
                    .payload
                    .get("n")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
            ok(json!({ "n": total }))
        }
        ("distinct", RouteTarget::Sharded(_)) => {
            let mut values: Vec<Value> = Vec::new();
            for shard in shard_names(node) {
                let response = forward(cluster, &shard, wire.clone()).await?;
                if !response.ok {
                    return Ok(response);
                }
                if let Some(shard_values) =
                    response.payload.get("values").and_then(Value::as_array)
                {
                    for value in shard_values {
                        if !values.iter().any(|v| crate::assertions::values_equal(v, value)) {
                            values.push(value.clone());
                        }
                    }
                }
            }
            ok(json!({ "values": values }))
        }
        ("delete", RouteTarget::Sharded(_)) => {
            let mut total = 0u64;
            for shard in shard_names(node) {
                let response = forward(cluster, &shard, wire.clone()).await?;
                if !response.ok {
                    return Ok(response);
                }
                total += response
                    .payload
                    .get("n")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
            ok(json!({ "n": total }))
        }
        // Everything else on an unsharded namespace forwards wholesale.
        (_, RouteTarget::Unsharded(shard)) => forward(cluster, shard, wire.clone()).await,
        // create/drop against a sharded namespace apply everywhere.
        (_, RouteTarget::Sharded(_)) => {
            let mut last = CommandResponse::success(json!({}));
            for shard in shard_names(node) {
                let response = forward(cluster, &shard, wire.clone()).await?;
                if !response.ok {
                    return Ok(response);
                }
                last = response;
            }
            Ok(last)
        }
    }
}

// ── CRUD: data-bearing nodes ───────────────────────────────────────────────

fn matches_filter(doc: &Value, filter: Option<&Value>) -> bool {
    let Some(filter) = filter.and_then(Value::as_object) else {
        return true;
    };
    filter.iter().all(|(key, expected)| {
        doc.get(key)
            .is_some_and(|actual| crate::assertions::values_equal(actual, expected))
    })
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => {
            let rank = type_rank(a).cmp(&type_rank(b));
            if rank != Ordering::Equal {
                rank
            } else {
                a.to_string().cmp(&b.to_string())
            }
        }
    }
}

fn sort_documents(docs: &mut [Value], sort: &Value) {
    let Some((field, direction)) = sort
        .as_object()
        .and_then(|s| s.iter().next())
        .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(1)))
    else {
        return;
    };
    docs.sort_by(|a, b| {
        let av = a.get(&field).unwrap_or(&Value::Null);
        let bv = b.get(&field).unwrap_or(&Value::Null);
        let ordering = cmp_values(av, bv);
        if direction < 0 { ordering.reverse() } else { ordering }
    });
}

/// Copy the primary's view of a collection onto its live data-bearing
/// secondaries. Arbiters never receive data.
fn replicate_collection(cluster: &Arc<ClusterShared>, primary: &Arc<NodeShared>, coll: &str) {
    let (set_name, docs) = {
        let state = primary.state.lock().expect("node state poisoned");
        let Some(set_name) = state.repl.set_name.clone() else {
            return;
        };
        (
            set_name,
            state.collections.get(coll).cloned().unwrap_or_default(),
        )
    };
    for member in cluster.set_members(&set_name) {
        if member.addr == primary.addr {
            continue;
        }
        let mut state = member.state.lock().expect("node state poisoned");
        if !state.alive || state.repl.arbiter {
            continue;
        }
        state.collections.insert(coll.to_string(), docs.clone());
    }
}

/// Writes require a writable primary; standalone nodes (no set) accept
/// writes directly.
fn check_writable(node: &Arc<NodeShared>) -> Option<HarnessResult<CommandResponse>> {
    let state = node.state.lock().expect("node state poisoned");
    if state.repl.set_name.is_some() && state.repl.role != ReplSetRole::Primary {
        return Some(fail(ServerErrorCode::NotWritablePrimary, "not primary"));
    }
    None
}

fn local_crud(
    cluster: &Arc<ClusterShared>,
    node: &Arc<NodeShared>,
    command: &str,
    wire: &Value,
) -> HarnessResult<CommandResponse> {
    let Some(coll) = wire.get(command).and_then(Value::as_str).map(String::from) else {
        return fail(ServerErrorCode::BadValue, "missing collection name");
    };

    match command {
        "insert" => {
            if let Some(err) = check_writable(node) {
                return err;
            }
            let Some(documents) = wire.get("documents").and_then(Value::as_array) else {
                return fail(ServerErrorCode::BadValue, "missing documents");
            };
            {
                let mut state = node.state.lock().expect("node state poisoned");
                let existing = state.collections.entry(coll.clone()).or_default();
                for doc in documents {
                    if let Some(id) = doc.get("_id")
                        && existing.iter().any(|d| {
                            d.get("_id")
                                .is_some_and(|other| crate::assertions::values_equal(other, id))
                        })
                    {
                        return fail(
                            ServerErrorCode::DuplicateKey,
                            format!("E11000 duplicate key error, dup key: {id}"),
                        );
                    }
                    existing.push(doc.clone());
                }
            }
            replicate_collection(cluster, node, &coll);
            ok(json!({ "n": documents.len() }))
        }
        "find" => {
            let filter = wire.get("filter");
            let mut docs: Vec<Value> = {
                let state = node.state.lock().expect("node state poisoned");
                state
                    .collections
                    .get(&coll)
                    .map(|docs| {
                        docs.iter()
                            .filter(|doc| matches_filter(doc, filter))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };
            if let Some(sort) = wire.get("sort") {
                sort_documents(&mut docs, sort);
            }
            ok(json!({ "cursor": { "id": 0, "ns": coll, "firstBatch": docs } }))
        }
        "count" => {
            let filter = wire.get("query");
            let state = node.state.lock().expect("node state poisoned");
            let n = state
                .collections
                .get(&coll)
                .map(|docs| docs.iter().filter(|doc| matches_filter(doc, filter)).count())
                .unwrap_or(0);
            ok(json!({ "n": n }))
        }
        "distinct" => {
            let Some(key) = wire.get("key").and_then(Value::as_str) else {
                return fail(ServerErrorCode::BadValue, "missing key");
            };
            let filter = wire.get("query");
            let state = node.state.lock().expect("node state poisoned");
            let mut values: Vec<Value> = Vec::new();
            if let Some(docs) = state.collections.get(&coll) {
                for doc in docs.iter().filter(|doc| matches_filter(doc, filter)) {
                    if let Some(value) = doc.get(key)
                        && !values
                            .iter()
                            .any(|v| crate::assertions::values_equal(v, value))
                    {
                        values.push(value.clone());
                    }
                }
            }
            ok(json!({ "values": values }))
        }
        "delete" => {
            if let Some(err) = check_writable(node) {
                return err;
            }
            let Some(deletes) = wire.get("deletes").and_then(Value::as_array) else {
                return fail(ServerErrorCode::BadValue, "missing deletes");
            };
            let mut removed = 0usize;
            {
                let mut state = node.state.lock().expect("node state poisoned");
                let docs = state.collections.entry(coll.clone()).or_default();
                for spec in deletes {
                    let filter = spec.get("q");
                    let limit = spec.get("limit").and_then(Value::as_u64).unwrap_or(0);
                    let mut kept = Vec::with_capacity(docs.len());
                    let mut matched = 0u64;
                    for doc in docs.drain(..) {
                        if matches_filter(&doc, filter) && (limit == 0 || matched < limit) {
                            matched += 1;
                            removed += 1;
                        } else {
                            kept.push(doc);
                        }
                    }
                    *docs = kept;
                }
            }
            replicate_collection(cluster, node, &coll);
            ok(json!({ "n": removed }))
        }
        "create" => {
            if let Some(err) = check_writable(node) {
                return err;
            }
            {
                let mut state = node.state.lock().expect("node state poisoned");
                if state.collections.contains_key(&coll) {
                    return fail(
                        ServerErrorCode::NamespaceExists,
                        format!("collection '{coll}' already exists"),
                    );
                }
                state.collections.insert(coll.clone(), Vec::new());
            }
            replicate_collection(cluster, node, &coll);
            ok(json!({}))
        }
        "drop" => {
            if let Some(err) = check_writable(node) {
                return err;
            }
            let dropped = {
                let mut state = node.state.lock().expect("node state poisoned");
                state.collections.remove(&coll).is_some()
            };
            if !dropped {
                return fail(
                    ServerErrorCode::NamespaceNotFound,
                    format!("ns '{coll}' not found"),
                );
            }
            // Secondaries drop the namespace too.
            let set_name = {
                let state = node.state.lock().expect("node state poisoned");
                state.repl.set_name.clone()
            };
            if let Some(set_name) = set_name {
                for member in cluster.set_members(&set_name) {
                    if member.addr == node.addr {
                        continue;
                    }
                    let mut state = member.state.lock().expect("node state poisoned");
                    state.collections.remove(&coll);
                }
            }
            ok(json!({}))
        }
        _ => unreachable!("routed by caller"),
    }
}
