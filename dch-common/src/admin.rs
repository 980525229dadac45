//! Administrative sub-protocol helpers.
//!
//! Typed builders over the opaque command document for the control-plane
//! commands scenarios lean on: fail points, currentOp snapshots,
//! structured log queries, server parameters, feature compatibility
//! version, and chunk migration.

use crate::assertions::values_equal;
use crate::client::CommandClient;
use crate::command::CommandRequest;
use crate::errors::HarnessResult;
use crate::poll::{self, PollOpts};
use crate::types::NodeAddr;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

/// Fail point activation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPointMode {
    Off,
    AlwaysOn,
    /// Trip for the next `n` matching operations, then disarm.
    Times(u32),
}

impl FailPointMode {
    fn to_wire(self) -> Value {
        match self {
            Self::Off => json!("off"),
            Self::AlwaysOn => json!("alwaysOn"),
            Self::Times(n) => json!({ "times": n }),
        }
    }
}

/// Configure a named server fail point.
pub async fn configure_fail_point(
    client: &CommandClient,
    addr: NodeAddr,
    name: &str,
    mode: FailPointMode,
    data: Option<Value>,
) -> HarnessResult<()> {
    let mut body = json!({
        "configureFailPoint": name,
        "mode": mode.to_wire(),
    });
    if let Some(data) = data {
        body["data"] = data;
    }
    debug!(fail_point = name, ?mode, "configuring fail point");
    client
        .run_expecting_success(CommandRequest::new(addr, body))
        .await?;
    Ok(())
}

/// An armed fail point with an explicit release.
///
/// The guard deliberately has no Drop-side release: disarming is a command
/// exchange, and a scenario must observe (or at least sequence) it. A
/// leaked guard leaves the fail point armed until topology teardown.
pub struct FailPointGuard {
    client: CommandClient,
    addr: NodeAddr,
    name: String,
}

impl FailPointGuard {
    /// Arm `name` in always-on mode.
    pub async fn enable(
        client: CommandClient,
        addr: NodeAddr,
        name: &str,
        data: Option<Value>,
    ) -> HarnessResult<Self> {
        configure_fail_point(&client, addr.clone(), name, FailPointMode::AlwaysOn, data).await?;
        Ok(Self {
            client,
            addr,
            name: name.to_string(),
        })
    }

    /// Arm `name` for the next `n` matching operations.
    pub async fn enable_times(
        client: CommandClient,
        addr: NodeAddr,
        name: &str,
        n: u32,
        data: Option<Value>,
    ) -> HarnessResult<Self> {
        configure_fail_point(&client, addr.clone(), name, FailPointMode::Times(n), data).await?;
        Ok(Self {
            client,
            addr,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until an operation is provably paused at this fail point,
    /// observed through a currentOp marker, never a fixed sleep.
    pub async fn await_paused_op(&self, opts: PollOpts) -> HarnessResult<()> {
        let name = self.name.clone();
        poll::wait_until(
            &format!("an operation paused at fail point '{}'", self.name),
            opts,
            || {
                let client = self.client.clone();
                let addr = self.addr.clone();
                let name = name.clone();
                async move {
                    let ops = current_ops(&client, addr).await?;
                    Ok(ops.iter().any(|op| {
                        op.get("failpointMsg").and_then(Value::as_str) == Some(name.as_str())
                    }))
                }
            },
        )
        .await
    }

    /// Disarm the fail point, letting paused operations resume.
    pub async fn release(self) -> HarnessResult<()> {
        configure_fail_point(&self.client, self.addr, &self.name, FailPointMode::Off, None).await
    }
}

/// Snapshot of in-flight operations on one node.
pub async fn current_ops(client: &CommandClient, addr: NodeAddr) -> HarnessResult<Vec<Value>> {
    let payload = client
        .run_expecting_success(CommandRequest::new(addr, json!({ "currentOp": 1 })))
        .await?;
    Ok(payload
        .get("inprog")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

/// Matcher for structured log events: numeric event id, expected
/// attribute values, and/or a message pattern.
#[derive(Debug, Clone, Default)]
pub struct LogMatcher {
    id: Option<i64>,
    fields: Vec<(String, Value)>,
    message_pattern: Option<Regex>,
}

impl LogMatcher {
    /// Match by numeric log event id.
    pub fn id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Match by message regex.
    pub fn message(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            message_pattern: Some(Regex::new(pattern)?),
            ..Self::default()
        })
    }

    /// Additionally require an attribute field to equal `value`.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    /// Whether one structured log event satisfies every constraint.
    pub fn matches(&self, event: &Value) -> bool {
        if let Some(id) = self.id
            && event.get("id").and_then(Value::as_i64) != Some(id)
        {
            return false;
        }
        if let Some(pattern) = &self.message_pattern {
            let msg = event.get("msg").and_then(Value::as_str).unwrap_or("");
            if !pattern.is_match(msg) {
                return false;
            }
        }
        let attr = event.get("attr").cloned().unwrap_or(Value::Null);
        self.fields
            .iter()
            .all(|(key, expected)| attr.get(key).is_some_and(|v| values_equal(v, expected)))
    }
}

/// Fetch the structured log events of one node that satisfy `matcher`.
///
/// Entries arrive either as structured documents or as JSON strings;
/// string entries are parsed before matching.
pub async fn log_events(
    client: &CommandClient,
    addr: NodeAddr,
    matcher: &LogMatcher,
) -> HarnessResult<Vec<Value>> {
    let payload = client
        .run_expecting_success(CommandRequest::new(addr, json!({ "getLog": "global" })))
        .await?;
    let entries = payload
        .get("log")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::String(raw) => serde_json::from_str::<Value>(&raw).ok(),
            structured => Some(structured),
        })
        .filter(|event| matcher.matches(event))
        .collect())
}

/// Count matching log events on one node.
pub async fn count_log_events(
    client: &CommandClient,
    addr: NodeAddr,
    matcher: &LogMatcher,
) -> HarnessResult<usize> {
    Ok(log_events(client, addr, matcher).await?.len())
}

/// Converge on a log event having been emitted at least `min_count`
/// times.
pub async fn wait_for_log(
    client: &CommandClient,
    addr: NodeAddr,
    matcher: &LogMatcher,
    min_count: usize,
    opts: PollOpts,
) -> HarnessResult<()> {
    poll::wait_until(
        &format!("log event matching {matcher:?} seen >= {min_count} times"),
        opts,
        || {
            let client = client.clone();
            let addr = addr.clone();
            let matcher = matcher.clone();
            async move {
                let count = count_log_events(&client, addr, &matcher).await?;
                Ok(count >= min_count)
            }
        },
    )
    .await
}

/// Read one server parameter.
pub async fn get_parameter(
    client: &CommandClient,
    addr: NodeAddr,
    name: &str,
) -> HarnessResult<Value> {
    let payload = client
        .run_expecting_success(CommandRequest::new(
            addr,
            json!({ "getParameter": 1, name: 1 }),
        ))
        .await?;
    Ok(payload.get(name).cloned().unwrap_or(Value::Null))
}

/// Set one server parameter.
pub async fn set_parameter(
    client: &CommandClient,
    addr: NodeAddr,
    name: &str,
    value: Value,
) -> HarnessResult<()> {
    client
        .run_expecting_success(CommandRequest::new(
            addr,
            json!({ "setParameter": 1, name: value }),
        ))
        .await?;
    Ok(())
}

/// Read the cluster's feature compatibility version.
pub async fn get_fcv(client: &CommandClient, addr: NodeAddr) -> HarnessResult<String> {
    let value = get_parameter(client, addr, "featureCompatibilityVersion").await?;
    Ok(value
        .get("version")
        .and_then(Value::as_str)
        .or(value.as_str())
        .unwrap_or_default()
        .to_string())
}

/// Transition the cluster's feature compatibility version.
pub async fn set_fcv(client: &CommandClient, addr: NodeAddr, version: &str) -> HarnessResult<()> {
    client
        .run_expecting_success(CommandRequest::new(
            addr,
            json!({ "setFeatureCompatibilityVersion": version, "confirm": true }),
        ))
        .await?;
    Ok(())
}

/// Move the chunk owning `find`'s shard-key value to another shard.
pub async fn move_chunk(
    router: &CommandClient,
    addr: NodeAddr,
    ns: &str,
    find: Value,
    to_shard: &str,
) -> HarnessResult<()> {
    router
        .run_expecting_success(CommandRequest::new(
            addr,
            json!({ "moveChunk": ns, "find": find, "to": to_shard }),
        ))
        .await?;
    Ok(())
}
