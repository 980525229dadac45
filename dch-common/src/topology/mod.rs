//! Cluster topology fixtures.
//!
//! A topology owns the process handles it launched and exposes stable
//! accessors for roles (primary, secondaries, router, shard N). Bring-up
//! is bounded and fails into teardown; teardown is best-effort total:
//! every member gets a stop attempt even when earlier stops fail.

pub mod process;
pub mod replset;
pub mod sharded;

pub use process::{NodeLauncher, ProcessConfig, ProcessHandle};
pub use replset::{Member, ReplicaSetFixture};
pub use sharded::{ShardedClusterFixture, ShardedClusterSpec};

use crate::client::CommandClient;
use crate::command::CommandRequest;
use crate::errors::HarnessResult;
use crate::types::{NodeAddr, ReplSetRole};
use serde_json::json;

/// Ask one endpoint what role it currently holds.
///
/// Read-only, so it is safe inside poll predicates.
pub async fn probe_role(client: &CommandClient, addr: NodeAddr) -> HarnessResult<ReplSetRole> {
    let payload = client
        .run_expecting_success(CommandRequest::new(addr, json!({ "hello": 1 })))
        .await?;
    let role = if payload
        .get("isWritablePrimary")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        ReplSetRole::Primary
    } else if payload
        .get("arbiterOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        ReplSetRole::Arbiter
    } else if payload
        .get("secondary")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        ReplSetRole::Secondary
    } else {
        ReplSetRole::Startup
    };
    Ok(role)
}
