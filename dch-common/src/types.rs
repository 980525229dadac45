//! Common types used across DCH components.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in a cluster topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listening endpoint of a node (host plus port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of topology a fixture manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Standalone,
    ReplicaSet,
    ShardedCluster,
}

/// Role a node currently holds within a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplSetRole {
    Primary,
    Secondary,
    Arbiter,
    /// Node has not been initiated into a set yet.
    Startup,
}

impl ReplSetRole {
    /// Arbiters vote but never hold data; divergence checks skip them.
    pub fn is_data_bearing(&self) -> bool {
        matches!(self, Self::Primary | Self::Secondary)
    }
}

/// Purpose a launched process serves within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Data-bearing replica set member (or arbiter, per the member spec).
    ReplSetMember,
    /// Config-server replica set member of a sharded cluster.
    ConfigServer,
    /// Query router of a sharded cluster.
    Router,
}

/// Per-member launch options for a replica set.
///
/// Mirrors the per-member overrides a config document carries: election
/// priority, vote weight, the arbiter flag, and free-form tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Election priority (higher is preferred; 0 means never primary).
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Votes this member contributes to elections.
    #[serde(default = "default_votes")]
    pub votes: u32,
    /// Whether this member is an arbiter (votes, holds no data).
    #[serde(default)]
    pub arbiter_only: bool,
    /// Free-form tags carried into the member config document.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for MemberSpec {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            votes: default_votes(),
            arbiter_only: false,
            tags: Vec::new(),
        }
    }
}

impl MemberSpec {
    /// A data-bearing member with default priority and one vote.
    pub fn data_node() -> Self {
        Self::default()
    }

    /// An arbiter member: one vote, zero priority, no data.
    pub fn arbiter() -> Self {
        Self {
            priority: 0.0,
            votes: 1,
            arbiter_only: true,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

fn default_priority() -> f64 {
    1.0
}

fn default_votes() -> u32 {
    1
}
