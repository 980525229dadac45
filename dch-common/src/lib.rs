//! # dch-common
//!
//! Core library of the Distributed Cluster Harness: black-box test
//! infrastructure for replicated and sharded database deployments.
//!
//! The harness stands up multi-process topologies, drives them through
//! structured commands, and verifies eventually-consistent outcomes:
//!
//! - [`topology`]: replica-set and sharded-cluster fixtures over a
//!   launcher/process seam; bounded bring-up, best-effort teardown.
//! - [`client`]: one command in, one classified outcome out: success,
//!   server rejection with a numeric code, or transport failure.
//! - [`poll`]: convergence polling with per-call interval/timeout and
//!   diagnosable timeouts; no unbounded waits.
//! - [`assertions`]: expected-vs-actual checks that carry full context,
//!   including order-sensitive and multiset result comparison.
//! - [`scenario`]: setup/exercise/teardown lifecycle with teardown
//!   guaranteed on every path.
//! - [`admin`]: fail points, currentOp, structured log queries, server
//!   parameters, FCV, chunk migration.
//! - [`background`]: named concurrent operations with bounded joins.
//! - [`mock`]: in-process mock cluster for hermetic runs.

pub mod admin;
pub mod assertions;
pub mod background;
pub mod client;
pub mod command;
pub mod config;
pub mod errors;
pub mod mock;
pub mod poll;
pub mod scenario;
pub mod testing;
pub mod topology;
pub mod types;

pub use background::BackgroundOp;
pub use client::{CommandClient, Transport};
pub use command::{CommandRequest, CommandResponse, ReadConcern, WriteConcern};
pub use errors::{HarnessError, HarnessResult, ServerErrorCode, TransportKind};
pub use poll::PollOpts;
pub use scenario::{Scenario, ScenarioReport, ScenarioRunner};
pub use topology::{
    NodeLauncher, ProcessConfig, ProcessHandle, ReplicaSetFixture, ShardedClusterFixture,
    ShardedClusterSpec,
};
pub use types::{MemberSpec, NodeAddr, NodeId, NodeKind, ReplSetRole, TopologyKind};
