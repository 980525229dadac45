//! Convergence polling against live cluster state: bounded waits,
//! swallowed probe errors, and structured-log convergence.

use dch_common::admin::{self, LogMatcher};
use dch_common::background::BackgroundOp;
use dch_common::client::CommandClient;
use dch_common::command::CommandRequest;
use dch_common::config::TopologySettings;
use dch_common::mock::{MockCluster, log_ids};
use dch_common::poll::{self, PollOpts};
use dch_common::topology::ReplicaSetFixture;
use dch_common::types::MemberSpec;
use serde_json::json;
use std::time::{Duration, Instant};

#[ctor::ctor]
fn init() {
    dch_common::testing::init_global_scenario_logging();
}

fn settings() -> TopologySettings {
    TopologySettings {
        init_timeout_secs: 10,
        stable_timeout_secs: 5,
        stop_grace_secs: 1,
    }
}

#[tokio::test]
async fn test_wait_until_is_bounded_against_live_state() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node()],
        settings(),
    )
    .await
    .unwrap();

    let member = rs.member(0);
    let client = member.client();
    let addr = member.addr();
    let started = Instant::now();
    let err = poll::wait_until(
        "a document that will never exist",
        PollOpts::new(Duration::from_millis(20), Duration::from_millis(300)),
        || {
            let client = client.clone();
            let addr = addr.clone();
            async move {
                let payload = client
                    .run_expecting_success(CommandRequest::new(
                        addr,
                        json!({ "count": "missing" }),
                    ))
                    .await?;
                Ok(payload["n"].as_u64().unwrap_or(0) > 0)
            }
        },
    )
    .await
    .unwrap_err();

    assert!(err.is_convergence_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_probe_errors_against_downed_node_are_swallowed() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node()],
        settings(),
    )
    .await
    .unwrap();

    rs.stop_member(0).await.unwrap();
    let member = rs.member(0);
    let client = member.client();
    let addr = member.addr();

    // Restart the node after a beat; the poll must ride out the refused
    // connections in between.
    let handle = member.handle().clone();
    let restarter = BackgroundOp::spawn("restarter", async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.start().await
    });

    poll::wait_until(
        "node answers ping again",
        PollOpts::new(Duration::from_millis(20), Duration::from_secs(5)),
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
    .unwrap();

    restarter.join(Duration::from_secs(2)).await.unwrap();
    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_log_query_is_idempotent_and_converges() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 2],
        settings(),
    )
    .await
    .unwrap();

    let index = rs.await_primary().await.unwrap();
    let member = rs.member(index);
    let client = member.client();
    let matcher = LogMatcher::id(log_ids::ELECTION_WON).with_field("set", json!("rs0"));

    // The election that made this node primary was logged.
    admin::wait_for_log(
        &client,
        member.addr(),
        &matcher,
        1,
        PollOpts::fast().with_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    // Re-evaluating without state change yields the same answer.
    let first = admin::count_log_events(&client, member.addr(), &matcher)
        .await
        .unwrap();
    for _ in 0..5 {
        let again = admin::count_log_events(&client, member.addr(), &matcher)
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_log_counts_repeated_events() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 2],
        settings(),
    )
    .await
    .unwrap();

    // Bounce primacy between the two members a few times.
    for _ in 0..2 {
        let other = 1 - rs.await_primary().await.unwrap();
        rs.step_up(other).await.unwrap();
    }

    // Both election victories are in member 0's or member 1's logs; the
    // winner of the last bounce logged at least one.
    let index = rs.await_primary().await.unwrap();
    let member = rs.member(index);
    admin::wait_for_log(
        &member.client(),
        member.addr(),
        &LogMatcher::id(log_ids::ELECTION_WON),
        1,
        PollOpts::fast().with_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_stable_state_reconverges_after_election() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 3],
        settings(),
    )
    .await
    .unwrap();

    rs.step_down().await.unwrap();
    // Transiently zero primaries is legal; await_stable_state rides
    // through the election window.
    rs.await_stable_state().await.unwrap();
    assert_eq!(rs.observed_primaries().await.len(), 1);

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_error_names_goal_and_last_state() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node()],
        settings(),
    )
    .await
    .unwrap();
    rs.stop_member(0).await.unwrap();

    let member = rs.member(0);
    let client: CommandClient = member.client();
    let addr = member.addr();
    let err = poll::wait_until(
        "downed node becomes reachable",
        PollOpts::new(Duration::from_millis(20), Duration::from_millis(200)),
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
    .unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("downed node becomes reachable"), "{msg}");
    assert!(msg.contains("connection refused"), "{msg}");

    rs.teardown().await.unwrap();
}
