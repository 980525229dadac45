//! Replica set fixture lifecycle: bring-up, elections, replication
//! fan-out, reconfiguration, and best-effort teardown.

use dch_common::command::CommandRequest;
use dch_common::config::TopologySettings;
use dch_common::errors::ServerErrorCode;
use dch_common::mock::MockCluster;
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

async fn insert_one(rs: &ReplicaSetFixture, coll: &str, doc: serde_json::Value) {
    let index = rs.await_primary().await.unwrap();
    let member = rs.member(index);
    member
        .client()
        .run_expecting_success(CommandRequest::new(
            member.addr(),
            json!({ "insert": coll, "documents": [doc] }),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_single_node_set_stabilizes_within_bound() {
    let cluster = MockCluster::new();
    let started = Instant::now();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node()],
        settings(),
    )
    .await
    .unwrap();

    // Bring-up includes await_stable_state; the whole thing fits the bound.
    assert!(started.elapsed() < Duration::from_secs(5));
    let primaries = rs.observed_primaries().await;
    assert_eq!(primaries, vec![0]);

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_empty_member_list_is_a_topology_error() {
    let cluster = MockCluster::new();
    let err = ReplicaSetFixture::start(cluster.launcher(), "rs0", vec![], settings())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        dch_common::HarnessError::TopologyInit(_)
    ));
}

#[tokio::test]
async fn test_stepdown_is_tolerated_and_elects_a_new_primary() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 3],
        settings(),
    )
    .await
    .unwrap();

    let old_primary = rs.await_primary().await.unwrap();
    // The stepdown drops its own connection; the fixture treats that as
    // success at this call site only.
    rs.step_down().await.unwrap();
    rs.await_stable_state().await.unwrap();

    let new_primary = rs.await_primary().await.unwrap();
    assert_ne!(
        new_primary, old_primary,
        "stepdown cooldown should exclude the old primary"
    );
    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_writes_replicate_to_secondaries_but_not_arbiters() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![
            MemberSpec::data_node().with_priority(2.0),
            MemberSpec::data_node(),
            MemberSpec::arbiter(),
        ],
        settings(),
    )
    .await
    .unwrap();

    insert_one(&rs, "events", json!({ "_id": 1, "kind": "audit" })).await;

    // Exactly one data-bearing secondary, and it sees the write.
    let secondaries = rs.secondary_clients().await.unwrap();
    assert_eq!(secondaries.len(), 1);
    let secondary_member = rs.member(1);
    let payload = secondary_member
        .client()
        .run_expecting_success(CommandRequest::new(
            secondary_member.addr(),
            json!({ "count": "events" }),
        ))
        .await
        .unwrap();
    assert_eq!(payload["n"], json!(1));

    // The arbiter holds no data.
    let arbiter = rs.member(2);
    let payload = arbiter
        .client()
        .run_expecting_success(CommandRequest::new(
            arbiter.addr(),
            json!({ "count": "events" }),
        ))
        .await
        .unwrap();
    assert_eq!(payload["n"], json!(0));

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_secondary_rejects_writes_with_not_writable_primary() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node().with_priority(2.0), MemberSpec::data_node()],
        settings(),
    )
    .await
    .unwrap();

    let primary = rs.await_primary().await.unwrap();
    let secondary = rs.member(if primary == 0 { 1 } else { 0 });
    secondary
        .client()
        .run_expecting_failure(
            CommandRequest::new(
                secondary.addr(),
                json!({ "insert": "t", "documents": [{ "_id": 1 }] }),
            ),
            ServerErrorCode::NotWritablePrimary,
        )
        .await
        .unwrap();

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_kill_primary_fails_over_and_retry_succeeds() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 3],
        settings(),
    )
    .await
    .unwrap();

    insert_one(&rs, "orders", json!({ "_id": 1 })).await;
    let old_primary = rs.await_primary().await.unwrap();
    rs.stop_member(old_primary).await.unwrap();
    rs.await_stable_state().await.unwrap();

    let new_primary = rs.await_primary().await.unwrap();
    assert_ne!(new_primary, old_primary);

    // The replicated write survived the failover.
    let member = rs.member(new_primary);
    let payload = member
        .client()
        .run_expecting_success(CommandRequest::new(
            member.addr(),
            json!({ "count": "orders" }),
        ))
        .await
        .unwrap();
    assert_eq!(payload["n"], json!(1));

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_membership_changes_bump_config_version() {
    let cluster = MockCluster::new();
    let mut rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 2],
        settings(),
    )
    .await
    .unwrap();

    assert_eq!(rs.config_version(), 1);
    rs.add_member(MemberSpec::data_node()).await.unwrap();
    assert_eq!(rs.config_version(), 2);
    assert_eq!(rs.members().len(), 3);
    rs.await_stable_state().await.unwrap();

    rs.teardown().await.unwrap();
}

#[tokio::test]
async fn test_teardown_leaves_every_member_dead() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node(); 3],
        settings(),
    )
    .await
    .unwrap();

    // One member already stopped: teardown still stops the rest.
    rs.stop_member(1).await.unwrap();
    rs.teardown().await.unwrap();
    for member in rs.members() {
        assert!(!member.is_alive().await, "{} survived teardown", member.addr());
    }
}

#[tokio::test]
async fn test_step_up_transfers_primacy() {
    let cluster = MockCluster::new();
    let rs = ReplicaSetFixture::start(
        cluster.launcher(),
        "rs0",
        vec![MemberSpec::data_node().with_priority(2.0), MemberSpec::data_node()],
        settings(),
    )
    .await
    .unwrap();

    assert_eq!(rs.await_primary().await.unwrap(), 0);
    rs.step_up(1).await.unwrap();
    assert_eq!(rs.await_primary().await.unwrap(), 1);

    rs.teardown().await.unwrap();
}
