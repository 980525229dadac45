//! Sharded cluster fixture: registration, range routing, scatter-gather
//! reads, chunk migration, and FCV transitions through the router.

use dch_common::admin;
use dch_common::assertions::{check_results_eq, check_results_eq_unordered};
use dch_common::command::CommandRequest;
use dch_common::config::TopologySettings;
use dch_common::errors::ServerErrorCode;
use dch_common::mock::{MockCluster, log_ids};
use dch_common::poll::PollOpts;
use dch_common::topology::{ShardedClusterFixture, ShardedClusterSpec};
use serde_json::{Value, json};
use std::time::Duration;

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

async fn two_shard_cluster(cluster: &MockCluster) -> ShardedClusterFixture {
    ShardedClusterFixture::start(cluster.launcher(), ShardedClusterSpec::minimal(2), settings())
        .await
        .unwrap()
}

/// Shard "users" on `uid` and split so [0, 50) and [50, ∞) are separate
/// chunks, both initially on shard0.
async fn shard_users(fixture: &ShardedClusterFixture) {
    let router = fixture.router_client(0);
    let addr = fixture.router(0).addr();
    router
        .run_expecting_success(CommandRequest::new(
            addr.clone(),
            json!({ "shardCollection": "users", "key": { "uid": 1 } }),
        ))
        .await
        .unwrap();
    router
        .run_expecting_success(CommandRequest::new(
            addr,
            json!({ "split": "users", "middle": { "uid": 50 } }),
        ))
        .await
        .unwrap();
}

async fn insert_users(fixture: &ShardedClusterFixture, uids: &[i64]) {
    let router = fixture.router_client(0);
    let addr = fixture.router(0).addr();
    let documents: Vec<Value> = uids
        .iter()
        .map(|uid| json!({ "_id": uid, "uid": uid }))
        .collect();
    router
        .run_expecting_success(CommandRequest::new(
            addr,
            json!({ "insert": "users", "documents": documents }),
        ))
        .await
        .unwrap();
}

async fn count_on_shard(fixture: &ShardedClusterFixture, shard: usize, coll: &str) -> u64 {
    let rs = fixture.shard(shard);
    let index = rs.await_primary().await.unwrap();
    let member = rs.member(index);
    let payload = member
        .client()
        .run_expecting_success(CommandRequest::new(member.addr(), json!({ "count": coll })))
        .await
        .unwrap();
    payload["n"].as_u64().unwrap()
}

#[tokio::test]
async fn test_bring_up_registers_every_shard() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;

    let payload = fixture
        .router_client(0)
        .run_expecting_success(CommandRequest::new(
            fixture.router(0).addr(),
            json!({ "listShards": 1 }),
        ))
        .await
        .unwrap();
    let shards = payload["shards"].as_array().unwrap();
    assert_eq!(shards.len(), 2);

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_inserts_route_by_shard_key_after_migration() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;
    shard_users(&fixture).await;

    // Move the upper chunk to shard1, then insert across the split point.
    admin::move_chunk(
        &fixture.router_client(0),
        fixture.router(0).addr(),
        "users",
        json!({ "uid": 75 }),
        "shard1",
    )
    .await
    .unwrap();
    insert_users(&fixture, &[10, 20, 60, 70, 80]).await;

    assert_eq!(count_on_shard(&fixture, 0, "users").await, 2);
    assert_eq!(count_on_shard(&fixture, 1, "users").await, 3);

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_move_chunk_relocates_existing_documents() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;
    shard_users(&fixture).await;
    insert_users(&fixture, &[10, 60, 70]).await;

    // Everything starts on shard0.
    assert_eq!(count_on_shard(&fixture, 0, "users").await, 3);

    admin::move_chunk(
        &fixture.router_client(0),
        fixture.router(0).addr(),
        "users",
        json!({ "uid": 60 }),
        "shard1",
    )
    .await
    .unwrap();

    // The [50, ∞) documents moved; the [0, 50) chunk stayed.
    assert_eq!(count_on_shard(&fixture, 0, "users").await, 1);
    assert_eq!(count_on_shard(&fixture, 1, "users").await, 2);

    // The migration is visible in the router's structured log.
    let matcher = admin::LogMatcher::id(log_ids::CHUNK_MIGRATION_COMMITTED)
        .with_field("ns", json!("users"));
    admin::wait_for_log(
        &fixture.router_client(0),
        fixture.router(0).addr(),
        &matcher,
        1,
        PollOpts::fast().with_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_scatter_gather_results_match_unordered() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;
    shard_users(&fixture).await;
    admin::move_chunk(
        &fixture.router_client(0),
        fixture.router(0).addr(),
        "users",
        json!({ "uid": 75 }),
        "shard1",
    )
    .await
    .unwrap();
    insert_users(&fixture, &[1, 60]).await;

    let payload = fixture
        .router_client(0)
        .run_expecting_success(CommandRequest::new(
            fixture.router(0).addr(),
            json!({ "find": "users" }),
        ))
        .await
        .unwrap();
    let batch: Vec<Value> = payload
        .pointer("/cursor/firstBatch")
        .and_then(Value::as_array)
        .cloned()
        .unwrap();

    // Cross-shard merge order is not a contract; the multiset comparator
    // accepts either interleaving, the ordered one only accepts one.
    let expected = vec![
        json!({ "_id": 60, "uid": 60 }),
        json!({ "_id": 1, "uid": 1 }),
    ];
    check_results_eq_unordered("router scatter-gather", &expected, &batch).unwrap();
    let ordered_both_ways = check_results_eq("forward", &expected, &batch).is_ok()
        || check_results_eq(
            "reverse",
            &[expected[1].clone(), expected[0].clone()],
            &batch,
        )
        .is_ok();
    assert!(ordered_both_ways);

    // An explicit sort makes order a contract.
    let payload = fixture
        .router_client(0)
        .run_expecting_success(CommandRequest::new(
            fixture.router(0).addr(),
            json!({ "find": "users", "sort": { "uid": 1 } }),
        ))
        .await
        .unwrap();
    let sorted: Vec<Value> = payload
        .pointer("/cursor/firstBatch")
        .and_then(Value::as_array)
        .cloned()
        .unwrap();
    check_results_eq(
        "sorted router read",
        &[json!({ "_id": 1, "uid": 1 }), json!({ "_id": 60, "uid": 60 })],
        &sorted,
    )
    .unwrap();

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_move_chunk_to_unknown_shard_is_rejected() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;
    shard_users(&fixture).await;

    let err = admin::move_chunk(
        &fixture.router_client(0),
        fixture.router(0).addr(),
        "users",
        json!({ "uid": 10 }),
        "shard99",
    )
    .await
    .unwrap_err();
    assert_eq!(err.server_code(), Some(ServerErrorCode::ShardNotFound.code()));

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_fcv_transition_through_router() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;
    let router = fixture.router_client(0);
    let addr = fixture.router(0).addr();

    assert_eq!(admin::get_fcv(&router, addr.clone()).await.unwrap(), "8.0");
    admin::set_fcv(&router, addr.clone(), "7.0").await.unwrap();
    assert_eq!(admin::get_fcv(&router, addr.clone()).await.unwrap(), "7.0");

    // Bogus versions are rejected with a structured error.
    let err = admin::set_fcv(&router, addr, "3.2").await.unwrap_err();
    assert_eq!(
        err.server_code(),
        Some(ServerErrorCode::InvalidOptions.code())
    );

    fixture.teardown().await.unwrap();
}

#[tokio::test]
async fn test_teardown_stops_router_shards_and_config_servers() {
    let cluster = MockCluster::new();
    let fixture = two_shard_cluster(&cluster).await;
    fixture.teardown().await.unwrap();

    assert!(!fixture.router(0).is_alive().await);
    for shard in fixture.shards() {
        for member in shard.members() {
            assert!(!member.is_alive().await);
        }
    }
    for member in fixture.config_servers().members() {
        assert!(!member.is_alive().await);
    }
}
