//! Built-in smoke scenarios.
//!
//! Each runs against an in-process mock cluster, so the smoke suite is
//! hermetic: no external processes, no network.

use async_trait::async_trait;
use dch_common::admin::{self, FailPointGuard};
use dch_common::assertions;
use dch_common::background::BackgroundOp;
use dch_common::command::CommandRequest;
use dch_common::config::TopologySettings;
use dch_common::errors::{HarnessError, HarnessResult};
use dch_common::mock::MockCluster;
use dch_common::poll::PollOpts;
use dch_common::scenario::Scenario;
use dch_common::topology::{ReplicaSetFixture, ShardedClusterFixture, ShardedClusterSpec};
use dch_common::types::MemberSpec;
use serde_json::{Value, json};
use std::time::Duration;

fn settings() -> TopologySettings {
    TopologySettings {
        init_timeout_secs: 10,
        stable_timeout_secs: 5,
        stop_grace_secs: 1,
    }
}

/// All built-in scenarios, in execution order.
pub fn builtin() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(ReplsetFailover::default()),
        Box::new(FailPointPause::default()),
        Box::new(ShardedRouting::default()),
    ]
}

/// Three-member set: write, step the primary down, verify the write
/// survived the failover.
#[derive(Default)]
struct ReplsetFailover {
    fixture: Option<ReplicaSetFixture>,
}

#[async_trait]
impl Scenario for ReplsetFailover {
    fn name(&self) -> &str {
        "replset_failover"
    }

    async fn setup(&mut self) -> HarnessResult<()> {
        let cluster = MockCluster::new();
        let fixture = ReplicaSetFixture::start(
            cluster.launcher(),
            "smoke",
            vec![MemberSpec::data_node(); 3],
            settings(),
        )
        .await?;
        self.fixture = Some(fixture);
        Ok(())
    }

    async fn exercise(&mut self) -> HarnessResult<()> {
        let fixture = self.fixture.as_ref().expect("setup ran");
        let primary = fixture.await_primary().await?;
        let member = fixture.member(primary);
        member
            .client()
            .run_expecting_success(CommandRequest::new(
                member.addr(),
                json!({ "insert": "smoke", "documents": [{ "_id": 1, "v": 42 }] }),
            ))
            .await?;

        fixture.step_down().await?;
        fixture.await_stable_state().await?;

        let new_primary = fixture.await_primary().await?;
        if new_primary == primary {
            return Err(HarnessError::AssertionFailed {
                context: "failover target".into(),
                expected: format!("a primary other than member {primary}"),
                actual: format!("member {new_primary}"),
            });
        }
        let member = fixture.member(new_primary);
        let payload = member
            .client()
            .run_expecting_success(CommandRequest::new(
                member.addr(),
                json!({ "count": "smoke" }),
            ))
            .await?;
        assertions::check_doc_eq("replicated count", &json!(1), &payload["n"])
    }

    async fn teardown(&mut self) -> HarnessResult<()> {
        match &self.fixture {
            Some(fixture) => fixture.teardown().await,
            None => Ok(()),
        }
    }
}

/// Pause an insert at a fail point, observe the pause, release, verify.
#[derive(Default)]
struct FailPointPause {
    fixture: Option<ReplicaSetFixture>,
}

#[async_trait]
impl Scenario for FailPointPause {
    fn name(&self) -> &str {
        "failpoint_pause"
    }

    async fn setup(&mut self) -> HarnessResult<()> {
        let cluster = MockCluster::new();
        let fixture = ReplicaSetFixture::start(
            cluster.launcher(),
            "smoke",
            vec![MemberSpec::data_node()],
            settings(),
        )
        .await?;
        self.fixture = Some(fixture);
        Ok(())
    }

    async fn exercise(&mut self) -> HarnessResult<()> {
        let fixture = self.fixture.as_ref().expect("setup ran");
        let member = fixture.member(0);
        let client = member.client();
        let addr = member.addr();

        let guard = FailPointGuard::enable(
            client.clone(),
            addr.clone(),
            "pauseCommand",
            Some(json!({ "commands": ["insert"] })),
        )
        .await?;

        let insert_client = client.clone();
        let insert_addr = addr.clone();
        let op = BackgroundOp::spawn("paused-insert", async move {
            insert_client
                .run_expecting_success(CommandRequest::new(
                    insert_addr,
                    json!({ "insert": "smoke", "documents": [{ "_id": 1 }] }),
                ))
                .await
                .map(|_| ())
        });

        guard
            .await_paused_op(PollOpts::fast().with_timeout(Duration::from_secs(2)))
            .await?;
        let payload = client
            .run_expecting_success(CommandRequest::new(addr.clone(), json!({ "count": "smoke" })))
            .await?;
        assertions::check_doc_eq("count while paused", &json!(0), &payload["n"])?;

        guard.release().await?;
        op.join(Duration::from_secs(2)).await?;

        let payload = client
            .run_expecting_success(CommandRequest::new(addr, json!({ "count": "smoke" })))
            .await?;
        assertions::check_doc_eq("count after release", &json!(1), &payload["n"])
    }

    async fn teardown(&mut self) -> HarnessResult<()> {
        match &self.fixture {
            Some(fixture) => fixture.teardown().await,
            None => Ok(()),
        }
    }
}

/// Two shards: split, migrate a chunk, verify routing and scatter-gather.
#[derive(Default)]
struct ShardedRouting {
    fixture: Option<ShardedClusterFixture>,
}

#[async_trait]
impl Scenario for ShardedRouting {
    fn name(&self) -> &str {
        "sharded_routing"
    }

    async fn setup(&mut self) -> HarnessResult<()> {
        let cluster = MockCluster::new();
        let fixture = ShardedClusterFixture::start(
            cluster.launcher(),
            ShardedClusterSpec::minimal(2),
            settings(),
        )
        .await?;
        self.fixture = Some(fixture);
        Ok(())
    }

    async fn exercise(&mut self) -> HarnessResult<()> {
        let fixture = self.fixture.as_ref().expect("setup ran");
        let router = fixture.router_client(0);
        let addr = fixture.router(0).addr();

        router
            .run_expecting_success(CommandRequest::new(
                addr.clone(),
                json!({ "shardCollection": "users", "key": { "uid": 1 } }),
            ))
            .await?;
        router
            .run_expecting_success(CommandRequest::new(
                addr.clone(),
                json!({ "split": "users", "middle": { "uid": 100 } }),
            ))
            .await?;
        admin::move_chunk(&router, addr.clone(), "users", json!({ "uid": 100 }), "shard1")
            .await?;

        router
            .run_expecting_success(CommandRequest::new(
                addr.clone(),
                json!({ "insert": "users", "documents": [
                    { "_id": 1, "uid": 10 },
                    { "_id": 2, "uid": 150 },
                ]}),
            ))
            .await?;

        let payload = router
            .run_expecting_success(CommandRequest::new(addr, json!({ "find": "users" })))
            .await?;
        let batch: Vec<Value> = payload
            .pointer("/cursor/firstBatch")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        assertions::check_results_eq_unordered(
            "routed documents",
            &[
                json!({ "_id": 1, "uid": 10 }),
                json!({ "_id": 2, "uid": 150 }),
            ],
            &batch,
        )
    }

    async fn teardown(&mut self) -> HarnessResult<()> {
        match &self.fixture {
            Some(fixture) => fixture.teardown().await,
            None => Ok(()),
        }
    }
}
