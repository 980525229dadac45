//! Convergence polling.
//!
//! Distributed state is observed, never awaited blindly: a predicate is
//! re-evaluated on a fixed interval until it holds or a per-call timeout
//! elapses. Predicate errors count as "not yet satisfied": a node that is
//! mid-restart legitimately refuses connections, and the poll simply keeps
//! retrying. There is no unbounded wait anywhere in the harness.

use crate::errors::{HarnessError, HarnessResult};
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default re-evaluation interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

/// Default total bound for one wait call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval used for fast-converging in-process state.
const FAST_INTERVAL: Duration = Duration::from_millis(50);

/// Per-call polling knobs. Interval and timeout are independent: in-process
/// state wants a tight interval, cross-process propagation (initial sync,
/// chunk migration) wants a long timeout.
#[derive(Debug, Clone, Copy)]
pub struct PollOpts {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOpts {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl PollOpts {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Tight interval for state that converges within milliseconds.
    pub fn fast() -> Self {
        Self {
            interval: FAST_INTERVAL,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Poll until `probe` yields a value, or fail with the last observed
/// context once `opts.timeout` elapses.
///
/// The probe must be read-only: evaluating it may not change its own
/// future answer. Errors from the probe are swallowed and retained as
/// diagnostic context for the eventual timeout report.
pub async fn wait_for<T, F, Fut>(goal: &str, opts: PollOpts, mut probe: F) -> HarnessResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<Option<T>>>,
{
    let deadline = Instant::now() + opts.timeout;
    let mut evaluations: u64 = 0;
    let mut last_context = String::from("never evaluated");

    loop {
        evaluations += 1;
        match probe().await {
            Ok(Some(value)) => {
                trace!(goal, evaluations, "condition satisfied");
                return Ok(value);
            }
            Ok(None) => {
                last_context = format!("condition false after {evaluations} evaluations");
            }
            Err(err) => {
                // Transient probe failures (node restarting, election in
                // progress) are not fatal to the wait.
                trace!(goal, %err, "probe error treated as not-yet-satisfied");
                last_context = format!("probe error on evaluation {evaluations}: {err}");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(HarnessError::ConvergenceTimeout {
                goal: goal.to_string(),
                timeout: opts.timeout,
                last_context,
            });
        }
        // Jitter keeps concurrent waiters out of lockstep; the sleep is
        // clamped to the deadline so the total bound holds regardless.
        let sleep = jittered(opts.interval).min(deadline - now);
        tokio::time::sleep(sleep).await;
    }
}

/// Poll until `predicate` returns true. See [`wait_for`].
pub async fn wait_until<F, Fut>(goal: &str, opts: PollOpts, mut predicate: F) -> HarnessResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HarnessResult<bool>>,
{
    wait_for(goal, opts, move || {
        let fut = predicate();
        async move { fut.await.map(|ok| if ok { Some(()) } else { None }) }
    })
    .await
}

fn jittered(interval: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.9..=1.1);
    interval.mul_f64(factor)
}
