//! Background operations.
//!
//! A scenario that overlaps a long-running server-side operation with
//! foreground assertions runs the operation as a first-class task with a
//! join handle, not as a second scripting runtime. Joins always take an
//! explicit timeout, and a task whose target node is killed must resolve
//! (with a transport-classified error) rather than hang the harness.

use crate::errors::{HarnessError, HarnessResult};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A named concurrent operation with a join handle.
pub struct BackgroundOp<T> {
    name: String,
    // Option so `join` can move the handle out while Drop still aborts
    // never-joined tasks.
    handle: Option<JoinHandle<HarnessResult<T>>>,
}

impl<T: Send + 'static> BackgroundOp<T> {
    /// Spawn `future` onto its own task.
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = HarnessResult<T>> + Send + 'static,
    {
        let name = name.into();
        debug!(op = %name, "spawning background operation");
        Self {
            handle: Some(tokio::spawn(future)),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task has already run to completion.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the operation to complete, bounded by `timeout`.
    ///
    /// On timeout the task is aborted before returning, so no detached
    /// work outlives the scenario that started it.
    pub async fn join(mut self, timeout: Duration) -> HarnessResult<T> {
        let name = std::mem::take(&mut self.name);
        let mut handle = self
            .handle
            .take()
            .expect("background operation joined twice");
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(HarnessError::Internal(format!(
                "background operation '{name}' panicked"
            ))),
            Ok(Err(_)) => Err(HarnessError::Internal(format!(
                "background operation '{name}' was cancelled"
            ))),
            Err(_) => {
                warn!(op = %name, ?timeout, "background operation did not finish, aborting");
                handle.abort();
                Err(HarnessError::ConvergenceTimeout {
                    goal: format!("background operation '{name}' to complete"),
                    timeout,
                    last_context: "task still running at join deadline".to_string(),
                })
            }
        }
    }

    /// Cancel the operation. A subsequent `join` reports cancellation.
    pub fn abort(&self) {
        debug!(op = %self.name, "aborting background operation");
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl<T> Drop for BackgroundOp<T> {
    fn drop(&mut self) {
        // A dropped handle means the scenario forgot to join; don't let the
        // task keep driving the cluster underneath later scenarios.
        if let Some(handle) = &self.handle
            && !handle.is_finished()
        {
            handle.abort();
        }
    }
}
