//! Scenario lifecycle: setup → exercise → teardown, teardown always.
//!
//! A scenario owns its own fixtures (as `Option` fields, so teardown can
//! handle whatever partial state setup left behind). The runner guarantees
//! teardown executes exactly once on every path: setup failure, exercise
//! failure, or success. A teardown failure is reported alongside the
//! primary error; it never masks it and is never dropped.

use crate::errors::{HarnessError, HarnessResult};
use crate::testing::{ScenarioLogger, ScenarioPhase};
use async_trait::async_trait;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// One test scenario with an explicit lifecycle.
///
/// Implementations keep fixture state in `Option` fields: `teardown` must
/// tolerate being called after a failed or partial `setup`.
#[async_trait]
pub trait Scenario: Send {
    fn name(&self) -> &str;

    /// Build topology and seed data.
    async fn setup(&mut self) -> HarnessResult<()>;

    /// Drive the cluster and assert on outcomes.
    async fn exercise(&mut self) -> HarnessResult<()>;

    /// Release every resource setup acquired. Invoked unconditionally.
    async fn teardown(&mut self) -> HarnessResult<()>;
}

/// Phase in which a scenario's primary error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedPhase {
    Setup,
    Exercise,
}

/// Outcome of one scenario run.
#[derive(Debug)]
pub struct ScenarioReport {
    /// Correlation id, also stamped into the scenario's log stream.
    pub run_id: uuid::Uuid,
    pub name: String,
    /// Primary error: setup or exercise failure.
    pub error: Option<HarnessError>,
    /// Phase the primary error was raised in.
    pub failed_phase: Option<FailedPhase>,
    /// Teardown failure, reported alongside the primary error.
    pub teardown_error: Option<HarnessError>,
    pub duration: Duration,
}

impl ScenarioReport {
    /// A run passes only if both the body and teardown succeeded.
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.teardown_error.is_none()
    }

    /// Re-raise the primary error (teardown has already run). A clean body
    /// with a failed teardown surfaces the teardown error instead.
    pub fn into_result(self) -> HarnessResult<()> {
        match (self.error, self.teardown_error) {
            (Some(primary), _) => Err(primary),
            (None, Some(teardown)) => Err(teardown),
            (None, None) => Ok(()),
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        match (&self.error, &self.teardown_error) {
            (None, None) => format!("PASS {} ({:?})", self.name, self.duration),
            (Some(err), None) => format!("FAIL {} ({:?}): {err}", self.name, self.duration),
            (None, Some(td)) => format!(
                "FAIL {} ({:?}): teardown failed: {td}",
                self.name, self.duration
            ),
            (Some(err), Some(td)) => format!(
                "FAIL {} ({:?}): {err} (teardown also failed: {td})",
                self.name, self.duration
            ),
        }
    }
}

/// Runs scenarios with guaranteed-teardown discipline.
#[derive(Debug, Default)]
pub struct ScenarioRunner {
    _private: (),
}

impl ScenarioRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one scenario through its full lifecycle.
    ///
    /// 1. `setup`; on failure, teardown still runs, then the setup error
    ///    is the primary error.
    /// 2. `exercise`; any error is captured as the primary error.
    /// 3. `teardown`, unconditionally. Its error never masks the primary
    ///    error and is never silently dropped.
    pub async fn run(&self, scenario: &mut dyn Scenario) -> ScenarioReport {
        let name = scenario.name().to_string();
        let run_id = uuid::Uuid::new_v4();
        let logger = ScenarioLogger::for_scenario(&name);
        logger.log_with_data(
            ScenarioPhase::Setup,
            "run id",
            serde_json::json!({ "run_id": run_id.to_string() }),
        );
        let started = Instant::now();

        let (primary, failed_phase) = match scenario.setup().await {
            Err(err) => {
                error!(scenario = %name, %err, "setup failed");
                logger.log(ScenarioPhase::Setup, format!("setup failed: {err}"));
                (Some(err), Some(FailedPhase::Setup))
            }
            Ok(()) => {
                logger.log(ScenarioPhase::Execute, "setup complete, exercising");
                match scenario.exercise().await {
                    Err(err) => {
                        error!(scenario = %name, %err, "exercise failed");
                        logger.log(ScenarioPhase::Execute, format!("exercise failed: {err}"));
                        (Some(err), Some(FailedPhase::Exercise))
                    }
                    Ok(()) => (None, None),
                }
            }
        };

        logger.log(ScenarioPhase::Teardown, "tearing down");
        let teardown_error = match scenario.teardown().await {
            Ok(()) => None,
            Err(err) => {
                warn!(scenario = %name, %err, "teardown failed");
                logger.log(ScenarioPhase::Teardown, format!("teardown failed: {err}"));
                Some(err)
            }
        };

        let report = ScenarioReport {
            run_id,
            name,
            error: primary,
            failed_phase,
            teardown_error,
            duration: started.elapsed(),
        };
        if report.passed() {
            info!(scenario = %report.name, ?report.duration, "scenario passed");
            logger.log(ScenarioPhase::Verify, "SCENARIO PASS");
        } else {
            logger.log(ScenarioPhase::Verify, report.summary());
        }
        report
    }

    /// Run a batch of scenarios sequentially, continuing past failures.
    pub async fn run_all(&self, scenarios: &mut [Box<dyn Scenario>]) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.run(scenario.as_mut()).await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scenario scripted to fail in selected phases, counting invocations.
    struct Scripted {
        fail_setup: bool,
        fail_exercise: bool,
        fail_teardown: bool,
        setup_calls: Arc<AtomicU32>,
        exercise_calls: Arc<AtomicU32>,
        teardown_calls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(fail_setup: bool, fail_exercise: bool, fail_teardown: bool) -> Self {
            Self {
                fail_setup,
                fail_exercise,
                fail_teardown,
                setup_calls: Arc::new(AtomicU32::new(0)),
                exercise_calls: Arc::new(AtomicU32::new(0)),
                teardown_calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn boom(which: &str) -> HarnessError {
            HarnessError::AssertionFailed {
                context: which.to_string(),
                expected: "success".to_string(),
                actual: "scripted failure".to_string(),
            }
        }
    }

    #[async_trait]
    impl Scenario for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn setup(&mut self) -> HarnessResult<()> {
            self.setup_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                Err(Self::boom("setup"))
            } else {
                Ok(())
            }
        }

        async fn exercise(&mut self) -> HarnessResult<()> {
            self.exercise_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_exercise {
                Err(Self::boom("exercise"))
            } else {
                Ok(())
            }
        }

        async fn teardown(&mut self) -> HarnessResult<()> {
            self.teardown_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown {
                Err(Self::boom("teardown"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_clean_run_passes() {
        let mut scenario = Scripted::new(false, false, false);
        let report = ScenarioRunner::new().run(&mut scenario).await;
        assert!(report.passed());
        assert_eq!(scenario.teardown_calls.load(Ordering::SeqCst), 1);
        report.into_result().unwrap();
    }

    #[tokio::test]
    async fn test_exercise_failure_still_tears_down_once() {
        let mut scenario = Scripted::new(false, true, false);
        let report = ScenarioRunner::new().run(&mut scenario).await;
        assert!(!report.passed());
        assert_eq!(report.failed_phase, Some(FailedPhase::Exercise));
        assert_eq!(scenario.teardown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_skips_exercise_but_tears_down() {
        let mut scenario = Scripted::new(true, false, false);
        let report = ScenarioRunner::new().run(&mut scenario).await;
        assert_eq!(report.failed_phase, Some(FailedPhase::Setup));
        assert_eq!(scenario.exercise_calls.load(Ordering::SeqCst), 0);
        assert_eq!(scenario.teardown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_error_does_not_mask_primary() {
        let mut scenario = Scripted::new(false, true, true);
        let report = ScenarioRunner::new().run(&mut scenario).await;
        // Both errors present on the report.
        assert!(report.error.is_some());
        assert!(report.teardown_error.is_some());
        assert!(report.summary().contains("teardown also failed"));
        // The primary error wins the re-raise.
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("exercise"));
    }

    #[tokio::test]
    async fn test_teardown_error_alone_fails_the_run() {
        let mut scenario = Scripted::new(false, false, true);
        let report = ScenarioRunner::new().run(&mut scenario).await;
        assert!(!report.passed());
        assert!(report.error.is_none());
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("teardown"));
    }

    #[tokio::test]
    async fn test_run_all_continues_past_failures() {
        let mut scenarios: Vec<Box<dyn Scenario>> = vec![
            Box::new(Scripted::new(false, true, false)),
            Box::new(Scripted::new(false, false, false)),
        ];
        let reports = ScenarioRunner::new().run_all(&mut scenarios).await;
        assert_eq!(reports.len(), 2);
        assert!(!reports[0].passed());
        assert!(reports[1].passed());
    }
}
