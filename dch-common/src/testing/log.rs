//! Structured scenario logging for CI debugging.
//!
//! Writes JSONL output per scenario to make post-mortem debugging of
//! failed runs easier.
//!
//! # Global JSONL logging
//!
//! For automatic JSONL output from all tests without code changes, call
//! `init_global_scenario_logging()` once in your test setup:
//!
//! ```ignore
//! use dch_common::testing::init_global_scenario_logging;
//!
//! #[ctor::ctor]
//! fn setup() {
//!     init_global_scenario_logging();
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Scenario lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    /// Topology bring-up and data seeding.
    Setup,
    /// Main scenario execution.
    Execute,
    /// Outcome verification.
    Verify,
    /// Resource cleanup.
    Teardown,
}

impl std::fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Initialize global JSONL logging for all scenarios.
///
/// Sets up a tracing subscriber that writes JSON events to
/// `target/test-logs/all_scenarios.jsonl` and human-readable output to
/// stderr. Safe to call multiple times; initialization happens once.
///
/// # Environment variables
///
/// - `DCH_TEST_LOG_FILE`: override the log file path
/// - `DCH_TEST_LOG_LEVEL`: log level filter (default `info`)
pub fn init_global_scenario_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let log_file = create_global_log_file();

        let file_layer = log_file.map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let level = std::env::var("DCH_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!("dch_common={level},dch={level}"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var("DCH_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_scenarios.jsonl")).ok()
}

/// Find the target directory by searching up from the current dir.
fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

/// One structured log entry for scenario execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioLogEntry {
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// Name of the scenario.
    pub scenario: String,
    /// Current lifecycle phase.
    pub phase: ScenarioPhase,
    /// Log message.
    pub message: String,
    /// Optional structured data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Duration since scenario start in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ScenarioLogEntry {
    pub fn new(scenario: &str, phase: ScenarioPhase, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            scenario: scenario.to_string(),
            phase,
            message: message.into(),
            data: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Structured scenario logger that writes JSONL output.
///
/// Creates one log file per scenario in `target/test-logs/`.
pub struct ScenarioLogger {
    scenario: String,
    start_time: Instant,
    entries: Mutex<Vec<ScenarioLogEntry>>,
    log_file: Option<Mutex<std::fs::File>>,
}

impl ScenarioLogger {
    pub fn for_scenario(scenario: &str) -> Self {
        let log_file = Self::create_log_file(scenario).ok();

        let logger = Self {
            scenario: scenario.to_string(),
            start_time: Instant::now(),
            entries: Mutex::new(Vec::new()),
            log_file: log_file.map(Mutex::new),
        };

        logger.log(ScenarioPhase::Setup, "SCENARIO START");
        logger
    }

    fn create_log_file(scenario: &str) -> std::io::Result<std::fs::File> {
        let log_dir = find_target_dir().join("test-logs");
        std::fs::create_dir_all(&log_dir)?;

        let safe_name = scenario.replace("::", "_").replace(['/', '\\', ' '], "_");
        std::fs::File::create(log_dir.join(format!("{safe_name}.jsonl")))
    }

    /// Log a message for a specific phase.
    pub fn log(&self, phase: ScenarioPhase, message: impl Into<String>) {
        let duration_ms = self.start_time.elapsed().as_millis() as u64;
        let entry =
            ScenarioLogEntry::new(&self.scenario, phase, message).with_duration(duration_ms);
        self.write_entry(&entry);
    }

    /// Log a message with structured data.
    pub fn log_with_data(
        &self,
        phase: ScenarioPhase,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let duration_ms = self.start_time.elapsed().as_millis() as u64;
        let entry = ScenarioLogEntry::new(&self.scenario, phase, message)
            .with_duration(duration_ms)
            .with_data(data);
        self.write_entry(&entry);
    }

    fn write_entry(&self, entry: &ScenarioLogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }

        if let Some(file) = &self.log_file
            && let Ok(mut f) = file.lock()
            && let Ok(json) = serde_json::to_string(entry)
        {
            let _ = writeln!(f, "{json}");
        }

        tracing::info!(
            scenario = %self.scenario,
            phase = %entry.phase,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        );
    }

    /// All entries recorded so far.
    pub fn entries(&self) -> Vec<ScenarioLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Zero-boilerplate scenario log guard that auto-logs pass/fail on drop.
///
/// Logs SCENARIO PASS when dropped normally, SCENARIO FAIL when dropped
/// during a panic.
///
/// # Environment variables
///
/// - `DCH_TEST_LOGGING=1`: enable (default: enabled in CI, disabled
///   locally)
/// - `DCH_TEST_LOGGING=0`: disable
pub struct ScenarioGuard {
    inner: Option<ScenarioLogger>,
}

impl ScenarioGuard {
    pub fn new(scenario: &str) -> Self {
        let enabled = Self::is_enabled();
        Self {
            inner: if enabled {
                init_global_scenario_logging();
                Some(ScenarioLogger::for_scenario(scenario))
            } else {
                None
            },
        }
    }

    fn is_enabled() -> bool {
        match std::env::var("DCH_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        }
    }

    pub fn log(&self, phase: ScenarioPhase, message: impl Into<String>) {
        if let Some(logger) = &self.inner {
            logger.log(phase, message);
        }
    }

    pub fn log_with_data(
        &self,
        phase: ScenarioPhase,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        if let Some(logger) = &self.inner {
            logger.log_with_data(phase, message, data);
        }
    }
}

impl Drop for ScenarioGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            if std::thread::panicking() {
                logger.log_with_data(
                    ScenarioPhase::Verify,
                    "SCENARIO FAIL",
                    serde_json::json!({ "reason": "panicked" }),
                );
            } else {
                logger.log(ScenarioPhase::Verify, "SCENARIO PASS");
            }
        }
    }
}
