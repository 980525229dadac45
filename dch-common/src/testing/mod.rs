//! Test-support utilities: structured scenario logging.

pub mod log;

pub use log::{
    ScenarioGuard, ScenarioLogEntry, ScenarioLogger, ScenarioPhase, init_global_scenario_logging,
};
