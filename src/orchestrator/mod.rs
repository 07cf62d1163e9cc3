//! Orchestrator (§4.5): the top-level control loop wiring StateStore,
//! PolicyLogger, Advisor, TuningOverrideStore and PhaseRunner together.

mod batch;
mod run;

pub use batch::{BatchRunOptions, BatchSummary};
pub use run::{PhaseResult, RunOptions, RunSummary};

use crate::config::Config;
use crate::phase::PhaseRunner;
use crate::policy::{Advisor, PolicyLogger, TuningOverrideStore};
use crate::state::StateStore;
use std::sync::Arc;

/// `progress(phase, pct, msg)`, invoked before and after each phase (§4.5).
pub type ProgressFn = dyn Fn(&str, u8, &str) + Send + Sync;

/// Cooperative cancellation, checked between phases (never mid-subprocess).
pub type CancelToken = Arc<std::sync::atomic::AtomicBool>;

pub fn new_cancel_token() -> CancelToken {
    Arc::new(std::sync::atomic::AtomicBool::new(false))
}

/// Phase keys run by default when `RunOptions::phases` is left empty.
pub const DEFAULT_PHASES: &[&str] = &["phase1", "phase2", "phase3", "phase4", "phase5"];

#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
    state: Arc<StateStore>,
    runner: Arc<PhaseRunner>,
    logger: Arc<PolicyLogger>,
    advisor: Arc<Advisor>,
    overrides: Arc<TuningOverrideStore>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let state = Arc::new(StateStore::new(&config));
        let runner = Arc::new(PhaseRunner::new(config.clone()));
        let run_id = crate::policy::generate_run_id();
        let logger = Arc::new(PolicyLogger::new(
            config.policy_log_dir.clone(),
            run_id,
            crate::policy::LearningMode::default(),
        ));
        let advisor = Arc::new(Advisor::new(config.policy_log_dir.clone()));
        let overrides = Arc::new(TuningOverrideStore::new(config.overrides_file.clone()));
        Self {
            config,
            state,
            runner,
            logger,
            advisor,
            overrides,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn advisor(&self) -> &Advisor {
        &self.advisor
    }

    pub fn overrides(&self) -> &TuningOverrideStore {
        &self.overrides
    }

    pub fn logger(&self) -> &PolicyLogger {
        &self.logger
    }
}
