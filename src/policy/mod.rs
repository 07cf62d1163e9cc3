//! PolicyLogger + Advisor (§4.3): an observational telemetry and learning
//! layer. The logger records every phase transition to an append-only JSONL
//! log; the advisor reads those logs to compute rolling statistics and
//! non-binding tuning advice; the override store materializes advice into
//! `tuning_overrides.json` under safety gates. Flow is strictly one-way:
//! logs -> advisor stats -> override store. The override store never writes
//! back into the logger.

pub mod advisor;
pub mod logger;
pub mod overrides;
pub mod stats;
pub mod system;

pub use advisor::{AdviceBundle, Advisor, Suggestion, Telemetry};
pub use logger::{PhaseEventContext, PolicyLogEntry, PolicyLogger};
pub use overrides::{OverrideHistoryEntry, TuningOverrideStore, TuningOverrides};
pub use system::SystemSnapshot;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How much the policy engine is allowed to act on its own advice. `Observe`
/// (the default) never mutates overrides mid-run; `Assist` materializes
/// overrides through the confidence/streak gates in §3.4; `Autonomous`
/// relaxes those gates for offline experimentation. Only `Observe` and
/// `Assist` are reachable from the default CLI surface (§1's LLM-advisor
/// exclusion) — `Autonomous` exists solely so logs written by other tooling
/// round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    Observe,
    Assist,
    Autonomous,
}

impl Default for LearningMode {
    fn default() -> Self {
        LearningMode::Observe
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseStart,
    PhaseEnd,
    PhaseRetry,
    PhaseFailure,
}

/// Schema version stamped on every log line and every materialized override,
/// so offline tooling reading old logs can tell which advice rules applied.
pub const POLICY_VERSION: &str = "1.0.0";

/// Generate a `run-<YYYYMMDDTHHMMSS>-<8 hex>` run id (§3.5).
pub fn generate_run_id() -> String {
    let now = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let hex: String = {
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
            .collect()
    };
    format!("run-{now}-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_matches_expected_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("run-"));
        let rest = &id[4..];
        let (ts, hex) = rest.split_once('-').unwrap();
        assert_eq!(ts.len(), 15); // YYYYMMDDTHHMMSS
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
