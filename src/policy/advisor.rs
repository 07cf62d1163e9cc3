//! Read-only advisor over the PolicyLogger's event log (§4.3). Rebuilds its
//! rolling statistics only when the log directory's `(newest_mtime,
//! file_count)` token changes, so repeated `advise()` calls within a run are
//! cheap.

use super::logger::{directory_token, read_all_entries, PolicyLogEntry};
use super::stats::{RollingWindow, WindowSummary, HALLUCINATION_WINDOW, ROLLING_WINDOW};
use super::EventKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// A point-in-time view of the rolling stats an `advise()` call computed
/// from, handed back alongside the suggestions so callers can render both.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Telemetry {
    pub phase_duration_ms: HashMap<String, WindowSummary>,
    pub rt_factor: HashMap<String, WindowSummary>,
    pub fallback_rate: HashMap<String, WindowSummary>,
    pub engine_success_rate: HashMap<String, f64>,
    pub reward_running_avg: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suggestion {
    ChunkSize { phase: String, action: ChunkAction, confidence: f64 },
    Engine { phase: String, engine: String, confidence: f64 },
    VoiceVariant { file_id: String, failures: u32 },
    RetryPolicy { phase: String, suggested_retries: u32 },
    RtFactorAlert { phase: String, p95: f64 },
    FallbackAlert { phase: String, rate: f64 },
    HallucinationWatch { file_id: String },
    PhaseDurationWatch { phase: String, p95_ms: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkAction {
    Increase,
    Reduce,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AdviceBundle {
    pub suggestions: Vec<Suggestion>,
    pub telemetry: Telemetry,
}

/// A single decoded phase-end/phase-failure event, flattened out of the raw
/// `metrics`/`errors` JSON for easier aggregation.
struct Observation {
    phase: String,
    file_id: Option<String>,
    duration_ms: Option<f64>,
    rt_factor: Option<f64>,
    fallback: bool,
    hallucination: bool,
    engine: Option<String>,
    failed: bool,
}

fn observe(entry: &PolicyLogEntry) -> Observation {
    let metrics = entry.metrics.as_ref();
    let get_f64 = |key: &str| metrics.and_then(|m| m.get(key)).and_then(|v| v.as_f64());
    let get_bool = |key: &str| metrics.and_then(|m| m.get(key)).and_then(|v| v.as_bool()).unwrap_or(false);
    let get_str = |key: &str| metrics.and_then(|m| m.get(key)).and_then(|v| v.as_str()).map(str::to_string);

    Observation {
        phase: entry.phase.clone(),
        file_id: entry.file_id.clone(),
        duration_ms: entry.duration_ms.map(|d| d as f64).or_else(|| get_f64("duration_ms")),
        rt_factor: get_f64("rt_factor"),
        fallback: get_bool("fallback_used"),
        hallucination: get_bool("hallucination_detected"),
        engine: get_str("engine"),
        failed: entry.status == "failed" || entry.status == "error" || matches!(entry.event, EventKind::PhaseFailure),
    }
}

struct CachedStats {
    token: (Option<SystemTime>, usize),
    duration: HashMap<String, RollingWindow>,
    rt_factor: HashMap<String, RollingWindow>,
    fallback: HashMap<String, RollingWindow>,
    failure_streak: HashMap<String, u32>,
    engine_attempts: HashMap<(String, String), (u32, u32)>, // (phase,engine) -> (successes, attempts)
    failure_rate: HashMap<String, f64>,
    reward_running_avg: f64,
    any_hallucination: bool,
    hallucination_recent: HashMap<String, RollingWindow>,
}

impl CachedStats {
    fn empty(token: (Option<SystemTime>, usize)) -> Self {
        Self {
            token,
            duration: HashMap::new(),
            rt_factor: HashMap::new(),
            fallback: HashMap::new(),
            failure_streak: HashMap::new(),
            engine_attempts: HashMap::new(),
            failure_rate: HashMap::new(),
            reward_running_avg: 0.0,
            any_hallucination: false,
            hallucination_recent: HashMap::new(),
        }
    }
}

pub struct Advisor {
    log_dir: PathBuf,
    cache: Mutex<Option<CachedStats>>,
}

impl Advisor {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            cache: Mutex::new(None),
        }
    }

    fn rebuild(&self) -> CachedStats {
        let token = directory_token(&self.log_dir);
        let entries = read_all_entries(&self.log_dir);
        let mut stats = CachedStats::empty(token);

        let mut reward_samples: Vec<f64> = Vec::new();
        let mut per_phase_failures: HashMap<String, (u32, u32)> = HashMap::new();

        for entry in &entries {
            if !matches!(entry.event, EventKind::PhaseEnd | EventKind::PhaseFailure) {
                continue;
            }
            let obs = observe(entry);
            if obs.hallucination {
                stats.any_hallucination = true;
            }
            if let Some(file_id) = &obs.file_id {
                stats
                    .hallucination_recent
                    .entry(file_id.clone())
                    .or_insert_with(|| RollingWindow::with_capacity(HALLUCINATION_WINDOW))
                    .push(if obs.hallucination { 1.0 } else { 0.0 });
            }

            if let Some(d) = obs.duration_ms {
                stats.duration.entry(obs.phase.clone()).or_insert_with(RollingWindow::new).push(d);
            }
            if let Some(rt) = obs.rt_factor {
                stats.rt_factor.entry(obs.phase.clone()).or_insert_with(RollingWindow::new).push(rt);
            }
            stats
                .fallback
                .entry(obs.phase.clone())
                .or_insert_with(RollingWindow::new)
                .push(if obs.fallback { 1.0 } else { 0.0 });

            let counter = per_phase_failures.entry(obs.phase.clone()).or_insert((0, 0));
            counter.1 += 1;
            if obs.failed {
                counter.0 += 1;
            }

            if let Some(file_id) = &obs.file_id {
                let streak = stats.failure_streak.entry(file_id.clone()).or_insert(0);
                if obs.phase == "phase4" && obs.failed {
                    *streak += 1;
                } else if obs.phase == "phase4" {
                    *streak = 0;
                }
            }

            if let Some(engine) = &obs.engine {
                let key = (obs.phase.clone(), engine.clone());
                let tally = stats.engine_attempts.entry(key).or_insert((0, 0));
                tally.1 += 1;
                if !obs.failed {
                    tally.0 += 1;
                }
            }

            let rt_penalty = obs.rt_factor.map(|rt| (0.1 * (rt - 2.0)).max(0.0)).unwrap_or(0.0);
            let fallback_rate = if obs.fallback { 1.0 } else { 0.0 };
            let reward = 1.0
                - 1.5 * if obs.failed { 1.0 } else { 0.0 }
                - 0.5 * fallback_rate
                - rt_penalty
                - 0.3 * if obs.hallucination { 1.0 } else { 0.0 };
            reward_samples.push(reward);
        }

        for (phase, (failed, total)) in per_phase_failures {
            if total > 0 {
                stats.failure_rate.insert(phase, failed as f64 / total as f64);
            }
        }

        if !reward_samples.is_empty() {
            stats.reward_running_avg = reward_samples.iter().sum::<f64>() / reward_samples.len() as f64;
        }

        stats
    }

    fn with_stats<R>(&self, f: impl FnOnce(&CachedStats) -> R) -> R {
        let mut guard = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let token = directory_token(&self.log_dir);
        let needs_rebuild = guard.as_ref().map(|c| c.token != token).unwrap_or(true);
        if needs_rebuild {
            *guard = Some(self.rebuild());
        }
        f(guard.as_ref().expect("just rebuilt above"))
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Render the current rolling stats and active advice as Markdown, for
    /// the `advise --report` CLI flag (§4.3). Not meant for automated
    /// consumption — `advise()`'s structured `AdviceBundle` is the API
    /// surface other code should read.
    pub fn generate_report(&self) -> String {
        let bundle = self.advise();
        let mut out = String::new();
        out.push_str("# Policy Advisor Report\n\n");
        out.push_str(&format!("Reward running average: {:.3}\n\n", bundle.telemetry.reward_running_avg));

        out.push_str("## Phase duration (ms)\n\n");
        let mut phases: Vec<_> = bundle.telemetry.phase_duration_ms.keys().collect();
        phases.sort();
        for phase in phases {
            let summary = &bundle.telemetry.phase_duration_ms[phase];
            out.push_str(&format!(
                "- **{phase}**: mean={:.0}, p95={:.0}, count={}\n",
                summary.mean, summary.p95, summary.count
            ));
        }

        out.push_str("\n## Suggestions\n\n");
        if bundle.suggestions.is_empty() {
            out.push_str("(none)\n");
        }
        for suggestion in &bundle.suggestions {
            out.push_str(&format!("- {suggestion:?}\n"));
        }
        out
    }

    pub fn advise(&self) -> AdviceBundle {
        self.with_stats(|stats| {
            let mut suggestions = Vec::new();
            let mut telemetry = Telemetry {
                reward_running_avg: stats.reward_running_avg,
                ..Default::default()
            };

            for (phase, window) in &stats.duration {
                let summary = window.summary();
                telemetry.phase_duration_ms.insert(phase.clone(), summary);
                if summary.count < ROLLING_WINDOW / 4 {
                    continue;
                }
                if summary.mean > 600_000.0 {
                    suggestions.push(Suggestion::ChunkSize {
                        phase: phase.clone(),
                        action: ChunkAction::Reduce,
                        confidence: 0.6,
                    });
                } else if summary.mean < 180_000.0 {
                    suggestions.push(Suggestion::ChunkSize {
                        phase: phase.clone(),
                        action: ChunkAction::Increase,
                        confidence: 0.6,
                    });
                }
                if summary.p95 > 0.0 {
                    suggestions.push(Suggestion::PhaseDurationWatch {
                        phase: phase.clone(),
                        p95_ms: summary.p95,
                    });
                }
            }

            for (phase, window) in &stats.rt_factor {
                let summary = window.summary();
                telemetry.rt_factor.insert(phase.clone(), summary);
                if summary.p95 > 2.0 {
                    suggestions.push(Suggestion::RtFactorAlert {
                        phase: phase.clone(),
                        p95: summary.p95,
                    });
                }
            }

            for (phase, window) in &stats.fallback {
                let summary = window.summary();
                telemetry.fallback_rate.insert(phase.clone(), summary);
                if summary.mean > 0.2 {
                    suggestions.push(Suggestion::FallbackAlert {
                        phase: phase.clone(),
                        rate: summary.mean,
                    });
                }
            }

            for (phase, rate) in &stats.failure_rate {
                let suggested_retries = if *rate > 0.35 {
                    4
                } else if *rate < 0.05 {
                    1
                } else {
                    continue;
                };
                suggestions.push(Suggestion::RetryPolicy {
                    phase: phase.clone(),
                    suggested_retries,
                });
            }

            for (file_id, streak) in &stats.failure_streak {
                if *streak >= 2 {
                    suggestions.push(Suggestion::VoiceVariant {
                        file_id: file_id.clone(),
                        failures: *streak,
                    });
                }
            }

            for (file_id, window) in &stats.hallucination_recent {
                if window.max() > 0.0 {
                    suggestions.push(Suggestion::HallucinationWatch {
                        file_id: file_id.clone(),
                    });
                }
            }

            let mut best_by_phase: HashMap<String, (String, f64, u32)> = HashMap::new();
            for ((phase, engine), (successes, attempts)) in &stats.engine_attempts {
                if *attempts == 0 {
                    continue;
                }
                let rate = *successes as f64 / *attempts as f64;
                telemetry
                    .engine_success_rate
                    .insert(format!("{phase}:{engine}"), rate);
                let entry = best_by_phase.entry(phase.clone()).or_insert_with(|| (engine.clone(), rate, *attempts));
                if rate > entry.1 {
                    *entry = (engine.clone(), rate, *attempts);
                }
            }
            for (phase, (engine, rate, attempts)) in best_by_phase {
                if attempts < 3 {
                    continue;
                }
                let margin_confidence = (rate - 0.5).max(0.0) + 0.55;
                if margin_confidence >= 0.55 {
                    suggestions.push(Suggestion::Engine {
                        phase,
                        engine,
                        confidence: margin_confidence.min(0.99),
                    });
                }
            }

            AdviceBundle { suggestions, telemetry }
        })
    }

    /// Mean phase duration over the rolling window, in ms. Returns `0.0` if
    /// no samples exist yet for the phase.
    pub fn recent_avg_duration_ms(&self, phase: &str) -> f64 {
        self.with_stats(|stats| stats.duration.get(phase).map(|w| w.mean()).unwrap_or(0.0))
    }

    pub fn reward_running_avg(&self) -> f64 {
        self.with_stats(|stats| stats.reward_running_avg)
    }

    /// Safety flags derived from the running reward average (§4.3).
    pub fn safety_flags(&self) -> super::overrides::SafetyFlags {
        self.with_stats(|stats| super::overrides::SafetyFlags {
            revert_chunk: stats.reward_running_avg < -0.5,
            revert_engine: stats.reward_running_avg < -0.75,
            voice_alert: stats.any_hallucination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{LearningMode, PhaseEventContext, PolicyLogger};
    use tempfile::tempdir;

    #[test]
    fn chunk_size_suggestion_emitted_when_mean_duration_high() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-a".into(), LearningMode::Observe);
        for _ in 0..12 {
            logger.record_phase_end(PhaseEventContext {
                phase: "phase3".into(),
                status: "success".into(),
                duration_ms: Some(700_000),
                ..Default::default()
            });
        }
        let advisor = Advisor::new(dir.path().to_path_buf());
        let bundle = advisor.advise();
        assert!(bundle.suggestions.iter().any(|s| matches!(
            s,
            Suggestion::ChunkSize { action: ChunkAction::Reduce, .. }
        )));
    }

    #[test]
    fn voice_variant_suggested_after_two_phase4_failures() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-a".into(), LearningMode::Observe);
        for _ in 0..2 {
            logger.record_phase_end(PhaseEventContext {
                phase: "phase4".into(),
                file_id: Some("book-1".into()),
                status: "failed".into(),
                ..Default::default()
            });
        }
        let advisor = Advisor::new(dir.path().to_path_buf());
        let bundle = advisor.advise();
        assert!(bundle
            .suggestions
            .iter()
            .any(|s| matches!(s, Suggestion::VoiceVariant { file_id, .. } if file_id == "book-1")));
    }

    #[test]
    fn cache_reused_until_log_dir_changes() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-a".into(), LearningMode::Observe);
        logger.record_phase_end(PhaseEventContext {
            phase: "phase1".into(),
            status: "success".into(),
            duration_ms: Some(1000),
            ..Default::default()
        });
        let advisor = Advisor::new(dir.path().to_path_buf());
        let first = advisor.recent_avg_duration_ms("phase1");
        assert_eq!(first, 1000.0);

        logger.record_phase_end(PhaseEventContext {
            phase: "phase1".into(),
            status: "success".into(),
            duration_ms: Some(3000),
            ..Default::default()
        });
        let second = advisor.recent_avg_duration_ms("phase1");
        assert_eq!(second, 2000.0);
    }

    #[test]
    fn reward_running_avg_below_threshold_sets_revert_chunk() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-a".into(), LearningMode::Observe);
        for _ in 0..5 {
            logger.record_phase_end(PhaseEventContext {
                phase: "phase4".into(),
                status: "failed".into(),
                ..Default::default()
            });
        }
        let advisor = Advisor::new(dir.path().to_path_buf());
        let flags = advisor.safety_flags();
        assert!(flags.revert_chunk);
        assert!(flags.revert_engine);
    }
}
