//! TuningOverrideStore: the human-reviewable `tuning_overrides.json` sibling
//! document (§3.4). Applies the safety rules at materialization time —
//! `delta_percent` clamped to ±20, engine preference gated on confidence,
//! voice variant gated on a success streak — and keeps a chronological
//! `history` of every accepted change.

use crate::errors::PolicyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DELTA_PERCENT_CLAMP: f64 = 20.0;
pub const ENGINE_CONFIDENCE_THRESHOLD: f64 = 0.70;
pub const VOICE_SUCCESS_STREAK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub knob: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeState {
    #[serde(default)]
    pub voice_success_streak: u32,
    #[serde(default)]
    pub reward_running_avg: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningOverrides {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub overrides: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub history: Vec<OverrideHistoryEntry>,
    #[serde(default)]
    pub runtime_state: RuntimeState,
}

fn default_version() -> u32 {
    1
}

impl Default for TuningOverrides {
    fn default() -> Self {
        Self {
            version: default_version(),
            overrides: BTreeMap::new(),
            history: Vec::new(),
            runtime_state: RuntimeState::default(),
        }
    }
}

impl TuningOverrides {
    pub fn knob(&self, phase: &str, knob: &str) -> Option<&Value> {
        self.overrides.get(phase)?.get(knob)
    }

    fn record(&mut self, phase: &str, knob: &str, new_value: Value, reason: &str) {
        let old_value = self.knob(phase, knob).cloned();
        self.overrides
            .entry(phase.to_string())
            .or_default()
            .insert(knob.to_string(), new_value.clone());
        self.history.push(OverrideHistoryEntry {
            timestamp: Utc::now(),
            phase: phase.to_string(),
            knob: knob.to_string(),
            old_value,
            new_value,
            reason: reason.to_string(),
        });
    }
}

/// Adaptive deltas the Advisor computed for the run that just completed
/// (§4.3 "Reward signal").
#[derive(Debug, Clone, Default)]
pub struct AdaptiveDeltas {
    pub chunk_size_delta_percent: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SafetyFlags {
    pub revert_chunk: bool,
    pub revert_engine: bool,
    pub voice_alert: bool,
}

pub struct TuningOverrideStore {
    path: PathBuf,
}

impl TuningOverrideStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Missing or corrupt `tuning_overrides.json` is tolerated as empty
    /// (§7): a fresh project has no overrides yet.
    pub fn load(&self) -> TuningOverrides {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return TuningOverrides::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn load_checked(&self) -> Result<TuningOverrides, PolicyError> {
        if !self.path.exists() {
            return Ok(TuningOverrides::default());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|source| PolicyError::OverridesRead {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| PolicyError::OverridesParse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, overrides: &TuningOverrides) -> Result<(), PolicyError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PolicyError::OverridesWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(overrides).map_err(|source| {
            PolicyError::OverridesParse {
                path: self.path.clone(),
                source,
            }
        })?;
        std::fs::write(&self.path, json).map_err(|source| PolicyError::OverridesWrite {
            path: self.path.clone(),
            source,
        })
    }

    /// Clamp and apply a `chunk_size.delta_percent` change; always applied
    /// (the knob is clamped, not gated) — matches §3.4's invariant and the
    /// override-clamp scenario in §8.4.
    pub fn apply_chunk_size_delta(&self, phase: &str, delta_percent: f64, reason: &str) -> Result<f64, PolicyError> {
        let clamped = delta_percent.clamp(-DELTA_PERCENT_CLAMP, DELTA_PERCENT_CLAMP);
        let mut overrides = self.load_checked()?;
        overrides.record(phase, "chunk_size.delta_percent", Value::from(clamped), reason);
        self.save(&overrides)?;
        Ok(clamped)
    }

    /// Only materializes `engine.preferred` when `confidence >= 0.70` (§3.4,
    /// §4.4). Returns whether the change was applied.
    pub fn apply_engine_preference(
        &self,
        phase: &str,
        engine: &str,
        confidence: f64,
        reason: &str,
    ) -> Result<bool, PolicyError> {
        if confidence < ENGINE_CONFIDENCE_THRESHOLD {
            return Ok(false);
        }
        let mut overrides = self.load_checked()?;
        overrides.record(
            phase,
            "engine.preferred",
            serde_json::json!({ "engine": engine, "confidence": confidence }),
            reason,
        );
        self.save(&overrides)?;
        Ok(true)
    }

    /// Only materializes `voice_variant` when `runtime_state.voice_success_streak
    /// >= 3` (§3.4). Returns whether the change was applied.
    pub fn apply_voice_variant(&self, file_id: &str, voice: &str, reason: &str) -> Result<bool, PolicyError> {
        let mut overrides = self.load_checked()?;
        if overrides.runtime_state.voice_success_streak < VOICE_SUCCESS_STREAK_THRESHOLD {
            return Ok(false);
        }
        overrides.record("phase4", &format!("voice_variant.{file_id}"), Value::String(voice.to_string()), reason);
        self.save(&overrides)?;
        Ok(true)
    }

    pub fn apply_retry_policy(&self, phase: &str, suggested_retries: u32, reason: &str) -> Result<(), PolicyError> {
        let mut overrides = self.load_checked()?;
        overrides.record(
            phase,
            "retry_policy.suggested_retries",
            Value::from(suggested_retries),
            reason,
        );
        self.save(&overrides)?;
        Ok(())
    }

    pub fn bump_voice_success_streak(&self) -> Result<u32, PolicyError> {
        let mut overrides = self.load_checked()?;
        overrides.runtime_state.voice_success_streak += 1;
        let streak = overrides.runtime_state.voice_success_streak;
        self.save(&overrides)?;
        Ok(streak)
    }

    pub fn reset_voice_success_streak(&self) -> Result<(), PolicyError> {
        let mut overrides = self.load_checked()?;
        overrides.runtime_state.voice_success_streak = 0;
        self.save(&overrides)
    }

    /// Ingest the Advisor's end-of-run `adaptive_deltas` + `safety_flags`:
    /// mutate the overrides document, reverting to neutral where a safety
    /// flag demands it, and append the change to `history` (§4.3).
    pub fn ingest_run_outcome(
        &self,
        phase: &str,
        reward: f64,
        deltas: AdaptiveDeltas,
        flags: SafetyFlags,
    ) -> Result<(), PolicyError> {
        let mut overrides = self.load_checked()?;
        overrides
            .runtime_state
            .reward_running_avg
            .entry(phase.to_string())
            .and_modify(|avg| *avg = *avg * 0.8 + reward * 0.2)
            .or_insert(reward);
        self.save(&overrides)?;

        if flags.revert_chunk {
            self.apply_chunk_size_delta(phase, 0.0, "safety_flag:revert_chunk")?;
        } else if let Some(delta) = deltas.chunk_size_delta_percent {
            let bounded = delta.clamp(-2.0, 2.0);
            self.apply_chunk_size_delta(phase, bounded, "adaptive_delta")?;
        }

        if flags.revert_engine {
            let mut overrides = self.load_checked()?;
            overrides.overrides.entry(phase.to_string()).or_default().remove("engine.preferred");
            overrides.history.push(OverrideHistoryEntry {
                timestamp: Utc::now(),
                phase: phase.to_string(),
                knob: "engine.preferred".to_string(),
                old_value: None,
                new_value: Value::Null,
                reason: "safety_flag:revert_engine".to_string(),
            });
            self.save(&overrides)?;
        }

        if flags.voice_alert {
            self.reset_voice_success_streak()?;
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chunk_delta_clamps_to_plus_twenty() {
        let dir = tempdir().unwrap();
        let store = TuningOverrideStore::new(dir.path().join("tuning_overrides.json"));
        let applied = store.apply_chunk_size_delta("phase3", 50.0, "advisor").unwrap();
        assert_eq!(applied, 20.0);
    }

    #[test]
    fn chunk_delta_clamps_to_minus_twenty() {
        let dir = tempdir().unwrap();
        let store = TuningOverrideStore::new(dir.path().join("tuning_overrides.json"));
        let applied = store.apply_chunk_size_delta("phase3", -75.0, "advisor").unwrap();
        assert_eq!(applied, -20.0);
    }

    #[test]
    fn engine_preference_requires_confidence_gate() {
        let dir = tempdir().unwrap();
        let store = TuningOverrideStore::new(dir.path().join("tuning_overrides.json"));
        let applied_low = store.apply_engine_preference("phase4", "kokoro", 0.5, "advisor").unwrap();
        assert!(!applied_low);
        let applied_high = store.apply_engine_preference("phase4", "kokoro", 0.71, "advisor").unwrap();
        assert!(applied_high);
        let overrides = store.load();
        assert_eq!(overrides.knob("phase4", "engine.preferred").unwrap()["engine"], "kokoro");
    }

    #[test]
    fn voice_variant_requires_success_streak() {
        let dir = tempdir().unwrap();
        let store = TuningOverrideStore::new(dir.path().join("tuning_overrides.json"));
        assert!(!store.apply_voice_variant("book", "voice-2", "advisor").unwrap());
        store.bump_voice_success_streak().unwrap();
        store.bump_voice_success_streak().unwrap();
        store.bump_voice_success_streak().unwrap();
        assert!(store.apply_voice_variant("book", "voice-2", "advisor").unwrap());
    }

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempdir().unwrap();
        let store = TuningOverrideStore::new(dir.path().join("nope.json"));
        let overrides = store.load();
        assert_eq!(overrides.version, 1);
        assert!(overrides.overrides.is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tuning_overrides.json");
        std::fs::write(&path, "not json").unwrap();
        let store = TuningOverrideStore::new(path);
        let overrides = store.load();
        assert!(overrides.overrides.is_empty());
    }

    #[test]
    fn revert_chunk_safety_flag_resets_to_neutral() {
        let dir = tempdir().unwrap();
        let store = TuningOverrideStore::new(dir.path().join("tuning_overrides.json"));
        store.apply_chunk_size_delta("phase3", 15.0, "advisor").unwrap();
        store
            .ingest_run_outcome(
                "phase3",
                -0.6,
                AdaptiveDeltas::default(),
                SafetyFlags {
                    revert_chunk: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let overrides = store.load();
        assert_eq!(overrides.knob("phase3", "chunk_size.delta_percent").unwrap(), 0.0);
    }
}
