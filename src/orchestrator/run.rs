//! Single-input run: §4.5's numbered algorithm.

use super::{CancelToken, Orchestrator, ProgressFn, DEFAULT_PHASES};
use crate::errors::OrchestratorError;
use crate::phase::{PhaseOutcome, PhaseRequest};
use crate::policy::PhaseEventContext;
use crate::policy::overrides::AdaptiveDeltas;
use crate::schema::types::{FileEntry, PhaseBlock, PipelineDocument, Status};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input_file: PathBuf,
    /// Defaults to `{phase1..phase5}` when empty.
    pub phases: Vec<String>,
    pub resume: bool,
    pub max_retries: u32,
    pub voice: Option<String>,
    pub engine: Option<String>,
    pub enable_subtitles: bool,
    pub concat_only: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            phases: Vec::new(),
            resume: true,
            max_retries: 2,
            voice: None,
            engine: None,
            enable_subtitles: false,
            concat_only: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PhaseResult {
    pub phase: String,
    pub status: String,
    pub duration_ms: u64,
    pub category: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub file_id: String,
    pub audiobook_path: Option<PathBuf>,
    pub phase_results: Vec<PhaseResult>,
    pub error: Option<String>,
}

impl Orchestrator {
    /// Run `opts.input_file` through the requested phase sequence (§4.5).
    pub async fn run(
        &self,
        opts: &RunOptions,
        progress: Option<&ProgressFn>,
        cancel: Option<&CancelToken>,
    ) -> Result<RunSummary, OrchestratorError> {
        let file_id = opts
            .input_file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::NoFileStem {
                path: opts.input_file.clone(),
            })?;

        let phases: Vec<String> = if opts.phases.is_empty() {
            DEFAULT_PHASES.iter().map(|s| s.to_string()).collect()
        } else {
            opts.phases.clone()
        };

        let mut phase_results = Vec::with_capacity(phases.len());

        for phase in &phases {
            if self.is_cancelled(cancel) {
                return Ok(cancelled_summary(file_id, phase_results));
            }

            if let Some(cb) = progress {
                cb(phase, 0, "starting");
            }

            if opts.resume && self.phase_already_succeeded(phase, &file_id)? {
                phase_results.push(PhaseResult {
                    phase: phase.clone(),
                    status: "skipped".to_string(),
                    duration_ms: 0,
                    category: None,
                });
                if let Some(cb) = progress {
                    cb(phase, 100, "skipped (reuse)");
                }
                continue;
            }

            let outcome = self.run_one_phase(phase, &file_id, opts).await?;

            if let Some(cb) = progress {
                cb(phase, if outcome.success { 100 } else { 0 }, if outcome.success { "complete" } else { "failed" });
            }

            phase_results.push(phase_result(phase, &outcome));
            self.ingest_run_outcome(phase, &outcome);

            if !outcome.success {
                return Ok(RunSummary {
                    success: false,
                    file_id,
                    audiobook_path: None,
                    phase_results,
                    error: Some(format!("phase {phase} failed: {}", outcome.stderr_tail)),
                });
            }

            if phase == "phase5" && opts.enable_subtitles {
                if self.is_cancelled(cancel) {
                    return Ok(cancelled_summary(file_id, phase_results));
                }
                let sub_outcome = self.run_one_phase("phase5_5", &file_id, opts).await?;
                phase_results.push(phase_result("phase5_5", &sub_outcome));
                self.ingest_run_outcome("phase5_5", &sub_outcome);
            }
        }

        let final_doc = self.state.read(false)?;
        let audiobook_path = self.archive_audiobook(&final_doc, &file_id);
        Ok(RunSummary {
            success: true,
            file_id,
            audiobook_path,
            phase_results,
            error: None,
        })
    }

    fn is_cancelled(&self, cancel: Option<&CancelToken>) -> bool {
        cancel.map(|c| c.load(std::sync::atomic::Ordering::SeqCst)).unwrap_or(false)
    }

    async fn run_one_phase(
        &self,
        phase: &str,
        file_id: &str,
        opts: &RunOptions,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        self.mark_running(phase, file_id)?;
        self.logger.record_phase_start(PhaseEventContext {
            phase: phase.to_string(),
            file_id: Some(file_id.to_string()),
            status: "running".to_string(),
            ..Default::default()
        });

        let req = PhaseRequest {
            phase: phase.to_string(),
            input_file: opts.input_file.clone(),
            file_id: file_id.to_string(),
            engine: opts.engine.clone(),
            disable_fallback: false,
            concat_only: opts.concat_only,
            voice: opts.voice.clone(),
        };
        let outcome = self.runner.run_with_retry(&self.state, &req, opts.max_retries).await?;
        self.record_outcome(phase, file_id, &req, &outcome)?;
        Ok(outcome)
    }

    fn phase_already_succeeded(&self, phase: &str, file_id: &str) -> Result<bool, OrchestratorError> {
        let doc = self.state.read(false)?;
        Ok(doc
            .file_entry(phase, file_id)
            .map(|entry| entry.envelope.status.is_success())
            .unwrap_or(false))
    }

    fn mark_running(&self, phase: &str, file_id: &str) -> Result<(), OrchestratorError> {
        self.state.with_transaction(&format!("{phase}_start"), |doc| {
            upsert_file_entry(doc, phase, file_id, Status::Running, None, None);
            doc.recompute_phases_map();
            Ok(())
        })?;
        Ok(())
    }

    fn record_outcome(
        &self,
        phase: &str,
        file_id: &str,
        req: &PhaseRequest,
        outcome: &PhaseOutcome,
    ) -> Result<(), OrchestratorError> {
        let status = if outcome.success { Status::Success } else { Status::Failed };

        let source_hash = if outcome.success && crate::schema::types::HASH_REUSABLE_PHASES.contains(&phase) {
            crate::phase::hash_file(&req.input_file).ok()
        } else {
            None
        };

        let metrics = serde_json::json!({
            "duration_ms": outcome.duration.as_millis() as u64,
            "reused": outcome.reused,
        });
        let error = if outcome.success {
            None
        } else {
            Some(serde_json::json!({
                "exit_code": outcome.exit_code,
                "category": outcome.category.map(|c| c.to_string()),
                "stderr_tail": outcome.stderr_tail,
            }))
        };

        self.state.with_transaction(&format!("{phase}_end"), |doc| {
            upsert_file_entry(doc, phase, file_id, status, source_hash.clone(), error.clone());
            if let Some(entry) = doc
                .phase_block_mut(phase)
                .and_then(|b| b.files.as_mut())
                .and_then(|f| f.get_mut(file_id))
            {
                entry.envelope.metrics = metrics.clone();
            }
            doc.recompute_phases_map();
            Ok(())
        })?;

        let ctx = PhaseEventContext {
            phase: phase.to_string(),
            file_id: Some(file_id.to_string()),
            status: status.as_str().to_string(),
            duration_ms: Some(outcome.duration.as_millis() as u64),
            metrics: Some(metrics),
            errors: error.map(|e| vec![e]),
        };
        if outcome.success {
            self.logger.record_phase_end(ctx);
        } else {
            self.logger.record_failure(ctx);
        }

        Ok(())
    }

    /// Feed the Advisor's running reward average and safety flags into the
    /// override store, and track phase-4 voice success streaks (§3.4, §4.3).
    fn ingest_run_outcome(&self, phase: &str, outcome: &PhaseOutcome) {
        let reward = self.advisor.reward_running_avg();
        let flags = self.advisor.safety_flags();
        let _ = self.overrides.ingest_run_outcome(phase, reward, AdaptiveDeltas::default(), flags);
        if phase == "phase4" {
            if outcome.success {
                let _ = self.overrides.bump_voice_success_streak();
            } else {
                let _ = self.overrides.reset_voice_success_streak();
            }
        }
    }

    /// Copy the produced audiobook to a title-addressed archive folder
    /// (§4.5 step 3d): a timestamped file plus the canonical overwrite.
    fn archive_audiobook(&self, doc: &PipelineDocument, file_id: &str) -> Option<PathBuf> {
        let entry = doc.file_entry("phase5", file_id)?;
        let source = extract_path_field(&entry.envelope.artifacts, &["output_path", "audio_path", "mp3_path"])?;
        if !source.exists() {
            return None;
        }
        let archive_dir = self.config.audiobooks_dir.join(file_id);
        std::fs::create_dir_all(&archive_dir).ok()?;
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let dest = archive_dir.join(format!("{file_id}_{timestamp}.mp3"));
        std::fs::copy(&source, &dest).ok()?;
        let canonical = archive_dir.join("audiobook.mp3");
        std::fs::copy(&source, &canonical).ok()?;
        Some(canonical)
    }
}

fn phase_result(phase: &str, outcome: &PhaseOutcome) -> PhaseResult {
    PhaseResult {
        phase: phase.to_string(),
        status: (if outcome.reused {
            "reused"
        } else if outcome.success {
            "success"
        } else {
            "failed"
        })
        .to_string(),
        duration_ms: outcome.duration.as_millis() as u64,
        category: outcome.category.map(|c| c.to_string()),
    }
}

fn cancelled_summary(file_id: String, phase_results: Vec<PhaseResult>) -> RunSummary {
    RunSummary {
        success: false,
        file_id,
        audiobook_path: None,
        phase_results,
        error: Some("cancelled".to_string()),
    }
}

fn extract_path_field(value: &Value, keys: &[&str]) -> Option<PathBuf> {
    let Value::Object(map) = value else {
        return None;
    };
    for key in keys {
        if let Some(Value::String(s)) = map.get(*key) {
            return Some(PathBuf::from(s));
        }
    }
    None
}

fn upsert_file_entry(
    doc: &mut PipelineDocument,
    phase: &str,
    file_id: &str,
    status: Status,
    source_hash: Option<String>,
    error: Option<Value>,
) {
    if doc.phase_block(phase).is_none() {
        doc.set_phase_block(phase, PhaseBlock::new(Status::Running));
    }
    let block = doc.phase_block_mut(phase).expect("just inserted above");
    block.envelope.status = status;
    let files = block.files.get_or_insert_with(Default::default);
    let entry = files.entry(file_id.to_string()).or_insert_with(|| FileEntry::new(status));
    entry.envelope.status = status;
    if let Some(hash) = source_hash {
        entry.source_hash = Some(hash);
    }
    if let Some(err) = error {
        entry.envelope.errors.push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn sample_input(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("book.txt");
        std::fs::write(&path, b"hello world").unwrap();
        path
    }

    #[tokio::test]
    async fn run_fails_cleanly_when_phase_executable_is_missing() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        config.ensure_directories().unwrap();
        let orchestrator = Orchestrator::new(config);

        let opts = RunOptions {
            input_file: sample_input(dir.path()),
            phases: vec!["phase1".to_string()],
            ..Default::default()
        };
        let result = orchestrator.run(&opts, None, None).await;
        assert!(result.is_err() || !result.unwrap().success);
    }

    #[tokio::test]
    async fn cancellation_checked_before_phase_returns_cancelled_summary() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf()).unwrap();
        config.ensure_directories().unwrap();
        let orchestrator = Orchestrator::new(config);
        let cancel = super::super::new_cancel_token();
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);

        let opts = RunOptions {
            input_file: sample_input(dir.path()),
            phases: vec!["phase1".to_string()],
            ..Default::default()
        };
        let summary = orchestrator.run(&opts, None, Some(&cancel)).await.unwrap();
        assert!(!summary.success);
        assert_eq!(summary.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn no_file_stem_is_rejected() {
        let path = PathBuf::from("/");
        assert!(path.file_stem().is_none());
    }
}
