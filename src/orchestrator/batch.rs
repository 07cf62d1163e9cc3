//! Batch mode (§4.5): run several inputs through the same phase sequence,
//! bounded by a worker semaphore, sharing a single `StateStore`.

use super::{Orchestrator, ProgressFn, RunOptions, RunSummary};
use crate::errors::OrchestratorError;
use crate::schema::types::{BatchRunRecord, Status};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct BatchRunOptions {
    pub inputs: Vec<PathBuf>,
    pub phases: Vec<String>,
    pub resume: bool,
    pub max_retries: u32,
    pub voice: Option<String>,
    pub engine: Option<String>,
    pub enable_subtitles: bool,
    pub max_workers: usize,
}

impl Default for BatchRunOptions {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            phases: Vec::new(),
            resume: true,
            max_retries: 2,
            voice: None,
            engine: None,
            enable_subtitles: false,
            max_workers: 1,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<RunSummary>,
}

impl Orchestrator {
    /// Run every input in `opts.inputs` through `Orchestrator::run`, up to
    /// `opts.max_workers` concurrently, then append one `batch_runs` record
    /// summarizing the whole batch (§4.5's batch mode paragraph).
    pub async fn run_batch(
        &self,
        opts: &BatchRunOptions,
        progress: Option<&ProgressFn>,
    ) -> Result<BatchSummary, OrchestratorError> {
        let run_id = crate::policy::generate_run_id();
        let semaphore = Arc::new(Semaphore::new(opts.max_workers.max(1)));
        let start = Instant::now();

        let mut handles = Vec::with_capacity(opts.inputs.len());
        for input in &opts.inputs {
            let orchestrator = self.clone();
            let run_opts = RunOptions {
                input_file: input.clone(),
                phases: opts.phases.clone(),
                resume: opts.resume,
                max_retries: opts.max_retries,
                voice: opts.voice.clone(),
                engine: opts.engine.clone(),
                enable_subtitles: opts.enable_subtitles,
                concat_only: false,
            };
            let permit = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                orchestrator.run(&run_opts, None, None).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, input) in handles.into_iter().zip(&opts.inputs) {
            let outcome = match handle.await {
                Ok(Ok(summary)) => summary,
                Ok(Err(err)) => failed_summary(input, &err.to_string()),
                Err(join_err) => failed_summary(input, &join_err.to_string()),
            };
            if let Some(cb) = progress {
                cb(&outcome.file_id, if outcome.success { 100 } else { 0 }, if outcome.success { "complete" } else { "failed" });
            }
            results.push(outcome);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        let status = if failed == 0 { Status::Success } else { Status::Failed };

        let record = BatchRunRecord {
            run_id: run_id.clone(),
            status,
            timestamps: serde_json::json!({
                "started_at": chrono::Utc::now().to_rfc3339(),
                "duration_ms": start.elapsed().as_millis() as u64,
            }),
            metrics: serde_json::json!({
                "total": results.len(),
                "succeeded": succeeded,
                "failed": failed,
            }),
            errors: results.iter().filter_map(|r| r.error.clone()).map(|e| serde_json::json!({ "error": e })).collect(),
            artifacts: serde_json::Value::Object(Default::default()),
            files: results
                .iter()
                .map(|r| {
                    let mut envelope = crate::schema::types::Envelope::new(if r.success { Status::Success } else { Status::Failed });
                    envelope.artifacts = serde_json::json!({ "audiobook_path": r.audiobook_path });
                    (r.file_id.clone(), envelope)
                })
                .collect(),
        };

        self.state().with_transaction("batch_run", |doc| {
            doc.batch_runs.push(record.clone());
            Ok(())
        })?;

        Ok(BatchSummary {
            run_id,
            succeeded,
            failed,
            results,
        })
    }
}

fn failed_summary(input: &PathBuf, error: &str) -> RunSummary {
    let file_id = input
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| input.to_string_lossy().to_string());
    RunSummary {
        success: false,
        file_id,
        audiobook_path: None,
        phase_results: Vec::new(),
        error: Some(error.to_string()),
    }
}
