//! Append-only JSONL policy event log, one file per UTC day
//! (`policy_logs/<YYYYMMDD>.log`, §3.5). Every public method swallows I/O
//! errors — observability must never break the pipeline (§7) — logging a
//! `tracing::warn!` instead of returning an error to the orchestrator.

use super::system::{SystemSampler, SystemSnapshot};
use super::{EventKind, LearningMode, POLICY_VERSION};
use crate::errors::PolicyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One JSONL line, matching the schema in §3.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub status: String,
    pub run_id: String,
    pub sequence: u64,
    pub learning_mode: LearningMode,
    pub policy_version: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub system_load: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
}

/// Caller-supplied context for one event; the logger enriches it with
/// timestamp, run_id, sequence, learning_mode, policy_version, and the
/// system snapshot before writing.
#[derive(Debug, Clone, Default)]
pub struct PhaseEventContext {
    pub phase: String,
    pub file_id: Option<String>,
    pub status: String,
    pub duration_ms: Option<u64>,
    pub metrics: Option<Value>,
    pub errors: Option<Vec<Value>>,
}

struct OpenLog {
    day: String,
    file: File,
}

pub struct PolicyLogger {
    log_dir: PathBuf,
    run_id: String,
    learning_mode: LearningMode,
    sequence: AtomicU64,
    sampler: Mutex<SystemSampler>,
    open: Mutex<Option<OpenLog>>,
}

impl PolicyLogger {
    pub fn new(log_dir: PathBuf, run_id: String, learning_mode: LearningMode) -> Self {
        Self {
            log_dir,
            run_id,
            learning_mode,
            sequence: AtomicU64::new(0),
            sampler: Mutex::new(SystemSampler::new()),
            open: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record_phase_start(&self, ctx: PhaseEventContext) {
        self.record(EventKind::PhaseStart, ctx);
    }

    pub fn record_phase_end(&self, ctx: PhaseEventContext) {
        self.record(EventKind::PhaseEnd, ctx);
    }

    pub fn record_retry(&self, ctx: PhaseEventContext) {
        self.record(EventKind::PhaseRetry, ctx);
    }

    pub fn record_failure(&self, ctx: PhaseEventContext) {
        self.record(EventKind::PhaseFailure, ctx);
    }

    fn record(&self, event: EventKind, ctx: PhaseEventContext) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.sample_system();
        let entry = PolicyLogEntry {
            timestamp: Utc::now(),
            event,
            phase: ctx.phase,
            file_id: ctx.file_id,
            status: ctx.status,
            run_id: self.run_id.clone(),
            sequence,
            learning_mode: self.learning_mode,
            policy_version: POLICY_VERSION.to_string(),
            cpu_percent: snapshot.cpu_percent,
            memory_percent: snapshot.memory_percent,
            system_load: snapshot.system_load,
            duration_ms: ctx.duration_ms,
            metrics: ctx.metrics,
            errors: ctx.errors,
        };

        if let Err(e) = self.append(&entry) {
            tracing::warn!(error = %e, "policy log append failed; continuing without observability");
        }
    }

    fn sample_system(&self) -> SystemSnapshot {
        match self.sampler.lock() {
            Ok(mut sampler) => sampler.sample(),
            Err(poisoned) => poisoned.into_inner().sample(),
        }
    }

    fn append(&self, entry: &PolicyLogEntry) -> Result<(), PolicyError> {
        std::fs::create_dir_all(&self.log_dir).map_err(|source| PolicyError::Write {
            path: self.log_dir.clone(),
            source,
        })?;

        let line = serde_json::to_string(entry).map_err(PolicyError::Serialize)?;

        let mut guard = self.open.lock().unwrap_or_else(|p| p.into_inner());
        let day = entry.timestamp.format("%Y%m%d").to_string();
        let needs_reopen = guard.as_ref().map(|o| o.day != day).unwrap_or(true);
        if needs_reopen {
            let path = self.log_dir.join(format!("{day}.log"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| PolicyError::Write { path, source })?;
            *guard = Some(OpenLog { day, file });
        }

        let open = guard.as_mut().expect("just opened above");
        writeln!(open.file, "{line}").map_err(|source| PolicyError::Write {
            path: self.log_dir.join(format!("{}.log", open.day)),
            source,
        })?;
        open.file.flush().map_err(|source| PolicyError::Write {
            path: self.log_dir.join(format!("{}.log", open.day)),
            source,
        })?;
        Ok(())
    }
}

/// Read every entry across every day-file under `log_dir`, skipping
/// malformed lines (§3.5's "consumers must tolerate malformed lines").
pub fn read_all_entries(log_dir: &std::path::Path) -> Vec<PolicyLogEntry> {
    let Ok(read_dir) = std::fs::read_dir(log_dir) else {
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = read_dir
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    paths.sort();

    let mut entries = Vec::new();
    for path in paths {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in contents.lines() {
            if let Ok(entry) = serde_json::from_str::<PolicyLogEntry>(line) {
                entries.push(entry);
            }
        }
    }
    entries
}

/// `(newest_mtime, file_count)` token used by the advisor to detect whether
/// the log directory changed since its last stats rebuild (§4.3 cache
/// invalidation).
pub fn directory_token(log_dir: &std::path::Path) -> (Option<std::time::SystemTime>, usize) {
    let Ok(read_dir) = std::fs::read_dir(log_dir) else {
        return (None, 0);
    };
    let mut newest = None;
    let mut count = 0;
    for entry in read_dir.flatten() {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        count += 1;
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                newest = Some(match newest {
                    Some(existing) if existing > modified => existing,
                    _ => modified,
                });
            }
        }
    }
    (newest, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(phase: &str, status: &str) -> PhaseEventContext {
        PhaseEventContext {
            phase: phase.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sequence_increases_monotonically_within_a_run() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-test".into(), LearningMode::Observe);
        logger.record_phase_start(ctx("phase1", "running"));
        logger.record_phase_end(ctx("phase1", "success"));
        logger.record_phase_start(ctx("phase2", "running"));

        let entries = read_all_entries(dir.path());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 2);
        assert_eq!(entries[2].sequence, 3);
    }

    #[test]
    fn entries_round_trip_all_fields() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-test".into(), LearningMode::Observe);
        logger.record_phase_end(PhaseEventContext {
            phase: "phase4".into(),
            file_id: Some("book".into()),
            status: "success".into(),
            duration_ms: Some(1234),
            metrics: Some(serde_json::json!({"rt_factor": 1.5})),
            errors: None,
        });

        let entries = read_all_entries(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_id.as_deref(), Some("book"));
        assert_eq!(entries[0].duration_ms, Some(1234));
        assert_eq!(entries[0].run_id, "run-test");
    }

    #[test]
    fn tolerates_malformed_trailing_line() {
        let dir = tempdir().unwrap();
        let logger = PolicyLogger::new(dir.path().to_path_buf(), "run-test".into(), LearningMode::Observe);
        logger.record_phase_start(ctx("phase1", "running"));

        let day = Utc::now().format("%Y%m%d").to_string();
        let path = dir.path().join(format!("{day}.log"));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not valid json").unwrap();

        let entries = read_all_entries(dir.path());
        assert_eq!(entries.len(), 1);
    }
}
