//! PhaseRunner: uniform invocation of heterogeneous phase executables with
//! reuse, retry, and timeout (§4.4).

use super::categorize::categorize;
use super::recipe::{enhanced_chunk_dir, recipe_for, Launcher};
use super::reuse::{can_reuse, hash_file};
use crate::config::Config;
use crate::errors::{FailureCategory, PhaseError};
use crate::state::StateStore;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Environment variables stripped before spawning a phase executable, so
/// the orchestrator's own virtualenv/interpreter does not leak into a
/// phase's isolated toolchain (original orchestrator's `get_clean_env_for_poetry`).
const STRIPPED_ENV_VARS: &[&str] = &[
    "VIRTUAL_ENV",
    "PYTHONPATH",
    "CONDA_PREFIX",
    "POETRY_ACTIVE",
    "PYTHONHOME",
    "_OLD_VIRTUAL_PATH",
    "_OLD_VIRTUAL_PYTHONHOME",
];

/// Minimum enhanced-chunk WAV count that makes phase 5's concat-only fast
/// path worth attempting.
const CONCAT_ONLY_MIN_CHUNKS: usize = 100;

fn timeout_for(phase: &str) -> Duration {
    match phase {
        "phase1" | "phase2" | "phase3" => Duration::from_secs(300 + 18_000),
        "phase4" => Duration::from_secs(1_200),
        "phase5" => Duration::from_secs(1_800),
        "phase5_5" => Duration::from_secs(3_600),
        _ => Duration::from_secs(1_800),
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRequest {
    pub phase: String,
    pub input_file: PathBuf,
    pub file_id: String,
    /// Phase 4 only: `xtts` or `kokoro`. Defaults to `xtts` when unset.
    pub engine: Option<String>,
    pub disable_fallback: bool,
    /// Phase 5 only: attempt the concat-only fast path.
    pub concat_only: bool,
    /// Voice id override, passed through as `--voice=<id>` when set.
    pub voice: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub duration: Duration,
    pub stderr_tail: String,
    pub category: Option<FailureCategory>,
    /// True when the phase was skipped because a prior run's artifact was
    /// reusable (§4.4 step 2); `exit_code` is `0` and `duration` is zero.
    pub reused: bool,
    /// The engine actually used for phase 4, after any fallback.
    pub engine_used: Option<String>,
}

impl PhaseOutcome {
    fn reused() -> Self {
        Self {
            success: true,
            exit_code: 0,
            duration: Duration::ZERO,
            stderr_tail: String::new(),
            category: None,
            reused: true,
            engine_used: None,
        }
    }
}

pub struct PhaseRunner {
    config: Config,
}

impl PhaseRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn phase_root(&self) -> PathBuf {
        self.config
            .monorepo_root()
            .unwrap_or_else(|| self.config.project_dir.clone())
    }

    /// Run `req` once, honoring the reuse policy, timeout, and phase-4/5
    /// special-casing. Returns `Ok` with a failed outcome for ordinary
    /// subprocess failures; `Err` only for state-store errors encountered
    /// while consulting the reuse policy, or a failure to spawn at all.
    pub async fn run(&self, state: &StateStore, req: &PhaseRequest) -> Result<PhaseOutcome, PhaseError> {
        if crate::schema::types::HASH_REUSABLE_PHASES.contains(&req.phase.as_str()) {
            let current_hash = hash_file(&req.input_file).map_err(|source| PhaseError::Spawn {
                phase: req.phase.clone(),
                command: req.input_file.clone(),
                source,
            })?;
            let doc = state.read(false)?;
            if can_reuse(&doc, &req.phase, &req.file_id, &current_hash) {
                return Ok(PhaseOutcome::reused());
            }
        }

        match req.phase.as_str() {
            "phase4" => self.run_phase4(req).await,
            "phase5" => self.run_phase5(req).await,
            _ => self.invoke(req, req.engine.as_deref()).await,
        }
    }

    /// `RunWithRetry`: up to `max_retries + 1` attempts, constant 2s
    /// backoff, short-circuiting on non-retryable failure categories.
    pub async fn run_with_retry(
        &self,
        state: &StateStore,
        req: &PhaseRequest,
        max_retries: u32,
    ) -> Result<PhaseOutcome, PhaseError> {
        let mut attempt = 0;
        loop {
            let outcome = self.run(state, req).await?;
            if outcome.success {
                return Ok(outcome);
            }
            let retryable = outcome.category.map(FailureCategory::is_retryable).unwrap_or(true);
            if !retryable || attempt >= max_retries {
                return Ok(outcome);
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn run_phase4(&self, req: &PhaseRequest) -> Result<PhaseOutcome, PhaseError> {
        let primary = req.engine.clone().unwrap_or_else(|| "xtts".to_string());
        let outcome = self.invoke(req, Some(&primary)).await?;
        if outcome.success || req.disable_fallback {
            return Ok(outcome);
        }
        if !outcome.category.map(FailureCategory::is_retryable).unwrap_or(true) {
            return Ok(outcome);
        }
        let secondary = if primary == "xtts" { "kokoro" } else { "xtts" };
        self.invoke(req, Some(secondary)).await
    }

    async fn run_phase5(&self, req: &PhaseRequest) -> Result<PhaseOutcome, PhaseError> {
        if req.concat_only || self.concat_only_eligible(&req.file_id) {
            let mut concat_req = req.clone();
            concat_req.concat_only = true;
            let outcome = self.invoke(&concat_req, None).await?;
            if outcome.success {
                return Ok(outcome);
            }
        }
        let mut full_req = req.clone();
        full_req.concat_only = false;
        self.invoke(&full_req, None).await
    }

    fn concat_only_eligible(&self, file_id: &str) -> bool {
        let dir = enhanced_chunk_dir(&self.phase_root(), file_id);
        let Some(pattern) = dir.join("*.wav").to_str().map(str::to_string) else {
            return false;
        };
        glob::glob(&pattern)
            .map(|paths| paths.filter_map(Result::ok).count() >= CONCAT_ONLY_MIN_CHUNKS)
            .unwrap_or(false)
    }

    async fn invoke(&self, req: &PhaseRequest, engine: Option<&str>) -> Result<PhaseOutcome, PhaseError> {
        let recipe = recipe_for(&req.phase, &self.phase_root(), engine);
        let command_path = recipe.working_dir.join(&recipe.target);

        let mut cmd = match recipe.launcher {
            Launcher::Python => {
                let mut cmd = Command::new(&self.config.python_interpreter);
                cmd.arg(&recipe.target);
                cmd
            }
            Launcher::PoetryScript => {
                let mut cmd = Command::new("poetry");
                cmd.args(["run", "python", recipe.target.as_str()]);
                cmd
            }
            Launcher::PoetryModule => {
                let mut cmd = Command::new("poetry");
                cmd.args(["run", "python", "-m", recipe.target.as_str()]);
                cmd
            }
        };
        cmd.current_dir(&recipe.working_dir);
        cmd.env_clear();
        for (key, value) in std::env::vars() {
            if STRIPPED_ENV_VARS.contains(&key.as_str()) {
                continue;
            }
            cmd.env(key, value);
        }
        for arg in &recipe.fixed_args {
            cmd.arg(arg);
        }
        cmd.arg(format!("--file={}", req.input_file.display()));
        cmd.arg(format!("--file_id={}", req.file_id));
        cmd.arg(format!("--json_path={}", self.config.state_file.display()));
        if req.phase == "phase4" {
            if req.disable_fallback {
                cmd.arg("--disable_fallback");
            }
        }
        if req.phase == "phase5" && req.concat_only {
            cmd.arg("--concat_only");
        }
        if let Some(voice) = &req.voice {
            cmd.arg(format!("--voice={voice}"));
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        set_new_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| PhaseError::Spawn {
            phase: req.phase.clone(),
            command: command_path.clone(),
            source,
        })?;
        let pid = child.id();

        let timeout = timeout_for(&req.phase);
        let start = Instant::now();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let duration = start.elapsed();
                let stderr_tail = tail(&String::from_utf8_lossy(&output.stderr));
                let exit_code = output.status.code().unwrap_or(-1);
                if output.status.success() {
                    Ok(PhaseOutcome {
                        success: true,
                        exit_code,
                        duration,
                        stderr_tail,
                        category: None,
                        reused: false,
                        engine_used: engine.map(str::to_string),
                    })
                } else {
                    Ok(PhaseOutcome {
                        success: false,
                        exit_code,
                        duration,
                        category: Some(categorize(&stderr_tail)),
                        stderr_tail,
                        reused: false,
                        engine_used: engine.map(str::to_string),
                    })
                }
            }
            Ok(Err(source)) => Err(PhaseError::Spawn {
                phase: req.phase.clone(),
                command: command_path,
                source,
            }),
            Err(_elapsed) => {
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                Ok(PhaseOutcome {
                    success: false,
                    exit_code: -1,
                    duration: timeout,
                    stderr_tail: String::new(),
                    category: Some(FailureCategory::Timeout),
                    reused: false,
                    engine_used: engine.map(str::to_string),
                })
            }
        }
    }
}

fn tail(s: &str) -> String {
    const MAX: usize = super::categorize::STDERR_TAIL_BYTES;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut start = s.len() - MAX;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(unix)]
fn set_new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_new_process_group(_cmd: &mut Command) {}

/// Terminate the whole process group a timed-out phase spawned, not just
/// its immediate child, so grandchildren get reclaimed too (§4.4 step 4).
#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let _ = killpg(pgid, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{PhaseBlock, Status};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    fn runner_in(dir: &Path) -> (PhaseRunner, StateStore) {
        let config = Config::new(dir.to_path_buf()).unwrap();
        config.ensure_directories().unwrap();
        let store = StateStore::new(&config);
        (PhaseRunner::new(config), store)
    }

    /// Same as `runner_in`, but points the `Python` launcher at a binary
    /// name that cannot resolve, so a spawn attempt fails deterministically
    /// regardless of whether this machine happens to have `python3` on `PATH`.
    fn runner_with_unresolvable_interpreter(dir: &Path) -> (PhaseRunner, StateStore) {
        let mut config = Config::new(dir.to_path_buf()).unwrap();
        config.ensure_directories().unwrap();
        config.python_interpreter = "definitely-not-a-real-interpreter-binary".to_string();
        let store = StateStore::new(&config);
        (PhaseRunner::new(config), store)
    }

    #[tokio::test]
    async fn reuse_short_circuits_before_spawning_anything() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("book.txt");
        std::fs::write(&input, b"hello world").unwrap();
        let artifact = dir.path().join("validated.txt");
        std::fs::write(&artifact, b"ok").unwrap();

        let (runner, store) = runner_in(dir.path());
        let hash = hash_file(&input).unwrap();

        store
            .with_transaction("seed", |doc| {
                let mut block = PhaseBlock::new(Status::Success);
                let mut files = std::collections::BTreeMap::new();
                let mut entry = crate::schema::types::FileEntry::new(Status::Success);
                entry.envelope.artifacts = serde_json::json!({ "output_path": artifact.to_string_lossy() });
                entry.source_hash = Some(hash);
                files.insert("book".to_string(), entry);
                block.files = Some(files);
                doc.set_phase_block("phase1", block);
                Ok(())
            })
            .unwrap();

        let req = PhaseRequest {
            phase: "phase1".to_string(),
            input_file: input,
            file_id: "book".to_string(),
            engine: None,
            disable_fallback: false,
            concat_only: false,
            voice: None,
        };
        let outcome = runner.run(&store, &req).await.unwrap();
        assert!(outcome.reused);
        assert!(outcome.success);
        assert_eq!(outcome.duration, StdDuration::ZERO);
    }

    #[tokio::test]
    async fn spawn_failure_for_nonexistent_executable_is_an_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("book.txt");
        std::fs::write(&input, b"hello world").unwrap();
        let (runner, store) = runner_with_unresolvable_interpreter(dir.path());

        let req = PhaseRequest {
            phase: "phase9_does_not_exist".to_string(),
            input_file: input,
            file_id: "book".to_string(),
            engine: None,
            disable_fallback: false,
            concat_only: false,
            voice: None,
        };
        let result = runner.run(&store, &req).await;
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), PhaseError::Spawn { .. }));
    }

    #[test]
    fn timeout_budgets_match_spec_constants() {
        assert_eq!(timeout_for("phase1"), Duration::from_secs(18_300));
        assert_eq!(timeout_for("phase4"), Duration::from_secs(1_200));
        assert_eq!(timeout_for("phase5"), Duration::from_secs(1_800));
        assert_eq!(timeout_for("phase5_5"), Duration::from_secs(3_600));
    }
}
