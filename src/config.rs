use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Runtime configuration for the orchestrator.
///
/// Resolved in increasing priority: built-in defaults, an optional
/// `.pipeline/config.toml`, environment variables, then explicit
/// constructor arguments (which stand in for CLI flags at this layer).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_file: PathBuf,
    pub pipeline_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub policy_log_dir: PathBuf,
    pub overrides_file: PathBuf,
    pub transactions_log: PathBuf,
    pub audiobooks_dir: PathBuf,
    pub lock_timeout_secs: u64,
    pub max_retries: u32,
    pub backup_retention: usize,
    /// Interpreter binary phase recipes with a `Python` launcher spawn
    /// directly, standing in for the original's `sys.executable`.
    pub python_interpreter: String,
}

/// Project-level overrides read from `.pipeline/config.toml`, if present.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    lock_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    backup_retention: Option<usize>,
    python_interpreter: Option<String>,
}

const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKUP_RETENTION: usize = 50;
const DEFAULT_PYTHON_INTERPRETER: &str = "python3";

impl Config {
    /// Build a `Config` rooted at `project_dir`, honoring `.pipeline/config.toml`
    /// and the `POLICY_LOG_ROOT` / `PIPELINE_MAX_RETRIES` / `PIPELINE_LOCK_TIMEOUT_SECS`
    /// environment variables along the way.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("failed to resolve project directory")?;

        let pipeline_dir = project_dir.join(".pipeline");
        let file_config = Self::load_file_config(&pipeline_dir);

        let lock_timeout_secs = std::env::var("PIPELINE_LOCK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file_config.lock_timeout_secs)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS);

        let max_retries = std::env::var("PIPELINE_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file_config.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let backup_retention = file_config
            .backup_retention
            .unwrap_or(DEFAULT_BACKUP_RETENTION);

        let python_interpreter = std::env::var("PIPELINE_PYTHON_INTERPRETER")
            .ok()
            .or(file_config.python_interpreter.clone())
            .unwrap_or_else(|| DEFAULT_PYTHON_INTERPRETER.to_string());

        let policy_log_dir = std::env::var("POLICY_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| pipeline_dir.join("policy_logs"));

        Ok(Self {
            state_file: project_dir.join("pipeline.json"),
            backups_dir: pipeline_dir.join("backups"),
            overrides_file: pipeline_dir.join("tuning_overrides.json"),
            transactions_log: pipeline_dir.join("transactions.log"),
            audiobooks_dir: project_dir.join("audiobooks"),
            policy_log_dir,
            pipeline_dir,
            project_dir,
            lock_timeout_secs,
            max_retries,
            backup_retention,
            python_interpreter,
        })
    }

    /// `MONOREPO_ROOT`, when set, hints at the project root phase executables use
    /// to resolve their own working directories; the orchestrator only reads it
    /// through so phase invocations can inherit it.
    pub fn monorepo_root(&self) -> Option<PathBuf> {
        std::env::var("MONOREPO_ROOT").ok().map(PathBuf::from)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.pipeline_dir).context("failed to create .pipeline dir")?;
        std::fs::create_dir_all(&self.backups_dir).context("failed to create backups dir")?;
        std::fs::create_dir_all(&self.policy_log_dir)
            .context("failed to create policy_logs dir")?;
        Ok(())
    }

    fn load_file_config(pipeline_dir: &std::path::Path) -> FileConfig {
        let path = pipeline_dir.join("config.toml");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return FileConfig::default();
        };
        toml::from_str(&raw).unwrap_or_default()
    }
}
