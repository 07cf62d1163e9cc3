//! Append-only JSONL audit trail of every StateStore write attempt
//! (`.pipeline/transactions.log`). Readers tolerate malformed trailing lines
//! the same way policy-log readers do (§3.5), since both are append-only
//! logs that may be read while another process is mid-append.

use crate::errors::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub success: bool,
    pub pid: u32,
    pub changed_keys: Vec<String>,
}

pub struct StateTransactionLog {
    path: PathBuf,
}

impl StateTransactionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, operation: &str, success: bool, changed_keys: &[String]) -> Result<(), StateError> {
        let entry = TransactionLogEntry {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            success,
            pid: std::process::id(),
            changed_keys: changed_keys.to_vec(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let line = serde_json::to_string(&entry).map_err(|source| StateError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        file.flush().map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Return up to `limit` most recent entries, newest first. Lines that
    /// fail to parse (e.g. truncated mid-write) are silently skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<TransactionLogEntry>, StateError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|source| StateError::Read {
            path: self.path.clone(),
            source,
        })?;

        let mut entries: Vec<TransactionLogEntry> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}
