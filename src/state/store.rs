//! StateStore: single-writer, concurrent-reader atomic persistence of
//! `pipeline.json` (§4.1).

use super::backup::{BackupEntry, StateBackupManager};
use super::lock::FileLock;
use super::transaction_log::{StateTransactionLog, TransactionLogEntry};
use crate::config::Config;
use crate::errors::StateError;
use crate::schema::types::PipelineDocument;
use crate::schema::{canonicalize, validate};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    backup_before_write: bool,
    backups: StateBackupManager,
    transactions: StateTransactionLog,
    /// Serializes transactions within this process, on top of the
    /// cross-process file lock, so threaded callers get predictable
    /// behavior without all contending on the OS lock directly.
    write_guard: Mutex<()>,
}

impl StateStore {
    pub fn new(config: &Config) -> Self {
        Self::with_options(
            config.state_file.clone(),
            config.backups_dir.clone(),
            config.transactions_log.clone(),
            Duration::from_secs(config.lock_timeout_secs),
            config.backup_retention,
            true,
        )
    }

    pub fn with_options(
        state_path: PathBuf,
        backups_dir: PathBuf,
        transactions_log: PathBuf,
        lock_timeout: Duration,
        backup_retention: usize,
        backup_before_write: bool,
    ) -> Self {
        let lock_path = {
            let mut s = state_path.clone().into_os_string();
            s.push(".lock");
            PathBuf::from(s)
        };
        Self {
            state_path,
            lock_path,
            lock_timeout,
            backup_before_write,
            backups: StateBackupManager::new(backups_dir, backup_retention),
            transactions: StateTransactionLog::new(transactions_log),
            write_guard: Mutex::new(()),
        }
    }

    /// Load the document; an absent file reads as an empty canonical
    /// document rather than an error.
    pub fn read(&self, strict: bool) -> Result<PipelineDocument, StateError> {
        let doc = self.read_raw()?;
        if strict {
            crate::schema::strict_validate(&doc)?;
        }
        Ok(doc)
    }

    fn read_raw(&self) -> Result<PipelineDocument, StateError> {
        if !self.state_path.exists() {
            return Ok(PipelineDocument::default());
        }
        let contents = std::fs::read_to_string(&self.state_path).map_err(|source| StateError::Read {
            path: self.state_path.clone(),
            source,
        })?;
        let raw: Value = serde_json::from_str(&contents).map_err(|source| StateError::Parse {
            path: self.state_path.clone(),
            source,
        })?;
        let doc = canonicalize(raw, None, false)?;
        Ok(doc)
    }

    /// Persist `doc` atomically, following the write protocol in §4.1:
    /// lock, optional backup, temp-file write + fsync, rename-replace,
    /// rotate backups, append to the transaction log, unlock.
    pub fn write(&self, doc: &PipelineDocument, validate_first: bool, operation_name: &str) -> Result<(), StateError> {
        if validate_first {
            validate(doc)?;
        }

        let _guard = self.write_guard.lock().unwrap_or_else(|p| p.into_inner());
        let _lock = FileLock::try_acquire(&self.lock_path, self.lock_timeout)?;

        let before_keys = self.read_raw().ok().map(|d| top_level_keys(&d));

        if self.backup_before_write && self.state_path.exists() {
            self.backups.create_backup(&self.state_path)?;
        }

        let result = self.write_atomic(doc);

        let after_keys = top_level_keys(doc);
        let changed_keys: Vec<String> = match before_keys {
            Some(before) => after_keys
                .into_iter()
                .filter(|k| !before.contains(k))
                .chain(before.into_iter().filter(|k| !after_keys_contains(doc, k)))
                .collect(),
            None => after_keys,
        };

        let _ = self
            .transactions
            .append(operation_name, result.is_ok(), &changed_keys);

        result
    }

    fn write_atomic(&self, doc: &PipelineDocument) -> Result<(), StateError> {
        let serialized = serde_json::to_vec_pretty(doc).map_err(|source| StateError::Parse {
            path: self.state_path.clone(),
            source,
        })?;

        let tmp_path = self.state_path.with_extension(format!(
            "json.{}_{}.tmp",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
        ));

        let write_result = (|| -> Result<(), StateError> {
            let mut file = std::fs::File::create(&tmp_path).map_err(|source| StateError::Write {
                path: tmp_path.clone(),
                source,
            })?;
            file.write_all(&serialized).map_err(|source| StateError::Write {
                path: tmp_path.clone(),
                source,
            })?;
            file.sync_all().map_err(|source| StateError::Write {
                path: tmp_path.clone(),
                source,
            })?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        std::fs::rename(&tmp_path, &self.state_path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp_path);
            StateError::Write {
                path: self.state_path.clone(),
                source,
            }
        })?;

        Ok(())
    }

    /// Run `f` against a freshly read document; if it returns `Ok`, commit
    /// the mutation atomically under `operation_name`. If it returns `Err`,
    /// nothing is written — the on-disk state is untouched (rollback is
    /// simply "don't write"). This is the Rust analogue of the
    /// context-manager transaction scope: Rust has no scope-exit hook to
    /// intercept, so the closure's result stands in for commit/rollback.
    pub fn with_transaction<F>(&self, operation_name: &str, f: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut PipelineDocument) -> Result<(), StateError>,
    {
        let mut doc = self.read(false)?;
        f(&mut doc)?;
        self.write(&doc, true, operation_name)
    }

    pub fn list_backups(&self, limit: usize) -> Result<Vec<BackupEntry>, StateError> {
        self.backups.list(limit)
    }

    /// Restore the document from `backup_path` and treat it as the new
    /// current state (caller decides whether to also persist it).
    pub fn restore_backup(&self, backup_path: &Path) -> Result<PipelineDocument, StateError> {
        let bytes = self.backups.read_backup(backup_path)?;
        let text = String::from_utf8_lossy(&bytes);
        let raw: Value = serde_json::from_str(&text).map_err(|source| StateError::Parse {
            path: backup_path.to_path_buf(),
            source,
        })?;
        canonicalize(raw, None, false).map_err(StateError::from)
    }

    pub fn get_transaction_history(&self, limit: usize) -> Result<Vec<TransactionLogEntry>, StateError> {
        self.transactions.recent(limit)
    }

    /// Derived `{phase_key -> status}` map, same shape as the `phases` field.
    pub fn get_status_summary(&self) -> Result<std::collections::BTreeMap<String, String>, StateError> {
        let doc = self.read(false)?;
        Ok(doc
            .phases
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().to_string()))
            .collect())
    }

    pub fn get_phase_data(&self, phase_key: &str) -> Result<Option<crate::schema::types::PhaseBlock>, StateError> {
        let doc = self.read(false)?;
        Ok(doc.phase_block(phase_key).cloned())
    }

    pub fn get_chunks(
        &self,
        phase_key: &str,
        file_id: &str,
    ) -> Result<Option<Vec<crate::schema::types::ChunkEntry>>, StateError> {
        let doc = self.read(false)?;
        Ok(doc
            .file_entry(phase_key, file_id)
            .and_then(|entry| entry.chunks.clone()))
    }

    pub fn get_chunk_metadata(
        &self,
        phase_key: &str,
        file_id: &str,
        chunk_id: &str,
    ) -> Result<Option<crate::schema::types::ChunkEntry>, StateError> {
        Ok(self
            .get_chunks(phase_key, file_id)?
            .and_then(|chunks| chunks.into_iter().find(|c| c.chunk_id == chunk_id)))
    }
}

fn top_level_keys(doc: &PipelineDocument) -> Vec<String> {
    use crate::schema::types::PHASE_KEYS;
    PHASE_KEYS
        .iter()
        .filter(|k| doc.phase_block(k).is_some())
        .map(|k| k.to_string())
        .collect()
}

fn after_keys_contains(doc: &PipelineDocument, key: &str) -> bool {
    doc.phase_block(key).is_some()
}
