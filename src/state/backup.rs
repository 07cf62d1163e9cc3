//! Backup rotation for `pipeline.json`: a timestamped copy is written before
//! every successful write (§4.1 step 2), and only the `retention` most recent
//! are kept, ordered by mtime.

use crate::errors::StateError;
use chrono::Utc;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub modified: std::time::SystemTime,
}

pub struct StateBackupManager {
    backups_dir: PathBuf,
    retention: usize,
}

impl StateBackupManager {
    pub fn new(backups_dir: PathBuf, retention: usize) -> Self {
        Self {
            backups_dir,
            retention,
        }
    }

    /// Copy `state_path` into the backups directory with a microsecond-
    /// resolution timestamp suffix, then rotate out anything past retention.
    pub fn create_backup(&self, state_path: &Path) -> Result<PathBuf, StateError> {
        std::fs::create_dir_all(&self.backups_dir).map_err(|source| StateError::Write {
            path: self.backups_dir.clone(),
            source,
        })?;

        let stem = state_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pipeline");
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let backup_path = self.backups_dir.join(format!("{stem}_{timestamp}.json.bak"));

        std::fs::copy(state_path, &backup_path).map_err(|source| StateError::Write {
            path: backup_path.clone(),
            source,
        })?;

        self.rotate()?;
        Ok(backup_path)
    }

    /// Retain only the `retention` most recently modified backups.
    fn rotate(&self) -> Result<(), StateError> {
        let mut entries = self.list(usize::MAX)?;
        if entries.len() <= self.retention {
            return Ok(());
        }
        entries.sort_by_key(|e| std::cmp::Reverse(e.modified));
        for stale in entries.into_iter().skip(self.retention) {
            let _ = std::fs::remove_file(&stale.path);
        }
        Ok(())
    }

    pub fn list(&self, limit: usize) -> Result<Vec<BackupEntry>, StateError> {
        if !self.backups_dir.exists() {
            return Ok(Vec::new());
        }
        let read_dir = std::fs::read_dir(&self.backups_dir).map_err(|source| StateError::Read {
            path: self.backups_dir.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bak") {
                continue;
            }
            let Ok(meta) = item.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            entries.push(BackupEntry { path, modified });
        }
        entries.sort_by_key(|e| std::cmp::Reverse(e.modified));
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn read_backup(&self, path: &Path) -> Result<Vec<u8>, StateError> {
        if !path.exists() {
            return Err(StateError::BackupNotFound {
                path: path.to_path_buf(),
            });
        }
        std::fs::read(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn create_backup_copies_current_state() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("pipeline.json");
        fs::write(&state_path, b"{}").unwrap();
        let mgr = StateBackupManager::new(dir.path().join("backups"), 50);
        let backup_path = mgr.create_backup(&state_path).unwrap();
        assert_eq!(fs::read(&backup_path).unwrap(), b"{}");
        assert!(backup_path.to_string_lossy().ends_with(".json.bak"));
    }

    #[test]
    fn rotation_retains_only_most_recent() {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("pipeline.json");
        let mgr = StateBackupManager::new(dir.path().join("backups"), 3);
        for i in 0..5 {
            fs::write(&state_path, format!("{{\"n\":{i}}}")).unwrap();
            mgr.create_backup(&state_path).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let remaining = mgr.list(usize::MAX).unwrap();
        assert_eq!(remaining.len(), 3);
    }

    #[test]
    fn read_missing_backup_errors() {
        let dir = tempdir().unwrap();
        let mgr = StateBackupManager::new(dir.path().join("backups"), 50);
        let err = mgr.read_backup(&dir.path().join("nope.json.bak")).unwrap_err();
        assert!(matches!(err, StateError::BackupNotFound { .. }));
    }
}
