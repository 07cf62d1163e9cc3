//! Content-hash reuse policy for phases 1-3 (§4.4 step 2): skip
//! re-executing a phase whose prior run already succeeded against the same
//! input.

use crate::schema::types::{FileEntry, PipelineDocument};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

/// SHA-256 of `path`'s contents, hex-encoded.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// The hash a phase's prior run recorded, with phase 2's fallback onto
/// phase 1's hash when its own `source_hash` is absent (§4.4).
fn stored_hash(doc: &PipelineDocument, phase: &str, file_id: &str) -> Option<String> {
    let own = doc.file_entry(phase, file_id).and_then(|e| e.source_hash.clone());
    if own.is_some() {
        return own;
    }
    if phase == "phase2" {
        return doc.file_entry("phase1", file_id).and_then(|e| e.source_hash.clone());
    }
    None
}

/// Walk an envelope's untyped `artifacts` JSON looking for any string value
/// that resolves to a file that still exists on disk.
fn any_artifact_exists(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty() && Path::new(s).exists(),
        Value::Object(map) => map.values().any(any_artifact_exists),
        Value::Array(items) => items.iter().any(any_artifact_exists),
        _ => false,
    }
}

fn should_reuse(entry: &FileEntry, current_hash: &str, stored: Option<&str>) -> bool {
    if !entry.envelope.status.is_success() {
        return false;
    }
    if !any_artifact_exists(&entry.envelope.artifacts) {
        return false;
    }
    match stored {
        // Legacy data predating hash tracking: trust status over hash.
        None => true,
        Some(h) => h == current_hash,
    }
}

/// Whether `phase`'s prior run for `file_id` can be reused instead of
/// rerun, given the document's current state and the input file's current
/// content hash.
pub fn can_reuse(doc: &PipelineDocument, phase: &str, file_id: &str, current_hash: &str) -> bool {
    let Some(entry) = doc.file_entry(phase, file_id) else {
        return false;
    };
    let stored = stored_hash(doc, phase, file_id);
    should_reuse(entry, current_hash, stored.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{Envelope, FileEntry, PhaseBlock, Status};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn doc_with_entry(phase: &str, file_id: &str, status: Status, hash: Option<&str>, artifact: Option<&Path>) -> PipelineDocument {
        let mut doc = PipelineDocument::default();
        let mut envelope = Envelope::new(status);
        if let Some(path) = artifact {
            envelope.artifacts = serde_json::json!({ "output_path": path.to_string_lossy() });
        }
        let entry = FileEntry {
            envelope,
            chunks: None,
            source_hash: hash.map(str::to_string),
        };
        let mut files = BTreeMap::new();
        files.insert(file_id.to_string(), entry);
        let mut block = PhaseBlock::new(status);
        block.files = Some(files);
        doc.set_phase_block(phase, block);
        doc
    }

    #[test]
    fn reuses_when_status_success_and_hash_matches_and_artifact_exists() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("out.txt");
        std::fs::write(&artifact, b"x").unwrap();
        let doc = doc_with_entry("phase1", "book", Status::Success, Some("abc123"), Some(&artifact));
        assert!(can_reuse(&doc, "phase1", "book", "abc123"));
    }

    #[test]
    fn reruns_when_hash_differs() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("out.txt");
        std::fs::write(&artifact, b"x").unwrap();
        let doc = doc_with_entry("phase1", "book", Status::Success, Some("abc123"), Some(&artifact));
        assert!(!can_reuse(&doc, "phase1", "book", "different-hash"));
    }

    #[test]
    fn reruns_when_artifact_missing_from_disk() {
        let doc = doc_with_entry(
            "phase1",
            "book",
            Status::Success,
            Some("abc123"),
            Some(Path::new("/nonexistent/path/out.txt")),
        );
        assert!(!can_reuse(&doc, "phase1", "book", "abc123"));
    }

    #[test]
    fn legacy_entry_missing_hash_is_trusted_on_status_alone() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("out.txt");
        std::fs::write(&artifact, b"x").unwrap();
        let doc = doc_with_entry("phase1", "book", Status::Success, None, Some(&artifact));
        assert!(can_reuse(&doc, "phase1", "book", "anything"));
    }

    #[test]
    fn phase2_inherits_phase1_hash_when_its_own_is_absent() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("out.txt");
        std::fs::write(&artifact, b"x").unwrap();
        let mut doc = doc_with_entry("phase1", "book", Status::Success, Some("shared-hash"), Some(&artifact));
        let phase2 = doc_with_entry("phase2", "book", Status::Success, None, Some(&artifact));
        doc.phase2 = phase2.phase2;
        assert!(can_reuse(&doc, "phase2", "book", "shared-hash"));
        assert!(!can_reuse(&doc, "phase2", "book", "other-hash"));
    }

    #[test]
    fn no_prior_entry_is_not_reusable() {
        let doc = PipelineDocument::default();
        assert!(!can_reuse(&doc, "phase1", "book", "abc123"));
    }
}
