//! Typed shapes for the canonical pipeline-state document (schema v4.0.0).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SCHEMA_VERSION: &str = "4.0.0";

/// Canonical phase keys, in pipeline order. Lexicographic string order on
/// these exact spellings happens to match phase order, which is why
/// `PipelineDocument::phase_block` can iterate a `BTreeMap` safely if ever
/// needed, but the document itself keeps them as named fields since the set
/// is fixed and finite.
pub const PHASE_KEYS: &[&str] = &[
    "phase1", "phase2", "phase3", "phase4", "phase5", "phase5_5", "phase6", "phase7",
];

/// Phases for which the orchestrator's content-hash reuse decision applies.
pub const HASH_REUSABLE_PHASES: &[&str] = &["phase1", "phase2", "phase3"];

/// Phases that carry a `files` map in their block.
pub const FILE_BEARING_PHASES: &[&str] = &[
    "phase1", "phase2", "phase3", "phase4", "phase5", "phase5_5",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Pending,
    Running,
    Success,
    Partial,
    PartialSuccess,
    Failed,
    Error,
    Skipped,
    Unknown,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Partial => "partial",
            Status::PartialSuccess => "partial_success",
            Status::Failed => "failed",
            Status::Error => "error",
            Status::Skipped => "skipped",
            Status::Unknown => "unknown",
        }
    }

    /// Coerce an arbitrary raw status string into a canonical value.
    /// Known aliases map to their canonical counterpart; anything else
    /// unrecognized falls back to `pending` (the spec's "unknown values are
    /// normalized to pending" rule — distinct from the explicit `unknown`
    /// status, which is itself a canonical value).
    pub fn coerce(raw: &str) -> Status {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "pending" => Status::Pending,
            "running" => Status::Running,
            "success" => Status::Success,
            "partial" => Status::Partial,
            "partial_success" => Status::PartialSuccess,
            "failed" => Status::Failed,
            "error" => Status::Error,
            "skipped" => Status::Skipped,
            "unknown" => Status::Unknown,
            "complete" | "completed" | "ok" => Status::Success,
            "in_progress" | "inprogress" => Status::Running,
            _ => Status::Pending,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Success
                | Status::PartialSuccess
                | Status::Failed
                | Status::Error
                | Status::Skipped
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Status::coerce(&raw))
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Pending
    }
}

/// A single chunk entry, produced by phase 3 and consumed by phase 4/5.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkEntry {
    pub chunk_id: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub errors: Vec<Value>,
    /// Phase-specific fields (audio path, engine, validation tier, rt_factor, ...),
    /// intentionally left untyped since they vary per phase and are produced
    /// by the phase executables, which are external collaborators.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The five-field envelope every phase block and file-entry carries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Envelope {
    #[serde(default)]
    pub status: Status,
    #[serde(default = "empty_object")]
    pub timestamps: Value,
    #[serde(default = "empty_object")]
    pub artifacts: Value,
    #[serde(default = "empty_object")]
    pub metrics: Value,
    #[serde(default)]
    pub errors: Vec<Value>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Envelope {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            timestamps: empty_object(),
            artifacts: empty_object(),
            metrics: empty_object(),
            errors: Vec::new(),
        }
    }
}

/// A file-entry: one envelope plus chunks (phases 4/5) and a content hash
/// (phases 1-3, used by the reuse decision in the phase runner).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileEntry {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
}

impl FileEntry {
    pub fn new(status: Status) -> Self {
        Self {
            envelope: Envelope::new(status),
            chunks: None,
            source_hash: None,
        }
    }
}

/// One phase's block: its own envelope plus, for file-bearing phases, a map
/// of per-`file_id` entries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhaseBlock {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<BTreeMap<String, FileEntry>>,
}

impl PhaseBlock {
    pub fn new(status: Status) -> Self {
        Self {
            envelope: Envelope::new(status),
            files: None,
        }
    }

    pub fn file_entry(&self, file_id: &str) -> Option<&FileEntry> {
        self.files.as_ref().and_then(|f| f.get(file_id))
    }
}

/// An appended record in `batch_runs`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BatchRunRecord {
    pub run_id: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default = "empty_object")]
    pub timestamps: Value,
    #[serde(default = "empty_object")]
    pub metrics: Value,
    #[serde(default)]
    pub errors: Vec<Value>,
    #[serde(default = "empty_object")]
    pub artifacts: Value,
    #[serde(default)]
    pub files: BTreeMap<String, Envelope>,
}

/// The canonical pipeline.json root document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDocument {
    #[serde(default = "default_version")]
    pub pipeline_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase1: Option<PhaseBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase2: Option<PhaseBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase3: Option<PhaseBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase4: Option<PhaseBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase5: Option<PhaseBlock>,
    #[serde(rename = "phase5_5", default, skip_serializing_if = "Option::is_none")]
    pub phase5_5: Option<PhaseBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase6: Option<PhaseBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase7: Option<PhaseBlock>,

    #[serde(default)]
    pub phases: BTreeMap<String, Status>,
    #[serde(default)]
    pub batch_runs: Vec<BatchRunRecord>,
    #[serde(default)]
    pub voice_overrides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_voice: Option<String>,
}

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl Default for PipelineDocument {
    fn default() -> Self {
        Self {
            pipeline_version: default_version(),
            created_at: None,
            last_updated: None,
            file_id: None,
            phase1: None,
            phase2: None,
            phase3: None,
            phase4: None,
            phase5: None,
            phase5_5: None,
            phase6: None,
            phase7: None,
            phases: BTreeMap::new(),
            batch_runs: Vec::new(),
            voice_overrides: BTreeMap::new(),
            tts_voice: None,
        }
    }
}

impl PipelineDocument {
    pub fn phase_block(&self, phase_key: &str) -> Option<&PhaseBlock> {
        match phase_key {
            "phase1" => self.phase1.as_ref(),
            "phase2" => self.phase2.as_ref(),
            "phase3" => self.phase3.as_ref(),
            "phase4" => self.phase4.as_ref(),
            "phase5" => self.phase5.as_ref(),
            "phase5_5" => self.phase5_5.as_ref(),
            "phase6" => self.phase6.as_ref(),
            "phase7" => self.phase7.as_ref(),
            _ => None,
        }
    }

    pub fn phase_block_mut(&mut self, phase_key: &str) -> Option<&mut PhaseBlock> {
        match phase_key {
            "phase1" => self.phase1.as_mut(),
            "phase2" => self.phase2.as_mut(),
            "phase3" => self.phase3.as_mut(),
            "phase4" => self.phase4.as_mut(),
            "phase5" => self.phase5.as_mut(),
            "phase5_5" => self.phase5_5.as_mut(),
            "phase6" => self.phase6.as_mut(),
            "phase7" => self.phase7.as_mut(),
            _ => None,
        }
    }

    pub fn set_phase_block(&mut self, phase_key: &str, block: PhaseBlock) {
        match phase_key {
            "phase1" => self.phase1 = Some(block),
            "phase2" => self.phase2 = Some(block),
            "phase3" => self.phase3 = Some(block),
            "phase4" => self.phase4 = Some(block),
            "phase5" => self.phase5 = Some(block),
            "phase5_5" => self.phase5_5 = Some(block),
            "phase6" => self.phase6 = Some(block),
            "phase7" => self.phase7 = Some(block),
            _ => {}
        }
    }

    /// Recompute the derived `phases` status map from whichever phase blocks
    /// are present. Called at the end of canonicalization.
    pub fn recompute_phases_map(&mut self) {
        self.phases.clear();
        for key in PHASE_KEYS {
            if let Some(block) = self.phase_block(key) {
                self.phases.insert(key.to_string(), block.envelope.status);
            }
        }
    }

    pub fn file_entry(&self, phase_key: &str, file_id: &str) -> Option<&FileEntry> {
        self.phase_block(phase_key)?.file_entry(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_coerce_aliases() {
        assert_eq!(Status::coerce("complete"), Status::Success);
        assert_eq!(Status::coerce("COMPLETED"), Status::Success);
        assert_eq!(Status::coerce("ok"), Status::Success);
        assert_eq!(Status::coerce("in_progress"), Status::Running);
        assert_eq!(Status::coerce("unknown"), Status::Unknown);
        assert_eq!(Status::coerce("gibberish"), Status::Pending);
    }

    #[test]
    fn status_round_trips_through_json() {
        let block = PhaseBlock::new(Status::Success);
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["status"], "success");
        let back: PhaseBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back.envelope.status, Status::Success);
    }

    #[test]
    fn phase_block_accessor_roundtrip() {
        let mut doc = PipelineDocument::default();
        doc.set_phase_block("phase3", PhaseBlock::new(Status::Running));
        assert_eq!(doc.phase_block("phase3").unwrap().envelope.status, Status::Running);
        doc.recompute_phases_map();
        assert_eq!(doc.phases.get("phase3"), Some(&Status::Running));
        assert!(doc.phases.get("phase1").is_none());
    }

    #[test]
    fn default_document_serializes_without_null_phase_keys() {
        let doc = PipelineDocument::default();
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("phase1").is_none());
        assert_eq!(json["pipeline_version"], SCHEMA_VERSION);
    }
}
