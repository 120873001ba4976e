//! The feature ledger: the on-disk checklist driving completion detection.
//!
//! `feature_list.json` at the project root is the single source of truth for
//! "is this project done". The initializer session creates it; coding
//! sessions flip `passes` flags through their own file writes. The pilot
//! only ever reads it and rewrites it atomically on behalf of the agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::paths::{ProjectPaths, write_atomic};

const LEDGER_SCHEMA: &str = include_str!("../schemas/feature_list.schema.json");

/// One unit of required work.
///
/// `category`, `description` and `steps` are fixed at creation; only
/// `passes` is expected to change, and only from `false` to `true`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureEntry {
    pub category: String,
    pub description: String,
    pub steps: Vec<String>,
    pub passes: bool,
}

/// The stored ledger could not be parsed into the expected shape.
///
/// This is reported, never silently defaulted: it indicates a defective
/// write in a prior iteration or external tampering.
#[derive(Debug, thiserror::Error)]
#[error("corrupt feature ledger at {}: {reason}", path.display())]
pub struct CorruptLedgerError {
    pub path: PathBuf,
    pub reason: String,
}

/// Whether a ledger exists for the project.
pub fn exists(project_dir: &Path) -> bool {
    ProjectPaths::new(project_dir).ledger_path.exists()
}

/// Load and validate the ledger.
///
/// Schema conformance is checked before parsing so shape violations surface
/// as [`CorruptLedgerError`] with the offending detail, not as a generic
/// serde message.
pub fn load(project_dir: &Path) -> Result<Vec<FeatureEntry>> {
    let path = ProjectPaths::new(project_dir).ledger_path;
    debug!(path = %path.display(), "loading feature ledger");
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("read ledger {}", path.display()))?;

    let json: Value = serde_json::from_str(&contents).map_err(|err| CorruptLedgerError {
        path: path.clone(),
        reason: format!("invalid json: {err}"),
    })?;
    validate_schema(&json).map_err(|reason| CorruptLedgerError {
        path: path.clone(),
        reason,
    })?;
    let entries: Vec<FeatureEntry> =
        serde_json::from_value(json).map_err(|err| CorruptLedgerError {
            path: path.clone(),
            reason: err.to_string(),
        })?;
    debug!(total = entries.len(), "feature ledger loaded");
    Ok(entries)
}

/// Atomically write the ledger (temp file + rename).
///
/// A save must never leave the file half-written; an interrupted save keeps
/// the previous complete version readable.
pub fn save(project_dir: &Path, entries: &[FeatureEntry]) -> Result<()> {
    let path = ProjectPaths::new(project_dir).ledger_path;
    let mut buf = serde_json::to_string_pretty(entries).context("serialize ledger")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

/// `(completed, total)` counts over the entries.
pub fn progress_summary(entries: &[FeatureEntry]) -> (usize, usize) {
    let completed = entries.iter().filter(|entry| entry.passes).count();
    (completed, entries.len())
}

/// Validate the raw document against the embedded ledger schema.
fn validate_schema(instance: &Value) -> std::result::Result<(), String> {
    let schema: Value = serde_json::from_str(LEDGER_SCHEMA).map_err(|err| err.to_string())?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| err.to_string())?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entry;

    /// Verifies save → load preserves any well-formed entry sequence.
    #[test]
    fn ledger_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = vec![
            entry("functional", "User can register", false),
            entry("edge-case", "Rejects empty form", true),
        ];

        save(temp.path(), &entries).expect("save");
        assert!(exists(temp.path()));
        let loaded = load(temp.path()).expect("load");
        assert_eq!(loaded, entries);
    }

    #[test]
    fn empty_ledger_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        save(temp.path(), &[]).expect("save");
        let loaded = load(temp.path()).expect("load");
        assert!(loaded.is_empty());
        assert_eq!(progress_summary(&loaded), (0, 0));
    }

    #[test]
    fn missing_ledger_does_not_exist() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!exists(temp.path()));
        assert!(load(temp.path()).is_err());
    }

    #[test]
    fn missing_field_is_reported_as_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feature_list.json");
        std::fs::write(&path, r#"[{"category": "functional", "passes": false}]"#).expect("write");

        let err = load(temp.path()).expect_err("corrupt");
        let corrupt = err
            .downcast_ref::<CorruptLedgerError>()
            .expect("typed corrupt error");
        assert!(corrupt.reason.contains("description") || corrupt.reason.contains("required"));
    }

    #[test]
    fn wrong_type_is_reported_as_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feature_list.json");
        std::fs::write(
            &path,
            r#"[{"category": "functional", "description": "x", "steps": "not-a-list", "passes": false}]"#,
        )
        .expect("write");

        let err = load(temp.path()).expect_err("corrupt");
        assert!(err.downcast_ref::<CorruptLedgerError>().is_some());
    }

    #[test]
    fn invalid_json_is_reported_as_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feature_list.json");
        std::fs::write(&path, "[{truncated").expect("write");

        let err = load(temp.path()).expect_err("corrupt");
        assert!(err.downcast_ref::<CorruptLedgerError>().is_some());
    }

    /// Verifies an interrupted save never corrupts the previous version: a
    /// stray temp file from a killed writer must not affect the next load.
    #[test]
    fn interrupted_save_keeps_previous_version_readable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries = vec![entry("functional", "Stable entry", true)];
        save(temp.path(), &entries).expect("save");

        // Simulate a writer dying mid-write: garbage at the temp path only.
        std::fs::write(
            temp.path().join("feature_list.json.tmp"),
            "[{\"category\": \"trunc",
        )
        .expect("write temp");

        let loaded = load(temp.path()).expect("load after interruption");
        assert_eq!(loaded, entries);
    }

    #[test]
    fn progress_counts_passing_entries() {
        let entries = vec![
            entry("functional", "a", true),
            entry("functional", "b", false),
            entry("ui", "c", true),
        ];
        assert_eq!(progress_summary(&entries), (2, 3));
    }
}
