//! Canonical paths within a pilot project directory.

use std::path::{Path, PathBuf};

/// Name of the feature ledger file at the project root.
pub const LEDGER_FILE: &str = "feature_list.json";
/// Name of the application specification file at the project root.
pub const SPEC_FILE: &str = "app_spec.txt";

/// All pilot-owned paths for a project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub ledger_path: PathBuf,
    pub spec_path: PathBuf,
    pub pilot_dir: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let pilot_dir = root.join(".pilot");
        Self {
            ledger_path: root.join(LEDGER_FILE),
            spec_path: root.join(SPEC_FILE),
            config_path: pilot_dir.join("config.toml"),
            run_state_path: pilot_dir.join("run_state.json"),
            iterations_dir: pilot_dir.join("iterations"),
            pilot_dir,
            root,
        }
    }
}

/// Atomically write `contents` to `path` (temp file + rename).
///
/// Creates parent directories as needed. The temp file lives next to the
/// target so the rename stays on one filesystem.
pub fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
