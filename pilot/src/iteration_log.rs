//! Iteration transcripts under `.pilot/iterations/`.
//!
//! Product artifacts, written for every iteration regardless of `RUST_LOG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::tools::ActionRecord;

/// Metadata for one iteration (`meta.json`).
#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub iter: u32,
    /// Which prompt drove the iteration (`initializer` or `coding`).
    pub phase: String,
    pub model_requested: String,
    /// Model the endpoint reported it used, when stated.
    pub model_used: Option<String>,
    /// Endpoint reported a different model than requested.
    pub model_mismatch: bool,
    pub duration_ms: u64,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub reply_path: PathBuf,
    pub actions_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iter: u32) -> Self {
        let dir = iterations_dir.join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            reply_path: dir.join("reply.md"),
            actions_path: dir.join("actions.json"),
            dir,
        }
    }
}

/// Write one iteration's transcript in deterministic order.
pub fn write_iteration(
    iterations_dir: &Path,
    meta: &IterationMeta,
    reply_text: &str,
    actions: &[ActionRecord],
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(iterations_dir, meta.iter);
    std::fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, meta)?;
    write_text(&paths.reply_path, reply_text)?;
    write_json(&paths.actions_path, &actions)?;
    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ActionOutcome;

    #[test]
    fn iteration_paths_are_stable() {
        let paths = IterationPaths::new(Path::new("/tmp/p/.pilot/iterations"), 3);
        assert!(paths.dir.ends_with("iterations/3"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.reply_path.ends_with("reply.md"));
        assert!(paths.actions_path.ends_with("actions.json"));
    }

    #[test]
    fn writes_all_transcript_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = IterationMeta {
            iter: 1,
            phase: "coding".to_string(),
            model_requested: "auto".to_string(),
            model_used: Some("anthropic/claude-3-5-sonnet-20241022".to_string()),
            model_mismatch: false,
            duration_ms: 12,
            completed: 1,
            total: 4,
        };
        let actions = vec![ActionRecord {
            tool: "bash".to_string(),
            detail: "ls".to_string(),
            outcome: ActionOutcome::Ran {
                exit_code: Some(0),
                timed_out: false,
            },
        }];

        let paths =
            write_iteration(temp.path(), &meta, "did some work", &actions).expect("write");
        assert!(paths.meta_path.exists());
        assert!(paths.reply_path.exists());
        assert!(paths.actions_path.exists());

        let actions_json = std::fs::read_to_string(&paths.actions_path).expect("read");
        assert!(actions_json.contains("\"outcome\": \"ran\""));
    }
}
