//! Run state storage for iteration bookkeeping.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::write_atomic;

/// Persisted bookkeeping for the project (`.pilot/run_state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// Next iteration number (1-indexed, monotonically increasing across runs).
    pub next_iter: u32,
}

impl Default for RunState {
    fn default() -> Self {
        Self { next_iter: 1 }
    }
}

/// Load run state from disk; a missing file is a fresh default.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    if !path.exists() {
        return Ok(RunState::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(next_iter = state.next_iter, "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(next_iter = state.next_iter, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}
