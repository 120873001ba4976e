//! Pilot configuration stored under `.pilot/config.toml`.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::paths::write_atomic;

/// Executables the remote agent may invoke through the `bash` tool.
///
/// Listing, reading, version-control, process-inspection and package-manager
/// commands only. Matching is case-sensitive.
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "npm", "node", "git", "ps", "lsof", "sleep", "pkill",
];

/// Pilot configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PilotConfig {
    /// Base URL of the OpenCode endpoint. When unset, `OPENCODE_BASE_URL`
    /// or the endpoint default applies.
    pub base_url: Option<String>,

    /// Bounded wait for a single remote call, in seconds.
    pub request_timeout_secs: u64,

    /// How many times a transport failure is retried before halting.
    pub transport_retries: u32,

    /// Base delay between retries in seconds (scales linearly per attempt).
    pub retry_backoff_secs: u64,

    /// Pause between successful iterations, in seconds.
    pub auto_continue_delay_secs: u64,

    /// Output-length ceiling forwarded verbatim with every prompt.
    pub max_output_tokens: u32,

    /// Wall-clock budget for one gated shell command, in seconds.
    pub shell_timeout_secs: u64,

    /// Truncate captured shell output beyond this many bytes.
    pub shell_output_limit_bytes: usize,

    /// Executables permitted through the command gate.
    pub command_allowlist: Vec<String>,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: 300,
            transport_retries: 3,
            retry_backoff_secs: 2,
            auto_continue_delay_secs: 3,
            max_output_tokens: 32_000,
            shell_timeout_secs: 120,
            shell_output_limit_bytes: 100_000,
            command_allowlist: DEFAULT_ALLOWLIST.iter().map(ToString::to_string).collect(),
        }
    }
}

impl PilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("request_timeout_secs must be > 0"));
        }
        if self.shell_timeout_secs == 0 {
            return Err(anyhow!("shell_timeout_secs must be > 0"));
        }
        if self.shell_output_limit_bytes == 0 {
            return Err(anyhow!("shell_output_limit_bytes must be > 0"));
        }
        if self.max_output_tokens == 0 {
            return Err(anyhow!("max_output_tokens must be > 0"));
        }
        if self.command_allowlist.is_empty() {
            return Err(anyhow!("command_allowlist must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    if !path.exists() {
        let cfg = PilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
