//! Local application of tool invocations from remote replies.
//!
//! The session client only reports invocations; this module performs them.
//! Shell commands pass through the command gate first, and file operations
//! are confined to the project directory. A rejection is a recorded outcome,
//! never an error.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::gate::CommandGate;
use crate::process::run_shell;
use crate::session::AgentReply;

/// What happened to one tool invocation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Gated shell command ran to completion (or timed out).
    Ran { exit_code: Option<i32>, timed_out: bool },
    /// Filtered out by the gate or the path containment check.
    Rejected { reason: String },
    Wrote { bytes: usize },
    Read { bytes: usize },
    /// The invocation could not be attempted (malformed input, local I/O).
    Skipped { reason: String },
}

/// One applied invocation, serialized into the iteration transcript.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionRecord {
    pub tool: String,
    /// Command line or file path the invocation named.
    pub detail: String,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

/// Shared context for applying one reply's invocations.
#[derive(Debug)]
pub struct ToolContext<'a> {
    pub project_dir: &'a Path,
    pub gate: &'a CommandGate,
    pub shell_timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Apply every tool invocation in `reply`, in order.
pub fn apply_invocations(ctx: &ToolContext<'_>, reply: &AgentReply) -> Vec<ActionRecord> {
    reply
        .tool_invocations()
        .map(|(name, input)| apply_one(ctx, name, input))
        .collect()
}

/// Shell commands the gate rejected, for the next iteration's context.
pub fn rejected_shell_commands(records: &[ActionRecord]) -> Vec<String> {
    records
        .iter()
        .filter(|record| {
            record.tool == "bash" && matches!(record.outcome, ActionOutcome::Rejected { .. })
        })
        .map(|record| record.detail.clone())
        .collect()
}

fn apply_one(ctx: &ToolContext<'_>, name: &str, input: &Value) -> ActionRecord {
    match name {
        "bash" | "shell" => apply_shell(ctx, input),
        "write" => apply_write(ctx, input),
        "read" => apply_read(ctx, input),
        other => ActionRecord {
            tool: other.to_string(),
            detail: String::new(),
            outcome: ActionOutcome::Skipped {
                reason: "unrecognized tool".to_string(),
            },
        },
    }
}

fn apply_shell(ctx: &ToolContext<'_>, input: &Value) -> ActionRecord {
    let Some(command) = input.get("command").and_then(Value::as_str) else {
        return ActionRecord {
            tool: "bash".to_string(),
            detail: String::new(),
            outcome: ActionOutcome::Skipped {
                reason: "missing command input".to_string(),
            },
        };
    };

    if !ctx.gate.is_allowed(command) {
        warn!(command, "command rejected by gate");
        return ActionRecord {
            tool: "bash".to_string(),
            detail: command.to_string(),
            outcome: ActionOutcome::Rejected {
                reason: "not on the command allow-list".to_string(),
            },
        };
    }

    let outcome = match run_shell(command, ctx.project_dir, ctx.shell_timeout, ctx.output_limit_bytes)
    {
        Ok(output) => {
            debug!(command, exit_code = ?output.exit_code, "command ran");
            ActionOutcome::Ran {
                exit_code: output.exit_code,
                timed_out: output.timed_out,
            }
        }
        Err(err) => ActionOutcome::Skipped {
            reason: format!("could not run: {err:#}"),
        },
    };
    ActionRecord {
        tool: "bash".to_string(),
        detail: command.to_string(),
        outcome,
    }
}

fn apply_write(ctx: &ToolContext<'_>, input: &Value) -> ActionRecord {
    let raw_path = file_path_input(input).unwrap_or_default();
    let content = input.get("content").and_then(Value::as_str).unwrap_or_default();
    let record = |outcome| ActionRecord {
        tool: "write".to_string(),
        detail: raw_path.clone(),
        outcome,
    };

    if raw_path.is_empty() {
        return record(ActionOutcome::Skipped {
            reason: "missing filePath input".to_string(),
        });
    }
    let Some(path) = contained_path(ctx.project_dir, &raw_path) else {
        warn!(path = %raw_path, "write outside project directory rejected");
        return record(ActionOutcome::Rejected {
            reason: "path escapes the project directory".to_string(),
        });
    };

    match write_with_parents(&path, content) {
        Ok(()) => record(ActionOutcome::Wrote {
            bytes: content.len(),
        }),
        Err(err) => record(ActionOutcome::Skipped {
            reason: format!("could not write: {err:#}"),
        }),
    }
}

fn apply_read(ctx: &ToolContext<'_>, input: &Value) -> ActionRecord {
    let raw_path = file_path_input(input).unwrap_or_default();
    let record = |outcome| ActionRecord {
        tool: "read".to_string(),
        detail: raw_path.clone(),
        outcome,
    };

    if raw_path.is_empty() {
        return record(ActionOutcome::Skipped {
            reason: "missing filePath input".to_string(),
        });
    }
    let Some(path) = contained_path(ctx.project_dir, &raw_path) else {
        warn!(path = %raw_path, "read outside project directory rejected");
        return record(ActionOutcome::Rejected {
            reason: "path escapes the project directory".to_string(),
        });
    };

    match std::fs::read(&path) {
        Ok(bytes) => record(ActionOutcome::Read { bytes: bytes.len() }),
        Err(err) => record(ActionOutcome::Skipped {
            reason: format!("could not read: {err}"),
        }),
    }
}

fn file_path_input(input: &Value) -> Option<String> {
    ["filePath", "file_path", "path"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(ToString::to_string)
}

fn write_with_parents(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("write {}", path.display()))
}

/// Resolve a tool-supplied path inside the project directory.
///
/// `..` components are refused outright; absolute paths must sit under the
/// project root (raw or canonicalized). Relative paths are joined.
fn contained_path(project_dir: &Path, raw: &str) -> Option<PathBuf> {
    let raw_path = Path::new(raw);
    if raw_path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return None;
    }
    if raw_path.is_absolute() {
        let canonical_root = project_dir.canonicalize().ok()?;
        if raw_path.starts_with(project_dir) || raw_path.starts_with(&canonical_root) {
            return Some(raw_path.to_path_buf());
        }
        return None;
    }
    Some(project_dir.join(raw_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ALLOWLIST;
    use crate::session::ReplyPart;
    use serde_json::json;

    fn reply_with(parts: Vec<ReplyPart>) -> AgentReply {
        AgentReply {
            parts,
            model_used: None,
        }
    }

    fn context<'a>(project_dir: &'a Path, gate: &'a CommandGate) -> ToolContext<'a> {
        ToolContext {
            project_dir,
            gate,
            shell_timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn allowed_command_runs_in_project_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("present.txt"), "x").expect("write");
        let gate = CommandGate::new(DEFAULT_ALLOWLIST.iter().copied());
        let reply = reply_with(vec![ReplyPart::ToolInvocation {
            name: "bash".to_string(),
            input: json!({ "command": "ls present.txt" }),
        }]);

        let records = apply_invocations(&context(temp.path(), &gate), &reply);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].outcome,
            ActionOutcome::Ran {
                exit_code: Some(0),
                timed_out: false
            }
        );
    }

    #[test]
    fn disallowed_command_is_rejected_not_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(DEFAULT_ALLOWLIST.iter().copied());
        let reply = reply_with(vec![ReplyPart::ToolInvocation {
            name: "bash".to_string(),
            input: json!({ "command": "ls; rm -rf /" }),
        }]);

        let records = apply_invocations(&context(temp.path(), &gate), &reply);
        assert!(matches!(records[0].outcome, ActionOutcome::Rejected { .. }));
        assert_eq!(rejected_shell_commands(&records), vec!["ls; rm -rf /"]);
    }

    #[test]
    fn write_lands_inside_project_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(DEFAULT_ALLOWLIST.iter().copied());
        let reply = reply_with(vec![ReplyPart::ToolInvocation {
            name: "write".to_string(),
            input: json!({ "filePath": "src/app.js", "content": "console.log(1)" }),
        }]);

        let records = apply_invocations(&context(temp.path(), &gate), &reply);
        assert!(matches!(records[0].outcome, ActionOutcome::Wrote { .. }));
        let written =
            std::fs::read_to_string(temp.path().join("src/app.js")).expect("written file");
        assert_eq!(written, "console.log(1)");
    }

    #[test]
    fn traversal_and_outside_writes_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(DEFAULT_ALLOWLIST.iter().copied());
        let reply = reply_with(vec![
            ReplyPart::ToolInvocation {
                name: "write".to_string(),
                input: json!({ "filePath": "../escape.txt", "content": "x" }),
            },
            ReplyPart::ToolInvocation {
                name: "write".to_string(),
                input: json!({ "filePath": "/etc/pilot-test.txt", "content": "x" }),
            },
        ]);

        let records = apply_invocations(&context(temp.path(), &gate), &reply);
        assert!(matches!(records[0].outcome, ActionOutcome::Rejected { .. }));
        assert!(matches!(records[1].outcome, ActionOutcome::Rejected { .. }));
    }

    #[test]
    fn read_reports_length() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("notes.txt"), "hello").expect("write");
        let gate = CommandGate::new(DEFAULT_ALLOWLIST.iter().copied());
        let reply = reply_with(vec![ReplyPart::ToolInvocation {
            name: "read".to_string(),
            input: json!({ "filePath": "notes.txt" }),
        }]);

        let records = apply_invocations(&context(temp.path(), &gate), &reply);
        assert_eq!(records[0].outcome, ActionOutcome::Read { bytes: 5 });
    }

    #[test]
    fn unknown_tool_is_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gate = CommandGate::new(DEFAULT_ALLOWLIST.iter().copied());
        let reply = reply_with(vec![ReplyPart::ToolInvocation {
            name: "webfetch".to_string(),
            input: json!({ "url": "http://example.com" }),
        }]);

        let records = apply_invocations(&context(temp.path(), &gate), &reply);
        assert!(matches!(records[0].outcome, ActionOutcome::Skipped { .. }));
    }
}
