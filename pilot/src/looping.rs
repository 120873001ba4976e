//! The autonomous two-phase agent loop.
//!
//! Each iteration re-derives the project phase from the feature ledger: no
//! ledger means a fresh project (initializer prompt), an incomplete ledger
//! means work remains (coding prompt), a complete ledger stops the loop. The
//! remote agent's tool invocations are applied locally with the command gate
//! in front of every shell command; gate rejections are routine and feed the
//! next iteration's context instead of halting.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::PilotConfig;
use crate::exit_codes;
use crate::gate::CommandGate;
use crate::iteration_log::{IterationMeta, write_iteration};
use crate::ledger::{self, CorruptLedgerError, FeatureEntry};
use crate::paths::ProjectPaths;
use crate::prompt::{CODING_TITLE, CodingPromptInputs, INITIALIZER_TITLE, PromptEngine};
use crate::run_state::{load_run_state, write_run_state};
use crate::session::{AgentReply, ModelChoice, PromptRequest, SessionClient, SessionError};
use crate::tools::{ToolContext, apply_invocations, rejected_shell_commands};

/// Project phase, derived from the ledger alone at each iteration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectPhase {
    /// No ledger yet; the initializer must bootstrap the project.
    Fresh,
    /// Ledger present with unfinished entries.
    Advancing { completed: usize, total: usize },
    /// Every ledger entry passes.
    Done { total: usize },
}

/// Reason why [`run_loop`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every ledger entry passes.
    Done,
    /// The caller-supplied iteration cap was reached before completion.
    CapReached { max_iterations: u32 },
    /// A user interrupt was observed.
    Interrupted,
    /// Unrecoverable error: auth, corrupt ledger, or retries exhausted.
    Failed { reason: String },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub iterations: u32,
    pub completed: usize,
    pub total: usize,
    pub stop: LoopStop,
}

impl LoopOutcome {
    /// Process exit code for this halt reason.
    pub fn exit_code(&self) -> i32 {
        match self.stop {
            LoopStop::Done => exit_codes::DONE,
            LoopStop::CapReached { .. } => exit_codes::HALTED_CAP,
            LoopStop::Interrupted => exit_codes::HALTED_USER,
            LoopStop::Failed { .. } => exit_codes::HALTED_ERROR,
        }
    }
}

/// Progress notification for one finished iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iter: u32,
    pub phase: &'static str,
    pub actions: usize,
    pub rejected: usize,
    pub completed: usize,
    pub total: usize,
}

/// Inputs for one loop invocation.
#[derive(Debug)]
pub struct LoopRequest<'a> {
    pub project_dir: &'a Path,
    pub config: &'a PilotConfig,
    /// Requested model, passed through to the endpoint verbatim.
    pub model: &'a ModelChoice,
    /// Iteration cap; `None` runs until completion or error.
    pub max_iterations: Option<u32>,
    /// Set by the caller (e.g. a Ctrl-C handler); polled between remote
    /// calls and during delays.
    pub interrupt: &'a AtomicBool,
}

fn read_phase(project_dir: &Path) -> Result<(ProjectPhase, Vec<FeatureEntry>)> {
    if !ledger::exists(project_dir) {
        return Ok((ProjectPhase::Fresh, Vec::new()));
    }
    let entries = ledger::load(project_dir)?;
    let (completed, total) = ledger::progress_summary(&entries);
    let phase = if completed == total {
        ProjectPhase::Done { total }
    } else {
        ProjectPhase::Advancing { completed, total }
    };
    Ok((phase, entries))
}

/// Run iterations until completion, the iteration cap, an unrecoverable
/// error, or a user interrupt.
///
/// Command-gate rejections never stop the loop; they are recorded and fed
/// into the next coding prompt so the remote agent can adapt.
pub fn run_loop<C: SessionClient, F: FnMut(&IterationReport)>(
    request: &LoopRequest<'_>,
    client: &C,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let paths = ProjectPaths::new(request.project_dir);
    let engine = PromptEngine::new();
    let gate = CommandGate::new(request.config.command_allowlist.iter().cloned());
    let mut iterations = 0u32;
    let mut rejected: Vec<String> = Vec::new();

    loop {
        if request.interrupt.load(Ordering::Relaxed) {
            return Ok(outcome(request.project_dir, iterations, LoopStop::Interrupted));
        }

        let (phase, entries) = match read_phase(request.project_dir) {
            Ok(result) => result,
            Err(err) if err.downcast_ref::<CorruptLedgerError>().is_some() => {
                return Ok(outcome(
                    request.project_dir,
                    iterations,
                    LoopStop::Failed {
                        reason: format!("{err:#}"),
                    },
                ));
            }
            Err(err) => return Err(err),
        };

        if let ProjectPhase::Done { total } = phase {
            info!(total, "all features passing");
            return Ok(LoopOutcome {
                iterations,
                completed: total,
                total,
                stop: LoopStop::Done,
            });
        }

        if let Some(max_iterations) = request.max_iterations
            && iterations >= max_iterations
        {
            return Ok(outcome(
                request.project_dir,
                iterations,
                LoopStop::CapReached { max_iterations },
            ));
        }

        let (phase_name, title, prompt) = match &phase {
            ProjectPhase::Fresh => {
                let spec_text = std::fs::read_to_string(&paths.spec_path).with_context(|| {
                    format!(
                        "read specification {} (supply --spec on the first run)",
                        paths.spec_path.display()
                    )
                })?;
                (
                    "initializer",
                    INITIALIZER_TITLE,
                    engine.render_initializer(&spec_text, &request.config.command_allowlist)?,
                )
            }
            ProjectPhase::Advancing { completed, total } => {
                let ledger_json =
                    serde_json::to_string_pretty(&entries).context("serialize ledger for prompt")?;
                (
                    "coding",
                    CODING_TITLE,
                    engine.render_coding(
                        &CodingPromptInputs {
                            ledger_json: &ledger_json,
                            completed: *completed,
                            total: *total,
                            rejected_commands: &rejected,
                        },
                        &request.config.command_allowlist,
                    )?,
                )
            }
            ProjectPhase::Done { .. } => unreachable!("handled above"),
        };

        let started = Instant::now();
        info!(iter = iterations + 1, phase = phase_name, "starting iteration");

        let reply = match call_remote(request, client, title, &prompt) {
            RemoteCall::Reply(reply) => reply,
            RemoteCall::Interrupted => {
                return Ok(outcome(request.project_dir, iterations, LoopStop::Interrupted));
            }
            RemoteCall::Failed(err) => {
                warn!(error = %err, "remote call failed, halting");
                return Ok(outcome(
                    request.project_dir,
                    iterations,
                    LoopStop::Failed {
                        reason: err.to_string(),
                    },
                ));
            }
        };

        let model_mismatch = match (request.model, &reply.model_used) {
            (ModelChoice::Fixed(requested), Some(used)) if requested != used => {
                warn!(requested = %requested, used = %used, "endpoint substituted a different model");
                true
            }
            _ => false,
        };

        let tool_ctx = ToolContext {
            project_dir: request.project_dir,
            gate: &gate,
            shell_timeout: Duration::from_secs(request.config.shell_timeout_secs),
            output_limit_bytes: request.config.shell_output_limit_bytes,
        };
        let actions = apply_invocations(&tool_ctx, &reply);
        rejected = rejected_shell_commands(&actions);

        let (completed, total) = ledger::load(request.project_dir)
            .map(|entries| ledger::progress_summary(&entries))
            .unwrap_or((0, 0));

        let mut run_state = load_run_state(&paths.run_state_path)?;
        let iter = run_state.next_iter;
        let meta = IterationMeta {
            iter,
            phase: phase_name.to_string(),
            model_requested: request.model.to_string(),
            model_used: reply.model_used.as_ref().map(ToString::to_string),
            model_mismatch,
            duration_ms: started.elapsed().as_millis() as u64,
            completed,
            total,
        };
        write_iteration(&paths.iterations_dir, &meta, &reply.text(), &actions)?;
        run_state.next_iter = iter + 1;
        write_run_state(&paths.run_state_path, &run_state)?;

        iterations += 1;
        on_iteration(&IterationReport {
            iter,
            phase: phase_name,
            actions: actions.len(),
            rejected: rejected.len(),
            completed,
            total,
        });

        // Pacing between sessions; also where user interrupts land cheaply.
        pause(
            Duration::from_secs(request.config.auto_continue_delay_secs),
            request.interrupt,
        );
    }
}

enum RemoteCall {
    Reply(AgentReply),
    Interrupted,
    Failed(SessionError),
}

/// One remote round-trip under the error policy: transport failures retry
/// with linear backoff up to the configured count, remote failures retry
/// once, auth failures never retry.
fn call_remote<C: SessionClient>(
    request: &LoopRequest<'_>,
    client: &C,
    title: &str,
    prompt: &str,
) -> RemoteCall {
    let cfg = request.config;
    let mut transport_attempts = 0u32;
    let mut remote_retried = false;

    loop {
        if request.interrupt.load(Ordering::Relaxed) {
            return RemoteCall::Interrupted;
        }
        let err = match client.open_session(request.project_dir, title) {
            Ok(session) => {
                if request.interrupt.load(Ordering::Relaxed) {
                    return RemoteCall::Interrupted;
                }
                match client.send_prompt(&PromptRequest {
                    session: &session,
                    prompt,
                    model: request.model,
                    max_output_tokens: cfg.max_output_tokens,
                }) {
                    Ok(reply) => return RemoteCall::Reply(reply),
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        let delay = match &err {
            SessionError::Transport(_) => {
                transport_attempts += 1;
                (transport_attempts <= cfg.transport_retries).then(|| {
                    Duration::from_secs(cfg.retry_backoff_secs * u64::from(transport_attempts))
                })
            }
            SessionError::Remote(_) => (!remote_retried).then(|| {
                remote_retried = true;
                Duration::from_secs(cfg.retry_backoff_secs)
            }),
            SessionError::Auth(_) => None,
        };

        match delay {
            Some(delay) => {
                warn!(error = %err, delay_secs = delay.as_secs(), "retrying remote call");
                pause(delay, request.interrupt);
            }
            None => return RemoteCall::Failed(err),
        }
    }
}

fn outcome(project_dir: &Path, iterations: u32, stop: LoopStop) -> LoopOutcome {
    let (completed, total) = ledger::load(project_dir)
        .map(|entries| ledger::progress_summary(&entries))
        .unwrap_or((0, 0));
    LoopOutcome {
        iterations,
        completed,
        total,
        stop,
    }
}

/// Sleep in short slices so an interrupt cuts the wait short.
fn pause(duration: Duration, interrupt: &AtomicBool) {
    let deadline = Instant::now() + duration;
    loop {
        if interrupt.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}
