//! Autonomous coding-agent loop driver.
//!
//! Drives a remote OpenCode-style agent against a project directory until
//! the feature ledger (`feature_list.json`) reports completion, an iteration
//! cap is hit, an unrecoverable error occurs, or the user interrupts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pilot::config::load_config;
use pilot::exit_codes;
use pilot::ledger;
use pilot::looping::{LoopOutcome, LoopRequest, LoopStop, run_loop};
use pilot::paths::ProjectPaths;
use pilot::session::{Credentials, DEFAULT_BASE_URL, ModelChoice, OpenCodeClient};

#[derive(Parser)]
#[command(name = "pilot", version, about = "Autonomous coding-agent loop driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the agent loop until completion, cap, error, or interrupt.
    Run {
        /// Project directory (created if missing).
        project_dir: PathBuf,
        /// Stop after this many iterations.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Model selector: `provider/model`, or `auto` to choose from
        /// available credentials.
        #[arg(long, default_value = "auto")]
        model: String,
        /// Specification file, copied to `app_spec.txt` when absent.
        #[arg(long)]
        spec: Option<PathBuf>,
    },
    /// Print ledger progress for a project.
    Status {
        /// Project directory.
        project_dir: PathBuf,
    },
}

fn main() {
    pilot::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::HALTED_ERROR
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            project_dir,
            max_iterations,
            model,
            spec,
        } => cmd_run(&project_dir, max_iterations, &model, spec.as_deref()),
        Command::Status { project_dir } => cmd_status(&project_dir),
    }
}

fn cmd_run(
    project_dir: &Path,
    max_iterations: Option<u32>,
    model_selector: &str,
    spec: Option<&Path>,
) -> Result<i32> {
    std::fs::create_dir_all(project_dir)
        .with_context(|| format!("create project directory {}", project_dir.display()))?;
    let paths = ProjectPaths::new(project_dir);
    if let Some(spec) = spec
        && !paths.spec_path.exists()
    {
        std::fs::copy(spec, &paths.spec_path)
            .with_context(|| format!("copy specification {}", spec.display()))?;
        println!("copied {} to {}", spec.display(), paths.spec_path.display());
    }

    let config = load_config(&paths.config_path)?;
    let credentials = Credentials::from_env();
    let model = ModelChoice::from_selector(model_selector, credentials.as_ref())?;
    let base_url = config
        .base_url
        .clone()
        .or_else(|| std::env::var("OPENCODE_BASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let client = OpenCodeClient::new(
        base_url,
        credentials,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("install interrupt handler")?;

    println!("project: {}", project_dir.display());
    println!("model: {model}");
    match max_iterations {
        Some(max) => println!("max iterations: {max}"),
        None => println!("max iterations: unlimited"),
    }

    let request = LoopRequest {
        project_dir,
        config: &config,
        model: &model,
        max_iterations,
        interrupt: &interrupt,
    };
    let outcome = run_loop(&request, &client, |report| {
        println!(
            "iteration {} [{}]: {}/{} features passing, {} actions ({} rejected)",
            report.iter, report.phase, report.completed, report.total, report.actions,
            report.rejected
        );
    })?;

    print_summary(&outcome);
    Ok(outcome.exit_code())
}

fn print_summary(outcome: &LoopOutcome) {
    let reason = match &outcome.stop {
        LoopStop::Done => "done: all features passing".to_string(),
        LoopStop::CapReached { max_iterations } => {
            format!("halted: iteration cap {max_iterations} reached")
        }
        LoopStop::Interrupted => "halted: user interrupt".to_string(),
        LoopStop::Failed { reason } => format!("halted: {reason}"),
    };
    println!();
    println!("iterations run: {}", outcome.iterations);
    println!("features passing: {}/{}", outcome.completed, outcome.total);
    println!("{reason}");
}

fn cmd_status(project_dir: &Path) -> Result<i32> {
    if !ledger::exists(project_dir) {
        println!("no feature ledger yet (fresh project)");
        return Ok(exit_codes::DONE);
    }
    let entries = ledger::load(project_dir)?;
    let (completed, total) = ledger::progress_summary(&entries);
    println!("features passing: {completed}/{total}");
    for entry in &entries {
        let mark = if entry.passes { "x" } else { " " };
        println!("  [{mark}] ({}) {}", entry.category, entry.description);
    }
    Ok(exit_codes::DONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["pilot", "run", "demo"]);
        match cli.command {
            Command::Run {
                project_dir,
                max_iterations,
                model,
                spec,
            } => {
                assert_eq!(project_dir, PathBuf::from("demo"));
                assert_eq!(max_iterations, None);
                assert_eq!(model, "auto");
                assert_eq!(spec, None);
            }
            Command::Status { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn parse_run_with_options() {
        let cli = Cli::parse_from([
            "pilot",
            "run",
            "demo",
            "--max-iterations",
            "5",
            "--model",
            "anthropic/claude-3-5-sonnet-20241022",
            "--spec",
            "spec.txt",
        ]);
        match cli.command {
            Command::Run {
                max_iterations,
                model,
                spec,
                ..
            } => {
                assert_eq!(max_iterations, Some(5));
                assert_eq!(model, "anthropic/claude-3-5-sonnet-20241022");
                assert_eq!(spec, Some(PathBuf::from("spec.txt")));
            }
            Command::Status { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn parse_status() {
        let cli = Cli::parse_from(["pilot", "status", "demo"]);
        assert!(matches!(cli.command, Command::Status { .. }));
    }
}
