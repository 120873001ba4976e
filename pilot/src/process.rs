//! Running gated shell commands with a timeout and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of one shell command.
#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Run one already-gated command line via `sh -c` in `workdir`.
///
/// Output is read concurrently while the child runs so full pipes cannot
/// deadlock; `output_limit_bytes` bounds what is kept in memory (the rest is
/// drained and discarded). The child is killed when `timeout` expires.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_shell(
    command_line: &str,
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ShellOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command_line)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning shell command");
    let mut child = cmd.spawn().context("spawn shell command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ShellOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = run_shell("printf hello", temp.path(), Duration::from_secs(5), 1000)
            .expect("run");

        assert!(output.success());
        assert_eq!(output.stdout, b"hello");
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn reports_nonzero_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = run_shell("exit 3", temp.path(), Duration::from_secs(5), 1000).expect("run");

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
    }

    #[test]
    fn kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = run_shell("sleep 5", temp.path(), Duration::from_millis(100), 1000)
            .expect("run");

        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn bounds_captured_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = run_shell(
            "yes x | head -c 10000",
            temp.path(),
            Duration::from_secs(5),
            64,
        )
        .expect("run");

        assert_eq!(output.stdout.len(), 64);
    }
}
