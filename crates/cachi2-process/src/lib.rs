//! Subprocess execution for cachi2's tool-driving resolvers.
//!
//! gomod, npm, yarn, cargo, and bundler all shell out to the real
//! ecosystem tool (`go mod download`, `cargo vendor`, `bundle lock`, ...)
//! rather than reimplementing it. This crate is the one place that spawns
//! those processes: it enforces a timeout, captures a size-bounded tail of
//! stdout/stderr (full tool output from a large vendor operation is not
//! worth holding in memory or echoing into a diagnostic event), and reports
//! failures in a shape resolvers can fold into `ToolError`.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Captured stdout/stderr is truncated to this many bytes from the end
/// (the tail is almost always where the useful error is).
const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// Result of a single, untimed command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                tail(&self.stderr)
            ))
        }
    }

    fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: tail(&String::from_utf8_lossy(&output.stdout)),
            stderr: tail(&String::from_utf8_lossy(&output.stderr)),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Result of a command run under [`run_with_timeout`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, or `-1` when the process was killed for timing out.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Truncates `s` to its last [`MAX_CAPTURED_BYTES`] bytes, at a UTF-8
/// char boundary, prefixing a marker if anything was cut.
fn tail(s: &str) -> String {
    if s.len() <= MAX_CAPTURED_BYTES {
        return s.to_string();
    }
    let mut start = s.len() - MAX_CAPTURED_BYTES;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("... [truncated]\n{}", &s[start..])
}

/// Runs a command to completion with no timeout, capturing output.
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandResult> {
    run_command_in_dir(program, args, Path::new("."))
}

/// Runs a command to completion with no timeout, in `dir`, capturing
/// output.
pub fn run_command_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    let start = Instant::now();
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("failed to run command: {program} {args:?} in {}", dir.display()))?;
    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Runs a command in `dir` with an environment extension, capturing
/// output.
pub fn run_command_with_env(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(String, String)],
) -> Result<CommandResult> {
    let start = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let output = cmd
        .output()
        .with_context(|| format!("failed to run command: {program} {args:?}"))?;
    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Runs a command with a wall-clock timeout, polling the child rather than
/// blocking on `wait()` so it can be killed when the deadline passes.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    dir: &Path,
    timeout: Duration,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn command: {program}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to poll command: {program}"))?
        {
            Some(status) => {
                return Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: tail(&read_pipe(child.stdout.take())),
                    stderr: tail(&read_pipe(child.stderr.take())),
                    timed_out: false,
                    duration: start.elapsed(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();

                    let mut stderr = tail(&read_pipe(child.stderr.take()));
                    stderr.push_str(&format!(
                        "\n{program} timed out after {}",
                        humantime::format_duration(timeout)
                    ));

                    return Ok(CommandOutput {
                        exit_code: -1,
                        stdout: tail(&read_pipe(child.stdout.take())),
                        stderr,
                        timed_out: true,
                        duration: start.elapsed(),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Whether `program` resolves on `PATH`.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Full path to `program` on `PATH`, if any.
pub fn which(program: &str) -> Option<std::path::PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_captures_stdout() {
        let result = run_command("echo", &["hello"]).expect("run");
        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[test]
    fn run_command_reports_failure() {
        let result = run_command("sh", &["-c", "exit 7"]).expect("run");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(7));
    }

    #[test]
    fn command_result_ok_err_on_failure() {
        let result = CommandResult {
            success: false,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "boom".into(),
            duration_ms: 1,
        };
        assert!(result.ok().is_err());
    }

    #[test]
    fn run_with_timeout_kills_slow_process() {
        let output = run_with_timeout(
            "sh",
            &["-c", "sleep 5"],
            Path::new("."),
            Duration::from_millis(100),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn run_with_timeout_succeeds_within_budget() {
        let output = run_with_timeout(
            "echo",
            &["fast"],
            Path::new("."),
            Duration::from_secs(5),
        )
        .expect("run");
        assert!(!output.timed_out);
        assert!(output.success());
        assert!(output.stdout.contains("fast"));
    }

    #[test]
    fn tail_truncates_long_output() {
        let long = "x".repeat(MAX_CAPTURED_BYTES + 100);
        let truncated = tail(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.starts_with("... [truncated]"));
    }

    #[test]
    fn command_exists_for_shell() {
        assert!(command_exists("sh"));
        assert!(!command_exists("this-command-does-not-exist-xyz123"));
    }
}
