//! Check command execution.
//!
//! A check is a named shell command whose exit status decides whether a
//! phase may be considered complete. Each check runs as `sh -c <command>`
//! in the project workspace with `PROJECT_ID` and `PROJECT_TITLE` injected
//! over the inherited environment, stdout and stderr captured in full.
//!
//! Timeouts escalate: SIGTERM at the deadline, SIGKILL 5 seconds later if
//! the process is still alive. A timed-out check is reported as failed
//! with an explicit timeout message, distinct from a non-zero exit.
//!
//! A phase's checks run strictly in declaration order and stop at the
//! first failure — a failing build check never lets the test check start.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Environment variable carrying the project id into check commands.
pub const ENV_PROJECT_ID: &str = "PROJECT_ID";

/// Environment variable carrying the project title into check commands.
pub const ENV_PROJECT_TITLE: &str = "PROJECT_TITLE";

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Lines of error detail shown per failing check.
const ERROR_PREVIEW_LINES: usize = 5;

/// Outcome of one check command. Produced and consumed within a single
/// invocation, never persisted.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub passed: bool,
    /// Captured stdout.
    pub output: String,
    /// Failure detail: captured stderr, exit code, or timeout message.
    pub error: Option<String>,
    pub duration: Duration,
}

/// Run a single named check command.
pub async fn run_check(
    name: &str,
    command: &str,
    cwd: &Path,
    env: &[(String, String)],
    limit: Duration,
) -> Result<CheckResult> {
    let started = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .spawn()
        .with_context(|| format!("Failed to spawn check command: {command}"))?;

    // Drain the pipes off-thread so a chatty command cannot fill the pipe
    // buffer and deadlock against wait()
    let stdout_task = tokio::spawn(read_all(child.stdout.take()));
    let stderr_task = tokio::spawn(read_all(child.stderr.take()));

    let status = match timeout(limit, child.wait()).await {
        Ok(status) => Some(status.context("Failed to wait for check command")?),
        Err(_) => {
            terminate(&mut child);
            if timeout(TERM_GRACE, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
            None
        }
    };

    let output = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let duration = started.elapsed();

    let result = |passed: bool, error: Option<String>| CheckResult {
        name: name.to_string(),
        command: command.to_string(),
        passed,
        output: output.clone(),
        error,
        duration,
    };

    let Some(status) = status else {
        return Ok(result(
            false,
            Some(format!("Timed out after {}s", limit.as_secs())),
        ));
    };

    if status.success() {
        Ok(result(true, None))
    } else {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = if stderr.trim().is_empty() {
            output.trim()
        } else {
            stderr.trim()
        };
        let error = if detail.is_empty() {
            format!("Exited with code {code}")
        } else {
            format!("Exited with code {code}:\n{detail}")
        };
        Ok(result(false, Some(error)))
    }
}

/// Run a phase's checks strictly in order, stopping at the first failure.
pub async fn run_phase_checks(
    checks: &[(String, String)],
    cwd: &Path,
    env: &[(String, String)],
    limit: Duration,
) -> Result<Vec<CheckResult>> {
    let mut results = Vec::with_capacity(checks.len());
    for (name, command) in checks {
        let result = run_check(name, command, cwd, env, limit).await?;
        let failed = !result.passed;
        results.push(result);
        if failed {
            break;
        }
    }
    Ok(results)
}

/// True iff every result passed. Vacuously true for an empty list.
pub fn all_checks_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// The first failing result, if any.
pub fn first_failure(results: &[CheckResult]) -> Option<&CheckResult> {
    results.iter().find(|r| !r.passed)
}

/// Compact pass/fail listing with truncated error detail, to keep
/// agent-facing output bounded.
pub fn format_check_results(results: &[CheckResult]) -> String {
    let mut out = String::new();
    for result in results {
        let secs = result.duration.as_secs_f64();
        if result.passed {
            out.push_str(&format!(
                "  {} {} ({:.1}s)\n",
                style("PASS").green(),
                result.name,
                secs
            ));
        } else {
            out.push_str(&format!(
                "  {} {} ({:.1}s)\n",
                style("FAIL").red(),
                result.name,
                secs
            ));
            if let Some(ref error) = result.error {
                for line in error.lines().take(ERROR_PREVIEW_LINES) {
                    out.push_str(&format!("      {line}\n"));
                }
                if error.lines().count() > ERROR_PREVIEW_LINES {
                    out.push_str("      ...\n");
                }
            }
        }
    }
    out
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf).await;
    }
    buf
}

/// Ask the child to exit. SIGTERM on unix; elsewhere straight to kill.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            return;
        }
    }
    let _ = child.start_kill();
}
