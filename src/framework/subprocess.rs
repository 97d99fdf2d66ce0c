//! Subprocess-backed [`TestExecutor`] with a wall-clock limit per test.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::command::CommandLine;
use super::{ExecutionResult, Framework, TestExecutor, TestTarget};

/// Runs framework commands as child processes.
///
/// The child is killed when the timeout elapses; output of a killed child is
/// discarded.
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    timeout: Duration,
}

impl SubprocessExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl TestExecutor for SubprocessExecutor {
    async fn execute(
        &self,
        framework: Framework,
        target: &TestTarget,
        working_dir: &Path,
    ) -> ExecutionResult {
        let cmd = framework.command(target);
        debug!(%framework, %target, program = %cmd.program, "spawning test runner");
        run_command(&cmd, working_dir, self.timeout).await
    }
}

/// Spawn `cmd` in `working_dir`, capture its output verbatim and enforce `timeout`.
pub async fn run_command(cmd: &CommandLine, working_dir: &Path, timeout: Duration) -> ExecutionResult {
    let start = Instant::now();
    let child = tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => {
            debug!(
                program = %cmd.program,
                code = ?output.status.code(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "test runner exited"
            );
            ExecutionResult::completed(
                output.status.code(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
        }
        Ok(Err(e)) => {
            warn!(program = %cmd.program, error = %e, "failed to spawn test runner");
            ExecutionResult::spawn_failed(format!("failed to execute {}: {}", cmd.program, e))
        }
        Err(_) => {
            let after_secs = timeout.as_secs_f64().ceil() as u64;
            warn!(program = %cmd.program, after_secs, "test runner timed out, killed");
            ExecutionResult::timed_out(after_secs, String::new(), String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::ExecutionFault;

    fn sh(script: &str) -> CommandLine {
        CommandLine {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let r = run_command(&sh("echo out; echo err >&2; exit 3"), dir.path(), Duration::from_secs(10)).await;
        assert!(!r.success);
        assert_eq!(r.exit_code, Some(3));
        assert_eq!(r.stdout, "out\n");
        assert_eq!(r.stderr, "err\n");
        assert_eq!(r.fault, None);
    }

    #[tokio::test]
    async fn test_zero_exit_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let r = run_command(&sh("pwd"), dir.path(), Duration::from_secs(10)).await;
        assert!(r.success);
        let reported = std::fs::canonicalize(r.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CommandLine {
            program: "definitely-not-a-test-runner".into(),
            args: vec![],
        };
        let r = run_command(&cmd, dir.path(), Duration::from_secs(5)).await;
        assert!(!r.success);
        assert_eq!(r.fault, Some(ExecutionFault::SpawnFailed));
        assert!(r.stderr.contains("definitely-not-a-test-runner"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let r = run_command(&sh("sleep 30"), dir.path(), Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(r.fault, Some(ExecutionFault::TimedOut { after_secs: 1 }));
        assert!(r.stderr.contains("timed out after 1s"));
    }
}
