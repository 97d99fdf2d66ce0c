//! Framework adapters: one variant per supported external test runner.
//!
//! Each variant knows how to recognise its test files, extract test
//! identifiers from them, and build the command line that runs a single
//! test. Execution itself goes through [`TestExecutor`] so the engine can
//! be driven by a real subprocess or a scripted fake.

pub mod command;
pub mod discovery;
pub mod report;
pub mod subprocess;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub use self::subprocess::SubprocessExecutor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameworkError {
    #[error("test framework '{0}' is not supported")]
    NotSupported(String),
}

/// Supported test frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Pytest,
    Unittest,
    Robot,
    Cypress,
    Playwright,
}

impl Framework {
    /// Every variant, in registration order.
    pub const ALL: [Framework; 5] = [
        Framework::Pytest,
        Framework::Unittest,
        Framework::Robot,
        Framework::Cypress,
        Framework::Playwright,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Pytest => "pytest",
            Framework::Unittest => "unittest",
            Framework::Robot => "robot",
            Framework::Cypress => "cypress",
            Framework::Playwright => "playwright",
        }
    }

    /// Whether test files of this framework are Python sources.
    pub fn is_python(&self) -> bool {
        matches!(self, Framework::Pytest | Framework::Unittest)
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Framework::ALL
            .into_iter()
            .find(|f| f.as_str() == key)
            .ok_or_else(|| FrameworkError::NotSupported(s.to_string()))
    }
}

/// One test to run: a file relative to the working directory, optionally
/// narrowed to a single named test inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub file: PathBuf,
    pub name: Option<String>,
}

impl TestTarget {
    pub fn file(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            name: None,
        }
    }

    pub fn named(file: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for TestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}::{}", self.file.display(), name),
            None => write!(f, "{}", self.file.display()),
        }
    }
}

/// Why an execution produced no verdict from the test itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFault {
    /// The runner binary could not be started.
    SpawnFailed,
    /// The wall-clock limit expired and the child was killed.
    TimedOut { after_secs: u64 },
}

/// Outcome of one adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub fault: Option<ExecutionFault>,
}

impl ExecutionResult {
    pub fn completed(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            success: exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            fault: None,
        }
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            fault: Some(ExecutionFault::SpawnFailed),
        }
    }

    pub fn timed_out(after_secs: u64, stdout: String, stderr: String) -> Self {
        let mut stderr = stderr;
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("timed out after {}s", after_secs));
        Self {
            success: false,
            stdout,
            stderr,
            exit_code: None,
            fault: Some(ExecutionFault::TimedOut { after_secs }),
        }
    }
}

/// Runs one test for a framework inside a working directory.
///
/// Implementations must not fail: spawn errors and timeouts are folded into
/// the returned [`ExecutionResult`].
#[async_trait::async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(
        &self,
        framework: Framework,
        target: &TestTarget,
        working_dir: &Path,
    ) -> ExecutionResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_frameworks() {
        assert_eq!("pytest".parse::<Framework>().unwrap(), Framework::Pytest);
        assert_eq!(" Robot ".parse::<Framework>().unwrap(), Framework::Robot);
        assert_eq!("playwright".parse::<Framework>().unwrap(), Framework::Playwright);
    }

    #[test]
    fn test_unknown_framework_is_not_supported() {
        let err = "jest".parse::<Framework>().unwrap_err();
        assert_eq!(err, FrameworkError::NotSupported("jest".into()));
        assert_eq!(err.to_string(), "test framework 'jest' is not supported");
    }

    #[test]
    fn test_exit_code_decides_success() {
        assert!(ExecutionResult::completed(Some(0), String::new(), String::new()).success);
        assert!(!ExecutionResult::completed(Some(1), String::new(), String::new()).success);
        assert!(!ExecutionResult::completed(None, String::new(), String::new()).success);
    }

    #[test]
    fn test_timeout_message_appended_to_stderr() {
        let r = ExecutionResult::timed_out(30, "partial".into(), "warn".into());
        assert_eq!(r.stderr, "warn\ntimed out after 30s");
        assert_eq!(r.fault, Some(ExecutionFault::TimedOut { after_secs: 30 }));
        assert!(!r.success);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(TestTarget::named("tests/test_a.py", "test_x").to_string(), "tests/test_a.py::test_x");
        assert_eq!(TestTarget::file("suite.robot").to_string(), "suite.robot");
    }
}
