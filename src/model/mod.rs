//! Domain records shared by the sync manager, execution engine and scheduler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::framework::Framework;

/// Row identifier used by every table.
pub type Id = i64;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:expr),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// A stored string did not map onto any known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Repositories and discovered tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    NotSynced,
    Error,
}

string_enum!(SyncStatus {
    Synced => "synced",
    NotSynced => "not_synced",
    Error => "error",
});

/// Hosting provider; decides where the token goes in the remote URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Github,
    Gitlab,
    Bitbucket,
    Generic,
}

string_enum!(Provider {
    Github => "github",
    Gitlab => "gitlab",
    Bitbucket => "bitbucket",
    Generic => "generic",
});

/// An external repository whose tests are mirrored into the catalog.
#[derive(Clone, Serialize)]
pub struct Repository {
    pub id: Id,
    pub project_id: Id,
    pub url: String,
    pub branch: String,
    pub provider: Provider,
    pub framework: Framework,
    pub tests_directory: String,
    pub local_checkout_path: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub sync_status: SyncStatus,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("url", &self.url)
            .field("branch", &self.branch)
            .field("provider", &self.provider)
            .field("framework", &self.framework)
            .field("tests_directory", &self.tests_directory)
            .field("local_checkout_path", &self.local_checkout_path)
            .field("has_token", &self.auth_token.is_some())
            .field("sync_status", &self.sync_status)
            .field("last_sync_time", &self.last_sync_time)
            .finish()
    }
}

/// Fields needed to register a repository.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRepository {
    pub project_id: Id,
    pub url: String,
    pub branch: String,
    pub provider: Provider,
    pub framework: Framework,
    pub tests_directory: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredTest {
    pub id: Id,
    pub repository_id: Id,
    pub name: String,
    pub relative_file_path: String,
    pub is_available: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
}

/// One write produced by reconciling a scan against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryChange {
    Insert {
        name: String,
        relative_file_path: String,
    },
    Update {
        id: Id,
        relative_file_path: String,
        is_available: bool,
    },
}

// ---------------------------------------------------------------------------
// Test cases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Manual,
    Automated,
}

string_enum!(TestType {
    Manual => "manual",
    Automated => "automated",
});

#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: Id,
    pub project_id: Id,
    pub folder_id: Option<Id>,
    pub title: String,
    pub test_type: TestType,
    /// Raw framework key; parsed lazily so a bad value fails only the run that uses it.
    pub framework: Option<String>,
    pub script_path: Option<String>,
    pub repository_id: Option<Id>,
    pub inline_code: Option<String>,
}

impl TestCase {
    /// Split `script_path` into the file and optional single test name (`file::name`).
    pub fn script_target(&self) -> Option<(&str, Option<&str>)> {
        let path = self.script_path.as_deref()?.trim();
        if path.is_empty() {
            return None;
        }
        match path.split_once("::") {
            Some((file, name)) if !name.is_empty() => Some((file, Some(name))),
            Some((file, _)) => Some((file, None)),
            None => Some((path, None)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTestCase {
    pub project_id: Id,
    #[serde(default)]
    pub folder_id: Option<Id>,
    pub title: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub repository_id: Option<Id>,
    #[serde(default)]
    pub inline_code: Option<String>,
    #[serde(default)]
    pub manual: bool,
}

// ---------------------------------------------------------------------------
// Runs and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

string_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Passed => "passed",
    Failed => "failed",
    Error => "error",
    Skipped => "skipped",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Passed | RunStatus::Failed | RunStatus::Error | RunStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRun {
    pub id: Id,
    pub test_case_id: Id,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub output_text: String,
    pub error_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Start,
    StepComplete,
    Warning,
    Error,
    Finish,
}

string_enum!(EventType {
    Start => "start",
    StepComplete => "step_complete",
    Warning => "warning",
    Error => "error",
    Finish => "finish",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

string_enum!(Severity {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
    Info => "info",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestEvent {
    pub id: Id,
    pub test_run_id: Id,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub description: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// An event not yet written to the audit trail.
#[derive(Debug, Clone)]
pub struct NewTestEvent {
    pub event_type: EventType,
    pub severity: Severity,
    pub description: String,
    pub details: serde_json::Value,
}

impl NewTestEvent {
    pub fn new(event_type: EventType, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            event_type,
            severity,
            description: description.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Point-in-time view of a run, served to observers that join late.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Id,
    pub test_case_id: Id,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_text: String,
    pub recent_events: Vec<TestEvent>,
}

// ---------------------------------------------------------------------------
// Scheduler events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

string_enum!(Recurrence {
    None => "none",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

impl Recurrence {
    /// Fixed-length interval; months are always 30 days.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => Some(Duration::days(1)),
            Recurrence::Weekly => Some(Duration::weeks(1)),
            Recurrence::Monthly => Some(Duration::days(30)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

string_enum!(ScheduleStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    RunTests,
    General,
}

string_enum!(ScheduleKind {
    RunTests => "run_tests",
    General => "general",
});

/// Which test cases a batch covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSelector {
    AllProjectTests,
    Folder(Id),
    TestCases(Vec<Id>),
}

impl TestSelector {
    pub fn is_empty(&self) -> bool {
        matches!(self, TestSelector::TestCases(ids) if ids.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerEvent {
    pub id: Id,
    pub project_id: Id,
    pub title: String,
    pub event_type: ScheduleKind,
    pub scheduled_time: DateTime<Utc>,
    pub recurrence: Recurrence,
    pub test_selector: Option<TestSelector>,
    pub status: ScheduleStatus,
    pub last_run_time: Option<DateTime<Utc>>,
    pub parent_event_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedulerEvent {
    pub project_id: Id,
    pub title: String,
    pub event_type: ScheduleKind,
    pub scheduled_time: DateTime<Utc>,
    pub recurrence: Recurrence,
    #[serde(default)]
    pub test_selector: Option<TestSelector>,
    #[serde(default)]
    pub parent_event_id: Option<Id>,
}
