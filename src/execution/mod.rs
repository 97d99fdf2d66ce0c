//! Test execution engine: drive one run through its lifecycle.
//!
//! ```text
//! pending --start--> running --adapter--> passed | failed | error
//! ```
//!
//! Each transition commits together with the event announcing it, and
//! observers are notified only after the commit. A run that is not pending
//! when [`Engine::execute_run`] is called is left alone, so the queue can
//! redeliver freely.

pub mod inline;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::framework::{ExecutionResult, Framework, TestExecutor, TestTarget};
use crate::model::{EventType, Id, NewTestEvent, RunStatus, Severity, TestCase, TestRun, TestType};
use crate::queue::{Job, QueueError, TaskSubmitter};
use crate::storage::{RunCompletion, Store, StoreError};

use self::inline::InlineScript;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Id },

    #[error("{0}")]
    Preparation(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ExecError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => ExecError::NotFound { entity, id },
            other => ExecError::Store(other),
        }
    }
}

/// Everything the adapter needs, resolved before the subprocess starts.
struct Prepared {
    framework: Framework,
    target: TestTarget,
    working_dir: PathBuf,
    discovered_test_id: Option<Id>,
    // Held so the inline script outlives the subprocess.
    _inline: Option<InlineScript>,
}

pub struct Engine {
    store: Store,
    executor: Arc<dyn TestExecutor>,
    broadcaster: Arc<Broadcaster>,
    submitter: Arc<dyn TaskSubmitter>,
}

impl Engine {
    pub fn new(
        store: Store,
        executor: Arc<dyn TestExecutor>,
        broadcaster: Arc<Broadcaster>,
        submitter: Arc<dyn TaskSubmitter>,
    ) -> Self {
        Self {
            store,
            executor,
            broadcaster,
            submitter,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a pending run for `test_case_id` and hand it to the queue.
    pub fn enqueue(&self, test_case_id: Id) -> Result<Id, ExecError> {
        let case = self.store.get_test_case(test_case_id)?;
        let run_id = self.store.create_pending_run(case.id, Utc::now())?;
        let handle = self.submitter.submit(Job::ExecuteSingleRun { run_id })?;
        info!(run_id, test_case_id, job_id = %handle.id, "run enqueued");
        Ok(run_id)
    }

    /// Create a pending run and execute it in the current task.
    pub async fn run_test_case(&self, case: &TestCase) -> Result<TestRun, ExecError> {
        let run_id = self.store.create_pending_run(case.id, Utc::now())?;
        self.execute_run(run_id).await?;
        Ok(self.store.get_run(run_id)?)
    }

    /// Execute a pending run to completion.
    ///
    /// Returns `false` without side effects when the run is no longer pending.
    pub async fn execute_run(&self, run_id: Id) -> Result<bool, ExecError> {
        let run = self.store.get_run(run_id)?;
        if run.status != RunStatus::Pending {
            debug!(run_id, status = %run.status, "run not pending, nothing to do");
            return Ok(false);
        }
        let case = self.store.get_test_case(run.test_case_id)?;

        let started_at = Utc::now();
        let start = NewTestEvent::new(EventType::Start, Severity::Info, "Test execution started")
            .with_details(json!({ "test_case_id": case.id, "title": case.title }));
        let start = match self.store.start_run(run_id, started_at, &start)? {
            Some(event) => event,
            None => {
                debug!(run_id, "run claimed by another worker");
                return Ok(false);
            }
        };
        self.broadcaster.publish_event(&start);
        info!(run_id, test_case_id = case.id, "run started");

        let prepared = match self.prepare(&case).await {
            Ok(p) => p,
            Err(e) => {
                let message = e.to_string();
                warn!(run_id, test_case_id = case.id, error = %message, "run preparation failed");
                self.finish(run_id, started_at, RunStatus::Error, "", &message, None, None, None)?;
                return Ok(true);
            }
        };

        let step = NewTestEvent::new(EventType::StepComplete, Severity::Info, "Environment prepared").with_details(json!({
            "framework": prepared.framework,
            "target": prepared.target.to_string(),
            "working_dir": prepared.working_dir.display().to_string(),
        }));
        let step = self.store.append_event(run_id, &step, Utc::now())?;
        self.broadcaster.publish_event(&step);

        let result = self
            .executor
            .execute(prepared.framework, &prepared.target, &prepared.working_dir)
            .await;
        let status = classify(&result);
        let error_text = error_text(status, &result);
        let report = prepared.framework.parse_report(&result.stdout);
        self.finish(
            run_id,
            started_at,
            status,
            &result.stdout,
            &error_text,
            Some(&result),
            report,
            prepared.discovered_test_id,
        )?;
        Ok(true)
    }

    /// Force a run that a crashed worker left behind into `error`.
    ///
    /// Returns `false` when the run already reached a terminal state.
    pub fn abort_run(&self, run_id: Id, reason: &str) -> Result<bool, ExecError> {
        let run = self.store.get_run(run_id)?;
        let started_at = match run.status {
            RunStatus::Pending => {
                let now = Utc::now();
                let start = NewTestEvent::new(EventType::Start, Severity::Info, "Test execution started");
                if self.store.start_run(run_id, now, &start)?.is_none() {
                    return Ok(false);
                }
                now
            }
            RunStatus::Running => run.started_at,
            _ => return Ok(false),
        };
        warn!(run_id, reason, "aborting run");
        self.finish(run_id, started_at, RunStatus::Error, "", reason, None, None, None)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        run_id: Id,
        started_at: DateTime<Utc>,
        status: RunStatus,
        stdout: &str,
        error_text: &str,
        result: Option<&ExecutionResult>,
        report: Option<serde_json::Value>,
        discovered_test_id: Option<Id>,
    ) -> Result<bool, ExecError> {
        let finished_at = Utc::now().max(started_at);
        let duration = (finished_at - started_at).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;

        let mut events = Vec::with_capacity(2);
        if status == RunStatus::Error {
            let headline = error_text.lines().last().unwrap_or(error_text).to_string();
            events.push(NewTestEvent::new(EventType::Error, Severity::Critical, headline));
        }
        let severity = match status {
            RunStatus::Passed => Severity::Info,
            RunStatus::Failed => Severity::High,
            _ => Severity::Critical,
        };
        let mut details = json!({
            "status": status,
            "stdout": stdout,
            "stderr": result.map(|r| r.stderr.as_str()).unwrap_or(error_text),
            "exit_code": result.and_then(|r| r.exit_code),
            "duration_seconds": duration,
        });
        if let Some(report) = report {
            details["report"] = report;
        }
        events.push(
            NewTestEvent::new(EventType::Finish, severity, format!("Test execution finished: {}", status))
                .with_details(details),
        );

        let completion = RunCompletion {
            status,
            finished_at,
            output_text: stdout.to_string(),
            error_text: error_text.to_string(),
        };
        let recorded = match self.store.finish_run(run_id, &completion, &events)? {
            Some(recorded) => recorded,
            None => {
                warn!(run_id, "run left running state before it could be finished");
                return Ok(false);
            }
        };

        if let Some(id) = discovered_test_id {
            self.store.record_discovered_test_run(id, finished_at, status)?;
        }

        for event in &recorded {
            self.broadcaster.publish_event(event);
        }
        let snapshot = self.store.current_status(run_id)?;
        self.broadcaster.publish_status(&snapshot);
        info!(run_id, status = %status, duration_seconds = duration, "run finished");
        Ok(true)
    }

    async fn prepare(&self, case: &TestCase) -> Result<Prepared, ExecError> {
        if case.test_type == TestType::Manual {
            return Err(ExecError::Preparation(format!(
                "test case {} is manual and cannot be executed",
                case.id
            )));
        }

        if let Some(code) = case.inline_code.as_deref().filter(|c| !c.trim().is_empty()) {
            let framework = match case.framework.as_deref() {
                Some(key) => parse_framework(key)?,
                None => Framework::Pytest,
            };
            let script = InlineScript::write(framework, code)
                .map_err(|e| ExecError::Preparation(format!("could not write inline script: {}", e)))?;
            return Ok(Prepared {
                framework,
                target: TestTarget::file(script.file_name()),
                working_dir: script.dir().to_path_buf(),
                discovered_test_id: None,
                _inline: Some(script),
            });
        }

        let (file, name) = case.script_target().ok_or_else(|| {
            ExecError::Preparation(format!("test case {} has neither a script path nor inline code", case.id))
        })?;
        let repository_id = case.repository_id.ok_or_else(|| {
            ExecError::Preparation(format!("test case {} has a script path but no repository", case.id))
        })?;
        let repo = self.store.get_repository(repository_id)?;
        let framework = match case.framework.as_deref() {
            Some(key) => parse_framework(key)?,
            None => repo.framework,
        };

        let checkout = repo
            .local_checkout_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| ExecError::Preparation(format!("repository {} has no local checkout; sync it first", repo.id)))?;
        if !tokio::fs::try_exists(&checkout).await.unwrap_or(false) {
            return Err(ExecError::Preparation(format!(
                "local checkout {} does not exist",
                checkout.display()
            )));
        }
        if !tokio::fs::try_exists(checkout.join(file)).await.unwrap_or(false) {
            return Err(ExecError::Preparation(format!(
                "script {} not found in {}",
                file,
                checkout.display()
            )));
        }

        let discovered_test_id = self
            .store
            .find_discovered_test(repo.id, file, name)?
            .map(|t| t.id);
        let target = match name {
            Some(name) => TestTarget::named(file, name),
            None => TestTarget::file(file),
        };
        Ok(Prepared {
            framework,
            target,
            working_dir: checkout,
            discovered_test_id,
            _inline: None,
        })
    }
}

fn parse_framework(key: &str) -> Result<Framework, ExecError> {
    key.parse::<Framework>()
        .map_err(|e| ExecError::Preparation(e.to_string()))
}

/// Map an adapter result to the run's terminal status.
pub fn classify(result: &ExecutionResult) -> RunStatus {
    if result.fault.is_some() {
        RunStatus::Error
    } else if result.success {
        RunStatus::Passed
    } else {
        RunStatus::Failed
    }
}

fn error_text(status: RunStatus, result: &ExecutionResult) -> String {
    let stderr = result.stderr.trim_end();
    if status == RunStatus::Passed || !stderr.is_empty() {
        return result.stderr.clone();
    }
    match result.exit_code {
        Some(code) => format!("exited with status {}", code),
        None => "terminated without an exit status".to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::FakeExecutor;
    use super::*;
    use crate::model::{NewRepository, NewTestCase, Provider};
    use crate::queue::RecordingSubmitter;
    use crate::storage::testutil::temp_store;

    struct Harness {
        _dir: tempfile::TempDir,
        checkout: PathBuf,
        store: Store,
        executor: Arc<FakeExecutor>,
        broadcaster: Arc<Broadcaster>,
        submitter: Arc<RecordingSubmitter>,
        engine: Engine,
        project: Id,
        repo: Id,
    }

    fn harness() -> Harness {
        let (dir, store) = temp_store();
        let checkout = dir.path().join("checkout");
        std::fs::create_dir_all(checkout.join("tests")).unwrap();
        std::fs::write(checkout.join("tests/test_login.py"), "def test_login():\n    pass\n").unwrap();

        let project = store.create_project("p").unwrap();
        let repo = store
            .create_repository(&NewRepository {
                project_id: project,
                url: "https://github.com/acme/t.git".into(),
                branch: "main".into(),
                provider: Provider::Github,
                framework: Framework::Pytest,
                tests_directory: "tests".into(),
                username: None,
                auth_token: None,
            })
            .unwrap();
        store
            .mark_repository_synced(repo, checkout.to_str().unwrap(), Utc::now())
            .unwrap();

        let executor = Arc::new(FakeExecutor::default());
        let broadcaster = Arc::new(Broadcaster::new());
        let submitter = Arc::new(RecordingSubmitter::default());
        let engine = Engine::new(store.clone(), executor.clone(), broadcaster.clone(), submitter.clone());
        Harness {
            _dir: dir,
            checkout,
            store,
            executor,
            broadcaster,
            submitter,
            engine,
            project,
            repo,
        }
    }

    fn script_case(h: &Harness, script_path: &str) -> Id {
        h.store
            .create_test_case(&NewTestCase {
                project_id: h.project,
                title: script_path.into(),
                script_path: Some(script_path.into()),
                repository_id: Some(h.repo),
                ..Default::default()
            })
            .unwrap()
    }

    fn event_types(store: &Store, run_id: Id) -> Vec<EventType> {
        store.list_events(run_id).unwrap().iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_passing_run_lifecycle() {
        let h = harness();
        let case_id = script_case(&h, "tests/test_login.py::test_login");
        let run_id = h.engine.enqueue(case_id).unwrap();
        assert_eq!(h.submitter.jobs(), vec![Job::ExecuteSingleRun { run_id }]);
        assert_eq!(h.store.get_run(run_id).unwrap().status, RunStatus::Pending);

        let mut rx = h.broadcaster.subscribe(run_id);
        assert!(h.engine.execute_run(run_id).await.unwrap());

        let run = h.store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.output_text, "1 passed");
        let finished = run.finished_at.unwrap();
        assert!(finished >= run.started_at);
        let expected = (finished - run.started_at).num_microseconds().unwrap() as f64 / 1e6;
        assert!((run.duration_seconds.unwrap() - expected).abs() < 1e-6);
        assert_eq!(
            event_types(&h.store, run_id),
            vec![EventType::Start, EventType::StepComplete, EventType::Finish]
        );

        let calls = h.executor.calls.lock().unwrap();
        assert_eq!(calls[0].0, Framework::Pytest);
        assert_eq!(calls[0].1, "tests/test_login.py::test_login");
        assert_eq!(calls[0].2, h.checkout);
        drop(calls);

        // Every committed event, then the terminal status snapshot.
        let messages: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].data["type"], "start");
        assert_eq!(messages[2].data["type"], "finish");
        assert_eq!(messages[3].kind, crate::broadcast::MessageKind::Status);
        assert_eq!(messages[3].data["status"], "passed");
    }

    #[tokio::test]
    async fn test_failed_run_has_error_text() {
        let h = harness();
        h.executor.script(
            "tests/test_login.py",
            ExecutionResult::completed(Some(1), "1 failed".into(), String::new()),
        );
        let case = h.store.get_test_case(script_case(&h, "tests/test_login.py")).unwrap();
        let run = h.engine.run_test_case(&case).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_text, "exited with status 1");
        let finish = h.store.list_events(run.id).unwrap().pop().unwrap();
        assert_eq!(finish.severity, Severity::High);
        assert_eq!(finish.details["stdout"], "1 failed");
    }

    fn playwright_case(h: &Harness) -> Id {
        h.store
            .create_test_case(&NewTestCase {
                project_id: h.project,
                title: "login spec".into(),
                script_path: Some("tests/test_login.py".into()),
                repository_id: Some(h.repo),
                framework: Some("playwright".into()),
                ..Default::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_json_report_lands_in_finish_details() {
        let h = harness();
        h.executor.script(
            "tests/test_login.py",
            ExecutionResult::completed(
                Some(0),
                r#"{"stats":{"expected":1,"unexpected":0},"suites":[]}"#.into(),
                String::new(),
            ),
        );
        let case = h.store.get_test_case(playwright_case(&h)).unwrap();
        let run = h.engine.run_test_case(&case).await.unwrap();
        assert_eq!(run.status, RunStatus::Passed);

        let finish = h.store.list_events(run.id).unwrap().pop().unwrap();
        assert_eq!(finish.details["report"]["stats"]["expected"], 1);
        assert_eq!(h.executor.calls.lock().unwrap()[0].0, Framework::Playwright);
    }

    #[tokio::test]
    async fn test_unparsable_report_keeps_raw_stdout() {
        let h = harness();
        h.executor.script(
            "tests/test_login.py",
            ExecutionResult::completed(Some(1), "Error: browser missing".into(), String::new()),
        );
        let case = h.store.get_test_case(playwright_case(&h)).unwrap();
        let run = h.engine.run_test_case(&case).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let finish = h.store.list_events(run.id).unwrap().pop().unwrap();
        assert!(finish.details.get("report").is_none());
        assert_eq!(finish.details["stdout"], "Error: browser missing");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let h = harness();
        h.executor
            .script("tests/test_login.py", ExecutionResult::spawn_failed("failed to execute pytest: No such file"));
        let case = h.store.get_test_case(script_case(&h, "tests/test_login.py")).unwrap();
        let run = h.engine.run_test_case(&case).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error_text.contains("failed to execute pytest"));
        assert_eq!(
            event_types(&h.store, run.id),
            vec![EventType::Start, EventType::StepComplete, EventType::Error, EventType::Finish]
        );
    }

    #[tokio::test]
    async fn test_missing_script_is_preparation_error() {
        let h = harness();
        let case = h.store.get_test_case(script_case(&h, "tests/test_gone.py")).unwrap();
        let run = h.engine.run_test_case(&case).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error_text.contains("tests/test_gone.py not found"));
        assert_eq!(
            event_types(&h.store, run.id),
            vec![EventType::Start, EventType::Error, EventType::Finish]
        );
        assert!(h.executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_framework_is_preparation_error() {
        let h = harness();
        let id = h
            .store
            .create_test_case(&NewTestCase {
                project_id: h.project,
                title: "jest".into(),
                framework: Some("jest".into()),
                inline_code: Some("test('x', () => {})".into()),
                ..Default::default()
            })
            .unwrap();
        let run = h.engine.run_test_case(&h.store.get_test_case(id).unwrap()).await.unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_text, "test framework 'jest' is not supported");
    }

    #[tokio::test]
    async fn test_inline_code_runs_from_temp_file() {
        let h = harness();
        let id = h
            .store
            .create_test_case(&NewTestCase {
                project_id: h.project,
                title: "inline".into(),
                inline_code: Some("def test_ok():\n    assert True\n".into()),
                ..Default::default()
            })
            .unwrap();
        let run = h.engine.run_test_case(&h.store.get_test_case(id).unwrap()).await.unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        let calls = h.executor.calls.lock().unwrap();
        assert_eq!(calls[0].1, "test_inline.py");
        // The temp dir is gone once the run finished.
        assert!(!calls[0].2.exists());
    }

    #[tokio::test]
    async fn test_reexecuting_terminal_run_is_noop() {
        let h = harness();
        let run_id = h.engine.enqueue(script_case(&h, "tests/test_login.py")).unwrap();
        assert!(h.engine.execute_run(run_id).await.unwrap());
        let before = h.store.list_events(run_id).unwrap();
        let run_before = h.store.get_run(run_id).unwrap();

        assert!(!h.engine.execute_run(run_id).await.unwrap());
        assert!(!h.engine.execute_run(run_id).await.unwrap());
        assert_eq!(h.store.list_events(run_id).unwrap(), before);
        assert_eq!(h.store.get_run(run_id).unwrap().finished_at, run_before.finished_at);
        assert_eq!(h.executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discovered_test_gets_last_status() {
        let h = harness();
        h.store
            .apply_discovery(
                h.repo,
                &[crate::model::DiscoveryChange::Insert {
                    name: "test_login".into(),
                    relative_file_path: "tests/test_login.py".into(),
                }],
            )
            .unwrap();
        let case = h
            .store
            .get_test_case(script_case(&h, "tests/test_login.py::test_login"))
            .unwrap();
        h.engine.run_test_case(&case).await.unwrap();
        let discovered = h.store.list_discovered_tests(h.repo).unwrap();
        assert_eq!(discovered[0].last_status, Some(RunStatus::Passed));
        assert!(discovered[0].last_run_time.is_some());
    }

    #[test]
    fn test_abort_pending_run() {
        let h = harness();
        let case_id = script_case(&h, "tests/test_login.py");
        let run_id = h.store.create_pending_run(case_id, Utc::now()).unwrap();
        assert!(h.engine.abort_run(run_id, "worker panicked").unwrap());
        let run = h.store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_text, "worker panicked");
        assert!(!h.engine.abort_run(run_id, "again").unwrap());
    }

    #[test]
    fn test_enqueue_unknown_case() {
        let h = harness();
        assert!(matches!(h.engine.enqueue(999), Err(ExecError::NotFound { entity: "test case", id: 999 })));
    }
}
