//! Bounded-concurrency batch runs with per-test fault isolation.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{error, info};

use crate::execution::Engine;
use crate::model::{Id, RunStatus, TestCase, TestSelector};
use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("selector {0:?} matched no automated test cases")]
    Empty(TestSelector),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-test outcome inside a batch.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub success: bool,
    pub run_id: Option<Id>,
    pub status: Option<RunStatus>,
    pub error: Option<String>,
}

impl CaseResult {
    fn failed(run_id: Option<Id>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            run_id,
            status: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub test_case: TestCase,
    pub result: CaseResult,
}

pub struct BatchRunner {
    engine: Arc<Engine>,
    max_concurrency: usize,
}

impl BatchRunner {
    pub fn new(engine: Arc<Engine>, max_concurrency: usize) -> Self {
        Self {
            engine,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Resolve a selector to concrete automated cases. An empty set is an error.
    pub fn resolve(&self, project_id: Id, selector: &TestSelector) -> Result<Vec<TestCase>, SelectionError> {
        resolve(self.engine.store(), project_id, selector)
    }

    /// Run every case and return one result per case, in input order.
    ///
    /// At most `max_concurrency` cases execute at once. A failure or panic in
    /// one case becomes that case's result and never cancels the others.
    pub async fn run_many(&self, cases: Vec<TestCase>) -> Vec<BatchResult> {
        let total = cases.len();
        info!(total, max_concurrency = self.max_concurrency, "batch started");
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let store = self.engine.store();

        let mut pending = Vec::with_capacity(total);
        for case in cases {
            let run_id = match store.create_pending_run(case.id, Utc::now()) {
                Ok(id) => id,
                Err(e) => {
                    pending.push((case, None, Err(e.to_string())));
                    continue;
                }
            };
            let engine = self.engine.clone();
            let slots = slots.clone();
            let handle = tokio::spawn(async move {
                let _permit = slots.acquire_owned().await.ok();
                engine.execute_run(run_id).await
            });
            pending.push((case, Some(run_id), Ok(handle)));
        }

        let mut results = Vec::with_capacity(total);
        for (case, run_id, spawned) in pending {
            let result = match (run_id, spawned) {
                (Some(run_id), Ok(handle)) => match handle.await {
                    Ok(Ok(_)) => self.outcome(run_id),
                    Ok(Err(e)) => {
                        error!(test_case_id = case.id, run_id, error = %e, "test execution failed");
                        self.abandon(run_id, &e.to_string());
                        CaseResult::failed(Some(run_id), e.to_string())
                    }
                    Err(join) => {
                        let message = panic_message(join);
                        error!(test_case_id = case.id, run_id, error = %message, "test execution panicked");
                        self.abandon(run_id, &message);
                        CaseResult::failed(Some(run_id), message)
                    }
                },
                (run_id, Err(message)) => CaseResult::failed(run_id, message),
                (None, Ok(_)) => CaseResult::failed(None, "run was not created"),
            };
            results.push(BatchResult { test_case: case, result });
        }

        let passed = results.iter().filter(|r| r.result.success).count();
        info!(total, passed, failed = total - passed, "batch finished");
        results
    }

    fn outcome(&self, run_id: Id) -> CaseResult {
        match self.engine.store().get_run(run_id) {
            Ok(run) => CaseResult {
                success: run.status == RunStatus::Passed,
                run_id: Some(run_id),
                status: Some(run.status),
                error: (run.status != RunStatus::Passed && !run.error_text.is_empty()).then(|| run.error_text.clone()),
            },
            Err(e) => CaseResult::failed(Some(run_id), e.to_string()),
        }
    }

    /// Make sure a run whose worker died does not stay `running`.
    fn abandon(&self, run_id: Id, reason: &str) {
        if let Err(e) = self.engine.abort_run(run_id, reason) {
            error!(run_id, error = %e, "could not mark abandoned run as error");
        }
    }
}

pub fn resolve(store: &Store, project_id: Id, selector: &TestSelector) -> Result<Vec<TestCase>, SelectionError> {
    let cases = match selector {
        TestSelector::AllProjectTests => store.automated_cases_in_project(project_id)?,
        TestSelector::Folder(folder_id) => store.automated_cases_in_folder_tree(project_id, *folder_id)?,
        TestSelector::TestCases(ids) => store.automated_cases_by_ids(ids)?,
    };
    if cases.is_empty() {
        return Err(SelectionError::Empty(selector.clone()));
    }
    Ok(cases)
}

pub(crate) fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "test execution was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("test execution panicked: {}", detail)
}
