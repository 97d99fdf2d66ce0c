use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::due;
use super::ScheduleError;
use crate::batch::{BatchResult, BatchRunner};
use crate::model::{Id, NewSchedulerEvent, ScheduleKind, ScheduleStatus, SchedulerEvent};
use crate::queue::{Job, JobHandle, TaskSubmitter};
use crate::storage::Store;

/// What happened to one event during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub event_id: Id,
    pub status: ScheduleStatus,
    pub successor_id: Option<Id>,
    pub results: Vec<BatchResult>,
    pub error: Option<String>,
}

/// Finds due scheduler events and runs their test batches.
pub struct Scheduler {
    store: Store,
    batch: Arc<BatchRunner>,
    submitter: Arc<dyn TaskSubmitter>,
    // Serialises passes and manual batch runs.
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Store, batch: Arc<BatchRunner>, submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self {
            store,
            batch,
            submitter,
            pass_lock: Mutex::new(()),
        }
    }

    /// Validate and store a new event.
    pub fn add_event(&self, event: &NewSchedulerEvent) -> Result<Id, ScheduleError> {
        if event.title.trim().is_empty() {
            return Err(ScheduleError::Invalid("title must not be empty".into()));
        }
        if event.event_type == ScheduleKind::RunTests {
            match &event.test_selector {
                None => return Err(ScheduleError::Invalid("run_tests events need a test selector".into())),
                Some(selector) if selector.is_empty() => {
                    return Err(ScheduleError::Invalid("test selector lists no test cases".into()))
                }
                Some(_) => {}
            }
        }
        let id = self.store.create_scheduler_event(event, Utc::now())?;
        info!(event_id = id, title = %event.title, recurrence = %event.recurrence, "scheduler event added");
        Ok(id)
    }

    /// Queue a manual "run now" for an existing event.
    pub fn trigger(&self, event_id: Id) -> Result<JobHandle, ScheduleError> {
        self.store.get_scheduler_event(event_id)?;
        Ok(self.submitter.submit(Job::RunScheduledBatch { schedule_id: event_id })?)
    }

    /// Firings expected within the next `hours`.
    pub fn preview(&self, now: DateTime<Utc>, hours: u64) -> Result<Vec<due::Occurrence>, ScheduleError> {
        let window = chrono::Duration::hours(hours.min(24 * 366) as i64);
        let candidates = self.store.due_candidates(now + window)?;
        Ok(due::preview(&candidates, now, window))
    }

    /// Run every event due at `now`, one after another.
    ///
    /// A failure while processing one event marks it `failed` and the pass
    /// moves on. Only failing to list the due events aborts the pass.
    pub async fn process_due_events(&self, now: DateTime<Utc>) -> Result<Vec<EventOutcome>, ScheduleError> {
        let _pass = self.pass_lock.lock().await;
        let due = due::due_events(self.store.due_candidates(now)?, now);
        if !due.is_empty() {
            info!(count = due.len(), "processing due scheduler events");
        }

        let mut outcomes = Vec::with_capacity(due.len());
        for event in due {
            if let Some(outcome) = self.process_isolated(&event, now).await {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Release events a previous process left `running`.
    ///
    /// Each is marked `failed` and, when recurring, gets its successor so the
    /// chain carries on. Call before the first pass.
    pub async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<EventOutcome>, ScheduleError> {
        let _pass = self.pass_lock.lock().await;
        let stranded = self.store.scheduler_events_with_status(ScheduleStatus::Running)?;
        let mut outcomes = Vec::with_capacity(stranded.len());
        for event in stranded {
            let next = due::successor(&event);
            let successor_id =
                self.store
                    .complete_scheduler_event(event.id, ScheduleStatus::Failed, now, next.as_ref(), Utc::now())?;
            warn!(event_id = event.id, successor_id = ?successor_id, "recovered scheduler event interrupted mid-run");
            outcomes.push(EventOutcome {
                event_id: event.id,
                status: ScheduleStatus::Failed,
                successor_id,
                results: Vec::new(),
                error: Some("interrupted before completion".into()),
            });
        }
        Ok(outcomes)
    }

    /// Run one event's batch regardless of its due time.
    pub async fn run_scheduled_batch(&self, event_id: Id) -> Result<Option<EventOutcome>, ScheduleError> {
        let _pass = self.pass_lock.lock().await;
        let event = self.store.get_scheduler_event(event_id)?;
        Ok(self.process_isolated(&event, Utc::now()).await)
    }

    async fn process_isolated(&self, event: &SchedulerEvent, now: DateTime<Utc>) -> Option<EventOutcome> {
        match self.store.claim_scheduler_event(event.id) {
            Ok(true) => {}
            Ok(false) => {
                warn!(event_id = event.id, "scheduler event already running, skipped");
                return None;
            }
            Err(e) => {
                error!(event_id = event.id, error = %e, "could not claim scheduler event");
                return None;
            }
        }

        let attempt = AssertUnwindSafe(self.execute_event(event)).catch_unwind().await;
        let (status, results, error) = match attempt {
            Ok(Ok((status, results))) => (status, results, None),
            Ok(Err(e)) => (ScheduleStatus::Failed, Vec::new(), Some(e.to_string())),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                (ScheduleStatus::Failed, Vec::new(), Some(format!("scheduler pass panicked: {}", detail)))
            }
        };
        if let Some(e) = &error {
            error!(event_id = event.id, error = %e, "scheduler event failed");
        }

        // A failed run still extends the chain.
        let next = due::successor(event);
        let successor_id = match self
            .store
            .complete_scheduler_event(event.id, status, now, next.as_ref(), Utc::now())
        {
            Ok(id) => id,
            Err(e) => {
                error!(event_id = event.id, error = %e, "could not record scheduler event outcome");
                if let Err(e) = self.store.set_scheduler_event_status(event.id, ScheduleStatus::Failed) {
                    error!(event_id = event.id, error = %e, "could not release scheduler event");
                }
                None
            }
        };

        info!(
            event_id = event.id,
            status = %status,
            tests = results.len(),
            successor_id = ?successor_id,
            "scheduler event processed"
        );
        Some(EventOutcome {
            event_id: event.id,
            status,
            successor_id,
            results,
            error,
        })
    }

    async fn execute_event(&self, event: &SchedulerEvent) -> Result<(ScheduleStatus, Vec<BatchResult>), ScheduleError> {
        if event.event_type == ScheduleKind::General {
            return Ok((ScheduleStatus::Completed, Vec::new()));
        }
        let selector = event
            .test_selector
            .as_ref()
            .ok_or_else(|| ScheduleError::Invalid(format!("event {} has no test selector", event.id)))?;
        let cases = self.batch.resolve(event.project_id, selector)?;
        let results = self.batch.run_many(cases).await;
        let status = if results.iter().all(|r| r.result.success) {
            ScheduleStatus::Completed
        } else {
            ScheduleStatus::Failed
        };
        Ok((status, results))
    }
}

/// Poll for due events every `poll_interval`.
///
/// Each pass runs to completion before the next tick is taken; ticks missed
/// meanwhile are skipped rather than replayed.
pub async fn run_scheduler_loop(scheduler: Arc<Scheduler>, poll_interval: Duration) {
    info!(poll_secs = poll_interval.as_secs(), "scheduler loop started");
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        match scheduler.process_due_events(Utc::now()).await {
            Ok(outcomes) => {
                for outcome in outcomes.iter().filter(|o| o.status == ScheduleStatus::Failed) {
                    warn!(event_id = outcome.event_id, "scheduled batch failed");
                }
            }
            Err(e) => error!(error = %e, "failed to process due scheduler events"),
        }
    }
}
