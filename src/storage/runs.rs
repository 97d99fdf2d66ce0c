//! Test runs and their append-only event trail.
//!
//! Status transitions are guarded in SQL (`WHERE status = ...`) so a run can
//! only move `pending -> running -> terminal`, and each transition commits
//! together with the event that announces it. Transitions open with
//! `BEGIN IMMEDIATE` so concurrent writers queue on `busy_timeout`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{enum_col, fmt_ts, json_col, opt_ts_col, ts_col, Store, StoreError, StoreResult};
use crate::model::{Id, NewTestEvent, RunSnapshot, RunStatus, TestEvent, TestRun};

const RUN_COLUMNS: &str =
    "id, test_case_id, status, started_at, finished_at, duration_seconds, output_text, error_text";

const EVENT_COLUMNS: &str = "id, test_run_id, event_type, severity, description, details_json, timestamp";

/// Number of events included in a status snapshot.
const SNAPSHOT_EVENTS: usize = 5;

/// Terminal outcome written by [`Store::finish_run`].
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub output_text: String,
    pub error_text: String,
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    Ok(TestRun {
        id: row.get(0)?,
        test_case_id: row.get(1)?,
        status: enum_col(row, 2)?,
        started_at: ts_col(row, 3)?,
        finished_at: opt_ts_col(row, 4)?,
        duration_seconds: row.get(5)?,
        output_text: row.get(6)?,
        error_text: row.get(7)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<TestEvent> {
    Ok(TestEvent {
        id: row.get(0)?,
        test_run_id: row.get(1)?,
        event_type: enum_col(row, 2)?,
        severity: enum_col(row, 3)?,
        description: row.get(4)?,
        details: json_col(row, 5)?,
        timestamp: ts_col(row, 6)?,
    })
}

fn insert_event(
    conn: &Connection,
    run_id: Id,
    event: &NewTestEvent,
    at: DateTime<Utc>,
) -> StoreResult<TestEvent> {
    let details_json = serde_json::to_string(&event.details)
        .map_err(|e| StoreError::Corrupt(format!("event details not serializable: {}", e)))?;
    conn.execute(
        "INSERT INTO test_events (test_run_id, event_type, severity, description, details_json, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            event.event_type.as_str(),
            event.severity.as_str(),
            event.description,
            details_json,
            fmt_ts(&at),
        ],
    )?;
    Ok(TestEvent {
        id: conn.last_insert_rowid(),
        test_run_id: run_id,
        event_type: event.event_type,
        severity: event.severity,
        description: event.description.clone(),
        details: event.details.clone(),
        timestamp: at,
    })
}

impl Store {
    pub fn create_pending_run(&self, test_case_id: Id, at: DateTime<Utc>) -> StoreResult<Id> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO test_runs (test_case_id, status, started_at) VALUES (?1, ?2, ?3)",
            params![test_case_id, RunStatus::Pending.as_str(), fmt_ts(&at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, id: Id) -> StoreResult<TestRun> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM test_runs WHERE id = ?1", RUN_COLUMNS),
            params![id],
            run_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound { entity: "test run", id })
    }

    pub fn list_runs_for_case(&self, test_case_id: Id) -> StoreResult<Vec<TestRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_runs WHERE test_case_id = ?1 ORDER BY id",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![test_case_id], run_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Move a pending run to `running` and record its start event.
    ///
    /// Returns `None` (and writes nothing) when the run is not pending.
    pub fn start_run(&self, id: Id, at: DateTime<Utc>, event: &NewTestEvent) -> StoreResult<Option<TestEvent>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE test_runs SET status = ?2, started_at = ?3 WHERE id = ?1 AND status = ?4",
            params![id, RunStatus::Running.as_str(), fmt_ts(&at), RunStatus::Pending.as_str()],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let recorded = insert_event(&tx, id, event, at)?;
        tx.commit()?;
        Ok(Some(recorded))
    }

    /// Move a running run to a terminal status and append `events`, atomically.
    ///
    /// `finished_at` is clamped to `started_at` and the duration is derived
    /// unless one was already stored. Returns `None` when the run was not
    /// running, leaving it untouched.
    pub fn finish_run(
        &self,
        id: Id,
        completion: &RunCompletion,
        events: &[NewTestEvent],
    ) -> StoreResult<Option<Vec<TestEvent>>> {
        debug_assert!(completion.status.is_terminal());
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM test_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                run_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "test run", id })?;
        if current.status != RunStatus::Running {
            return Ok(None);
        }

        let finished_at = completion.finished_at.max(current.started_at);
        let duration = current.duration_seconds.unwrap_or_else(|| {
            (finished_at - current.started_at).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
        });

        tx.execute(
            "UPDATE test_runs
             SET status = ?2, finished_at = ?3, duration_seconds = ?4, output_text = ?5, error_text = ?6
             WHERE id = ?1 AND status = ?7",
            params![
                id,
                completion.status.as_str(),
                fmt_ts(&finished_at),
                duration,
                completion.output_text,
                completion.error_text,
                RunStatus::Running.as_str(),
            ],
        )?;

        let mut recorded = Vec::with_capacity(events.len());
        for event in events {
            recorded.push(insert_event(&tx, id, event, finished_at)?);
        }
        tx.commit()?;
        Ok(Some(recorded))
    }

    /// Runs still `pending` or `running`, oldest first.
    pub fn unfinished_runs(&self) -> StoreResult<Vec<TestRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_runs WHERE status IN (?1, ?2) ORDER BY id",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![RunStatus::Pending.as_str(), RunStatus::Running.as_str()],
            run_from_row,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Mark a pending run skipped without executing it.
    pub fn skip_run(&self, id: Id, reason: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE test_runs SET status = ?2, finished_at = ?3, duration_seconds = 0, error_text = ?4
             WHERE id = ?1 AND status = ?5",
            params![id, RunStatus::Skipped.as_str(), fmt_ts(&at), reason, RunStatus::Pending.as_str()],
        )?;
        Ok(changed == 1)
    }

    pub fn append_event(&self, run_id: Id, event: &NewTestEvent, at: DateTime<Utc>) -> StoreResult<TestEvent> {
        let conn = self.conn()?;
        insert_event(&conn, run_id, event, at)
    }

    pub fn list_events(&self, run_id: Id) -> StoreResult<Vec<TestEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_events WHERE test_run_id = ?1 ORDER BY id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Point-in-time status of a run with its most recent events, newest first.
    pub fn current_status(&self, run_id: Id) -> StoreResult<RunSnapshot> {
        let run = self.get_run(run_id)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_events WHERE test_run_id = ?1 ORDER BY id DESC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let recent_events = stmt
            .query_map(params![run_id, SNAPSHOT_EVENTS as i64], event_from_row)?
            .collect::<Result<_, _>>()?;

        Ok(RunSnapshot {
            run_id: run.id,
            test_case_id: run.test_case_id,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_seconds: run.duration_seconds,
            error_text: run.error_text,
            recent_events,
        })
    }
}
