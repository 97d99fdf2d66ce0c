//! Scheduler events and their recurrence chain.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{enum_col, fmt_ts, opt_ts_col, ts_col, Store, StoreError, StoreResult};
use crate::model::{Id, NewSchedulerEvent, ScheduleStatus, SchedulerEvent, TestSelector};

const EVENT_COLUMNS: &str = "id, project_id, title, event_type, scheduled_time, recurrence, test_selector_json,
    status, last_run_time, parent_event_id, created_at";

/// A scheduler event with whether a successor already links back to it.
#[derive(Debug, Clone)]
pub struct DueCandidate {
    pub event: SchedulerEvent,
    pub has_successor: bool,
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SchedulerEvent> {
    let selector_json: Option<String> = row.get(6)?;
    let test_selector = selector_json
        .map(|raw| serde_json::from_str::<TestSelector>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(SchedulerEvent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        event_type: enum_col(row, 3)?,
        scheduled_time: ts_col(row, 4)?,
        recurrence: enum_col(row, 5)?,
        test_selector,
        status: enum_col(row, 7)?,
        last_run_time: opt_ts_col(row, 8)?,
        parent_event_id: row.get(9)?,
        created_at: ts_col(row, 10)?,
    })
}

fn insert_scheduler_event(conn: &Connection, event: &NewSchedulerEvent, created_at: DateTime<Utc>) -> StoreResult<Id> {
    let selector_json = event
        .test_selector
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("selector not serializable: {}", e)))?;
    conn.execute(
        "INSERT INTO scheduler_events
            (project_id, title, event_type, scheduled_time, recurrence, test_selector_json, status, parent_event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.project_id,
            event.title,
            event.event_type.as_str(),
            fmt_ts(&event.scheduled_time),
            event.recurrence.as_str(),
            selector_json,
            ScheduleStatus::Pending.as_str(),
            event.parent_event_id,
            fmt_ts(&created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    pub fn create_scheduler_event(&self, event: &NewSchedulerEvent, created_at: DateTime<Utc>) -> StoreResult<Id> {
        let conn = self.conn()?;
        insert_scheduler_event(&conn, event, created_at)
    }

    pub fn get_scheduler_event(&self, id: Id) -> StoreResult<SchedulerEvent> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM scheduler_events WHERE id = ?1", EVENT_COLUMNS),
            params![id],
            event_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound { entity: "scheduler event", id })
    }

    pub fn list_scheduler_events(&self) -> StoreResult<Vec<SchedulerEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduler_events ORDER BY scheduled_time, id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn scheduler_events_with_status(&self, status: ScheduleStatus) -> StoreResult<Vec<SchedulerEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduler_events WHERE status = ?1 ORDER BY scheduled_time, id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn successors_of(&self, id: Id) -> StoreResult<Vec<SchedulerEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduler_events WHERE parent_event_id = ?1 ORDER BY id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![id], event_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Events scheduled at or before `now` that may still fire, oldest first:
    /// pending events, plus recurring events whose chain has no successor yet.
    ///
    /// Whether each is actually due is decided by the caller.
    pub fn due_candidates(&self, now: DateTime<Utc>) -> StoreResult<Vec<DueCandidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, EXISTS(SELECT 1 FROM scheduler_events c WHERE c.parent_event_id = scheduler_events.id)
             FROM scheduler_events
             WHERE scheduled_time <= ?1
               AND (status = 'pending'
                    OR (recurrence != 'none'
                        AND NOT EXISTS(SELECT 1 FROM scheduler_events c WHERE c.parent_event_id = scheduler_events.id)))
             ORDER BY scheduled_time, id",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![fmt_ts(&now)], |row| {
            Ok(DueCandidate {
                event: event_from_row(row)?,
                has_successor: row.get::<_, i64>(11)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Mark an event running unless another pass already holds it.
    pub fn claim_scheduler_event(&self, id: Id) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE scheduler_events SET status = ?2 WHERE id = ?1 AND status != ?2",
            params![id, ScheduleStatus::Running.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Record the outcome of a pass and, for recurring events, insert the
    /// successor in the same transaction. A successor is inserted at most once
    /// per event; the existing one's id is returned otherwise.
    pub fn complete_scheduler_event(
        &self,
        id: Id,
        status: ScheduleStatus,
        last_run_time: DateTime<Utc>,
        successor: Option<&NewSchedulerEvent>,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Option<Id>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE scheduler_events SET status = ?2, last_run_time = ?3 WHERE id = ?1",
            params![id, status.as_str(), fmt_ts(&last_run_time)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { entity: "scheduler event", id });
        }

        let successor_id = match successor {
            Some(next) => {
                let existing: Option<Id> = tx
                    .query_row(
                        "SELECT id FROM scheduler_events WHERE parent_event_id = ?1 ORDER BY id LIMIT 1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    Some(existing) => Some(existing),
                    None => Some(insert_scheduler_event(&tx, next, created_at)?),
                }
            }
            None => None,
        };
        tx.commit()?;
        Ok(successor_id)
    }

    /// Force an event into a terminal status without touching `last_run_time`.
    pub fn set_scheduler_event_status(&self, id: Id, status: ScheduleStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE scheduler_events SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }
}
