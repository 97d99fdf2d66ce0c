//! Pure due-ness and recurrence arithmetic.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{Id, NewSchedulerEvent, Recurrence, ScheduleKind, ScheduleStatus, SchedulerEvent};
use crate::storage::DueCandidate;

/// Whether `event` should fire in a pass at `now`.
///
/// One-off events fire once while pending. Recurring events fire when never
/// run, or when their last run is older than one interval, unless a
/// successor already exists (the successor carries the chain from there).
pub fn is_due(event: &SchedulerEvent, has_successor: bool, now: DateTime<Utc>) -> bool {
    if event.scheduled_time > now || event.status == ScheduleStatus::Running {
        return false;
    }
    match event.recurrence.interval() {
        None => event.status == ScheduleStatus::Pending,
        Some(interval) => {
            !has_successor
                && match event.last_run_time {
                    None => true,
                    Some(last) => last < now - interval,
                }
        }
    }
}

pub fn due_events(candidates: Vec<DueCandidate>, now: DateTime<Utc>) -> Vec<SchedulerEvent> {
    candidates
        .into_iter()
        .filter(|c| is_due(&c.event, c.has_successor, now))
        .map(|c| c.event)
        .collect()
}

/// The next link of a recurring chain: same selector, advanced by one interval.
pub fn successor(event: &SchedulerEvent) -> Option<NewSchedulerEvent> {
    let interval = event.recurrence.interval()?;
    Some(NewSchedulerEvent {
        project_id: event.project_id,
        title: event.title.clone(),
        event_type: event.event_type,
        scheduled_time: event.scheduled_time + interval,
        recurrence: event.recurrence,
        test_selector: event.test_selector.clone(),
        parent_event_id: Some(event.id),
    })
}

/// One upcoming firing in a dry-run preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Occurrence {
    pub scheduled_time: DateTime<Utc>,
    pub title: String,
    pub event_type: ScheduleKind,
    pub recurrence: Recurrence,
    /// The stored event this firing comes from.
    pub event_id: Id,
    /// `false` for a stored event, `true` for a successor not yet inserted.
    pub projected: bool,
}

/// Every firing expected up to `now + window`, oldest first.
///
/// Overdue pending events are included since the next pass will run them.
pub fn preview(candidates: &[DueCandidate], now: DateTime<Utc>, window: Duration) -> Vec<Occurrence> {
    let end = now + window;
    let mut out = Vec::new();
    for DueCandidate { event, has_successor } in candidates {
        // Only the tail of each chain produces future firings.
        if *has_successor || event.scheduled_time > end {
            continue;
        }
        let recurring = event.recurrence.interval();
        if event.status == ScheduleStatus::Pending || (recurring.is_some() && is_due(event, false, now)) {
            out.push(Occurrence {
                scheduled_time: event.scheduled_time,
                title: event.title.clone(),
                event_type: event.event_type,
                recurrence: event.recurrence,
                event_id: event.id,
                projected: false,
            });
        }
        if let Some(interval) = recurring {
            let mut next = event.scheduled_time + interval;
            while next <= end {
                out.push(Occurrence {
                    scheduled_time: next,
                    title: event.title.clone(),
                    event_type: event.event_type,
                    recurrence: event.recurrence,
                    event_id: event.id,
                    projected: true,
                });
                next += interval;
            }
        }
    }
    out.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time).then(a.event_id.cmp(&b.event_id)));
    out
}
