//! Recurring and one-off scheduled batch runs.

pub mod due;
pub mod engine;

use thiserror::Error;

use crate::batch::SelectionError;
use crate::queue::QueueError;
use crate::storage::StoreError;

pub use self::due::Occurrence;
pub use self::engine::{run_scheduler_loop, EventOutcome, Scheduler};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid scheduler event: {0}")]
    Invalid(String),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
