//! API route definitions.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use super::state::AppState;
use super::ApiError;
use crate::broadcast::{Message, MessageKind};
use crate::model::{Id, RunStatus};
use crate::queue::Job;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs/{id}/status", get(run_status))
        .route("/runs/{id}/stream", get(run_stream))
        .route("/test-cases/{id}/runs", post(enqueue_run))
        .route("/repositories/{id}/sync", post(sync_repository))
        .route("/schedules/{id}/trigger", post(trigger_schedule))
        .route("/schedules/dry-run", get(schedule_dry_run))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn run_status(State(state): State<AppState>, Path(id): Path<Id>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.services.store.current_status(id)?;
    Ok(Json(json!({ "data": snapshot })))
}

struct StreamState {
    initial: Option<Message>,
    rx: tokio::sync::broadcast::Receiver<Message>,
    done: bool,
}

fn is_terminal_status(message: &Message) -> bool {
    message.kind == MessageKind::Status
        && message.data["status"]
            .as_str()
            .and_then(|s| s.parse::<RunStatus>().ok())
            .is_some_and(|s| s.is_terminal())
}

fn sse_event(message: &Message) -> Result<Event, Infallible> {
    let kind = match message.kind {
        MessageKind::Status => "status",
        MessageKind::Update => "update",
    };
    let payload = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(kind).data(payload))
}

/// Server-sent events for one run: the current status first, then live
/// updates until the run's terminal status has been sent.
async fn run_stream(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let services = &state.services;
    services.store.get_run(id)?;
    // Subscribe before reading the snapshot so nothing falls in between.
    let rx = services.broadcaster.subscribe(id);
    let initial = Message::status(&services.store.current_status(id)?);
    let done = is_terminal_status(&initial);

    let start = StreamState {
        initial: Some(initial),
        rx,
        done,
    };
    let stream = futures::stream::unfold(start, move |mut st| async move {
        if let Some(initial) = st.initial.take() {
            return Some((sse_event(&initial), st));
        }
        if st.done {
            return None;
        }
        loop {
            match st.rx.recv().await {
                Ok(message) => {
                    st.done = is_terminal_status(&message);
                    return Some((sse_event(&message), st));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = id, skipped, "stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn enqueue_run(State(state): State<AppState>, Path(id): Path<Id>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run_id = state.services.engine.enqueue(id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "data": { "run_id": run_id } }))))
}

async fn sync_repository(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.services.store.get_repository(id)?;
    let handle = state.services.submitter.submit(Job::SyncRepository { repository_id: id })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "data": { "job_id": handle.id } }))))
}

async fn trigger_schedule(
    State(state): State<AppState>,
    Path(id): Path<Id>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let handle = state.services.scheduler.trigger(id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "data": { "job_id": handle.id } }))))
}

#[derive(Deserialize)]
struct DryRunParams {
    #[serde(default = "default_hours")]
    hours: u64,
}

fn default_hours() -> u64 {
    24
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(params): Query<DryRunParams>,
) -> Result<Json<Value>, ApiError> {
    let upcoming = state.services.scheduler.preview(chrono::Utc::now(), params.hours)?;
    Ok(Json(json!({ "data": { "upcoming": upcoming }, "meta": { "hours": params.hours } })))
}
