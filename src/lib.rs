//! flowtest -- automated test execution and scheduling orchestrator.
//!
//! This crate syncs test repositories into a catalog, runs tests through
//! external framework runners, schedules recurring batches, and streams run
//! status to live observers.

pub mod api;
pub mod batch;
pub mod broadcast;
pub mod config;
pub mod execution;
pub mod framework;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::batch::BatchRunner;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::execution::{Engine, ExecError};
use crate::framework::{SubprocessExecutor, TestExecutor};
use crate::model::Id;
use crate::queue::{Job, JobHandler, LocalQueue, RetryPolicy, TaskSubmitter};
use crate::scheduler::Scheduler;
use crate::storage::Store;
use crate::sync::{GitCli, RepositorySync, VcsClient};

const WORKER_LOST: &str = "worker lost before the run finished";

/// The wired-up orchestrator: every component sharing one store.
pub struct Services {
    pub store: Store,
    pub broadcaster: Arc<Broadcaster>,
    pub submitter: Arc<dyn TaskSubmitter>,
    pub engine: Arc<Engine>,
    pub batch: Arc<BatchRunner>,
    pub scheduler: Arc<Scheduler>,
    pub sync: Arc<RepositorySync>,
}

impl Services {
    pub fn new(
        store: Store,
        config: &Config,
        executor: Arc<dyn TestExecutor>,
        vcs: Arc<dyn VcsClient>,
        submitter: Arc<dyn TaskSubmitter>,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new());
        let engine = Arc::new(Engine::new(store.clone(), executor, broadcaster.clone(), submitter.clone()));
        let batch = Arc::new(BatchRunner::new(engine.clone(), config.execution.max_concurrency));
        let scheduler = Arc::new(Scheduler::new(store.clone(), batch.clone(), submitter.clone()));
        let sync = Arc::new(RepositorySync::new(
            store.clone(),
            vcs,
            config.repositories.checkout_root.clone(),
        ));
        Self {
            store,
            broadcaster,
            submitter,
            engine,
            batch,
            scheduler,
            sync,
        }
    }

    /// Production wiring: subprocess runners and the git CLI.
    pub fn open(config: &Config, submitter: Arc<dyn TaskSubmitter>) -> Result<Self> {
        let db_path = config.storage.db_path.to_string_lossy();
        info!(%db_path, "initializing database");
        let store = Store::open(&db_path).context("failed to open database")?;
        let executor = Arc::new(SubprocessExecutor::new(config.execution.test_timeout()));
        let vcs = Arc::new(GitCli::new(&config.repositories.git_binary));
        Ok(Self::new(store, config, executor, vcs, submitter))
    }

    /// Settle work a previous process left unfinished: interrupted scheduler
    /// events are failed and chained, and every run still `pending` or
    /// `running` is marked `error`.
    pub async fn recover(&self) -> Result<()> {
        let events = self.scheduler.recover_interrupted(Utc::now()).await?;
        let runs = self.store.unfinished_runs()?;
        for run in &runs {
            self.engine.abort_run(run.id, WORKER_LOST)?;
        }
        if !events.is_empty() || !runs.is_empty() {
            info!(events = events.len(), runs = runs.len(), "recovered interrupted work");
        }
        Ok(())
    }

    /// Execute one run inside its own task so a panic still leaves the run terminal.
    async fn execute_isolated(&self, run_id: Id) -> Result<()> {
        let engine = self.engine.clone();
        match tokio::spawn(async move { engine.execute_run(run_id).await }).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(ExecError::NotFound { entity, id })) => {
                warn!(run_id, entity, id, "dropping job for missing record");
                Ok(())
            }
            Ok(Err(e)) => {
                // A started run cannot resume, and a retry would find it running.
                let message = e.to_string();
                match self.engine.abort_run(run_id, &message) {
                    Ok(_) => {
                        warn!(run_id, error = %message, "run failed inside the engine, marked error");
                        Ok(())
                    }
                    Err(abort) => {
                        warn!(run_id, error = %abort, "could not mark failed run as error");
                        Err(e.into())
                    }
                }
            }
            Err(join) => {
                let message = batch::panic_message(join);
                self.engine.abort_run(run_id, &message)?;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for Services {
    async fn handle(&self, job: &Job) -> Result<()> {
        match job {
            Job::ExecuteSingleRun { run_id } => self.execute_isolated(*run_id).await,
            Job::RunScheduledBatch { schedule_id } => {
                self.scheduler.run_scheduled_batch(*schedule_id).await?;
                Ok(())
            }
            Job::ProcessDueEvents => {
                self.scheduler.process_due_events(Utc::now()).await?;
                Ok(())
            }
            Job::SyncRepository { repository_id } => match self.sync.sync_repository(*repository_id).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_transient() => Err(e.into()),
                Err(e) => {
                    // Auth and layout failures wait for the next manual sync.
                    warn!(repository_id, error = %e, "repository sync failed permanently");
                    Ok(())
                }
            },
        }
    }
}

/// Start the daemon: queue worker, scheduler loop and API server.
pub async fn serve(config: Config) -> Result<()> {
    let (queue, rx) = LocalQueue::new();
    let services = Arc::new(Services::open(&config, Arc::new(queue))?);

    services.recover().await.context("startup recovery failed")?;

    let policy = RetryPolicy {
        max_attempts: config.queue.max_attempts,
        backoff: Duration::from_millis(config.queue.retry_backoff_ms),
        concurrency: config.execution.max_concurrency,
    };
    let handler: Arc<dyn JobHandler> = services.clone();
    tokio::spawn(queue::run_worker(rx, handler, policy));

    if config.scheduler.enabled {
        let scheduler = services.scheduler.clone();
        let poll = config.scheduler.poll_interval();
        tokio::spawn(async move {
            scheduler::run_scheduler_loop(scheduler, poll).await;
        });
    } else {
        info!("scheduler disabled by configuration");
    }

    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid api.bind address: {}", config.api.bind))?;
    let app = api::router(api::state::AppState::new(services)).layer(TraceLayer::new_for_http());

    info!(%addr, "flowtest listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testutil::FakeExecutor;
    use crate::model::{EventType, NewTestCase, NewTestEvent, RunStatus, Severity};
    use crate::queue::RecordingSubmitter;
    use crate::storage::testutil::temp_store;
    use crate::sync::testutil::FakeVcs;

    fn services() -> (tempfile::TempDir, Services, Id) {
        let (dir, store) = temp_store();
        let mut config = Config::default();
        config.repositories.checkout_root = dir.path().join("repos");
        let services = Services::new(
            store,
            &config,
            Arc::new(FakeExecutor::default()),
            Arc::new(FakeVcs::default()),
            Arc::new(RecordingSubmitter::default()),
        );
        let project = services.store.create_project("p").unwrap();
        let case = services
            .store
            .create_test_case(&NewTestCase {
                project_id: project,
                title: "inline".into(),
                inline_code: Some("def test_ok():\n    pass\n".into()),
                ..Default::default()
            })
            .unwrap();
        (dir, services, case)
    }

    #[tokio::test]
    async fn test_store_failure_mid_run_leaves_run_terminal() {
        let (_dir, services, case) = services();
        let run_id = services.store.create_pending_run(case, Utc::now()).unwrap();
        // Only the terminal "passed" write fails; "running" and "error" go through.
        services
            .store
            .pool()
            .get()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_pass BEFORE UPDATE OF status ON test_runs
                 WHEN NEW.status = 'passed'
                 BEGIN SELECT RAISE(ABORT, 'disk gone'); END;",
            )
            .unwrap();

        services.handle(&Job::ExecuteSingleRun { run_id }).await.unwrap();

        let run = services.store.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.error_text.contains("disk gone"), "{}", run.error_text);
        // A redelivery is a no-op.
        services.handle(&Job::ExecuteSingleRun { run_id }).await.unwrap();
        assert_eq!(services.store.get_run(run_id).unwrap().status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_recover_marks_unfinished_runs_error() {
        let (_dir, services, case) = services();
        let now = Utc::now();
        let pending = services.store.create_pending_run(case, now).unwrap();
        let running = services.store.create_pending_run(case, now).unwrap();
        services
            .store
            .start_run(running, now, &NewTestEvent::new(EventType::Start, Severity::Info, "started"))
            .unwrap();
        let finished = services.store.create_pending_run(case, now).unwrap();
        services.engine.execute_run(finished).await.unwrap();

        services.recover().await.unwrap();

        for id in [pending, running] {
            let run = services.store.get_run(id).unwrap();
            assert_eq!(run.status, RunStatus::Error);
            assert_eq!(run.error_text, WORKER_LOST);
        }
        assert_eq!(services.store.get_run(finished).unwrap().status, RunStatus::Passed);
        assert!(services.store.unfinished_runs().unwrap().is_empty());
    }
}
