use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use flowtest::config::{Config, LoggingConfig};
use flowtest::model::{Id, NewRepository, NewSchedulerEvent, NewTestCase, TestSelector};
use flowtest::queue::RecordingSubmitter;
use flowtest::Services;

#[derive(Parser)]
#[command(
    name = "flowtest",
    about = "Automated test discovery, execution and scheduling orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $FLOWTEST_CONFIG, then /etc/flowtest/flowtest.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + queue worker + scheduler)
    Serve,

    /// Run test cases as one batch and print the results
    Run {
        #[arg(required = true)]
        test_case_ids: Vec<Id>,
    },

    /// Execute one pending run
    Execute { run_id: Id },

    /// Pull repositories and refresh their discovered tests
    Sync {
        repository_id: Option<Id>,

        /// Sync every registered repository
        #[arg(long, conflicts_with = "repository_id")]
        all: bool,
    },

    /// Print a run's current status as JSON
    Status { run_id: Id },

    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage folders
    Folder {
        #[command(subcommand)]
        action: FolderAction,
    },

    /// Manage test cases
    Case {
        #[command(subcommand)]
        action: CaseAction,
    },

    /// Manage test repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Manage scheduled batches
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Add { name: String },
}

#[derive(Subcommand)]
enum FolderAction {
    /// Create a folder, optionally inside another
    Add {
        #[arg(long)]
        project: Id,
        #[arg(long)]
        name: String,
        #[arg(long)]
        parent: Option<Id>,
    },
}

#[derive(Subcommand)]
enum CaseAction {
    /// Create a test case
    Add {
        #[arg(long)]
        project: Id,
        #[arg(long)]
        title: String,
        #[arg(long)]
        folder: Option<Id>,
        /// pytest, unittest, robot, cypress or playwright
        #[arg(long)]
        framework: Option<String>,
        /// `file` or `file::test_name`, relative to the repository tests directory
        #[arg(long)]
        script: Option<String>,
        #[arg(long)]
        repository: Option<Id>,
        /// Read the test source from this file instead of a repository
        #[arg(long, conflicts_with = "script")]
        inline_file: Option<PathBuf>,
        /// Record a manual case that is never executed
        #[arg(long)]
        manual: bool,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Register a repository
    Add {
        #[arg(long)]
        project: Id,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// github, gitlab, bitbucket or generic
        #[arg(long, default_value = "generic")]
        provider: String,
        #[arg(long)]
        framework: String,
        #[arg(long, default_value = "tests")]
        tests_dir: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long, env = "FLOWTEST_REPO_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Run every event that is due now
    Process,

    /// Add a scheduled event
    Add {
        #[arg(long)]
        project: Id,
        #[arg(long)]
        title: String,
        /// First firing, RFC 3339 (e.g. 2024-01-01T00:00:00Z)
        #[arg(long)]
        at: String,
        /// none, daily, weekly or monthly
        #[arg(long, default_value = "none")]
        recurrence: String,
        /// run_tests or general
        #[arg(long, default_value = "run_tests")]
        kind: String,
        /// Run every automated case in the project
        #[arg(long, conflicts_with_all = ["folder", "cases"])]
        all_tests: bool,
        /// Run every automated case under this folder
        #[arg(long, conflicts_with = "cases")]
        folder: Option<Id>,
        /// Comma-separated test case ids
        #[arg(long, value_delimiter = ',')]
        cases: Vec<Id>,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Services for commands that finish in-process. Jobs they enqueue are
/// recorded, never delivered.
fn one_shot(config: &Config) -> Result<Services> {
    Services::open(config, Arc::new(RecordingSubmitter::default()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!(bind = %config.api.bind, "Starting flowtest daemon");
            flowtest::serve(config).await?;
        }
        Commands::Run { test_case_ids } => {
            let services = one_shot(&config)?;
            let mut cases = Vec::with_capacity(test_case_ids.len());
            for id in test_case_ids {
                cases.push(services.store.get_test_case(id)?);
            }
            let total = cases.len();
            let results = services.batch.run_many(cases).await;

            println!("{:<6} | {:<30} | {:<8} | {:<6} | Error", "Case", "Title", "Status", "Run");
            println!("{:-<6}-|-{:-<30}-|-{:-<8}-|-{:-<6}-|-{:-<30}", "", "", "", "", "");
            let mut failures = 0;
            for r in &results {
                if !r.result.success {
                    failures += 1;
                }
                let status = r.result.status.map(|s| s.as_str()).unwrap_or("-");
                let run = r.result.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into());
                let error = r.result.error.as_deref().unwrap_or("");
                println!(
                    "{:<6} | {:<30} | {:<8} | {:<6} | {}",
                    r.test_case.id,
                    truncate(&r.test_case.title, 30),
                    status,
                    run,
                    truncate(error.lines().next().unwrap_or(""), 60)
                );
            }
            println!();
            if failures > 0 {
                bail!("{} of {} tests did not pass", failures, total);
            }
            println!("All {} tests passed.", total);
        }
        Commands::Execute { run_id } => {
            let services = one_shot(&config)?;
            if !services.engine.execute_run(run_id).await? {
                println!("Run {} is not pending; nothing to do.", run_id);
            }
            let snapshot = services.store.current_status(run_id)?;
            println!("Run {}: {}", run_id, snapshot.status);
        }
        Commands::Sync { repository_id, all } => {
            let services = one_shot(&config)?;
            if all {
                let outcomes = services.sync.sync_all().await?;
                if outcomes.is_empty() {
                    println!("No repositories registered.");
                }
                for (id, outcome) in outcomes {
                    match outcome {
                        Ok(report) => println!(
                            "repository {}: {} tests (+{} ~{} -{})",
                            id,
                            report.tests.len(),
                            report.inserted,
                            report.updated,
                            report.unavailable
                        ),
                        Err(e) => println!("repository {}: FAILED: {}", id, e),
                    }
                }
            } else if let Some(id) = repository_id {
                let report = services.sync.sync_repository(id).await?;
                println!(
                    "Synced repository {}: {} inserted, {} updated, {} unavailable",
                    id, report.inserted, report.updated, report.unavailable
                );
                for test in report.tests.iter().filter(|t| t.is_available) {
                    println!("  {}::{}", test.relative_file_path, test.name);
                }
            } else {
                bail!("pass a repository id or --all");
            }
        }
        Commands::Status { run_id } => {
            let services = one_shot(&config)?;
            let snapshot = services.store.current_status(run_id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Project { action } => match action {
            ProjectAction::Add { name } => {
                let services = one_shot(&config)?;
                let id = services.store.create_project(&name)?;
                println!("Project '{}' added with id {}.", name, id);
            }
        },
        Commands::Folder { action } => match action {
            FolderAction::Add { project, name, parent } => {
                let services = one_shot(&config)?;
                let id = services.store.create_folder(project, parent, &name)?;
                println!("Folder '{}' added with id {}.", name, id);
            }
        },
        Commands::Case { action } => match action {
            CaseAction::Add {
                project,
                title,
                folder,
                framework,
                script,
                repository,
                inline_file,
                manual,
            } => {
                let inline_code = match inline_file {
                    Some(path) => Some(
                        std::fs::read_to_string(&path)
                            .with_context(|| format!("failed to read {}", path.display()))?,
                    ),
                    None => None,
                };
                let services = one_shot(&config)?;
                let id = services.store.create_test_case(&NewTestCase {
                    project_id: project,
                    folder_id: folder,
                    title: title.clone(),
                    framework,
                    script_path: script,
                    repository_id: repository,
                    inline_code,
                    manual,
                })?;
                println!("Test case '{}' added with id {}.", title, id);
            }
        },
        Commands::Repo { action } => match action {
            RepoAction::Add {
                project,
                url,
                branch,
                provider,
                framework,
                tests_dir,
                username,
                token,
            } => {
                let services = one_shot(&config)?;
                let repo = NewRepository {
                    project_id: project,
                    url,
                    branch,
                    provider: provider.parse()?,
                    framework: framework.parse()?,
                    tests_directory: tests_dir,
                    username,
                    auth_token: token,
                };
                let id = services.sync.register(repo, &framework)?;
                println!("Repository added with id {}. Run `flowtest sync {}` to discover tests.", id, id);
            }
        },
        Commands::Schedule { action } => {
            let services = one_shot(&config)?;
            let scheduler = &services.scheduler;

            match action {
                ScheduleAction::Process => {
                    let outcomes = scheduler.process_due_events(Utc::now()).await?;
                    if outcomes.is_empty() {
                        println!("No events due.");
                    }
                    for o in outcomes {
                        let passed = o.results.iter().filter(|r| r.result.success).count();
                        print!("event {}: {} ({}/{} passed)", o.event_id, o.status, passed, o.results.len());
                        if let Some(next) = o.successor_id {
                            print!(", next firing is event {}", next);
                        }
                        if let Some(err) = o.error {
                            print!(", error: {}", err);
                        }
                        println!();
                    }
                }
                ScheduleAction::Add {
                    project,
                    title,
                    at,
                    recurrence,
                    kind,
                    all_tests,
                    folder,
                    cases,
                } => {
                    let scheduled_time = DateTime::parse_from_rfc3339(&at)
                        .with_context(|| format!("invalid --at timestamp: {}", at))?
                        .with_timezone(&Utc);
                    let test_selector = if all_tests {
                        Some(TestSelector::AllProjectTests)
                    } else if let Some(folder) = folder {
                        Some(TestSelector::Folder(folder))
                    } else if !cases.is_empty() {
                        Some(TestSelector::TestCases(cases))
                    } else {
                        None
                    };
                    let id = scheduler.add_event(&NewSchedulerEvent {
                        project_id: project,
                        title: title.clone(),
                        event_type: kind.parse()?,
                        scheduled_time,
                        recurrence: recurrence.parse()?,
                        test_selector,
                        parent_event_id: None,
                    })?;
                    println!("Schedule '{}' added with id {}.", title, id);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview(Utc::now(), hours)?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for o in preview {
                            let marker = if o.projected { " (projected)" } else { "" };
                            println!(
                                "{} : {} [{}, {}]{}",
                                o.scheduled_time.to_rfc3339(),
                                o.title,
                                o.event_type,
                                o.recurrence,
                                marker
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
