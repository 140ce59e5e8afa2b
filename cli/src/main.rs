mod adapters;
mod bootstrap;
mod config;
mod telemetry;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::Config;
use mcoda_core::{
    CancellationToken, JobState, McodaError, TaskFilter, TaskStatus, UsageFilter, WorkspaceStore,
};
use mcoda_engine::{
    HashMapAdapterRegistry, JobRuntime, StdRngSource, TaskSelector, TelemetryLedger,
    TimeWindow, TrioEngine, TrioEngineConfig,
};
use std::process::ExitCode;

/// Exit codes shared by every subcommand, per spec.md §6.
mod exit {
    pub const SUCCESS: u8 = 0;
    pub const GENERIC_FAILURE: u8 = 1;
    pub const PRECONDITION_FAILURE: u8 = 2;
    pub const JOB_NOT_SUCCESS: u8 = 3;
}

#[derive(Parser)]
#[command(name = "mcoda", about = "Workspace-scoped AI-agent orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive tasks through the gateway-trio ladder.
    GatewayTrio {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Vec<String>,
        #[arg(long, default_value_t = 3)]
        max_iterations: i32,
        #[arg(long, default_value_t = 5)]
        max_cycles: i32,
        #[arg(long)]
        resume: Option<String>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Inspect and control jobs.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Print the dependency-resolved task order for a project.
    OrderTasks {
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Inspect a single task.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Token-usage telemetry.
    Telemetry {
        #[command(subcommand)]
        action: TelemetryAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    List,
    Status { job_id: String },
    Watch {
        job_id: String,
        #[arg(long, default_value_t = 2)]
        interval_seconds: u64,
    },
    Logs { job_id: String },
    Inspect { job_id: String },
    Resume { job_id: String },
    Cancel {
        job_id: String,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Tokens { job_id: String },
}

#[derive(Subcommand)]
enum TaskAction {
    Show {
        task_key: String,
        #[arg(long, default_value_t = false)]
        include_logs: bool,
        #[arg(long, default_value_t = false)]
        include_history: bool,
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Subcommand)]
enum TelemetryAction {
    Summary {
        #[arg(long)]
        group_by: Vec<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = match Config::from_env().and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("mcoda: invalid configuration: {e:#}");
            return ExitCode::from(exit::GENERIC_FAILURE);
        }
    };

    if telemetry::init_telemetry(&config.logging).is_err() {
        eprintln!("mcoda: telemetry already initialized, continuing");
    }
    telemetry::log_startup_info(&config.workspace_root());

    match run(cli.command, &config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("mcoda: {e:#}");
            ExitCode::from(exit::GENERIC_FAILURE)
        }
    }
}

async fn run(command: Command, config: &Config) -> Result<u8> {
    match command {
        Command::GatewayTrio {
            project,
            status,
            max_iterations,
            max_cycles,
            resume,
            dry_run,
            json,
        } => cmd_gateway_trio(config, project, status, max_iterations, max_cycles, resume, dry_run, json).await,
        Command::Job { action } => cmd_job(config, action).await,
        Command::OrderTasks { project, json } => cmd_order_tasks(config, project, json).await,
        Command::Task { action } => cmd_task(config, action).await,
        Command::Telemetry { action } => cmd_telemetry(config, action).await,
    }
}

fn parse_statuses(raw: &[String]) -> Result<Vec<TaskStatus>> {
    if raw.is_empty() {
        return Ok(TaskFilter::default_statuses());
    }
    raw.iter()
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.clone()))
                .with_context(|| format!("'{s}' is not a known task status"))
        })
        .collect()
}

async fn cmd_gateway_trio(
    config: &Config,
    project: Option<String>,
    status: Vec<String>,
    max_iterations: i32,
    max_cycles: i32,
    resume: Option<String>,
    dry_run: bool,
    json: bool,
) -> Result<u8> {
    if !config::cli_stub_enabled() {
        eprintln!(
            "mcoda: no agent adapter is configured; set MCODA_CLI_STUB=1 to run with the stub adapter \
             (concrete adapters are a deployment-time integration, not part of this build)"
        );
        return Ok(exit::PRECONDITION_FAILURE);
    }

    let store = bootstrap::open_store(config).await?;
    let workspace_root = config.workspace_root();
    let runtime = JobRuntime::new(&store, workspace_root.clone());

    let status_filter = match parse_statuses(&status) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("mcoda: {e:#}");
            return Ok(exit::PRECONDITION_FAILURE);
        }
    };
    let filter = TaskFilter {
        project_key: project.clone(),
        status_filter,
        ..Default::default()
    };

    let job = if let Some(job_id) = &resume {
        let (job, _merged) = match runtime.resume_preconditions(job_id, serde_json::json!({})).await {
            Ok(v) => v,
            Err(e) => return Ok(report_precondition(&e)),
        };
        runtime.transition(&job.id, job.row_version, JobState::Running).await?
    } else {
        let payload = serde_json::json!({
            "project": project,
            "maxIterations": max_iterations,
            "maxCycles": max_cycles,
        });
        runtime.create("gateway-trio", "gateway-trio", payload, true).await?
    };

    if !config::skip_cli_checks() {
        tracing::debug!("health probes skipped in stub mode unless MCODA_SKIP_CLI_CHECKS is unset");
    }

    let agents = store.list_agents().await?;
    let slugs: Vec<String> = agents.iter().map(|a| a.slug.clone()).collect();
    let gateway_adapter = adapters::build_stub_gateway_adapter();
    let registry: HashMapAdapterRegistry = adapters::build_stub_registry(&slugs);

    let engine = TrioEngine::new(&store, runtime, &gateway_adapter, &registry);
    let engine_config = TrioEngineConfig {
        max_iterations,
        max_cycles,
        no_commit: false,
        dry_run,
    };
    let mut rng = StdRngSource::from_entropy();

    // Mirror the server's signal handling: SIGINT/SIGTERM on unix, ctrl_c on
    // windows, propagated as a cancellation token per spec.md §5 rather than
    // aborting the process outright (the in-flight step finishes as
    // "cancelled" and TrioState is left in a valid, resumable state).
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = sigint.recv() => {}
            }
        }
        #[cfg(windows)]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        signal_cancel.cancel();
    });

    let result = engine.run(&job.id, &filter, &engine_config, &mut rng, &cancel).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "jobId": result.job.id,
                "state": result.job.state.to_string(),
                "errorSummary": result.error_summary,
            })
        );
    } else {
        println!("job {} finished as {}", result.job.id, result.job.state);
        if let Some(summary) = &result.error_summary {
            println!("  {summary}");
        }
    }

    Ok(match result.job.state {
        JobState::Completed => exit::SUCCESS,
        _ => exit::JOB_NOT_SUCCESS,
    })
}

fn report_precondition(e: &McodaError) -> u8 {
    eprintln!("mcoda: {e}");
    exit::PRECONDITION_FAILURE
}

async fn cmd_job(config: &Config, action: JobAction) -> Result<u8> {
    let store = bootstrap::open_store(config).await?;
    let runtime = JobRuntime::new(&store, config.workspace_root());

    match action {
        JobAction::List => {
            let jobs = store.list_jobs(None).await?;
            for job in jobs {
                println!("{}  {}  {}", job.id, job.state, job.command_name);
            }
            Ok(exit::SUCCESS)
        }
        JobAction::Status { job_id } => {
            let job = match store.get_job(&job_id).await {
                Ok(j) => j,
                Err(e) if e.is_not_found() => {
                    eprintln!("mcoda: {e}");
                    return Ok(exit::PRECONDITION_FAILURE);
                }
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(if job.state == JobState::Completed {
                exit::SUCCESS
            } else if job.state.is_terminal() {
                exit::JOB_NOT_SUCCESS
            } else {
                exit::SUCCESS
            })
        }
        JobAction::Watch { job_id, interval_seconds } => {
            loop {
                let job = store.get_job(&job_id).await?;
                println!("{}  {}", Utc::now().to_rfc3339(), job.state);
                if job.state.is_terminal() {
                    return Ok(if job.state == JobState::Completed {
                        exit::SUCCESS
                    } else {
                        exit::JOB_NOT_SUCCESS
                    });
                }
                tokio::time::sleep(std::time::Duration::from_secs(interval_seconds)).await;
            }
        }
        JobAction::Logs { job_id } => {
            let checkpoints = store.list_checkpoints(&job_id).await?;
            for checkpoint in checkpoints {
                println!("{}  {}  {}", checkpoint.timestamp.to_rfc3339(), checkpoint.stage, checkpoint.details);
            }
            Ok(exit::SUCCESS)
        }
        JobAction::Inspect { job_id } => {
            let job = store.get_job(&job_id).await?;
            let checkpoints = store.list_checkpoints(&job_id).await?;
            let trio_state = store.load_trio_state(&job_id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "job": job,
                    "checkpoints": checkpoints,
                    "trioState": trio_state,
                }))?
            );
            Ok(exit::SUCCESS)
        }
        JobAction::Resume { job_id } => {
            match runtime.resume_preconditions(&job_id, serde_json::json!({})).await {
                Ok((job, _)) => {
                    println!("job {} is resumable from state {}", job.id, job.state);
                    Ok(exit::SUCCESS)
                }
                Err(e) => Ok(report_precondition(&e)),
            }
        }
        JobAction::Cancel { job_id, force } => match runtime.cancel(&job_id, force).await {
            Ok(job) => {
                println!("job {} cancelled", job.id);
                Ok(exit::SUCCESS)
            }
            Err(e) => Ok(report_precondition(&e)),
        },
        JobAction::Tokens { job_id } => {
            let filter = UsageFilter {
                job_id: Some(job_id),
                ..Default::default()
            };
            let page = store.query_token_usage(&filter, 1, 1000).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(exit::SUCCESS)
        }
    }
}

async fn cmd_order_tasks(config: &Config, project: Option<String>, json: bool) -> Result<u8> {
    let store = bootstrap::open_store(config).await?;
    let selector = TaskSelector::new(&store);
    // TaskSelector always orders by dependency; there is no alternate mode to
    // request, so the filter carries no ordering flag — see SPEC_FULL.md §7.
    let filter = TaskFilter {
        project_key: project,
        status_filter: TaskFilter::default_statuses(),
        ..Default::default()
    };
    let result = selector.select(&filter).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "ordered": result.ordered.iter().map(|t| &t.key).collect::<Vec<_>>(),
                "blocked": result.blocked.iter().map(|t| &t.key).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })
        );
    } else {
        for task in &result.ordered {
            println!("{}", task.key);
        }
        for warning in &result.warnings {
            eprintln!("warning: {warning}");
        }
    }
    Ok(exit::SUCCESS)
}

async fn cmd_task(config: &Config, action: TaskAction) -> Result<u8> {
    let store = bootstrap::open_store(config).await?;
    match action {
        TaskAction::Show {
            task_key,
            include_logs: _,
            include_history,
            format,
        } => {
            let task = match store.get_task_by_key(&task_key).await {
                Ok(t) => t,
                Err(e) if e.is_not_found() => {
                    eprintln!("mcoda: {e}");
                    return Ok(exit::PRECONDITION_FAILURE);
                }
                Err(e) => return Err(e.into()),
            };
            let history = if include_history {
                Some(store.list_task_runs(task.id).await?)
            } else {
                None
            };

            if format == "json" {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "task": task,
                        "history": history,
                    }))?
                );
            } else {
                println!("key:         {}", task.key);
                println!("name:        {}", task.name);
                println!("status:      {}", task.status);
                println!("priority:    {}", task.priority);
                if let Some(runs) = &history {
                    for run in runs {
                        println!("  attempt {} {} -> {:?}", run.attempt, run.step, run.status);
                    }
                }
            }
            Ok(exit::SUCCESS)
        }
    }
}

async fn cmd_telemetry(config: &Config, action: TelemetryAction) -> Result<u8> {
    let store = bootstrap::open_store(config).await?;
    let ledger = TelemetryLedger::new(&store);
    match action {
        TelemetryAction::Summary { group_by, since, until } => {
            let window = TimeWindow { since, until };
            let rows = match ledger.summarize(None, &window, &group_by, Utc::now()).await {
                Ok(r) => r,
                Err(e) if e.is_validation() => {
                    eprintln!("mcoda: {e}");
                    return Ok(exit::PRECONDITION_FAILURE);
                }
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(exit::SUCCESS)
        }
    }
}
