use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shellq::job::timestamp;
use shellq::{DlqEntry, Job, JobId, JobQueue, JobSpec, JobState};

/// Persistent background queue for shell commands
#[derive(Parser, Debug)]
#[command(name = "shellq", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database URL (default: ~/.shellq/queue.db)
    #[arg(long, env = "SHELLQ_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Log level or filter directive, overridden by RUST_LOG
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[arg(long, value_parser = ["pretty", "json"], default_value = "pretty", global = true)]
    log_format: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a job, given as JSON: {"command": "...", "id": "...", "max_retries": N}
    Enqueue {
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        job: Option<String>,

        /// Read the job JSON from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// List active jobs
    List {
        /// pending, processing, completed or dead
        #[arg(short, long)]
        state: Option<JobState>,
    },
    /// Show job counts
    Status,
    /// Run or stop workers
    Worker(WorkerCommands),
    /// Inspect the dead letter queue
    Dlq(DlqCommands),
    /// Read or change configuration
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
struct WorkerCommands {
    #[command(subcommand)]
    action: WorkerActions,
}

#[derive(Subcommand, Debug)]
enum WorkerActions {
    /// Run workers in the foreground until Ctrl-C or `worker stop`
    Start {
        /// Number of workers (default: worker_count)
        #[arg(short, long)]
        count: Option<usize>,
    },
    /// Ask all running workers to stop after their current job
    Stop,
}

#[derive(Args, Debug)]
struct DlqCommands {
    #[command(subcommand)]
    action: DlqActions,
}

#[derive(Subcommand, Debug)]
enum DlqActions {
    /// List dead jobs
    List,
    /// Move a dead job back to pending with a fresh retry budget
    Retry { id: String },
    /// Delete a dead job permanently
    Discard { id: String },
}

#[derive(Args, Debug)]
struct ConfigCommands {
    #[command(subcommand)]
    action: ConfigActions,
}

#[derive(Subcommand, Debug)]
enum ConfigActions {
    /// Print one value, or every value when no key is given
    Get { key: Option<String> },
    /// Set a value
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level, &cli.log_format) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize JSON logging")?,
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .context("Failed to initialize logging")?,
    }

    Ok(())
}

async fn open_queue(database_url: Option<&str>) -> Result<JobQueue> {
    if let Some(url) = database_url {
        return JobQueue::new(url)
            .await
            .with_context(|| format!("Failed to open database {url}"));
    }

    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .context("Cannot locate home directory; pass --database-url")?;
    let dir = PathBuf::from(home).join(".shellq");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let path = dir.join("queue.db");
    JobQueue::open(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

async fn run(cli: Cli) -> Result<()> {
    let mut queue = open_queue(cli.database_url.as_deref()).await?;

    match cli.command {
        Commands::Enqueue { job, file } => {
            let raw = match (job, file) {
                (Some(json), _) => json,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => bail!("Provide job JSON or --file"),
            };
            let spec: JobSpec =
                serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("Invalid JSON: {e}"))?;

            let job = queue.enqueue(spec).await?;
            println!("Enqueued job: {}", job.id);
            println!("  Command: {}", job.command);
            println!("  State: {}", job.state);
        }
        Commands::List { state } => {
            let jobs = queue.list_jobs(state).await?;
            print_jobs(&jobs, state);
        }
        Commands::Status => {
            let status = queue.status().await?;
            println!("Queue Status:");
            println!("  Jobs:");
            println!("    Pending: {}", status.pending);
            println!("    Processing: {}", status.processing);
            println!("    Completed: {}", status.completed);
            println!("    Failed/Dead: {}", status.failed_dead);
            println!("    Total: {}", status.total);
            println!("  DLQ: {} jobs", status.dlq_total);
        }
        Commands::Worker(cmd) => match cmd.action {
            WorkerActions::Start { count } => {
                if count == Some(0) {
                    bail!("Worker count must be at least 1");
                }
                let started = queue.start_workers(count).await?;
                println!("Started {started} worker(s). Press Ctrl+C to stop.");

                queue.wait_for_shutdown().await;
                info!("Workers stopped");
                println!("Workers stopped");
            }
            WorkerActions::Stop => {
                queue.request_stop().await?;
                println!("Stop signal sent. Workers will finish their current job and exit.");
            }
        },
        Commands::Dlq(cmd) => match cmd.action {
            DlqActions::List => print_dead_letters(&queue.dlq_list().await?),
            DlqActions::Retry { id } => {
                let job = queue.dlq_retry(&JobId::from(id)).await?;
                println!("Retried job: {}", job.id);
                println!("  Command: {}", job.command);
                println!("  State: {}", job.state);
            }
            DlqActions::Discard { id } => {
                let entry = queue.dlq_discard(&JobId::from(id)).await?;
                println!("Discarded job: {}", entry.job.id);
            }
        },
        Commands::Config(cmd) => match cmd.action {
            ConfigActions::Get { key: Some(key) } => {
                println!("{}", queue.config_value(&key).await?);
            }
            ConfigActions::Get { key: None } => {
                let config = queue.get_config().await?;
                println!("Configuration:");
                for (key, value) in config.entries() {
                    println!("  {key}: {value}");
                }
            }
            ConfigActions::Set { key, value } => {
                let config = queue.set_config(&key, &value).await?;
                let key: shellq::ConfigKey = key.parse()?;
                println!("Set {key} = {}", config.value(key));
            }
        },
    }

    Ok(())
}

fn print_jobs(jobs: &[Job], state: Option<JobState>) {
    let filter = state.map(|s| format!(" (state: {s})")).unwrap_or_default();

    if jobs.is_empty() {
        println!("No jobs{filter}");
        return;
    }

    println!("Jobs{filter}:");
    for job in jobs {
        println!("  ID: {}", job.id);
        println!("    Command: {}", job.command);
        println!("    State: {}", job.state);
        println!("    Attempts: {}/{}", job.attempts, job.max_retries);
        println!("    Created: {}", timestamp::format(&job.created_at));
        if let Some(at) = &job.next_retry_at {
            println!("    Next retry: {}", timestamp::format(at));
        }
        if let Some(error) = &job.last_error {
            println!("    Last error: {error}");
        }
        println!();
    }
}

fn print_dead_letters(entries: &[DlqEntry]) {
    if entries.is_empty() {
        println!("No jobs in DLQ");
        return;
    }

    println!("Dead Letter Queue:");
    for entry in entries {
        let job = &entry.job;
        println!("  ID: {}", job.id);
        println!("    Command: {}", job.command);
        println!("    Attempts: {}/{}", job.attempts, job.max_retries);
        println!("    Failed at: {}", timestamp::format(&entry.dead_at));
        if let Some(error) = &job.last_error {
            println!("    Error: {error}");
        }
        println!();
    }
}
