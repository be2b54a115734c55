//! CLI command definitions for frameflow.
//!
//! Every command talks to Redis through a [`Scheduler`]; the `worker` command
//! additionally runs a [`WorkerPool`] that executes an external program per
//! job.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::handler::CommandHandler;
use crate::config::{SchedulerConfig, DEFAULT_KEY_PREFIX, DEFAULT_REDIS_URL};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    Job, JobStatus, QueueLengths, Scheduler, SessionRecord, WorkerPool, WorkerPoolConfig,
};

/// Reliable Redis job queues with exactly-once session completion.
#[derive(Parser, Debug)]
#[command(name = "frameflow")]
#[command(about = "Run and inspect reliable Redis job queues")]
#[command(version)]
#[command(
    long_about = "frameflow dispatches per-frame jobs through priority and regular Redis lanes and signals once when every job of a session has finished.\n\nExample usage:\n  frameflow enqueue --queue rasterizer --team team-a --file frames.json --session render-42\n  frameflow worker --queue rasterizer --workers 8 -- ./render-frame.sh"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Redis connection URL.
    #[arg(long, env = "FRAMEFLOW_REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Prefix for every Redis key.
    #[arg(long, env = "FRAMEFLOW_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX, global = true)]
    pub prefix: String,

    /// Lifetime of job status entries, in seconds.
    #[arg(long, env = "FRAMEFLOW_STATUS_TTL", default_value = "86400", global = true)]
    pub status_ttl: u64,

    /// Lifetime of retry counters, in seconds.
    #[arg(long, env = "FRAMEFLOW_RETRY_TTL", default_value = "86400", global = true)]
    pub retry_ttl: u64,

    /// Lifetime of undrained sessions, in seconds.
    #[arg(long, env = "FRAMEFLOW_SESSION_TTL", default_value = "86400", global = true)]
    pub session_ttl: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Scheduler configuration described by the global flags.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_key_prefix(self.prefix.clone())
            .with_status_ttl(Duration::from_secs(self.status_ttl))
            .with_retry_ttl(Duration::from_secs(self.retry_ttl))
            .with_session_ttl(Duration::from_secs(self.session_ttl))
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a worker pool that executes a command for every job.
    Worker(WorkerArgs),

    /// Enqueue jobs from a JSON file, optionally as one session.
    Enqueue(EnqueueArgs),

    /// Show the status and attempt count of a job.
    Status(StatusArgs),

    /// Show lane lengths of one or more queue types.
    Stats(StatsArgs),

    /// List the job ids submitted by a team.
    TeamJobs(TeamJobsArgs),

    /// Show a session record and its outstanding job count.
    Session(SessionArgs),

    /// Move every job stuck in processing back onto the regular lane.
    ///
    /// Only run this when no worker is consuming the queue; jobs still being
    /// executed would be handed out a second time.
    Recover(RecoverArgs),
}

/// Arguments for `frameflow worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Queue type to consume.
    #[arg(short, long, env = "FRAMEFLOW_QUEUE")]
    pub queue: String,

    /// Number of concurrent workers.
    #[arg(short = 'w', long, default_value = "4")]
    pub workers: usize,

    /// Jobs claimed per fetch.
    #[arg(long, default_value = "5")]
    pub batch_size: usize,

    /// Attempts before a job is marked failed.
    #[arg(long, default_value = "3")]
    pub max_attempts: u32,

    /// Per-job timeout in seconds.
    #[arg(long, default_value = "1800")]
    pub job_timeout: u64,

    /// How long an idle fetch blocks waiting for work, in seconds.
    #[arg(long, default_value = "1")]
    pub fetch_timeout: u64,

    /// Pause after an empty fetch, in milliseconds.
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Graceful shutdown timeout in seconds.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout: u64,

    /// Print Prometheus metrics when the pool stops.
    #[arg(long)]
    pub print_metrics: bool,

    /// Program (and arguments) to run per job.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for `frameflow enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Queue type to enqueue onto.
    #[arg(short, long)]
    pub queue: String,

    /// Owning team.
    #[arg(short, long)]
    pub team: String,

    /// JSON file holding an array of `{"job_id"?, "payload", "priority"?}`.
    #[arg(short, long)]
    pub file: String,

    /// Put jobs without their own `priority` field on the priority lane.
    #[arg(long)]
    pub priority: bool,

    /// Dispatch the jobs as one session with this id.
    #[arg(long)]
    pub session: Option<String>,

    /// JSON metadata echoed back in the session completion event.
    #[arg(long, requires = "session")]
    pub metadata: Option<String>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `frameflow status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id to look up.
    pub job_id: String,
}

/// Arguments for `frameflow stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Queue types to report; repeat for several.
    #[arg(short, long = "queue", required = true)]
    pub queues: Vec<String>,
}

/// Arguments for `frameflow team-jobs`.
#[derive(Parser, Debug)]
pub struct TeamJobsArgs {
    /// Team id to list.
    pub team_id: String,
}

/// Arguments for `frameflow session`.
#[derive(Parser, Debug)]
pub struct SessionArgs {
    /// Session id to look up.
    pub session_id: String,
}

/// Arguments for `frameflow recover`.
#[derive(Parser, Debug)]
pub struct RecoverArgs {
    /// Queue type whose processing list is recovered.
    #[arg(short, long)]
    pub queue: String,
}

/// One entry of an enqueue file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job id; a random UUID is assigned when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Lane override for this job.
    #[serde(default)]
    pub priority: Option<bool>,
}

/// JSON output of `frameflow enqueue`.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueOutput {
    pub queue_type: String,
    pub team_id: String,
    pub session_id: Option<String>,
    pub job_ids: Vec<String>,
    pub priority_jobs: usize,
}

/// JSON output of `frameflow status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusOutput {
    pub job_id: String,
    pub status: Option<JobStatus>,
    pub attempts: i64,
}

/// JSON output of `frameflow stats`, one entry per queue type.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsOutput {
    pub queue_type: String,
    #[serde(flatten)]
    pub lengths: QueueLengths,
    pub total: usize,
}

/// JSON output of `frameflow session`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutput {
    pub session_id: String,
    pub session: Option<SessionRecord>,
    pub remaining: Option<i64>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = cli.scheduler_config();
    if let Commands::Worker(args) = &cli.command {
        config = config.with_fetch_timeout(Duration::from_secs(args.fetch_timeout));
    }

    let scheduler = Scheduler::connect(&cli.redis_url, config)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.redis_url))?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(scheduler, args).await,
        Commands::Enqueue(args) => run_enqueue_command(&scheduler, args).await,
        Commands::Status(args) => run_status_command(&scheduler, args).await,
        Commands::Stats(args) => run_stats_command(&scheduler, args).await,
        Commands::TeamJobs(args) => run_team_jobs_command(&scheduler, args).await,
        Commands::Session(args) => run_session_command(&scheduler, args).await,
        Commands::Recover(args) => run_recover_command(&scheduler, args).await,
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(scheduler: Scheduler, args: WorkerArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let handler = CommandHandler::from_command_line(&args.command)?;
    let config = WorkerPoolConfig::new(args.queue.clone())
        .with_num_workers(args.workers)
        .with_batch_size(args.batch_size)
        .with_max_attempts(args.max_attempts)
        .with_job_timeout(Duration::from_secs(args.job_timeout))
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout));

    let key_prefix = scheduler.config().key_prefix.clone();
    let mut pool = WorkerPool::new(scheduler, Arc::new(handler), config);
    pool.start().await?;
    info!(
        queue_type = %args.queue,
        key_prefix = %key_prefix,
        num_workers = pool.num_workers(),
        program = %args.command[0],
        "Worker pool running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let shutdown = pool.shutdown().await;
    let stats = pool.stats();
    println!(
        "Processed {} jobs ({} completed, {} failed, {} retried), {:.1}% success",
        stats.total_processed(),
        stats.jobs_completed,
        stats.jobs_failed,
        stats.jobs_retried,
        stats.success_rate()
    );
    if args.print_metrics {
        print!("{}", export_metrics());
    }

    shutdown.map_err(Into::into)
}

// ============================================================================
// Enqueue
// ============================================================================

async fn run_enqueue_command(scheduler: &Scheduler, args: EnqueueArgs) -> anyhow::Result<()> {
    let specs = load_job_specs(Path::new(&args.file))?;
    let jobs = build_jobs(specs, &args.queue, &args.team, args.priority)?;
    let job_ids: Vec<String> = jobs.iter().map(|job| job.job_id.clone()).collect();
    let priority_jobs = jobs.iter().filter(|job| job.priority).count();

    let producer = scheduler.producer();
    match &args.session {
        Some(session_id) => {
            let metadata = parse_metadata(args.metadata.as_deref())?;
            producer
                .start_session(&args.queue, &args.team, session_id, jobs, metadata)
                .await?;
        }
        None => {
            let (priority, regular): (Vec<Job>, Vec<Job>) =
                jobs.into_iter().partition(|job| job.priority);
            if !priority.is_empty() {
                producer.enqueue(&args.queue, priority, true).await?;
            }
            if !regular.is_empty() {
                producer.enqueue(&args.queue, regular, false).await?;
            }
        }
    }

    let output = EnqueueOutput {
        queue_type: args.queue,
        team_id: args.team,
        session_id: args.session,
        job_ids,
        priority_jobs,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "✓ Enqueued {} jobs on '{}' ({} priority)",
            output.job_ids.len(),
            output.queue_type,
            output.priority_jobs
        );
        if let Some(session_id) = &output.session_id {
            println!("  Session: {}", session_id);
        }
    }
    Ok(())
}

/// Reads an enqueue file: a JSON array of [`JobSpec`].
fn load_job_specs(path: &Path) -> anyhow::Result<Vec<JobSpec>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let specs: Vec<JobSpec> = serde_json::from_str(&content)
        .with_context(|| format!("Job file {} is not a JSON array of jobs", path.display()))?;

    info!(count = specs.len(), path = %path.display(), "Loaded job specs");
    Ok(specs)
}

fn build_jobs(
    specs: Vec<JobSpec>,
    queue_type: &str,
    team_id: &str,
    default_priority: bool,
) -> anyhow::Result<Vec<Job>> {
    if specs.is_empty() {
        anyhow::bail!("Job file contains no jobs");
    }

    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(specs.len());
    for spec in specs {
        let job_id = spec
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if !seen.insert(job_id.clone()) {
            anyhow::bail!("Duplicate job id '{}' in job file", job_id);
        }
        jobs.push(
            Job::new(job_id, queue_type, team_id, spec.payload)
                .with_priority(spec.priority.unwrap_or(default_priority)),
        );
    }
    Ok(jobs)
}

fn parse_metadata(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--metadata is not valid JSON"),
        None => Ok(serde_json::Value::Null),
    }
}

// ============================================================================
// Inspection
// ============================================================================

async fn run_status_command(scheduler: &Scheduler, args: StatusArgs) -> anyhow::Result<()> {
    let output = StatusOutput {
        status: scheduler.statuses().get_status(&args.job_id).await?,
        attempts: scheduler.retries().current(&args.job_id).await?,
        job_id: args.job_id,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_stats_command(scheduler: &Scheduler, args: StatsArgs) -> anyhow::Result<()> {
    let mut output = Vec::with_capacity(args.queues.len());
    for queue_type in args.queues {
        let lengths = scheduler.manager().get_queue_lengths(&queue_type).await?;
        output.push(QueueStatsOutput {
            queue_type,
            total: lengths.total(),
            lengths,
        });
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_team_jobs_command(scheduler: &Scheduler, args: TeamJobsArgs) -> anyhow::Result<()> {
    let job_ids = scheduler.registry().get_team_job_ids(&args.team_id).await?;
    println!("{}", serde_json::to_string_pretty(&job_ids)?);
    Ok(())
}

async fn run_session_command(scheduler: &Scheduler, args: SessionArgs) -> anyhow::Result<()> {
    let output = SessionOutput {
        session: scheduler.sessions().get_session(&args.session_id).await?,
        remaining: scheduler.sessions().remaining(&args.session_id).await?,
        session_id: args.session_id,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_recover_command(scheduler: &Scheduler, args: RecoverArgs) -> anyhow::Result<()> {
    let recovered = scheduler.manager().recover_processing(&args.queue).await?;
    println!("Recovered {} jobs onto '{}'", recovered, args.queue);
    Ok(())
}
