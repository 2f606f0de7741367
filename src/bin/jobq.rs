//! jobq CLI: operator interface to a Postgres-backed job queue.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobq::config::secrets::ExposeSecret;
use jobq::config::{Config, WorkerFile, WorkerSection};
use jobq::store::{JobStore, ListQuery, PgStore};
use jobq::telemetry::{TelemetryConfig, init_telemetry};
use jobq::worker::CommandHandler;
use jobq::{EnqueueOptions, JobId, Queue, QueueSelector, Status, Worker, WorkerEvent};

#[derive(Parser)]
#[command(name = "jobq", about = "Job queue with atomic claims and stall recovery")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Enqueue a job, or refresh one that is still waiting
    Enqueue {
        /// Queue name
        queue: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Job id (random when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Priority (higher is served first)
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Execution timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Attempts before the job is marked failed
        #[arg(long, default_value_t = 1)]
        max_attempts: u32,
    },
    /// Show a job
    Show {
        /// Job id
        id: String,
    },
    /// List jobs in claim order
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by queue
        #[arg(long)]
        queue: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Return overdue dequeued jobs to their queue
    Reclaim {
        /// Queue selector: `*`, `name` or `a,b`
        #[arg(long, default_value = "*")]
        selector: String,
    },
    /// Run a worker that executes a command for every job
    Work {
        /// Queue selector: `*`, `name` or `a,b`
        #[arg(long)]
        selector: Option<String>,
        /// Executable receiving the payload on stdin
        #[arg(long)]
        command: Option<PathBuf>,
        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
        #[arg(long)]
        max_concurrency: Option<usize>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        /// Worker identity recorded on claimed jobs
        #[arg(long)]
        name: Option<String>,
        /// TOML file with a [worker] table
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let guard = init_telemetry(
        TelemetryConfig::new("jobq")
            .endpoint(config.otel_endpoint.clone())
            .log_level(config.log_level.clone()),
    )?;

    let store = PgStore::connect(config.database_url.expose_secret()).await?;

    let outcome = match cli.command {
        Command::Migrate => {
            store.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Enqueue {
            queue,
            payload,
            id,
            priority,
            timeout_ms,
            max_attempts,
        } => {
            let mut options = EnqueueOptions::new()
                .priority(priority)
                .execution_timeout_ms(timeout_ms)
                .max_attempts(max_attempts);
            if let Some(id) = id {
                options = options.id(id);
            }
            cmd_enqueue(Queue::new(store), &queue, payload, options).await
        }
        Command::Show { id } => cmd_show(&store, id).await,
        Command::List {
            status,
            queue,
            limit,
        } => cmd_list(&store, status, queue, limit).await,
        Command::Reclaim { selector } => {
            let filter = selector.parse::<QueueSelector>()?.into_filter()?;
            let count = store.reclaim_stalled(&filter).await?;
            println!("Reclaimed {count} stalled job(s).");
            Ok(())
        }
        Command::Work {
            selector,
            command,
            args,
            max_concurrency,
            poll_interval_ms,
            name,
            config: file,
        } => {
            let section = match file {
                Some(path) => WorkerFile::load(&path)?.worker,
                None => WorkerSection::default(),
            };
            let mut options = section.apply(config.worker_options());
            if let Some(n) = max_concurrency {
                options.max_concurrency = n;
            }
            if let Some(ms) = poll_interval_ms {
                options.poll_interval = Duration::from_millis(ms);
            }
            if name.is_some() {
                options.name = name;
            }

            let selector = selector
                .or(section.selector.clone())
                .unwrap_or_else(|| "*".to_string());
            let command = command
                .or(section.command.clone().map(PathBuf::from))
                .ok_or_else(|| anyhow::anyhow!("no command given (--command or config file)"))?;
            let args = if args.is_empty() { section.args } else { args };
            let handler = CommandHandler::new(&command)?.args(args);

            let queue = Queue::new(store);
            let worker = queue.worker(selector.parse::<QueueSelector>()?, handler, options)?;
            cmd_work(worker).await
        }
    };

    // Push buffered spans and metrics before the guard shuts exporters down.
    guard.force_flush();
    outcome
}

async fn cmd_enqueue(
    queue: Queue,
    name: &str,
    payload: Option<String>,
    options: EnqueueOptions,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Value::Null,
    };

    let job = queue.enqueue(name, payload, options).await?;
    println!("Enqueued: {} (queue: {}, priority: {})", job.id, job.queue_name, job.priority);
    Ok(())
}

async fn cmd_work(worker: Worker) -> anyhow::Result<()> {
    let mut events = worker.subscribe();
    let name = worker.name().to_string();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                WorkerEvent::Error(e) => tracing::error!(worker = %name, error = %e, "worker error"),
                WorkerEvent::Drained => tracing::info!(worker = %name, "queue drained"),
                _ => {}
            }
        }
    });

    worker.start()?;
    tokio::signal::ctrl_c().await.ok();
    worker.stop().await;
    Ok(())
}

async fn cmd_show(store: &PgStore, id: String) -> anyhow::Result<()> {
    let Some(job) = store.get(&JobId::from(id.clone())).await? else {
        anyhow::bail!("no job with id '{id}'");
    };

    println!("ID:         {}", job.id);
    println!("Queue:      {}", job.queue_name);
    println!("Status:     {}", job.status);
    println!("Priority:   {}", job.priority);
    println!("Timeout:    {}ms", job.execution_timeout_ms);
    println!("Attempts:   {}/{}", job.attempts_used, job.max_attempts);
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Enqueued:   {}", job.enqueued_at);
    if let Some(at) = job.dequeued_at {
        println!("Dequeued:   {at}");
    }
    if let Some(deadline) = job.stall_deadline {
        println!("Stalls at:  {deadline}");
    }
    if let Some(ref owner) = job.owner_name {
        println!("Owner:      {owner}");
    }
    if let Some(ref result) = job.result {
        println!("---");
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(at) = job.completed_at {
        println!("Completed:  {at}");
    }
    if let Some(ref error) = job.error_info {
        println!("---");
        println!("Error:      {}", error.message);
        if let Some(ref trace) = error.trace {
            println!("Trace:      {trace}");
        }
    }
    if let Some(at) = job.failed_at {
        println!("Failed:     {at}");
    }
    Ok(())
}

async fn cmd_list(
    store: &PgStore,
    status: Option<String>,
    queue: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let status: Option<Status> = status.map(|s| s.parse()).transpose()?;
    let jobs = store.list(&ListQuery { status, queue, limit }).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<10}  {:<5}  {:<8}  ENQUEUED",
        "ID", "QUEUE", "STATUS", "PRI", "ATTEMPTS"
    );
    println!("{}", "-".repeat(100));

    for job in &jobs {
        println!(
            "{:<36}  {:<16}  {:<10}  {:<5}  {:<8}  {}",
            job.id,
            job.queue_name,
            job.status,
            job.priority,
            format!("{}/{}", job.attempts_used, job.max_attempts),
            job.enqueued_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}
