use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use db::{DbConfig, JobFilter, JobStore};
use storage::Storage;
use sync_core::{JobCounts, JobId, JobStatus, JobView, SyncConfig};
use sync_worker::{ObjectStoreUploader, OwnerSyncTable, SyncQueue, SyncService};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Uploads queued recordings to remote storage.
///
/// Worker and retry settings come from `RECSYNC_*` variables. The upload
/// target is `RECSYNC_REMOTE` (`s3://bucket/prefix`, `file:///dir` or
/// `memory://`); S3 credentials come from the usual `AWS_*` variables.
#[derive(Parser, Debug)]
#[command(name = "recsync", about = "Durable upload queue for recordings")]
struct Cli {
    /// Job store endpoint: mem://, file://<path> or rocksdb://<path>
    #[arg(long, default_value = "mem://", env = "RECSYNC_DB")]
    db: String,

    /// Override the number of workers
    #[arg(long)]
    workers: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the upload workers until interrupted
    Run,

    /// Queue a recording for upload and print its job id
    Enqueue {
        file: PathBuf,

        /// Display title (defaults to the file name)
        #[arg(long)]
        title: Option<String>,

        /// Attempt budget for this job
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Request cancellation of a job
    Cancel { job_id: String },

    /// List jobs, oldest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print job counts by status
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }

    let db_config = DbConfig {
        endpoint: cli.db.clone(),
        ..DbConfig::default()
    };
    if db_config.endpoint.starts_with("mem://") && !matches!(cli.command, Command::Run) {
        tracing::warn!("in-memory job store: jobs do not outlive this process");
    }
    let store = JobStore::open(&db_config, config.liveness_timeout()).await?;

    match cli.command {
        Command::Run => run(store, &config).await,
        Command::Enqueue {
            file,
            title,
            max_attempts,
        } => {
            let queue =
                SyncQueue::new(store).with_default_max_attempts(config.default_max_attempts);
            let title = title.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string())
            });
            let job = match max_attempts {
                Some(n) => queue.enqueue_with_attempts(file, title, n).await?,
                None => queue.enqueue(file, title).await?,
            };
            println!("{}", job.id);
            Ok(())
        }
        Command::Cancel { job_id } => {
            let id = JobId::parse(&job_id)?;
            let job = SyncQueue::new(store).cancel(id).await?;
            println!("{}\t{}", job.id, job.status);
            Ok(())
        }
        Command::List { status, limit } => {
            let filter = JobFilter {
                status,
                ..JobFilter::default()
            }
            .with_limit(limit);
            for job in store.list(filter).await? {
                let view = JobView::from(job);
                println!(
                    "{}\t{}\t{}/{}\t{}\t{}",
                    view.id,
                    view.status,
                    view.attempts,
                    view.max_attempts,
                    view.file_path.display(),
                    view.last_error.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Stats => {
            let counts = store.counts().await?;
            for line in stats_lines(&counts) {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn stats_lines(counts: &JobCounts) -> Vec<String> {
    let mut lines = vec![
        format!("pending     {}", counts.pending),
        format!("processing  {}", counts.processing),
        format!("succeeded   {}", counts.succeeded),
        format!("failed      {}", counts.failed),
        format!("cancelled   {}", counts.cancelled),
    ];
    // success_rate is already a percentage.
    if let Some(rate) = counts.success_rate() {
        lines.push(format!("success     {rate:.1}%"));
    }
    lines
}

async fn run(store: JobStore, config: &SyncConfig) -> Result<(), Box<dyn Error>> {
    let storage = Storage::from_env().await?;
    tracing::info!(scheme = storage.scheme(), "uploading to object storage");

    let service = SyncService::start(
        store,
        ObjectStoreUploader::new(storage),
        OwnerSyncTable::new(),
        config,
    )
    .await?;

    let mut events = service.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(target: "recsync::events", "{}", event.description()),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "recsync::events", skipped, "event log lagging")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, waiting for in-flight uploads");
    service.shutdown().await?;
    logger.abort();
    Ok(())
}
