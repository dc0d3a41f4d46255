//! CLI for reelwatch - asynchronous video generation jobs.

use chrono::{Duration as ChronoDuration, Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reelwatch::providers::{load_sdk_config, BedrockJobService, S3ObjectStore};
use reelwatch::{
    media, Job, JobFilter, JobMonitor, JobOutcome, JobService, JobStatus, S3Location,
    VideoGenerationRequest, DEFAULT_MODEL_ID,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "reelwatch")]
#[command(about = "Submit, monitor and download asynchronous video generation jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Root folder for job outputs
    #[arg(long, global = true, env = "REELWATCH_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// AWS region (defaults to the SDK chain, then us-east-1)
    #[arg(long, global = true)]
    region: Option<String>,

    /// Seconds between status queries
    #[arg(long, global = true, default_value_t = 10)]
    poll_interval: u64,

    /// Give up waiting after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a video generation job and wait for the result
    Generate(GenerateArgs),

    /// Show the current state of a job
    Status {
        /// Invocation ARN of the job
        arn: String,
    },

    /// List jobs
    List(ListArgs),

    /// Wait for one job and download its video
    Monitor {
        /// Invocation ARN of the job
        arn: String,
    },

    /// Download every finished job and wait for the running ones
    Sweep {
        /// Only jobs submitted within the last N hours
        #[arg(long)]
        since_hours: Option<i64>,
    },

    /// Play the second video right after the first
    Stitch {
        /// First clip
        first: PathBuf,
        /// Second clip
        second: PathBuf,
        /// Output file
        output: PathBuf,
    },

    /// Generate two clips, the second continuing from the first's last frame, and stitch them
    Chain(ChainArgs),
}

#[derive(Args)]
struct Target {
    /// S3 bucket receiving the videos
    #[arg(short, long, env = "REELWATCH_BUCKET")]
    bucket: String,

    /// Model identifier
    #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Seed for deterministic generation
    #[arg(long)]
    seed: Option<u32>,
}

#[derive(Args)]
struct GenerateArgs {
    /// The text prompt describing the video
    prompt: String,

    /// First frame (1280x720 PNG or JPEG)
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Return right after submitting
    #[arg(long)]
    no_wait: bool,

    #[command(flatten)]
    target: Target,
}

#[derive(Args)]
struct ListArgs {
    /// Only jobs in this status
    #[arg(short, long, value_enum, default_value = "in-progress")]
    status: StatusArg,

    /// Maximum number of jobs
    #[arg(long, default_value_t = 10)]
    max_results: i32,

    /// Only jobs submitted within the last N hours
    #[arg(long)]
    since_hours: Option<i64>,
}

#[derive(Args)]
struct ChainArgs {
    /// Prompt for the first clip
    first_prompt: String,

    /// Prompt for the continuation
    second_prompt: String,

    #[command(flatten)]
    target: Target,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    InProgress,
    Completed,
    Failed,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::InProgress => JobStatus::InProgress,
            StatusArg::Completed => JobStatus::Completed,
            StatusArg::Failed => JobStatus::Failed,
        }
    }
}

struct Session {
    monitor: JobMonitor,
    objects: Arc<S3ObjectStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reelwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping");
                cancel.cancel();
            }
        }
    });

    match &cli.command {
        Commands::Generate(args) => {
            let session = connect(&cli, cancel).await?;
            generate(&session, args, cli.json).await?;
        }
        Commands::Status { arn } => {
            let session = connect(&cli, cancel).await?;
            let job = session.monitor.service().get(arn).await?;
            print_jobs(&[job], cli.json)?;
        }
        Commands::List(args) => {
            let session = connect(&cli, cancel).await?;
            let mut filter = JobFilter::status(args.status.into()).with_max_results(args.max_results);
            if let Some(hours) = args.since_hours {
                filter = filter.submitted_after(Utc::now() - ChronoDuration::hours(hours));
            }
            let jobs = session.monitor.service().list(&filter).await?;
            print_jobs(&jobs, cli.json)?;
        }
        Commands::Monitor { arn } => {
            let session = connect(&cli, cancel).await?;
            let outcome = session.monitor.monitor_one(arn).await?;
            print_outcome(arn, &outcome, cli.json)?;
        }
        Commands::Sweep { since_hours } => {
            let session = connect(&cli, cancel).await?;
            let mut filter = JobFilter::default();
            if let Some(hours) = since_hours {
                filter = filter.submitted_after(Utc::now() - ChronoDuration::hours(*hours));
            }
            let report = session.monitor.monitor_many(&filter).await?;
            if cli.json {
                let result = serde_json::json!({
                    "downloaded": report.downloaded,
                    "already_downloaded": report.already_downloaded,
                    "failed": report.failed,
                    "missing": report.missing,
                    "errors": report.errors,
                    "pending": report.pending,
                    "interrupted": report.interrupted.map(|reason| reason.to_string()),
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for record in &report.downloaded {
                    println!("Downloaded: {}", record.path.display());
                }
                println!(
                    "{} downloaded, {} already on disk, {} failed, {} missing, {} errors",
                    report.downloaded.len(),
                    report.already_downloaded,
                    report.failed.len(),
                    report.missing.len(),
                    report.errors.len()
                );
                for handle in &report.pending {
                    println!("Still in progress: {handle}");
                }
            }
            if let Some(reason) = report.interrupted {
                anyhow::bail!("sweep {reason} with {} jobs in progress", report.pending.len());
            }
        }
        Commands::Stitch {
            first,
            second,
            output,
        } => {
            media::stitch_videos(first, second, output).await?;
            println!("Stitched video: {}", output.display());
        }
        Commands::Chain(args) => {
            let session = connect(&cli, cancel).await?;
            chain(&session, &cli.output_dir, args, cli.json).await?;
        }
    }

    Ok(())
}

async fn connect(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<Session> {
    let config = load_sdk_config(cli.region.clone()).await;
    let service = BedrockJobService::builder()
        .sdk_config(config.clone())
        .build()
        .await?;
    tracing::debug!(region = service.region(), "connected to {}", service.name());
    let objects = Arc::new(S3ObjectStore::new(&config));

    let mut builder = JobMonitor::builder(Arc::new(service), objects.clone())
        .output_dir(&cli.output_dir)
        .poll_interval(Duration::from_secs(cli.poll_interval))
        .cancel_token(cancel);
    if let Some(secs) = cli.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    Ok(Session {
        monitor: builder.build(),
        objects,
    })
}

/// Creates the bucket if needed and starts one job.
async fn submit(
    session: &Session,
    target: &Target,
    request: VideoGenerationRequest,
) -> anyhow::Result<Job> {
    let request = match target.seed {
        Some(seed) => request.with_seed(seed),
        None => request,
    };
    let input = request.to_model_input()?;
    let output_uri = format!("s3://{}", target.bucket);
    let location = S3Location::parse(&output_uri)?;
    session.objects.create_bucket(&location.bucket).await?;

    match session
        .monitor
        .start_job(&target.model, &input, &output_uri)
        .await
    {
        Ok(job) => Ok(job),
        Err(e) => {
            tracing::error!("failed to start video generation: {e}");
            Err(e.into())
        }
    }
}

/// Waits for a job and returns the downloaded video path.
async fn wait_for_video(session: &Session, job: &Job) -> anyhow::Result<PathBuf> {
    let outcome = session.monitor.monitor_one(&job.invocation_arn).await?;
    match outcome.artifact_path() {
        Some(path) => Ok(path.to_path_buf()),
        None => anyhow::bail!(
            "job {} produced no video ({:?})",
            job.job_id(),
            outcome
        ),
    }
}

async fn generate(session: &Session, args: &GenerateArgs, json_output: bool) -> anyhow::Result<()> {
    let mut request = VideoGenerationRequest::new(&args.prompt);
    if let Some(ref image) = args.image {
        request = request.with_image_file(image)?;
    }

    let job = submit(session, &args.target, request).await?;
    let folder = session.monitor.artifacts().job_dir(&job);

    if args.no_wait {
        if json_output {
            let result = serde_json::json!({
                "type": "video",
                "invocation_arn": job.invocation_arn,
                "folder": folder.display().to_string(),
                "status": job.status,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("Started job: {}", job.invocation_arn);
            println!("Job folder: {}", folder.display());
        }
        return Ok(());
    }

    let outcome = session.monitor.monitor_one(&job.invocation_arn).await?;
    print_outcome(&job.invocation_arn, &outcome, json_output)
}

async fn chain(
    session: &Session,
    output_root: &Path,
    args: &ChainArgs,
    json_output: bool,
) -> anyhow::Result<()> {
    let first_job = submit(
        session,
        &args.target,
        VideoGenerationRequest::new(&args.first_prompt),
    )
    .await?;
    let first_video = wait_for_video(session, &first_job).await?;
    tracing::info!(path = %first_video.display(), "first clip ready");

    let generation_dir = output_root.join(Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
    let last_frame = generation_dir.join("last_frame.png");
    media::extract_last_frame(&first_video, &last_frame).await?;

    let second_job = submit(
        session,
        &args.target,
        VideoGenerationRequest::new(&args.second_prompt).with_image_file(&last_frame)?,
    )
    .await?;
    let second_video = wait_for_video(session, &second_job).await?;
    tracing::info!(path = %second_video.display(), "second clip ready");

    let merged = generation_dir.join("merged_video.mp4");
    media::stitch_videos(&first_video, &second_video, &merged).await?;

    if json_output {
        let result = serde_json::json!({
            "type": "chain",
            "success": true,
            "clips": [first_video.display().to_string(), second_video.display().to_string()],
            "last_frame": last_frame.display().to_string(),
            "output": merged.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Merged video: {}", merged.display());
    }
    Ok(())
}

fn print_outcome(arn: &str, outcome: &JobOutcome, json_output: bool) -> anyhow::Result<()> {
    let (status, path, message) = match outcome {
        JobOutcome::Downloaded(record) => ("downloaded", Some(&record.path), None),
        JobOutcome::AlreadyDownloaded(record) => ("already_downloaded", Some(&record.path), None),
        JobOutcome::Failed { message } => ("failed", None, message.as_deref()),
        JobOutcome::ArtifactMissing => ("artifact_missing", None, None),
    };

    if json_output {
        let result = serde_json::json!({
            "type": "video",
            "success": path.is_some(),
            "invocation_arn": arn,
            "outcome": status,
            "output": path.map(|p| p.display().to_string()),
            "failure_message": message,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        match path {
            Some(path) => println!("Video successfully generated and downloaded to: {}", path.display()),
            None => println!(
                "Failed to generate or download video ({status}{})",
                message.map(|m| format!(": {m}")).unwrap_or_default()
            ),
        }
    }
    Ok(())
}

fn print_jobs(jobs: &[Job], json_output: bool) -> anyhow::Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs found.");
    }
    for job in jobs {
        let secs = job.elapsed().as_secs();
        println!(
            "{}  {:<10}  submitted {}  elapsed {}m {}s",
            job.job_id(),
            job.status,
            job.submit_time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            secs / 60,
            secs % 60
        );
        if let Some(ref reason) = job.failure_message {
            println!("    reason: {reason}");
        }
    }
    Ok(())
}
