use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use stem_splitter::config::AppConfig;
use stem_splitter::jobs::{JobStatus, StemCount};
use stem_splitter::logging::init_logging;
use stem_splitter::services::{JobResultView, ServiceContainer};
use stem_splitter::upload::parse_stem_count;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio file to separate
    input: PathBuf,

    /// Number of stems (2, 4 or 5)
    #[arg(short, long, default_value = "2", value_parser = parse_stems)]
    stems: StemCount,

    /// Keep the service running after the job finishes, until Ctrl-C
    #[arg(long)]
    keep_running: bool,

    /// Log filter directive, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Print the final job status as JSON
    #[arg(long)]
    json: bool,

    /// Print operation timings as JSON before exiting
    #[arg(long)]
    metrics: bool,
}

fn parse_stems(raw: &str) -> Result<StemCount, String> {
    parse_stem_count(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env_or_default();

    let (logging, _guard) = init_logging(&config.log_dir)?;
    if let Some(filter) = &args.log_filter {
        logging.set_filter(filter)?;
    }

    let container = ServiceContainer::new(config)
        .await
        .context("Failed to initialize services")?;
    container.start();
    logging.start_retention_cleanup(container.cancellation_token().child_token());

    let outcome = run(&container, &args).await;

    if args.metrics {
        println!("{}", serde_json::to_string_pretty(&container.metrics())?);
    }

    if args.keep_running && outcome.is_ok() {
        info!("Job finished; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.ok();
    }

    container.shutdown().await;
    outcome
}

async fn run(container: &ServiceContainer, args: &Args) -> anyhow::Result<()> {
    let filename = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Input path has no file name")?;
    let mut file = tokio::fs::File::open(&args.input)
        .await
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    let size = file.metadata().await.ok().map(|m| m.len());

    let job = container
        .submit(&filename, size, &mut file, args.stems)
        .await
        .context("Submission rejected")?;
    info!(job_id = %job.id, "Waiting for job");

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let mut last_seen: Option<(JobStatus, f64)> = None;

    let view = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(job_id = %job.id, "Interrupted; the job will not resume");
                anyhow::bail!("Interrupted before job {} finished", job.id);
            }
            _ = interval.tick() => {}
        }

        let view = container
            .status(&job.id)
            .await
            .with_context(|| format!("Job {} disappeared", job.id))?;

        let current = (view.status, view.progress);
        if last_seen != Some(current) {
            info!(
                job_id = %job.id,
                status = %view.status,
                progress = view.progress,
                "Job status changed"
            );
            last_seen = Some(current);
        }

        if view.status.is_terminal() {
            break view;
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    }

    match container.result(&job.id).await? {
        JobResultView::Ready(archive) => {
            println!(
                "{} ({} bytes, download as {})",
                archive.path.display(),
                archive.size_bytes,
                archive.download_name
            );
            Ok(())
        }
        JobResultView::NotReady { status, error } => {
            let error = error.unwrap_or_else(|| format!("job ended as {status}"));
            anyhow::bail!("Separation failed: {error}")
        }
    }
}
