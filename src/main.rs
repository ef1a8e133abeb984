mod cli;
mod progress;

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use cli::Cli;
use multifetch::config::Config;
use multifetch::job::{JobId, JobStatus};
use multifetch::orchestrator::Orchestrator;
use progress::ProgressReporter;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match &cli.config {
        Some(path) => Config::from_path(path).await?,
        None => Config::default(),
    };

    let requests = cli.job_requests()?;
    let orchestrator = Orchestrator::new(config);
    let (subscriber_id, mut events) = orchestrator.subscribe().await;

    let mut pending: HashSet<JobId> = HashSet::new();
    for request in &requests {
        let id = orchestrator
            .add(request.url.clone(), request.dest_dir.clone(), request.filename.clone(), request.params.clone())
            .await?;
        pending.insert(id);
    }

    let mut reporter = ProgressReporter::new(cli.progress_mode());
    let mut any_failed = false;

    while !pending.is_empty() {
        let Some(summary) = events.recv().await else {
            break;
        };
        if !pending.contains(&summary.id) {
            continue;
        }
        reporter.handle(&summary);
        if summary.status.is_terminal() {
            if matches!(summary.status, JobStatus::Failed | JobStatus::Cancelled) {
                any_failed = true;
            }
            pending.remove(&summary.id);
        }
    }

    orchestrator.unsubscribe(subscriber_id).await;

    if any_failed {
        return Err(anyhow!("one or more downloads did not complete successfully"));
    }
    info!("all downloads completed");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
