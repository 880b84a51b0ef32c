//! gitpulse command line entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gitpulse::config::load_settings;
use gitpulse::github::{GitHubApi, GitHubClient};
use gitpulse::models::{PipelineType, RunStatus};
use gitpulse::pipeline::{AppContext, GithubSync, PipelineController, Scheduler};
use gitpulse::repository::open_database;

/// GitHub repository and contributor analytics pipeline
#[derive(Parser, Debug)]
#[command(name = "gitpulse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch a repository (owner/name) and start tracking it
    Track {
        /// Repository full name, e.g. rust-lang/rust
        full_name: String,
    },

    /// Run one pipeline in the foreground
    Run {
        /// github_sync, data_enrichment, repository_processing or contributor_ranking
        #[arg(value_parser = parse_pipeline_type)]
        pipeline: PipelineType,
    },

    /// Show pipeline state and pending work
    Status {
        #[arg(value_parser = parse_pipeline_type)]
        pipeline: Option<PipelineType>,
    },

    /// List past runs, newest first
    History {
        #[arg(long = "type", value_parser = parse_pipeline_type)]
        pipeline: Option<PipelineType>,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Delete finished runs from the history
    ClearHistory {
        #[arg(long = "type", value_parser = parse_pipeline_type)]
        pipeline: Option<PipelineType>,
    },

    /// Run all pipelines on their cron schedules until interrupted
    Daemon,
}

/// Give cancelled runs a chance to record their end before exiting.
async fn wait_for_runs(controller: &PipelineController) -> Result<()> {
    for _ in 0..60 {
        let states = controller.statuses().await?;
        if !states.iter().any(|s| s.is_running) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    warn!("Runs still active at exit; they will be marked interrupted on next start");
    Ok(())
}

fn parse_pipeline_type(s: &str) -> Result<PipelineType, String> {
    PipelineType::from_str(s).ok_or_else(|| {
        let known: Vec<&str> = PipelineType::ALL.iter().map(|t| t.as_str()).collect();
        format!("unknown pipeline '{}' (expected one of: {})", s, known.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gitpulse={}", log_level).into()),
        )
        .init();

    let settings = load_settings().await;
    settings
        .ensure_directories()
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;
    let pool = open_database(&settings.database_path())
        .await
        .with_context(|| format!("opening {}", settings.database_path().display()))?;

    let api: Option<Arc<dyn GitHubApi>> = match settings.github_token {
        Some(_) => Some(Arc::new(
            GitHubClient::new(&settings).context("building GitHub client")?,
        )),
        None => {
            warn!("GITHUB_TOKEN is not set; only offline pipelines can run");
            None
        }
    };

    let ctx = AppContext::new(settings, pool, api);
    let controller = PipelineController::new(ctx.clone());

    match cli.command {
        Commands::Track { full_name } => {
            let sync = GithubSync::new(&ctx)?;
            match sync.track(&full_name).await? {
                Some(repo) => println!(
                    "Tracking {} ({} stars, {} forks)",
                    repo.full_name, repo.stars, repo.forks
                ),
                None => bail!("{} could not be extracted", full_name),
            }
        }

        Commands::Run { pipeline } => {
            controller.recover().await?;
            let run = controller.run(pipeline).await?;
            println!(
                "{} {}: {} items",
                run.pipeline_type,
                run.status.as_str(),
                run.items_processed
            );
            if let Some(message) = &run.error_message {
                println!("  {}", message);
            }
            if run.status == RunStatus::Failed {
                std::process::exit(1);
            }
        }

        Commands::Status { pipeline } => {
            let states = match pipeline {
                Some(t) => vec![controller.status(t).await?],
                None => controller.statuses().await?,
            };
            println!(
                "{:<24} {:<10} {:>8} {:>10}  {}",
                "PIPELINE", "STATUS", "RUNNING", "PENDING", "LAST RUN"
            );
            for state in states {
                let pending = controller.item_count(state.pipeline_type).await?;
                let last_run = state
                    .last_run
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<24} {:<10} {:>8} {:>10}  {}",
                    state.pipeline_type.as_str(),
                    state.status.as_str(),
                    if state.is_running { "yes" } else { "no" },
                    pending,
                    last_run
                );
            }
        }

        Commands::History { pipeline, limit } => {
            for run in controller.history(pipeline, limit).await? {
                let duration = run
                    .completed_at
                    .map(|end| format!("{}s", (end - run.started_at).num_seconds()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<22} {:<10} {:>6} items {:>8}  {}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.pipeline_type.as_str(),
                    run.status.as_str(),
                    run.items_processed,
                    duration,
                    run.error_message.as_deref().unwrap_or("")
                );
            }
        }

        Commands::ClearHistory { pipeline } => {
            let removed = controller.clear_history(pipeline).await?;
            println!("Removed {} run(s)", removed);
        }

        Commands::Daemon => {
            controller.recover().await?;
            let scheduler = Scheduler::new(controller.clone());
            scheduler.seed().await?;
            let mut sched = scheduler.start().await?;
            info!("gitpulse v{} scheduler running", env!("CARGO_PKG_VERSION"));

            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("Shutting down");

            let mut stopping = false;
            for pipeline_type in PipelineType::ALL {
                stopping |= controller.stop(pipeline_type);
            }
            if stopping {
                wait_for_runs(&controller).await?;
            }
            sched
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("scheduler shutdown: {}", e))?;
        }
    }

    Ok(())
}
