use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use refsync_core::RunStatus;
use refsync_storage::{CheckpointStore, FeedCache, PgEntityStore};
use refsync_sync::{ErrorPolicy, RunConfig, RunMode, StalePolicy};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "refsync")]
#[command(about = "Reconcile a reference-data feed into the entity store")]
struct Cli {
    /// YAML run configuration; REFSYNC_* environment variables override it.
    #[arg(long, short, global = true, env = "REFSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, reconcile and clean up. Resumes from a matching checkpoint.
    Run {
        #[arg(long)]
        mode: Option<RunMode>,
        #[arg(long)]
        error_policy: Option<ErrorPolicy>,
        #[arg(long)]
        stale_policy: Option<StalePolicy>,
        #[arg(long)]
        commit_interval: Option<usize>,
    },
    /// Evaluate the delete-threshold gate without writing anything.
    Precheck,
    /// Show the cached feed and checkpoint for the configured run key.
    Status,
    /// Remove the cached feed, its sidecar and the checkpoint.
    Reset,
    /// Apply database migrations.
    Migrate,
}

/// `RUST_LOG` when set and valid, otherwise `info`.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn exit_code_for(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::AbortedThreshold => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let load_config =
        || RunConfig::load(cli.config.as_deref()).context("loading run configuration");

    match cli.command.unwrap_or(Commands::Run {
        mode: None,
        error_policy: None,
        stale_policy: None,
        commit_interval: None,
    }) {
        Commands::Run {
            mode,
            error_policy,
            stale_policy,
            commit_interval,
        } => {
            let mut config = load_config()?;
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(policy) = error_policy {
                config.error_policy = policy;
            }
            if let Some(policy) = stale_policy {
                config.stale_policy = policy;
            }
            if let Some(interval) = commit_interval {
                config.commit_interval = interval;
            }
            config.validate()?;

            let pipeline = refsync_sync::pipeline_from_config(config).await?;
            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping at the next chunk boundary");
                    cancel.cancel();
                }
            });

            let report = pipeline.run_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.metrics.skipped > 0 {
                eprintln!(
                    "warning: {} row(s) skipped under best-effort",
                    report.metrics.skipped
                );
            }
            Ok(exit_code_for(report.status))
        }
        Commands::Precheck => {
            let config = load_config()?;
            let pipeline = refsync_sync::pipeline_from_config(config).await?;
            let report = pipeline.precheck_only().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.proceeds() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Commands::Status => {
            let config = load_config()?;
            let cache = FeedCache::new(config.download_cache.clone(), config.run_key());
            match cache.inspect().await? {
                Some(handle) => println!(
                    "cache: {} ({} bytes, sha256 {})",
                    handle.path.display(),
                    handle.byte_size,
                    handle.content_hash
                ),
                None => println!("cache: none for run key {}", cache.run_key()),
            }
            match CheckpointStore::new(config.checkpoint_path.clone()).load().await? {
                Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
                None => println!("checkpoint: none"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset => {
            let config = load_config()?;
            FeedCache::new(config.download_cache.clone(), config.run_key())
                .remove()
                .await
                .with_context(|| format!("removing {}", config.download_cache.display()))?;
            CheckpointStore::new(config.checkpoint_path.clone())
                .clear()
                .await?;
            info!("cache and checkpoint removed");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            // Only the database is needed here, so the feed settings are not required.
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for migrate")?;
            PgEntityStore::connect(&url).await?.migrate().await?;
            info!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn log_filter_defaults_to_info() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(log_filter().max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn subcommand_flags_parse() {
        let cli = Cli::try_parse_from([
            "refsync",
            "run",
            "--mode",
            "two-pass",
            "--error-policy",
            "best-effort",
            "--commit-interval",
            "50",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Run {
                mode,
                error_policy,
                commit_interval,
                ..
            }) => {
                assert_eq!(mode, Some(RunMode::TwoPass));
                assert_eq!(error_policy, Some(ErrorPolicy::BestEffort));
                assert_eq!(commit_interval, Some(50));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
