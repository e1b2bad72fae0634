use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cisync_core::CiService;
use cisync_sync::{build_scheduler, Config, CycleSummary, DispatchOptions, Dispatcher, SyncOptions};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cisync")]
#[command(about = "Incremental CI history sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file; falls back to $CISYNC_CONFIG, then ./cisync.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dry run with verbose logging: watermarks are never persisted.
    #[arg(long, global = true)]
    debug: bool,

    /// Comma-separated services to sync, e.g. `github,jenkins`.
    #[arg(long, global = true, value_delimiter = ',')]
    only_services: Vec<CiService>,

    /// Skip failing runs and advance watermarks past them instead of
    /// stopping. A skipped run is never retried by later syncs.
    #[arg(long, global = true)]
    force_save_last_run: bool,

    /// Six-field cron expression; keeps running and syncs on each tick.
    #[arg(long, global = true)]
    schedule: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle (default).
    Sync,
    /// Validate the config and list the providers it enables.
    Check,
}

fn init_tracing(debug: bool) {
    let default = if debug { "cisync=debug" } else { "cisync=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(fmt::layer())
        .init();
}

fn print_summary(summary: &CycleSummary) {
    let workflows: usize = summary.providers.iter().map(|p| p.workflow_reports).sum();
    let tests: usize = summary.providers.iter().map(|p| p.test_reports).sum();
    println!(
        "sync complete: run_id={} providers={} workflow_reports={} test_reports={} failed_entities={} success={}",
        summary.run_id,
        summary.providers.len(),
        workflows,
        tests,
        summary.failed_entities(),
        summary.is_success()
    );
}

async fn run(cli: Cli) -> Result<bool> {
    let path = Config::resolve_path(cli.config.clone());
    let config = Config::load(&path)?;
    let options = DispatchOptions {
        sync: SyncOptions {
            force_save_last_run: cli.force_save_last_run,
        },
        dry_run: cli.debug,
        only_services: cli.only_services.clone(),
    };
    let dispatcher = Dispatcher::from_config(&config, &options)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Check => {
            let services: Vec<&str> = dispatcher.services().iter().map(CiService::as_str).collect();
            println!("config ok: {} providers=[{}]", path.display(), services.join(","));
            Ok(true)
        }
        Commands::Sync => {
            if dispatcher.is_empty() {
                warn!(config = %path.display(), "no providers selected; nothing to sync");
            }
            match cli.schedule {
                Some(cron) => {
                    let mut sched = build_scheduler(Arc::new(dispatcher), &cron).await?;
                    sched.start().await.context("starting scheduler")?;
                    info!(%cron, "scheduler started; waiting for ctrl-c");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    sched.shutdown().await.context("stopping scheduler")?;
                    Ok(true)
                }
                None => {
                    let summary = dispatcher.run_once().await;
                    print_summary(&summary);
                    if cli.debug {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    }
                    Ok(summary.is_success())
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if run(cli).await? {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn force_save_help_warns_that_skipped_runs_are_lost() {
        let help = Cli::command().render_long_help().to_string();
        let help = help.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(help.contains("--force-save-last-run"));
        assert!(help.contains("never retried"));
    }

    #[test]
    fn only_services_splits_on_commas() {
        let cli = Cli::try_parse_from(["cisync", "--only-services", "github,Jenkins"]).unwrap();
        assert_eq!(cli.only_services, vec![CiService::Github, CiService::Jenkins]);
        assert!(cli.command.is_none());
    }
}
