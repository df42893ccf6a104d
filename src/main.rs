use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use tutorflow::cli::{Cli, Command};
use tutorflow::runtime;
use tutorflow_config::Config;
use tutorflow_store::Store;
use tutorflow_utils::logging;
use tutorflow_worker::freshness;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_init = if cli.json_logs {
        logging::init_tracing_json()
    } else {
        logging::init_tracing(cli.verbose)
    };
    if let Err(e) = log_init {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Worker => {
            let store = runtime::build_store(&config, cli.store.into()).await?;
            let ctx = runtime::build_context(config, store)?;
            runtime::run_daemon(ctx).await
        }
        Command::Enqueue {
            channel,
            message_ids,
            force,
        } => {
            let store = runtime::build_store(&config, cli.store.into()).await?;
            let n = store
                .enqueue(&config.pipeline_version, &channel, &message_ids, force)
                .await?;
            println!("{n} job(s) pending");
            Ok(())
        }
        Command::Freshness => {
            let store = runtime::build_store(&config, cli.store.into()).await?;
            let n = freshness::retier_open_assignments(
                store.as_ref(),
                &config.freshness,
                chrono::Utc::now(),
            )
            .await?;
            println!("{n} assignment(s) retiered");
            Ok(())
        }
        Command::RequeueStale { older_than_s } => {
            let store = runtime::build_store(&config, cli.store.into()).await?;
            let n = store.requeue_stale(Duration::from_secs(older_than_s)).await?;
            println!("{n} job(s) requeued");
            Ok(())
        }
        Command::ConfigCheck => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
