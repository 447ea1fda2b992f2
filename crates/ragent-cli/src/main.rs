//! `ragent`: command-line front end for the task scheduler.

use anyhow::Context;
use clap::Parser;

mod cli;
mod commands;

use cli::{Cli, Commands, HistoryAction, ScheduleAction};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logs go to stderr so `--json` output on stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ragent=info,ragent_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // expressions can be checked without touching config or the database
    if let Commands::Schedule {
        action: ScheduleAction::Check { expr, count },
    } = &cli.command
    {
        return commands::schedule_check(expr, *count);
    }

    let config = ragent_core::RagentConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    let handle = commands::open(&config)?;

    match cli.command {
        Commands::Serve => commands::serve(&handle).await,
        Commands::Task { action } => commands::task(&handle, action).await,
        Commands::History {
            action: HistoryAction::Prune,
        } => {
            let removed = handle.prune_history()?;
            println!("removed {removed} run(s)");
            Ok(())
        }
        Commands::Schedule { .. } => Ok(()),
    }
}
