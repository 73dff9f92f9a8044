mod cli;
mod ui;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use turnstile::CoordinatorConfig;
use turnstile::demo::{self, ticket_coordinator};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => CoordinatorConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::load()?,
    };
    let out = ui::Output::new();

    match cli.command {
        Command::Demo { workers } => {
            let (_coordinator, engine) = ticket_coordinator(config)?;
            let report = demo::race(&engine, "T-1001", usize::from(workers)).await?;
            out.race(&report);
            out.audit_trail(&report.history);
        }
        Command::Merge { workers } => {
            let (coordinator, engine) = ticket_coordinator(config)?;
            let pb = out.merge_progress(u64::from(workers));
            let report = demo::merge_storm(&coordinator, &engine, "T-2001", usize::from(workers), |outcome| {
                pb.set_message(format!("v{}", outcome.version));
                pb.inc(1);
            })
            .await?;
            pb.finish_and_clear();
            out.merge(&report);
        }
        Command::Table => {
            out.table(&demo::ticket_table()?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
