//! dirsync - one-way directory synchronization
//!
//! Reads users and groups from LDAP/Active Directory domains, diffs them
//! against the last committed state and writes the changes as JSON records:
//! - `sync` (alias `fetch`) runs full or incremental reconciliation
//! - `check` verifies connectivity and credentials

use clap::{Parser, Subcommand};

mod commands;
mod config;
mod error;
mod logging;
mod output;
mod sink;

use error::CliResult;

/// dirsync - Directory synchronization
#[derive(Parser)]
#[command(name = "dirsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize one or more domains
    #[command(alias = "fetch")]
    Sync(commands::sync::SyncArgs),

    /// Verify connectivity and credentials
    Check(commands::check::CheckArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let result = run(cli).await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Sync(args) => commands::sync::execute(args).await,
        Commands::Check(args) => commands::check::execute(args).await,
    }
}
