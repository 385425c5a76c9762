// src/cli/mod.rs — CLI definition (clap derive)

pub mod reconcile;
pub mod serve;
pub mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sibyl", about = "Ledger-backed session billing engine", version)]
pub struct Cli {
    /// Config file path
    #[arg(long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the billing scheduler daemon
    Serve,
    /// Show engine status (accounts, ledger, session states)
    Status {
        /// Show per-account balances
        #[arg(long)]
        verbose: bool,
    },
    /// Recompute an account balance from its ledger entries
    Reconcile {
        /// Account id to reconcile
        account: String,
    },
    /// Run database migrations and exit
    Migrate,
}
