// src/main.rs — Sibyl entry point

use clap::Parser;

use sibyl::cli::{Cli, Commands};
use sibyl::infra::config::Config;
use sibyl::infra::logger;
use sibyl::infra::paths;

#[tokio::main]
async fn main() {
    // Initialize logging (respects RUST_LOG)
    logger::init_logging("info");

    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config (falls back to defaults if no config.toml)
    let config = if let Some(ref path) = cli.config {
        Config::load_from(std::path::Path::new(path))?
    } else {
        Config::load()?
    };

    match cli.command {
        Commands::Serve => sibyl::cli::serve::run_serve(&config).await,
        Commands::Status { verbose } => sibyl::cli::status::show_status(&config, verbose),
        Commands::Reconcile { account } => sibyl::cli::reconcile::run_reconcile(&config, &account),
        Commands::Migrate => {
            let db_path = config
                .database
                .path
                .as_ref()
                .map(std::path::PathBuf::from)
                .unwrap_or_else(paths::db_path);
            sibyl::store::open(&db_path)?;
            println!("Migrations applied ({}).", db_path.display());
            Ok(())
        }
    }
}
