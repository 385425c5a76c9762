// src/cli/status.rs — Engine status report

use crate::infra::config::Config;
use crate::infra::paths;
use crate::store;

pub fn show_status(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let db_path = config
        .database
        .path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(paths::db_path);

    if !db_path.exists() {
        println!("Database not initialized ({}).", db_path.display());
        println!("Run `sibyl migrate` or `sibyl serve` to create it.");
        return Ok(());
    }

    let store = store::open(&db_path)?;

    println!("sibyl v{}", env!("CARGO_PKG_VERSION"));
    println!("Database: {}", db_path.display());
    println!();
    println!("Accounts:       {}", store.count_accounts()?);
    println!("Ledger entries: {}", store.count_entries()?);

    let counts = store.session_state_counts()?;
    if counts.is_empty() {
        println!("Sessions:       0");
    } else {
        println!("Sessions:");
        for (state, count) in counts {
            println!("  {state:<14} {count}");
        }
    }

    if verbose {
        println!();
        println!("Balances:");
        for account in store.all_accounts()? {
            let payout = if account.payout_destination.is_some() {
                " (payout enabled)"
            } else {
                ""
            };
            println!("  {:<24} {}{}", account.owner_id, account.balance, payout);
        }
    }

    Ok(())
}
