// src/cli/reconcile.rs — Manual balance reconciliation

use crate::infra::config::Config;
use crate::infra::paths;
use crate::store;

pub fn run_reconcile(config: &Config, account_id: &str) -> anyhow::Result<()> {
    let db_path = config
        .database
        .path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(paths::db_path);

    let store = store::open(&db_path)?;
    let outcome = store.reconcile(account_id)?;

    if outcome.corrected {
        println!(
            "Account {} corrected: {} -> {}",
            account_id, outcome.previous, outcome.balance
        );
    } else {
        println!(
            "Account {} consistent: balance {}",
            account_id, outcome.balance
        );
    }
    Ok(())
}
