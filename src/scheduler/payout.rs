// src/scheduler/payout.rs — Reader payout batch
//
// Sweeps eligible provider balances to the external payout rail. The
// rail is called first, outside any store transaction, with a key that
// is deterministic per (account, day); the ledger debit then uses the
// receipt id. A crash between the two replays both idempotently.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::external::PayoutRail;
use crate::infra::config::Config;
use crate::infra::errors::EngineError;
use crate::ledger::{self, ApplyOutcome, EntryKind, EntryRefs};
use crate::store::StoreHandle;

pub async fn run_payout_batch(
    store: &StoreHandle,
    config: &Config,
    rail: Arc<dyn PayoutRail>,
) -> Result<u32, EngineError> {
    let today = Utc::now().date_naive();
    let candidates = store
        .payout_candidates(config.payout.minimum, config.scheduler.batch_limit)
        .await?;

    let mut paid = 0;
    for account in candidates {
        let Some(ref destination) = account.payout_destination else {
            continue;
        };

        let rail_key = ledger::payout_rail_key(&account.id, today);
        let receipt = match rail.transfer(destination, account.balance, &rail_key).await {
            Ok(r) => r,
            Err(e) => {
                // Never assume the transfer applied; retried next cycle.
                warn!(
                    "Payout for account {} failed, skipping this cycle: {}",
                    account.id, e
                );
                continue;
            }
        };

        let debit_key = ledger::payout_debit_key(&receipt.id);
        match store
            .debit(
                account.id.clone(),
                receipt.amount,
                EntryKind::Payout,
                debit_key,
                EntryRefs::for_reference("payout", &receipt.id),
            )
            .await
        {
            Ok(ApplyOutcome::Applied(_)) => {
                info!(
                    "Account {} paid out {} (receipt {})",
                    account.id, receipt.amount, receipt.id
                );
                paid += 1;
            }
            Ok(ApplyOutcome::AlreadyApplied(_)) => {
                info!(
                    "Account {} payout {} already recorded, skipping",
                    account.id, receipt.id
                );
            }
            Err(e) => {
                // The transfer went out but the debit failed; reconcile
                // picks this up and the keyed rail call will not repeat.
                error!("Account {} payout debit failed: {}", account.id, e);
            }
        }
    }
    Ok(paid)
}
