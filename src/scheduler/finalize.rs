// src/scheduler/finalize.rs — Session finalization
//
// Converts ended sessions into immutable closed records: reconcile the
// payer's balance against the ledger, write the summary, flip the state,
// append the audit record. Never re-derives or re-issues ledger entries.

use tracing::{error, info, warn};

use crate::infra::config::Config;
use crate::infra::errors::EngineError;
use crate::sessions::SessionState;
use crate::store::store::FinalizeOutcome;
use crate::store::StoreHandle;

pub async fn run_finalization(store: &StoreHandle, config: &Config) -> Result<u32, EngineError> {
    let ended = store
        .sessions_in_state(SessionState::Ended, config.scheduler.batch_limit)
        .await?;

    let mut finalized = 0;
    for session in ended {
        // Repair any drift before the account is trusted again.
        match store.reconcile(session.client_account_id.clone()).await {
            Ok(outcome) if outcome.corrected => {
                warn!(
                    "Session {} finalize: payer balance corrected {} -> {}",
                    session.id, outcome.previous, outcome.balance
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(
                    "Session {} finalize: reconcile failed: {}, skipping",
                    session.id, e
                );
                continue;
            }
        }

        let total = session.total_charged();
        let summary = format!(
            "{} minute(s) billed at {}/min, {} charged",
            session.billed_minutes, session.rate_per_minute, total
        );

        match store
            .finalize_session(session.id.clone(), summary)
            .await
        {
            Ok(FinalizeOutcome::Finalized(row)) => {
                let details = serde_json::json!({
                    "modality": row.modality.as_str(),
                    "billed_minutes": row.billed_minutes,
                    "rate_per_minute": row.rate_per_minute.to_string(),
                    "total_charged": total.to_string(),
                });
                if let Err(e) = store
                    .append_audit(
                        Some(row.client_account_id.clone()),
                        "session_finalized".to_string(),
                        Some("session".to_string()),
                        Some(row.id.clone()),
                        details,
                    )
                    .await
                {
                    error!("Session {} audit write failed: {}", session.id, e);
                }
                info!(
                    "Session {} finalized ({} min, {})",
                    session.id, row.billed_minutes, total
                );
                finalized += 1;
            }
            Ok(FinalizeOutcome::AlreadyFinalized) => {
                info!("Session {} already finalized, skipping", session.id);
            }
            Err(e) => {
                error!("Session {} finalization error: {}", session.id, e);
            }
        }
    }
    Ok(finalized)
}
