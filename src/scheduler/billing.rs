// src/scheduler/billing.rs — The billing tick
//
// Charges every active session for its next billing minute. The
// idempotency key is derived from the persisted counter, so running the
// tick twice in a row (or two workers racing on the same schedule) can
// never charge a session for the same minute twice.

use chrono::{Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::infra::config::Config;
use crate::infra::errors::EngineError;
use crate::sessions::SessionState;
use crate::store::store::ChargeOutcome;
use crate::store::StoreHandle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BillingTickStats {
    pub charged: u32,
    pub paused: u32,
    pub ended: u32,
}

/// One pass over all active sessions. Per-session failures are logged
/// and never abort processing of the remaining sessions.
pub async fn run_billing_tick(
    store: &StoreHandle,
    config: &Config,
) -> Result<BillingTickStats, EngineError> {
    let now = Utc::now();
    let sessions = store
        .sessions_in_state(SessionState::Active, config.scheduler.batch_limit)
        .await?;

    let mut stats = BillingTickStats::default();

    for session in sessions {
        match store.charge_active_minute(session.id.clone(), now).await {
            Ok(ChargeOutcome::Charged { minute, .. }) => {
                debug!("Session {} charged for minute {}", session.id, minute);
                stats.charged += 1;
            }
            Ok(ChargeOutcome::AlreadyCharged { minute }) => {
                info!(
                    "Session {} already charged for minute {}, counter healed",
                    session.id, minute
                );
            }
            Ok(ChargeOutcome::InsufficientFunds { balance, rate }) => {
                info!(
                    "Session {} low balance ({} < {}), pausing",
                    session.id, balance, rate
                );
                let grace_until = now + Duration::minutes(config.billing.grace_minutes);
                match store.pause_session(session.id.clone(), grace_until).await {
                    Ok(_) => stats.paused += 1,
                    Err(e) => error!("Session {} pause failed: {}", session.id, e),
                }
            }
            Ok(ChargeOutcome::ZeroRate) => {
                warn!("Session {} has zero rate, skipping", session.id);
            }
            Ok(ChargeOutcome::SkippedNotActive { state }) => {
                // State moved between the scan and the charge; nothing to do.
                debug!("Session {} no longer active ({}), skipping", session.id, state);
            }
            Err(EngineError::AccountNotFound { account }) => {
                error!(
                    "Session {} payer account '{}' not found, ending session",
                    session.id, account
                );
                match store.end_session(session.id.clone(), None, now).await {
                    Ok(_) => stats.ended += 1,
                    Err(e) => error!("Session {} end failed: {}", session.id, e),
                }
            }
            Err(e) => {
                error!("Session {} billing error: {}", session.id, e);
            }
        }
    }

    if stats.charged > 0 || stats.paused > 0 || stats.ended > 0 {
        info!(
            "Billing tick: {} charged, {} paused, {} ended",
            stats.charged, stats.paused, stats.ended
        );
    }
    Ok(stats)
}
