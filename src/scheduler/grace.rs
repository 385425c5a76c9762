// src/scheduler/grace.rs — Grace period expiration
//
// Ends paused/reconnecting sessions whose grace deadline has passed.
// Driven by the scheduler because the disconnected client may never
// call back.

use chrono::Utc;
use tracing::{error, info};

use crate::infra::config::Config;
use crate::infra::errors::EngineError;
use crate::store::StoreHandle;

pub async fn run_grace_expiry(store: &StoreHandle, config: &Config) -> Result<u32, EngineError> {
    let now = Utc::now();
    let expired = store
        .grace_expired_sessions(now, config.scheduler.batch_limit)
        .await?;

    let mut ended = 0;
    for session in expired {
        info!("Session {} grace period expired, ending", session.id);
        match store.end_session(session.id.clone(), None, now).await {
            Ok(_) => ended += 1,
            Err(e) => error!("Session {} end failed: {}", session.id, e),
        }
    }
    Ok(ended)
}
