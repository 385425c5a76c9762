// src/scheduler/mod.rs — Periodic billing jobs
//
// Four independent jobs on their own intervals, all idempotent and safe
// under at-least-once execution: a job that dies mid-loop is simply
// resumed by the next tick, and replayed work is absorbed by the
// ledger's idempotency keys.

use std::sync::Arc;
use std::time::Duration;

use crate::external::PayoutRail;
use crate::infra::config::Config;
use crate::store::StoreHandle;

pub mod billing;
pub mod finalize;
pub mod grace;
pub mod payout;

pub use billing::run_billing_tick;
pub use finalize::run_finalization;
pub use grace::run_grace_expiry;
pub use payout::run_payout_batch;

/// Everything the scheduler needs to drive the engine.
pub struct SchedulerContext {
    pub store: StoreHandle,
    pub config: Config,
    pub rail: Arc<dyn PayoutRail>,
}

/// Run the scheduler loop until ctrl-c.
pub async fn run_scheduler(ctx: SchedulerContext) -> anyhow::Result<()> {
    tracing::info!("Billing scheduler starting...");

    let sched = &ctx.config.scheduler;
    let mut billing_interval = tokio::time::interval(Duration::from_secs(sched.billing_tick_secs));
    let mut grace_interval = tokio::time::interval(Duration::from_secs(sched.grace_expiry_secs));
    let mut finalize_interval = tokio::time::interval(Duration::from_secs(sched.finalize_secs));
    let mut payout_interval = tokio::time::interval(Duration::from_secs(sched.payout_secs));

    // Consume the immediate first tick of each interval
    billing_interval.tick().await;
    grace_interval.tick().await;
    finalize_interval.tick().await;
    payout_interval.tick().await;

    // Set up signal handler for graceful shutdown
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = billing_interval.tick() => {
                if let Err(e) = run_billing_tick(&ctx.store, &ctx.config).await {
                    tracing::error!("Billing tick failed: {}", e);
                }
            }
            _ = grace_interval.tick() => {
                if let Err(e) = run_grace_expiry(&ctx.store, &ctx.config).await {
                    tracing::error!("Grace expiry failed: {}", e);
                }
            }
            _ = finalize_interval.tick() => {
                if let Err(e) = run_finalization(&ctx.store, &ctx.config).await {
                    tracing::error!("Finalization failed: {}", e);
                }
            }
            _ = payout_interval.tick() => {
                if let Err(e) = run_payout_batch(&ctx.store, &ctx.config, ctx.rail.clone()).await {
                    tracing::error!("Payout batch failed: {}", e);
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    tracing::info!("Billing scheduler stopped.");
    Ok(())
}
