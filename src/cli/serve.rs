// src/cli/serve.rs — Run the scheduler daemon

use std::sync::Arc;

use crate::external::LoggedRail;
use crate::infra::config::Config;
use crate::infra::paths;
use crate::scheduler::{self, SchedulerContext};
use crate::store;

pub async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let db_path = config
        .database
        .path
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(paths::db_path);

    let store = store::open(&db_path)?;
    tracing::info!("Database: {}", db_path.display());

    let (handle, _store_task) = store::spawn_store_server(store);

    let ctx = SchedulerContext {
        store: handle,
        config: config.clone(),
        rail: Arc::new(LoggedRail),
    };

    println!("Scheduler running. Press Ctrl+C to stop.");
    scheduler::run_scheduler(ctx).await
}
