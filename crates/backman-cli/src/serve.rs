use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use backman_config::BackmanConfig;
use backman_cron::{BackupService, SqliteTaskStore};

/// Run the scheduler daemon until Ctrl-C.
///
/// Task edits made by other `backman` invocations land in the shared
/// database; they are picked up on the next refresh tick.
pub async fn run_serve(
    store: Arc<SqliteTaskStore>,
    config: &BackmanConfig,
    refresh_secs: u64,
) -> Result<()> {
    let service = BackupService::new(store, config);
    service.start().await?;

    let mut refresh = tokio::time::interval(Duration::from_secs(refresh_secs.max(1)));
    refresh.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = refresh.tick() => {
                if let Err(e) = service.refresh().await {
                    warn!("Failed to refresh task triggers: {e}");
                }
            }
        }
    }

    let running = service.running_tasks();
    if !running.is_empty() {
        info!(?running, "Waiting for in-flight backups to finish");
    }
    service.shutdown().await;
    Ok(())
}
