//! Failure notifications.

use async_trait::async_trait;
use tracing::{info, warn};

use backman_config::NotifyConfig;

/// Told about failed backups. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_failure(&self, task_name: &str, error_message: &str) -> anyhow::Result<()>;
}

/// Records failure notices in the log for the configured recipients.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    config: NotifyConfig,
}

impl LogNotifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_failure(&self, task_name: &str, error_message: &str) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!(task = %task_name, "Failure notifications disabled, not notifying");
            return Ok(());
        }
        warn!(
            task = %task_name,
            recipients = ?self.config.recipients,
            error = %error_message,
            "Backup failure notification"
        );
        Ok(())
    }
}
