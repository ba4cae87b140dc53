mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::config::{NotificationChannelType, NotificationConfig};

/// Events that trigger operator notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WipeNotice {
    JobStarted {
        job_id: String,
        device_ids: Vec<String>,
    },
    DeviceWiped {
        job_id: String,
        device_id: String,
        device_model: String,
        method: String,
        certificate_id: String,
    },
    DeviceFailed {
        job_id: String,
        device_id: String,
        error: String,
    },
    JobFinished {
        job_id: String,
        succeeded: usize,
        total: usize,
    },
}

/// Trait for notification channel implementations (Slack, Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, notice: WipeNotice) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(slack::SlackNotifier::new(webhook.clone())))
        }
    }
}

/// Deliver in the background; a slow webhook never holds up a wipe.
pub fn dispatch(notifier: &Option<Arc<dyn NotificationChannel>>, notice: WipeNotice) {
    if let Some(notifier) = notifier {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notice).await {
                warn!(error = %e, "Failed to send notification");
            }
        });
    }
}
