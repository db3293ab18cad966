use async_trait::async_trait;
use log::info;

use crate::notify::{Notification, Notifier, NotifyError};

/// Writes notifications to the process log. Used when no SMTP relay is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn send(&self, to: &str, notification: &Notification) -> Result<(), NotifyError> {
        let body = notification.body();
        info!("[notification to {}] {}: {}", to, notification.subject(), body.trim_end());
        Ok(())
    }
}
