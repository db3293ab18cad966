//! Outcome notifications. A `Notifier` is one delivery channel; the
//! `Dispatcher` picks recipients by their per-category toggles and hands the
//! message to the current channel without waiting for delivery.

pub mod email;
pub mod logging;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::SmtpConfig;
use crate::database::{BackupType, EventCategory, EventLevel, NotificationCategory, Recipient};
use crate::repository::events::{self, NewEvent};
use crate::repository::users;
use crate::utils::format_size;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("no delivery channel is configured")]
    NotConfigured,

    #[error("invalid address {0}")]
    Address(String),

    #[error("could not build message: {0}")]
    Message(String),

    #[error("delivery failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    BackupSucceeded {
        database: String,
        backup_type: BackupType,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        size: u64,
        remote_path: String,
    },
    BackupFailed {
        database: String,
        backup_type: BackupType,
        started_at: Option<DateTime<Utc>>,
        error: String,
    },
    StorageWarning {
        used_percentage: f64,
        threshold: f64,
    },
    Test,
}

fn timestamp(at: &Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl Notification {
    pub fn category(&self) -> NotificationCategory {
        match self {
            Notification::BackupSucceeded { .. } => NotificationCategory::BackupSuccess,
            Notification::BackupFailed { .. } => NotificationCategory::BackupFailure,
            Notification::StorageWarning { .. } => NotificationCategory::StorageWarning,
            Notification::Test => NotificationCategory::Test,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Notification::BackupSucceeded { database, .. } => {
                format!("Backup Completed Successfully - {}", database)
            }
            Notification::BackupFailed { database, .. } => format!("Backup Failed - {}", database),
            Notification::StorageWarning { .. } => "Storage Usage Warning".to_string(),
            Notification::Test => "Test Notification".to_string(),
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::BackupSucceeded {
                database,
                backup_type,
                started_at,
                completed_at,
                size,
                remote_path,
            } => format!(
                "Backup completed successfully.\n\n\
                 Database: {}\nBackup Type: {}\nStarted: {}\nCompleted: {}\n\
                 File Size: {}\nCloud Storage Path: {}\n",
                database,
                backup_type.as_str(),
                timestamp(started_at),
                timestamp(completed_at),
                format_size(*size),
                remote_path
            ),
            Notification::BackupFailed {
                database,
                backup_type,
                started_at,
                error,
            } => format!(
                "Backup failed.\n\n\
                 Database: {}\nBackup Type: {}\nStarted: {}\nError: {}\n\n\
                 Please check the system logs for more details.\n",
                database,
                backup_type.as_str(),
                timestamp(started_at),
                error
            ),
            Notification::StorageWarning {
                used_percentage,
                threshold,
            } => format!(
                "Your backup storage usage has reached {:.1}% (warning threshold {:.0}%).\n\n\
                 Please consider cleaning up old backups or increasing storage capacity.\n",
                used_percentage, threshold
            ),
            Notification::Test => "This is a test notification from the backup manager. \
                                   Delivery is working.\n"
                .to_string(),
        }
    }
}

/// One delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn send(&self, to: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// Email when SMTP is configured, otherwise the log channel.
pub fn build(config: &SmtpConfig) -> Arc<dyn Notifier> {
    if !config.is_configured() {
        return Arc::new(logging::LogNotifier);
    }
    match email::EmailNotifier::new(config) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            log::error!("SMTP configuration rejected, falling back to log notifications: {}", e);
            Arc::new(logging::LogNotifier)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: SqlitePool,
    notifier: Arc<RwLock<Arc<dyn Notifier>>>,
    /// Whether usage was at or above the threshold at the last observation.
    storage_alarm: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, notifier: Arc<dyn Notifier>) -> Self {
        Dispatcher {
            pool,
            notifier: Arc::new(RwLock::new(notifier)),
            storage_alarm: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        match self.notifier.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace_notifier(&self, notifier: Arc<dyn Notifier>) {
        match self.notifier.write() {
            Ok(mut guard) => *guard = notifier,
            Err(poisoned) => *poisoned.into_inner() = notifier,
        }
    }

    async fn send_each(
        &self,
        recipients: &[Recipient],
        notification: &Notification,
    ) -> DeliveryReport {
        let notifier = self.notifier();
        let mut report = DeliveryReport::default();
        for recipient in recipients {
            match notifier.send(&recipient.email, notification).await {
                Ok(()) => report.sent.push(recipient.email.clone()),
                Err(e) => {
                    log::warn!(
                        "Could not deliver '{}' to {} via {}: {}",
                        notification.subject(),
                        recipient.email,
                        notifier.channel(),
                        e
                    );
                    report.failed.push((recipient.email.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Sends to every user subscribed to the notification's category.
    pub async fn deliver(
        &self,
        notification: &Notification,
    ) -> Result<DeliveryReport, NotifyError> {
        let recipients = users::recipients(&self.pool, notification.category()).await?;
        let report = self.send_each(&recipients, notification).await;
        if !report.failed.is_empty() {
            events::record(
                &self.pool,
                NewEvent::new(
                    EventLevel::Warning,
                    EventCategory::Notification,
                    format!(
                        "'{}' could not be delivered to {} of {} recipients",
                        notification.subject(),
                        report.failed.len(),
                        recipients.len()
                    ),
                ),
            )
            .await;
        }
        Ok(report)
    }

    /// Fire-and-forget variant of `deliver`.
    pub fn dispatch(&self, notification: Notification) -> JoinHandle<DeliveryReport> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.deliver(&notification).await {
                Ok(report) => report,
                Err(e) => {
                    log::error!("Notification '{}' not sent: {}", notification.subject(), e);
                    DeliveryReport::default()
                }
            }
        })
    }

    /// Sends a test message to one address, ignoring toggles, and waits for it.
    pub async fn send_test(&self, to: &str) -> Result<(), NotifyError> {
        self.notifier().send(to, &Notification::Test).await
    }

    /// Records a usage observation. A warning goes out only when usage moves
    /// from below the threshold to at or above it, and only if someone is
    /// subscribed to storage warnings.
    pub async fn observe_usage(
        &self,
        used_percentage: f64,
        threshold: f64,
    ) -> Option<JoinHandle<DeliveryReport>> {
        let above = used_percentage >= threshold;
        let was_above = self.storage_alarm.swap(above, Ordering::SeqCst);
        if !above || was_above {
            return None;
        }
        match users::recipients(&self.pool, NotificationCategory::StorageWarning).await {
            Ok(recipients) if recipients.is_empty() => {
                log::info!(
                    "Storage usage at {:.1}% crossed {:.0}%, nobody subscribed to storage warnings",
                    used_percentage,
                    threshold
                );
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Could not look up storage warning recipients: {}", e);
                return None;
            }
        }
        events::record(
            &self.pool,
            NewEvent::new(
                EventLevel::Warning,
                EventCategory::StorageWarning,
                format!("Storage usage at {:.1}%, threshold is {:.0}%", used_percentage, threshold),
            ),
        )
        .await;
        Some(self.dispatch(Notification::StorageWarning {
            used_percentage,
            threshold,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use crate::repository::users;
    use crate::testing::RecordingNotifier;

    #[test]
    fn test_messages_carry_outcome_details() {
        let failed = Notification::BackupFailed {
            database: "sales".into(),
            backup_type: BackupType::Differential,
            started_at: None,
            error: "Msg 3035: no current database backup".into(),
        };
        assert_eq!(failed.subject(), "Backup Failed - sales");
        assert!(failed.body().contains("Backup Type: differential"));
        assert!(failed.body().contains("Msg 3035"));
        assert_eq!(failed.category(), NotificationCategory::BackupFailure);

        let succeeded = Notification::BackupSucceeded {
            database: "sales".into(),
            backup_type: BackupType::Full,
            started_at: None,
            completed_at: None,
            size: 1536,
            remote_path: "sales/2024-03/backup.bak".into(),
        };
        assert!(succeeded.body().contains("File Size: 1.50 KB"));

        let warning = Notification::StorageWarning {
            used_percentage: 92.345,
            threshold: 90.0,
        };
        assert!(warning.body().contains("92.3%"));
    }

    #[tokio::test]
    async fn test_deliver_respects_toggles() {
        let pool = memory_pool().await;
        let admin = users::create(&pool, "admin@example.com", "hash").await.unwrap();
        users::create(&pool, "ops@example.com", "hash").await.unwrap();
        let mut settings = users::notification_settings(&pool, admin.id).await.unwrap();
        settings.backup_success = false;
        users::save_notification_settings(&pool, &settings).await.unwrap();

        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(pool.clone(), Arc::new(notifier.clone()));
        let report = dispatcher
            .deliver(&Notification::BackupSucceeded {
                database: "sales".into(),
                backup_type: BackupType::Full,
                started_at: None,
                completed_at: None,
                size: 1,
                remote_path: "k".into(),
            })
            .await
            .unwrap();

        assert_eq!(report.sent, vec!["ops@example.com".to_string()]);
        assert_eq!(notifier.sent_to(), vec!["ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_logged_as_event() {
        let pool = memory_pool().await;
        users::create(&pool, "admin@example.com", "hash").await.unwrap();
        let notifier = RecordingNotifier::failing();
        let dispatcher = Dispatcher::new(pool.clone(), Arc::new(notifier));

        let report = dispatcher.dispatch(Notification::Test).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        let alerts = events::alerts(&pool, 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, EventCategory::Notification);
    }

    #[tokio::test]
    async fn test_storage_warning_only_on_crossing() {
        let pool = memory_pool().await;
        users::create(&pool, "admin@example.com", "hash").await.unwrap();
        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(pool.clone(), Arc::new(notifier.clone()));

        assert!(dispatcher.observe_usage(50.0, 90.0).await.is_none());
        let handle = dispatcher.observe_usage(91.0, 90.0).await.unwrap();
        assert_eq!(handle.await.unwrap().sent.len(), 1);
        // staying above does not repeat the warning
        assert!(dispatcher.observe_usage(95.0, 90.0).await.is_none());
        // dropping below re-arms it
        assert!(dispatcher.observe_usage(80.0, 90.0).await.is_none());
        assert!(dispatcher.observe_usage(90.0, 90.0).await.is_some());
    }

    #[tokio::test]
    async fn test_storage_warning_skips_users_who_opted_out() {
        let pool = memory_pool().await;
        let admin = users::create(&pool, "admin@example.com", "hash").await.unwrap();
        let mut settings = users::notification_settings(&pool, admin.id).await.unwrap();
        settings.storage_warning = false;
        users::save_notification_settings(&pool, &settings).await.unwrap();

        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(pool.clone(), Arc::new(notifier.clone()));
        assert!(dispatcher.observe_usage(92.0, 90.0).await.is_none());

        assert!(notifier.sent_to().is_empty());
        assert!(events::alerts(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_warning_alert_needs_a_subscriber() {
        let pool = memory_pool().await;
        let admin = users::create(&pool, "admin@example.com", "hash").await.unwrap();
        users::create(&pool, "ops@example.com", "hash").await.unwrap();
        let mut settings = users::notification_settings(&pool, admin.id).await.unwrap();
        settings.storage_warning = false;
        users::save_notification_settings(&pool, &settings).await.unwrap();

        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(pool.clone(), Arc::new(notifier.clone()));
        let report = dispatcher.observe_usage(92.0, 90.0).await.unwrap().await.unwrap();

        assert_eq!(report.sent, vec!["ops@example.com".to_string()]);
        let alerts = events::alerts(&pool, 10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, EventCategory::StorageWarning);
    }

    #[tokio::test]
    async fn test_replace_notifier() {
        let pool = memory_pool().await;
        let first = RecordingNotifier::default();
        let second = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(pool, Arc::new(first.clone()));
        dispatcher.replace_notifier(Arc::new(second.clone()));

        dispatcher.send_test("admin@example.com").await.unwrap();
        assert!(first.sent_to().is_empty());
        assert_eq!(second.sent_to(), vec!["admin@example.com".to_string()]);
    }
}
