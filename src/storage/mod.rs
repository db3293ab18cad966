//! Remote storage for backup artifacts: the backend capability, the remote
//! key layout, usage aggregation and retention cleanup.

pub mod local;
pub mod s3;

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::config::{StorageConfig, StorageKind};
use crate::database::{BackupJob, BackupRecord, EventCategory, EventLevel};
use crate::repository::events::{self, NewEvent};
use crate::repository::records;
use crate::utils::{format_size, usage_percentage};

pub const DEFAULT_LINK_EXPIRY: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage is not configured: {0}")]
    NotConfigured(String),

    #[error("object {0} not found")]
    NotFound(String),

    #[error("invalid object key {0}")]
    InvalidKey(String),

    /// Network failures, throttling and server errors.
    #[error("{operation} failed: {message}")]
    Transient { operation: &'static str, message: String },

    #[error("{operation} failed: {message}")]
    Rejected { operation: &'static str, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient { .. } | StorageError::Io(_))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// An object store holding backup artifacts under string keys.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Uploads the file and returns the reference to record for it.
    async fn put(&self, local: &Path, key: &str) -> Result<String, StorageError>;

    /// Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>, StorageError>;

    /// A time-limited download link.
    async fn presign(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;

    async fn check(&self) -> Result<(), StorageError>;
}

pub async fn build(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    Ok(match config.backend {
        StorageKind::S3 => Arc::new(s3::S3Storage::connect(config).await?),
        StorageKind::Local => Arc::new(local::LocalStorage::new(config.local_path.clone())),
    })
}

/// The backend in use, swapped as a whole when the configuration is reloaded.
#[derive(Clone)]
pub struct StorageHandle {
    current: Arc<RwLock<Arc<dyn StorageBackend>>>,
}

impl StorageHandle {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        StorageHandle {
            current: Arc::new(RwLock::new(backend)),
        }
    }

    pub fn current(&self) -> Arc<dyn StorageBackend> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, backend: Arc<dyn StorageBackend>) {
        match self.current.write() {
            Ok(mut guard) => *guard = backend,
            Err(poisoned) => *poisoned.into_inner() = backend,
        }
    }
}

/// `<database>/<YYYY-MM>/<file name>`.
pub fn remote_key(database_name: &str, file_name: &str, at: DateTime<Utc>) -> String {
    format!("{}/{}/{}", database_name.trim_matches('/'), at.format("%Y-%m"), file_name)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub available_bytes: u64,
    pub used_percentage: f64,
    pub used: String,
    pub capacity: String,
    pub available: String,
}

impl StorageUsage {
    pub fn new(used_bytes: u64, capacity_bytes: u64) -> Self {
        let available_bytes = capacity_bytes.saturating_sub(used_bytes);
        StorageUsage {
            used_bytes,
            capacity_bytes,
            available_bytes,
            used_percentage: (usage_percentage(used_bytes, capacity_bytes) * 100.0).round() / 100.0,
            used: format_size(used_bytes),
            capacity: format_size(capacity_bytes),
            available: format_size(available_bytes),
        }
    }
}

/// Sum of completed records' sizes against the configured capacity.
pub async fn usage(pool: &SqlitePool, config: &StorageConfig) -> Result<StorageUsage, sqlx::Error> {
    let used = records::completed_size_total(pool).await?;
    Ok(StorageUsage::new(used.max(0) as u64, config.capacity_bytes()))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub job_id: i64,
    pub removed: Vec<i64>,
    pub failed: Vec<i64>,
    pub freed_bytes: u64,
}

/// Removes the remote object, any kept local copy, then the record itself.
/// The record stays when the remote delete fails so the object is not lost
/// track of.
pub async fn remove_artifact(
    pool: &SqlitePool,
    backend: &dyn StorageBackend,
    record: &BackupRecord,
) -> Result<(), StorageError> {
    if let Some(key) = &record.cloud_storage_path {
        backend.delete(key).await?;
    }
    if let Some(path) = &record.file_path {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove local copy {}: {}", path, e),
        }
    }
    records::delete(pool, record.id).await?;
    Ok(())
}

/// Deletes the job's completed backups older than its retention, always
/// keeping the newest completed one.
pub async fn cleanup_job(
    pool: &SqlitePool,
    backend: &dyn StorageBackend,
    job: &BackupJob,
    now: DateTime<Utc>,
) -> Result<CleanupReport, sqlx::Error> {
    let cutoff = now - chrono::Duration::days(job.retention_days.max(1));
    let expired = records::expired_for_job(pool, job.id, cutoff).await?;
    let mut report = CleanupReport {
        job_id: job.id,
        ..Default::default()
    };

    for record in expired {
        match remove_artifact(pool, backend, &record).await {
            Ok(()) => {
                report.freed_bytes += record.file_size.unwrap_or(0).max(0) as u64;
                report.removed.push(record.id);
            }
            Err(e) => {
                events::record(
                    pool,
                    NewEvent::new(
                        EventLevel::Warning,
                        EventCategory::Cleanup,
                        format!(
                            "Could not remove expired backup {} of job {}: {}",
                            record.id, job.id, e
                        ),
                    )
                    .job(job.id)
                    .record(record.id),
                )
                .await;
                report.failed.push(record.id);
            }
        }
    }

    if !report.removed.is_empty() {
        info!(
            "Retention cleanup of job {} removed {} backups ({})",
            job.id,
            report.removed.len(),
            format_size(report.freed_bytes)
        );
        events::record(
            pool,
            NewEvent::new(
                EventLevel::Info,
                EventCategory::Cleanup,
                format!("Removed {} expired backups of job {}", report.removed.len(), job.id),
            )
            .job(job.id),
        )
        .await;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{memory_pool, BackupType};
    use crate::testing::{self, MemoryStorage};
    use chrono::TimeZone;

    #[test]
    fn test_remote_key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 1, 2, 3).unwrap();
        assert_eq!(
            remote_key("sales", "backup_sales_20240309_010203.bak", at),
            "sales/2024-03/backup_sales_20240309_010203.bak"
        );
    }

    #[test]
    fn test_usage_numbers() {
        let gib = 1024 * 1024 * 1024;
        let usage = StorageUsage::new(92 * gib, 100 * gib);
        assert_eq!(usage.used_percentage, 92.0);
        assert_eq!(usage.used, "92.00 GB");
        assert_eq!(usage.available_bytes, 8 * gib);

        let empty = StorageUsage::new(0, 0);
        assert_eq!(empty.used_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_usage_counts_completed_only() {
        let pool = memory_pool().await;
        let db = testing::database(&pool, "sales").await;
        let job = testing::job(&pool, db.id, BackupType::Full).await;
        testing::completed_record(&pool, job.id, Utc::now(), 1024).await;
        testing::failed_record(&pool, job.id, Utc::now(), "boom").await;

        let config = StorageConfig {
            capacity_gb: 1,
            ..Default::default()
        };
        let usage = usage(&pool, &config).await.unwrap();
        assert_eq!(usage.used_bytes, 1024);
        assert_eq!(usage.capacity_bytes, 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_keeps_newest() {
        let pool = memory_pool().await;
        let db = testing::database(&pool, "sales").await;
        let job = testing::job(&pool, db.id, BackupType::Full).await;
        let storage = MemoryStorage::default();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let old = testing::completed_record(&pool, job.id, t0, 100).await;
        let t1 = t0 + chrono::Duration::days(1);
        let newest = testing::completed_record(&pool, job.id, t1, 100).await;
        for record in [&old, &newest] {
            let key = record.cloud_storage_path.clone().unwrap();
            storage.insert(&key, 100);
        }

        // both are past retention; only the older one goes
        let now = t0 + chrono::Duration::days(90);
        let report = cleanup_job(&pool, &storage, &job, now).await.unwrap();
        assert_eq!(report.removed, vec![old.id]);
        assert_eq!(report.freed_bytes, 100);
        assert!(records::get(&pool, old.id).await.unwrap().is_none());
        assert!(records::get(&pool, newest.id).await.unwrap().is_some());
        assert_eq!(storage.keys(), vec![newest.cloud_storage_path.clone().unwrap()]);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_record_when_remote_delete_fails() {
        let pool = memory_pool().await;
        let db = testing::database(&pool, "sales").await;
        let job = testing::job(&pool, db.id, BackupType::Full).await;
        let storage = MemoryStorage::default();
        storage.fail_deletes(true);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let old = testing::completed_record(&pool, job.id, t0, 100).await;
        testing::completed_record(&pool, job.id, t0 + chrono::Duration::days(1), 100).await;

        let now = t0 + chrono::Duration::days(90);
        let report = cleanup_job(&pool, &storage, &job, now).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.failed, vec![old.id]);
        assert!(records::get(&pool, old.id).await.unwrap().is_some());
    }
}
