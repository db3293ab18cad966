//! Fixtures and in-memory stand-ins shared by the unit tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::config::{Config, ConfigHandle};
use crate::database::{BackupJob, BackupRecord, BackupType, Database, Frequency, User};
use crate::notify::{Dispatcher, Notification, Notifier, NotifyError};
use crate::pipeline::Pipeline;
use crate::repository::databases::{self, NewDatabase};
use crate::repository::jobs::{self, NewJob};
use crate::repository::records::{self, CompletedBackup};
use crate::repository::users;
use crate::service::{BackupArtifact, BackupEngine, BackupRequest, EngineError};
use crate::runlock::RunLocks;
use crate::storage::{StorageBackend, StorageError, StorageHandle, StoredObject};

pub async fn database(pool: &SqlitePool, name: &str) -> Database {
    databases::create(
        pool,
        &NewDatabase {
            name: name.to_string(),
            server: "sql01".to_string(),
            connection_string: format!(
                "Server=sql01;Database={};User Id=backup;Password=secret",
                name
            ),
        },
    )
    .await
    .unwrap()
}

/// An active daily job with 30 days retention.
pub async fn job(pool: &SqlitePool, database_id: i64, backup_type: BackupType) -> BackupJob {
    jobs::create(
        pool,
        &NewJob {
            name: format!("{} backup", backup_type.as_str()),
            database_id,
            user_id: None,
            backup_type,
            frequency: Frequency::Daily,
            retention_days: 30,
            is_active: true,
        },
        Utc::now(),
    )
    .await
    .unwrap()
}

pub async fn user(pool: &SqlitePool, email: &str) -> User {
    users::create(pool, email, "not-a-real-hash").await.unwrap()
}

pub async fn completed_record(
    pool: &SqlitePool,
    job_id: i64,
    at: DateTime<Utc>,
    size: i64,
) -> BackupRecord {
    let record = records::create_pending(pool, job_id, at).await.unwrap();
    records::mark_in_progress(pool, record.id, at).await.unwrap();
    records::mark_completed(
        pool,
        record.id,
        &CompletedBackup {
            file_path: None,
            file_size: size,
            cloud_storage_path: format!("job-{}/backup-{}.bak", job_id, record.id),
        },
        at,
    )
    .await
    .unwrap()
}

pub async fn failed_record(
    pool: &SqlitePool,
    job_id: i64,
    at: DateTime<Utc>,
    error: &str,
) -> BackupRecord {
    let record = records::create_pending(pool, job_id, at).await.unwrap();
    records::mark_in_progress(pool, record.id, at).await.unwrap();
    records::mark_failed(pool, record.id, error, None, at).await.unwrap()
}

/// Object store kept in a map, with switches to make calls fail.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<BTreeMap<String, u64>>>,
    transient_put_failures: Arc<AtomicU32>,
    reject_puts: Arc<AtomicBool>,
    fail_deletes: Arc<AtomicBool>,
    put_attempts: Arc<AtomicU32>,
}

impl MemoryStorage {
    pub fn insert(&self, key: &str, size: u64) {
        self.objects.lock().unwrap().insert(key.to_string(), size);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// The next `count` uploads fail with a retryable error.
    pub fn fail_puts(&self, count: u32) {
        self.transient_put_failures.store(count, Ordering::SeqCst);
    }

    pub fn reject_puts(&self) {
        self.reject_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn put_attempts(&self) -> u32 {
        self.put_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected {
                operation: "upload",
                message: "AccessDenied".into(),
            });
        }
        let remaining = self.transient_put_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_put_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Transient {
                operation: "upload",
                message: "connection reset".into(),
            });
        }
        let size = tokio::fs::metadata(local).await?.len();
        self.insert(key, size);
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Transient {
                operation: "delete",
                message: "timeout".into(),
            });
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StoredObject>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
            .map(|(key, size)| StoredObject {
                key: key.clone(),
                size: *size,
                last_modified: None,
            })
            .collect())
    }

    async fn presign(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        if !self.objects.lock().unwrap().contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{}?expires={}", key, expires_in.as_secs()))
    }

    async fn check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum EngineOutcome {
    /// Writes an artifact of this many bytes.
    Artifact(u64),
    Fail(String),
    /// Never finishes; used to exercise cancellation.
    Hang,
}

#[derive(Clone)]
pub struct FakeEngine {
    outcome: Arc<Mutex<EngineOutcome>>,
    calls: Arc<AtomicU32>,
    reachable: Arc<AtomicBool>,
}

impl FakeEngine {
    pub fn new(outcome: EngineOutcome) -> Self {
        FakeEngine {
            outcome: Arc::new(Mutex::new(outcome)),
            calls: Arc::new(AtomicU32::new(0)),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupEngine for FakeEngine {
    async fn run_backup(&self, request: &BackupRequest) -> Result<BackupArtifact, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome.lock().unwrap().clone();
        match outcome {
            EngineOutcome::Artifact(size) => {
                if let Some(parent) = request.destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&request.destination, vec![0u8; size as usize]).await?;
                Ok(BackupArtifact {
                    path: request.destination.clone(),
                    size,
                })
            }
            EngineOutcome::Fail(message) => Err(EngineError::Command {
                code: Some(1),
                output: message,
            }),
            EngineOutcome::Hang => std::future::pending().await,
        }
    }

    async fn check_connection(&self, _database: &Database) -> Result<(), EngineError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Command {
                code: Some(1),
                output: "Login timeout expired".into(),
            })
        }
    }
}

/// Captures notifications instead of delivering them.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, Notification)>>>,
    failing: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        RecordingNotifier {
            failing: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent().into_iter().map(|(to, _)| to).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, to: &str, notification: &Notification) -> Result<(), NotifyError> {
        if self.failing {
            return Err(NotifyError::Transport("relay refused".into()));
        }
        self.sent.lock().unwrap().push((to.to_string(), notification.clone()));
        Ok(())
    }
}

/// A pipeline wired to the in-memory stand-ins, keeping handles to them.
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub engine: FakeEngine,
    pub storage: MemoryStorage,
    pub notifier: RecordingNotifier,
}

pub fn pipeline(pool: &SqlitePool, outcome: EngineOutcome, config: Config) -> TestPipeline {
    let engine = FakeEngine::new(outcome);
    let storage = MemoryStorage::default();
    let notifier = RecordingNotifier::default();
    let pipeline = Pipeline::new(
        pool.clone(),
        ConfigHandle::new(None, config),
        Arc::new(engine.clone()),
        StorageHandle::new(Arc::new(storage.clone())),
        Dispatcher::new(pool.clone(), Arc::new(notifier.clone())),
        RunLocks::new(),
    );
    TestPipeline {
        pipeline,
        engine,
        storage,
        notifier,
    }
}

/// Defaults with artifacts under `dir` and near-instant upload retries.
pub fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.backup.storage_path = dir.to_path_buf();
    config.scheduler.retry_initial_delay_ms = 1;
    config.scheduler.retry_max_delay_secs = 0;
    config
}
