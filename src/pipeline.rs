//! One backup attempt end to end: record lifecycle, engine run, upload,
//! retention cleanup and notifications.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigHandle};
use crate::database::{BackupJob, BackupRecord, BackupType, Database, EventCategory, EventLevel};
use crate::notify::{self, Dispatcher, Notification};
use crate::repository::events::{self, NewEvent};
use crate::repository::records::{self, CompletedBackup, RecordError};
use crate::repository::{databases, jobs, settings};
use crate::retry::{retry_async, RetryPolicy};
use crate::runlock::{RunGuard, RunLocks};
use crate::service::service::artifact_name;
use crate::service::{BackupEngine, BackupRequest};
use crate::storage::{self, remote_key, StorageError, StorageHandle};
use crate::utils::format_size;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("backup job {0} not found")]
    NotFound(i64),

    #[error("backup job {0} already has an execution in flight")]
    InFlight(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Record(RecordError),
}

impl From<RecordError> for RunError {
    fn from(error: RecordError) -> Self {
        match error {
            RecordError::InFlight(job_id) => RunError::InFlight(job_id),
            RecordError::Database(e) => RunError::Database(e),
            other => RunError::Record(other),
        }
    }
}

/// An attempt that has been accepted and is running in the background.
pub struct Started {
    pub record: BackupRecord,
    pub handle: JoinHandle<Option<BackupRecord>>,
}

#[derive(Clone)]
pub struct Pipeline {
    pool: SqlitePool,
    config: ConfigHandle,
    engine: Arc<dyn BackupEngine>,
    storage: StorageHandle,
    dispatcher: Dispatcher,
    locks: RunLocks,
}

/// Everything resolved before the engine is invoked.
struct Plan {
    config: Arc<Config>,
    database: Database,
    request: BackupRequest,
    file_name: String,
    started_at: DateTime<Utc>,
}

struct Uploaded {
    size: u64,
    remote_path: String,
    local_path: Option<PathBuf>,
}

struct Failure {
    message: String,
    size: Option<u64>,
}

impl Failure {
    fn new(message: impl Into<String>) -> Self {
        Failure {
            message: message.into(),
            size: None,
        }
    }

    fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove local artifact {}: {}", path.display(), e),
    }
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        config: ConfigHandle,
        engine: Arc<dyn BackupEngine>,
        storage: StorageHandle,
        dispatcher: Dispatcher,
        locks: RunLocks,
    ) -> Self {
        Pipeline {
            pool,
            config,
            engine,
            storage,
            dispatcher,
            locks,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn BackupEngine> {
        &self.engine
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    /// Takes the job's run-lock, opens a pending record and runs the attempt
    /// in the background. Run-now comes through here; the scheduler uses
    /// `start_if_due`.
    pub async fn start(&self, job_id: i64) -> Result<Started, RunError> {
        let (guard, job) = self.claim(job_id).await?;
        self.launch(guard, job).await
    }

    /// Like `start`, but the job is re-read under its run-lock and skipped
    /// when it is no longer due at `now`: paused, or already run since the
    /// caller looked.
    pub async fn start_if_due(
        &self,
        job_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Started>, RunError> {
        let (guard, job) = self.claim(job_id).await?;
        if !job.is_due(now) {
            debug!("Job {} is no longer due, skipping", job.id);
            return Ok(None);
        }
        self.launch(guard, job).await.map(Some)
    }

    async fn claim(&self, job_id: i64) -> Result<(RunGuard, BackupJob), RunError> {
        let guard = self.locks.try_acquire(job_id).ok_or(RunError::InFlight(job_id))?;
        let job = jobs::get(&self.pool, job_id).await?.ok_or(RunError::NotFound(job_id))?;
        Ok((guard, job))
    }

    async fn launch(&self, guard: RunGuard, job: BackupJob) -> Result<Started, RunError> {
        let record = records::create_pending(&self.pool, job.id, Utc::now()).await?;
        info!("Queued backup of job {} as record {}", job.id, record.id);

        let pipeline = self.clone();
        let pending = record.clone();
        let handle = tokio::spawn(async move { pipeline.execute(guard, job, pending).await });
        Ok(Started { record, handle })
    }

    /// Signals the job's in-flight attempt, if any.
    pub fn cancel(&self, job_id: i64) -> bool {
        let cancelled = self.locks.cancel(job_id);
        if cancelled {
            info!("Cancellation requested for job {}", job_id);
        }
        cancelled
    }

    /// Rebuilds configuration, storage backend and notifier from file,
    /// environment and the persisted system settings.
    pub async fn reload(&self) -> crate::error::Result<Arc<Config>> {
        let overlay = settings::load_system(&self.pool).await?;
        let config = self.config.reload(&overlay).await?;
        self.storage.replace(storage::build(&config.storage).await?);
        self.dispatcher.replace_notifier(notify::build(&config.smtp));
        info!(
            "Configuration reloaded (storage: {}, notifications: {})",
            self.storage.current().name(),
            self.dispatcher.notifier().channel()
        );
        Ok(config)
    }

    /// Applies a record transition, retrying while the state database
    /// reports errors.
    async fn write_record<F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<BackupRecord, RecordError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<BackupRecord, RecordError>>,
    {
        let policy = RetryPolicy::uploads(&self.config.snapshot().scheduler);
        retry_async(&policy, operation_name, operation, |e| {
            matches!(e, RecordError::Database(_))
        })
        .await
    }

    /// Last resort when a transition could not be written: without it the
    /// job's in-flight slot stays taken until the next restart.
    async fn abandon(&self, record_id: i64, job_id: i64, message: &str) {
        match records::force_fail(&self.pool, record_id, message, Utc::now()).await {
            Ok(true) => warn!(
                "Backup record {} of job {} forced to failed: {}",
                record_id, job_id, message
            ),
            Ok(false) => {}
            Err(e) => error!(
                "Backup record {} of job {} stays open until restart: {}",
                record_id, job_id, e
            ),
        }
    }

    async fn execute(
        self,
        guard: RunGuard,
        job: BackupJob,
        record: BackupRecord,
    ) -> Option<BackupRecord> {
        let started_at = Utc::now();
        let record_id = record.id;
        let started = self
            .write_record("mark backup in progress", || {
                records::mark_in_progress(&self.pool, record_id, started_at)
            })
            .await;
        let record = match started {
            Ok(record) => record,
            Err(e) => {
                error!("Backup record {} of job {} could not start: {}", record_id, job.id, e);
                self.abandon(record_id, job.id, &format!("could not start: {}", e)).await;
                return None;
            }
        };
        events::record(
            &self.pool,
            NewEvent::new(
                EventLevel::Info,
                EventCategory::BackupStarted,
                format!("Backup of job '{}' started", job.name),
            )
            .job(job.id)
            .record(record.id),
        )
        .await;

        let database = databases::get(&self.pool, job.database_id).await;
        let database_name = match &database {
            Ok(Some(database)) => database.name.clone(),
            _ => format!("database #{}", job.database_id),
        };

        let outcome = match self.prepare(&job, database, started_at).await {
            Ok(plan) => {
                tokio::select! {
                    biased;
                    _ = guard.token().cancelled() => {
                        discard(&plan.request.destination).await;
                        Err(Failure::new("cancelled"))
                    }
                    result = self.run(&plan) => result,
                }
            }
            Err(failure) => Err(failure),
        };

        let completed_at = Utc::now();
        let finished = match &outcome {
            Ok(uploaded) => {
                let completed = CompletedBackup {
                    file_path: uploaded
                        .local_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    file_size: uploaded.size as i64,
                    cloud_storage_path: uploaded.remote_path.clone(),
                };
                self.write_record("mark backup completed", || {
                    records::mark_completed(&self.pool, record_id, &completed, completed_at)
                })
                .await
            }
            Err(failure) => {
                let size = failure.size.map(|s| s as i64);
                let message = failure.message.as_str();
                self.write_record("mark backup failed", || {
                    records::mark_failed(&self.pool, record_id, message, size, completed_at)
                })
                .await
            }
        };
        let finished = match finished {
            Ok(record) => Some(record),
            Err(RecordError::NotFound(id)) => {
                info!("Job {} was deleted during its attempt, record {} went with it", job.id, id);
                None
            }
            Err(e) => {
                error!("Could not finish backup record {} of job {}: {}", record_id, job.id, e);
                self.abandon(record_id, job.id, &format!("could not record outcome: {}", e)).await;
                None
            }
        };

        // the frequency may have been edited while the attempt ran
        match jobs::get(&self.pool, job.id).await {
            Ok(Some(current)) => {
                let stamped =
                    jobs::record_run(&self.pool, current.id, current.frequency, started_at).await;
                if let Err(e) = stamped {
                    error!("Could not update schedule of job {}: {}", job.id, e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Could not reload job {}: {}", job.id, e),
        }
        drop(guard);

        let finished = finished?;
        match outcome {
            Ok(uploaded) => self.after_success(&job, &finished, database_name, uploaded).await,
            Err(failure) => self.after_failure(&job, &finished, database_name, failure).await,
        }
        Some(finished)
    }

    async fn prepare(
        &self,
        job: &BackupJob,
        database: Result<Option<Database>, sqlx::Error>,
        started_at: DateTime<Utc>,
    ) -> Result<Plan, Failure> {
        let database = match database {
            Ok(Some(database)) => database,
            Ok(None) => {
                let message = format!("database {} no longer exists", job.database_id);
                return Err(Failure::new(message));
            }
            Err(e) => {
                let message = format!("could not load database {}: {}", job.database_id, e);
                return Err(Failure::new(message));
            }
        };
        if !database.is_active {
            return Err(Failure::new(format!("database '{}' is inactive", database.name)));
        }
        if job.backup_type == BackupType::Differential {
            let has_base = records::has_completed_full(&self.pool, database.id)
                .await
                .map_err(|e| Failure::new(format!("could not check for a full backup: {}", e)))?;
            if !has_base {
                return Err(Failure::new(format!(
                    "differential backup of '{}' requires a completed full backup",
                    database.name
                )));
            }
        }

        let config = self.config.snapshot();
        let file_name = artifact_name(&database.name, job.backup_type, started_at);
        let request = BackupRequest {
            database: database.clone(),
            backup_type: job.backup_type,
            destination: config.backup.storage_path.join(&file_name),
        };
        Ok(Plan {
            config,
            database,
            request,
            file_name,
            started_at,
        })
    }

    async fn run(&self, plan: &Plan) -> Result<Uploaded, Failure> {
        let artifact = self
            .engine
            .run_backup(&plan.request)
            .await
            .map_err(|e| Failure::new(e.to_string()))?;
        info!(
            "Backup of '{}' written to {} ({})",
            plan.database.name,
            artifact.path.display(),
            format_size(artifact.size)
        );

        let limit = plan.config.backup.max_backup_size_bytes();
        if limit > 0 && artifact.size > limit {
            discard(&artifact.path).await;
            return Err(Failure::new(format!(
                "backup size {} exceeds the limit of {}",
                format_size(artifact.size),
                format_size(limit)
            ))
            .with_size(artifact.size));
        }

        let key = remote_key(&plan.database.name, &plan.file_name, plan.started_at);
        let backend = self.storage.current();
        let policy = RetryPolicy::uploads(&plan.config.scheduler);
        let (target, local, object) = (backend.as_ref(), artifact.path.as_path(), key.as_str());
        let uploaded = retry_async(
            &policy,
            "upload",
            move || target.put(local, object),
            StorageError::is_transient,
        )
        .await;
        let remote_path = match uploaded {
            Ok(remote_path) => remote_path,
            Err(e) => {
                discard(&artifact.path).await;
                let message = format!("upload to {} failed: {}", backend.name(), e);
                return Err(Failure::new(message).with_size(artifact.size));
            }
        };
        info!("Uploaded {} to {} as {}", artifact.path.display(), backend.name(), remote_path);

        let local_path = if plan.config.backup.keep_local_copy {
            Some(artifact.path.clone())
        } else {
            discard(&artifact.path).await;
            None
        };
        Ok(Uploaded {
            size: artifact.size,
            remote_path,
            local_path,
        })
    }

    async fn after_success(
        &self,
        job: &BackupJob,
        record: &BackupRecord,
        database: String,
        uploaded: Uploaded,
    ) {
        events::record(
            &self.pool,
            NewEvent::new(
                EventLevel::Info,
                EventCategory::BackupSuccess,
                format!(
                    "Backup of '{}' completed ({}), stored at {}",
                    database,
                    format_size(uploaded.size),
                    uploaded.remote_path
                ),
            )
            .job(job.id)
            .record(record.id),
        )
        .await;

        let config = self.config.snapshot();
        let backend = self.storage.current();
        if let Err(e) = storage::cleanup_job(&self.pool, backend.as_ref(), job, Utc::now()).await {
            warn!("Retention cleanup of job {} failed: {}", job.id, e);
        }
        match storage::usage(&self.pool, &config.storage).await {
            Ok(usage) => {
                self.dispatcher
                    .observe_usage(usage.used_percentage, config.alerts.storage_warning_threshold)
                    .await;
            }
            Err(e) => warn!("Could not compute storage usage: {}", e),
        }

        self.dispatcher.dispatch(Notification::BackupSucceeded {
            database,
            backup_type: job.backup_type,
            started_at: record.started_at,
            completed_at: record.completed_at,
            size: uploaded.size,
            remote_path: uploaded.remote_path,
        });
    }

    async fn after_failure(
        &self,
        job: &BackupJob,
        record: &BackupRecord,
        database: String,
        failure: Failure,
    ) {
        events::record(
            &self.pool,
            NewEvent::new(
                EventLevel::Error,
                EventCategory::BackupFailure,
                format!("Backup of '{}' failed: {}", database, failure.message),
            )
            .job(job.id)
            .record(record.id),
        )
        .await;
        self.dispatcher.dispatch(Notification::BackupFailed {
            database,
            backup_type: job.backup_type,
            started_at: record.started_at,
            error: failure.message,
        });
    }
}
