use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use crate::database::{BackupRecord, BackupStatus};

const COLUMNS: &str = "id, backup_job_id, status, file_path, file_size, cloud_storage_path, \
                       started_at, completed_at, error_message, created_at";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("backup record {0} not found")]
    NotFound(i64),

    #[error("backup record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: BackupStatus,
        to: BackupStatus,
    },

    #[error("backup job {0} already has an execution in flight")]
    InFlight(i64),
}

/// Filters accepted by the history listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    pub job_id: Option<i64>,
    pub database_id: Option<i64>,
    pub status: Option<BackupStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Outcome fields written with the `completed` transition.
#[derive(Debug, Clone)]
pub struct CompletedBackup {
    pub file_path: Option<String>,
    pub file_size: i64,
    pub cloud_storage_path: String,
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Opens a new attempt for the job. Fails with `InFlight` while another
/// attempt of the same job is pending or in progress.
pub async fn create_pending(
    pool: &SqlitePool,
    job_id: i64,
    now: DateTime<Utc>,
) -> Result<BackupRecord, RecordError> {
    sqlx::query_as::<_, BackupRecord>(&format!(
        "INSERT INTO backup_records (backup_job_id, status, created_at) VALUES (?, ?, ?) \
         RETURNING {COLUMNS}"
    ))
    .bind(job_id)
    .bind(BackupStatus::Pending)
    .bind(now)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            RecordError::InFlight(job_id)
        } else {
            RecordError::Database(e)
        }
    })
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<BackupRecord>, sqlx::Error> {
    sqlx::query_as::<_, BackupRecord>(&format!("SELECT {COLUMNS} FROM backup_records WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

async fn transition_failed(pool: &SqlitePool, id: i64, to: BackupStatus) -> RecordError {
    match get(pool, id).await {
        Ok(Some(current)) => RecordError::InvalidTransition {
            id,
            from: current.status,
            to,
        },
        Ok(None) => RecordError::NotFound(id),
        Err(e) => RecordError::Database(e),
    }
}

pub async fn mark_in_progress(
    pool: &SqlitePool,
    id: i64,
    started_at: DateTime<Utc>,
) -> Result<BackupRecord, RecordError> {
    let updated = sqlx::query_as::<_, BackupRecord>(&format!(
        "UPDATE backup_records SET status = ?, started_at = ? WHERE id = ? AND status = ? \
         RETURNING {COLUMNS}"
    ))
    .bind(BackupStatus::InProgress)
    .bind(started_at)
    .bind(id)
    .bind(BackupStatus::Pending)
    .fetch_optional(pool)
    .await?;
    match updated {
        Some(record) => Ok(record),
        None => Err(transition_failed(pool, id, BackupStatus::InProgress).await),
    }
}

pub async fn mark_completed(
    pool: &SqlitePool,
    id: i64,
    outcome: &CompletedBackup,
    completed_at: DateTime<Utc>,
) -> Result<BackupRecord, RecordError> {
    let updated = sqlx::query_as::<_, BackupRecord>(&format!(
        "UPDATE backup_records SET status = ?, file_path = ?, file_size = ?, \
         cloud_storage_path = ?, completed_at = ? WHERE id = ? AND status = ? RETURNING {COLUMNS}"
    ))
    .bind(BackupStatus::Completed)
    .bind(&outcome.file_path)
    .bind(outcome.file_size)
    .bind(&outcome.cloud_storage_path)
    .bind(completed_at)
    .bind(id)
    .bind(BackupStatus::InProgress)
    .fetch_optional(pool)
    .await?;
    match updated {
        Some(record) => Ok(record),
        None => Err(transition_failed(pool, id, BackupStatus::Completed).await),
    }
}

/// Failure keeps no artifact references: neither the local file nor a remote
/// path survive a failed attempt.
pub async fn mark_failed(
    pool: &SqlitePool,
    id: i64,
    error_message: &str,
    file_size: Option<i64>,
    completed_at: DateTime<Utc>,
) -> Result<BackupRecord, RecordError> {
    let updated = sqlx::query_as::<_, BackupRecord>(&format!(
        "UPDATE backup_records SET status = ?, error_message = ?, file_size = ?, completed_at = ? \
         WHERE id = ? AND status = ? RETURNING {COLUMNS}"
    ))
    .bind(BackupStatus::Failed)
    .bind(error_message)
    .bind(file_size)
    .bind(completed_at)
    .bind(id)
    .bind(BackupStatus::InProgress)
    .fetch_optional(pool)
    .await?;
    match updated {
        Some(record) => Ok(record),
        None => Err(transition_failed(pool, id, BackupStatus::Failed).await),
    }
}

/// Fails every attempt left pending or in progress by a previous process,
/// stepping pending ones through in_progress first. Returns how many were
/// closed.
pub async fn fail_interrupted(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE backup_records SET status = 'in_progress', started_at = COALESCE(started_at, ?) \
         WHERE status = 'pending'",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let result = sqlx::query(
        "UPDATE backup_records SET status = 'failed', error_message = ?, completed_at = ? \
         WHERE status = 'in_progress'",
    )
    .bind("interrupted by service restart")
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Closes one attempt whose normal transition could not be written. Only a
/// row still pending or in progress is touched; returns whether it was.
pub async fn force_fail(
    pool: &SqlitePool,
    id: i64,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_records SET status = 'failed', error_message = ?, \
         started_at = COALESCE(started_at, ?), completed_at = ? \
         WHERE id = ? AND status IN ('pending', 'in_progress')",
    )
    .bind(error_message)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn history(
    pool: &SqlitePool,
    filter: &HistoryFilter,
) -> Result<Vec<BackupRecord>, sqlx::Error> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT r.id, r.backup_job_id, r.status, r.file_path, r.file_size, r.cloud_storage_path, \
         r.started_at, r.completed_at, r.error_message, r.created_at \
         FROM backup_records r JOIN backup_jobs j ON j.id = r.backup_job_id WHERE 1 = 1",
    );
    if let Some(job_id) = filter.job_id {
        query.push(" AND r.backup_job_id = ").push_bind(job_id);
    }
    if let Some(database_id) = filter.database_id {
        query.push(" AND j.database_id = ").push_bind(database_id);
    }
    if let Some(status) = filter.status {
        query.push(" AND r.status = ").push_bind(status);
    }
    if let Some(from) = filter.from {
        query.push(" AND r.created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        query.push(" AND r.created_at <= ").push_bind(to);
    }
    query
        .push(" ORDER BY r.created_at DESC, r.id DESC LIMIT ")
        .push_bind(filter.limit.unwrap_or(100).clamp(1, 1000));

    query.build_query_as::<BackupRecord>().fetch_all(pool).await
}

pub async fn since(
    pool: &SqlitePool,
    since: DateTime<Utc>,
) -> Result<Vec<BackupRecord>, sqlx::Error> {
    sqlx::query_as::<_, BackupRecord>(&format!(
        "SELECT {COLUMNS} FROM backup_records WHERE created_at >= ? ORDER BY created_at"
    ))
    .bind(since)
    .fetch_all(pool)
    .await
}

pub async fn latest(pool: &SqlitePool) -> Result<Option<BackupRecord>, sqlx::Error> {
    sqlx::query_as::<_, BackupRecord>(&format!(
        "SELECT {COLUMNS} FROM backup_records ORDER BY created_at DESC, id DESC LIMIT 1"
    ))
    .fetch_optional(pool)
    .await
}

#[cfg(test)]
pub async fn in_progress_count(pool: &SqlitePool, job_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM backup_records WHERE backup_job_id = ? AND status = 'in_progress'",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
}

/// Bytes held by completed attempts.
pub async fn completed_size_total(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(SUM(file_size), 0) FROM backup_records WHERE status = 'completed'",
    )
    .fetch_one(pool)
    .await
}

/// Whether any job of the database has produced a completed full backup.
pub async fn has_completed_full(pool: &SqlitePool, database_id: i64) -> Result<bool, sqlx::Error> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT r.id FROM backup_records r JOIN backup_jobs j ON j.id = r.backup_job_id \
         WHERE j.database_id = ? AND j.backup_type = 'full' AND r.status = 'completed' LIMIT 1",
    )
    .bind(database_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Completed records of the job created before `cutoff`, never including the
/// job's newest completed record.
pub async fn expired_for_job(
    pool: &SqlitePool,
    job_id: i64,
    cutoff: DateTime<Utc>,
) -> Result<Vec<BackupRecord>, sqlx::Error> {
    sqlx::query_as::<_, BackupRecord>(&format!(
        "SELECT {COLUMNS} FROM backup_records \
         WHERE backup_job_id = ? AND status = 'completed' AND created_at < ? \
         AND id <> (SELECT id FROM backup_records WHERE backup_job_id = ? AND status = 'completed' \
                    ORDER BY created_at DESC, id DESC LIMIT 1) \
         ORDER BY created_at"
    ))
    .bind(job_id)
    .bind(cutoff)
    .bind(job_id)
    .fetch_all(pool)
    .await
}

pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM backup_records WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
