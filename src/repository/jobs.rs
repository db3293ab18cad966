use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::{BackupJob, BackupType, Frequency};
use crate::schedule::next_run_for;

const COLUMNS: &str = "id, name, database_id, user_id, backup_type, frequency, retention_days, \
                       is_active, last_run, next_run, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub database_id: i64,
    pub user_id: Option<i64>,
    pub backup_type: BackupType,
    pub frequency: Frequency,
    pub retention_days: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub backup_type: Option<BackupType>,
    pub frequency: Option<Frequency>,
    pub retention_days: Option<i64>,
    pub is_active: Option<bool>,
}

pub async fn list(
    pool: &SqlitePool,
    database_id: Option<i64>,
) -> Result<Vec<BackupJob>, sqlx::Error> {
    match database_id {
        Some(database_id) => {
            sqlx::query_as::<_, BackupJob>(&format!(
                "SELECT {COLUMNS} FROM backup_jobs WHERE database_id = ? ORDER BY id"
            ))
            .bind(database_id)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, BackupJob>(&format!(
                "SELECT {COLUMNS} FROM backup_jobs ORDER BY id"
            ))
            .fetch_all(pool)
            .await
        }
    }
}

pub async fn list_active(pool: &SqlitePool) -> Result<Vec<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>(&format!(
        "SELECT {COLUMNS} FROM backup_jobs WHERE is_active = 1 ORDER BY id"
    ))
    .fetch_all(pool)
    .await
}

pub async fn count_active(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM backup_jobs WHERE is_active = 1")
        .fetch_one(pool)
        .await
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>(&format!("SELECT {COLUMNS} FROM backup_jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Active jobs are due straight away; paused ones carry no next-run.
pub async fn create(
    pool: &SqlitePool,
    new: &NewJob,
    now: DateTime<Utc>,
) -> Result<BackupJob, sqlx::Error> {
    let next_run = new.is_active.then_some(now);
    sqlx::query_as::<_, BackupJob>(&format!(
        "INSERT INTO backup_jobs (name, database_id, user_id, backup_type, frequency, \
         retention_days, is_active, last_run, next_run, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(&new.name)
    .bind(new.database_id)
    .bind(new.user_id)
    .bind(new.backup_type)
    .bind(new.frequency)
    .bind(new.retention_days)
    .bind(new.is_active)
    .bind(next_run)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Applies a user edit and re-derives next-run: pausing clears it, resuming
/// makes the job due at `now`, and a frequency change re-bases it on last-run.
pub async fn update(
    pool: &SqlitePool,
    id: i64,
    update: &JobUpdate,
    now: DateTime<Utc>,
) -> Result<Option<BackupJob>, sqlx::Error> {
    let Some(current) = get(pool, id).await? else {
        return Ok(None);
    };

    let frequency = update.frequency.unwrap_or(current.frequency);
    let is_active = update.is_active.unwrap_or(current.is_active);
    let next_run = if !is_active {
        None
    } else if !current.is_active {
        Some(now)
    } else if update.frequency.is_some_and(|f| f != current.frequency) {
        match current.last_run {
            Some(last_run) => next_run_for(frequency, true, last_run),
            None => current.next_run.or(Some(now)),
        }
    } else {
        current.next_run
    };

    sqlx::query_as::<_, BackupJob>(&format!(
        "UPDATE backup_jobs SET name = ?, backup_type = ?, frequency = ?, retention_days = ?, \
         is_active = ?, next_run = ?, updated_at = ? WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(update.name.as_ref().unwrap_or(&current.name))
    .bind(update.backup_type.unwrap_or(current.backup_type))
    .bind(frequency)
    .bind(update.retention_days.unwrap_or(current.retention_days))
    .bind(is_active)
    .bind(next_run)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn set_active(
    pool: &SqlitePool,
    id: i64,
    is_active: bool,
    now: DateTime<Utc>,
) -> Result<Option<BackupJob>, sqlx::Error> {
    update(
        pool,
        id,
        &JobUpdate {
            is_active: Some(is_active),
            ..Default::default()
        },
        now,
    )
    .await
}

/// Stamps the attempt that started at `last_run`. The next-run is only set
/// when the job is still active at write time, so a pause that raced the
/// attempt wins.
pub async fn record_run(
    pool: &SqlitePool,
    id: i64,
    frequency: Frequency,
    last_run: DateTime<Utc>,
) -> Result<Option<BackupJob>, sqlx::Error> {
    let next_run = frequency.next_after(last_run);
    sqlx::query_as::<_, BackupJob>(&format!(
        "UPDATE backup_jobs SET last_run = ?, \
         next_run = CASE WHEN is_active = 1 THEN ? ELSE NULL END, updated_at = ? \
         WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(last_run)
    .bind(next_run)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Deletes the job; its records go with it.
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
