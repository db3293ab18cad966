//! Read-only aggregations over jobs, records and events for the dashboard.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::database::{self, BackupJob, BackupRecord, BackupStatus};
use crate::pipeline::Pipeline;
use crate::repository::{events, jobs, records};
use crate::storage::{self, StorageUsage};
use crate::utils::format_size;

pub const DEFAULT_METRICS_DAYS: i64 = 7;
const ALERT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastBackup {
    pub record_id: i64,
    pub job_id: i64,
    pub status: BackupStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub healthy: bool,
    pub database: ComponentStatus,
    pub storage: ComponentStatus,
    pub scheduler_enabled: bool,
    pub active_jobs: i64,
    pub running_jobs: Vec<i64>,
    pub last_backup: Option<LastBackup>,
    pub recent_alerts: i64,
    pub storage_usage: Option<StorageUsage>,
    pub checked_at: DateTime<Utc>,
}

/// Connectivity problems are reported in the status, never returned as errors.
pub async fn system_status(pipeline: &Pipeline) -> SystemStatus {
    let pool = pipeline.pool();
    let config = pipeline.config().snapshot();
    let now = Utc::now();

    let database = if database::check_connection(pool).await {
        ComponentStatus {
            healthy: true,
            detail: "connected".to_string(),
        }
    } else {
        ComponentStatus {
            healthy: false,
            detail: "control database is unreachable".to_string(),
        }
    };

    let backend = pipeline.storage().current();
    let storage = match backend.check().await {
        Ok(()) => ComponentStatus {
            healthy: true,
            detail: format!("{} reachable", backend.name()),
        },
        Err(e) => ComponentStatus {
            healthy: false,
            detail: format!("{}: {}", backend.name(), e),
        },
    };

    let mut running_jobs = pipeline.locks().running();
    running_jobs.sort_unstable();

    let (active_jobs, last_backup, recent_alerts, storage_usage) = if database.healthy {
        let since = now - Duration::hours(ALERT_WINDOW_HOURS);
        (
            jobs::count_active(pool).await.unwrap_or(0),
            records::latest(pool).await.ok().flatten().map(|r| LastBackup {
                record_id: r.id,
                job_id: r.backup_job_id,
                status: r.status,
                started_at: r.started_at,
                completed_at: r.completed_at,
            }),
            events::count_alerts_since(pool, since).await.unwrap_or(0),
            storage::usage(pool, &config.storage).await.ok(),
        )
    } else {
        (0, None, 0, None)
    };

    SystemStatus {
        healthy: database.healthy && storage.healthy,
        database,
        storage,
        scheduler_enabled: config.scheduler.enabled,
        active_jobs,
        running_jobs,
        last_backup,
        recent_alerts,
        storage_usage,
        checked_at: now,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub completed: i64,
    pub failed: i64,
    pub total_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupMetrics {
    pub days: i64,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub running: i64,
    /// Percent of finished attempts that completed.
    pub success_rate: f64,
    pub total_size: u64,
    pub total_size_human: String,
    pub average_duration_seconds: Option<f64>,
    pub daily: Vec<DailyBucket>,
}

fn success_rate(completed: i64, failed: i64) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        return 0.0;
    }
    (completed as f64 / finished as f64 * 10_000.0).round() / 100.0
}

pub fn clamp_days(days: Option<i64>) -> i64 {
    days.unwrap_or(DEFAULT_METRICS_DAYS).clamp(1, 365)
}

/// Aggregates the records of the last `days` days. Every day of the window
/// gets a bucket, including days without attempts.
pub fn summarize(history: &[BackupRecord], days: i64, now: DateTime<Utc>) -> BackupMetrics {
    let first_day = (now - Duration::days(days - 1)).date_naive();
    let mut daily: BTreeMap<NaiveDate, DailyBucket> = first_day
        .iter_days()
        .take(days as usize)
        .map(|date| {
            (
                date,
                DailyBucket {
                    date,
                    ..Default::default()
                },
            )
        })
        .collect();

    let (mut completed, mut failed, mut running, mut total_size) = (0, 0, 0, 0u64);
    let mut durations = Vec::new();
    for record in history {
        let bucket = daily.get_mut(&record.created_at.date_naive());
        match record.status {
            BackupStatus::Completed => {
                completed += 1;
                let size = record.file_size.unwrap_or(0).max(0) as u64;
                total_size += size;
                if let Some(bucket) = bucket {
                    bucket.completed += 1;
                    bucket.total_size += size;
                }
                if let (Some(start), Some(end)) = (record.started_at, record.completed_at) {
                    durations.push((end - start).num_milliseconds() as f64 / 1000.0);
                }
            }
            BackupStatus::Failed => {
                failed += 1;
                if let Some(bucket) = bucket {
                    bucket.failed += 1;
                }
            }
            BackupStatus::Pending | BackupStatus::InProgress => running += 1,
        }
    }

    let average_duration_seconds =
        (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);
    BackupMetrics {
        days,
        total: history.len() as i64,
        completed,
        failed,
        running,
        success_rate: success_rate(completed, failed),
        total_size,
        total_size_human: format_size(total_size),
        average_duration_seconds,
        daily: daily.into_values().collect(),
    }
}

pub async fn backup_metrics(
    pool: &SqlitePool,
    days: i64,
    now: DateTime<Utc>,
) -> Result<BackupMetrics, sqlx::Error> {
    let since = (now - Duration::days(days - 1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now - Duration::days(days));
    let history = records::since(pool, since).await?;
    Ok(summarize(&history, days, now))
}

#[derive(Debug, Clone, Serialize)]
pub struct JobMetrics {
    pub job_id: i64,
    pub name: String,
    pub database_id: i64,
    pub is_active: bool,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub total_size: u64,
    pub last_status: Option<BackupStatus>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub running: bool,
}

pub fn per_job(
    all_jobs: &[BackupJob],
    history: &[BackupRecord],
    running: &[i64],
) -> Vec<JobMetrics> {
    let mut by_job: HashMap<i64, Vec<&BackupRecord>> = HashMap::new();
    for record in history {
        by_job.entry(record.backup_job_id).or_default().push(record);
    }

    all_jobs
        .iter()
        .map(|job| {
            let records = by_job.remove(&job.id).unwrap_or_default();
            let count = |status: BackupStatus| {
                records.iter().filter(|r| r.status == status).count() as i64
            };
            let completed = count(BackupStatus::Completed);
            let failed = count(BackupStatus::Failed);
            let total_size = records
                .iter()
                .filter(|r| r.status == BackupStatus::Completed)
                .map(|r| r.file_size.unwrap_or(0).max(0) as u64)
                .sum();
            let last_status = records.iter().max_by_key(|r| (r.created_at, r.id)).map(|r| r.status);
            JobMetrics {
                job_id: job.id,
                name: job.name.clone(),
                database_id: job.database_id,
                is_active: job.is_active,
                total: records.len() as i64,
                completed,
                failed,
                success_rate: success_rate(completed, failed),
                total_size,
                last_status,
                last_run: job.last_run,
                next_run: job.next_run,
                running: running.contains(&job.id),
            }
        })
        .collect()
}

pub async fn job_metrics(
    pipeline: &Pipeline,
    days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<JobMetrics>, sqlx::Error> {
    let all_jobs = jobs::list(pipeline.pool(), None).await?;
    let history = records::since(pipeline.pool(), now - Duration::days(days)).await?;
    Ok(per_job(&all_jobs, &history, &pipeline.locks().running()))
}
