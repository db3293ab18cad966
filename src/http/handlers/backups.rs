//! Backup job, run-now and history handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::CurrentUser;
use crate::database::{BackupJob, BackupRecord, BackupType, Frequency};
use crate::error::{AppError, Result};
use crate::http::AppState;
use crate::repository::databases;
use crate::repository::jobs::{self, JobUpdate, NewJob};
use crate::repository::records::{self, HistoryFilter};

#[derive(Debug, Deserialize)]
pub struct JobCreate {
    pub name: String,
    pub database_id: i64,
    pub backup_type: BackupType,
    pub frequency: Frequency,
    pub retention_days: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobChange {
    pub name: Option<String>,
    pub backup_type: Option<BackupType>,
    pub frequency: Option<Frequency>,
    pub retention_days: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub database_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: BackupJob,
    pub running: bool,
}

fn respond(state: &AppState, job: BackupJob) -> JobResponse {
    JobResponse {
        running: state.pipeline.locks().is_running(job.id),
        job,
    }
}

fn check_retention(days: Option<i64>) -> Result<()> {
    match days {
        Some(days) if days < 1 => {
            Err(AppError::Validation("retention_days must be at least 1".into()))
        }
        _ => Ok(()),
    }
}

fn job_not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Backup job {} not found", id))
}

/// GET /backups/jobs
pub(crate) async fn job_list(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<JobResponse>>> {
    let all = jobs::list(state.pipeline.pool(), query.database_id).await?;
    Ok(Json(all.into_iter().map(|job| respond(&state, job)).collect()))
}

/// POST /backups/jobs - New active jobs run at the next scheduler tick.
pub(crate) async fn job_create(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(req): Json<JobCreate>,
) -> Result<(StatusCode, Json<JobResponse>)> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Job name must not be empty".into()));
    }
    check_retention(req.retention_days)?;
    let pool = state.pipeline.pool();
    if databases::get(pool, req.database_id).await?.is_none() {
        return Err(AppError::NotFound(format!("Database {} not found", req.database_id)));
    }

    let retention_days = req
        .retention_days
        .unwrap_or(state.pipeline.config().snapshot().backup.retention_days);
    let job = jobs::create(
        pool,
        &NewJob {
            name: name.to_string(),
            database_id: req.database_id,
            user_id: Some(current.user.id),
            backup_type: req.backup_type,
            frequency: req.frequency,
            retention_days,
            is_active: req.is_active.unwrap_or(true),
        },
        Utc::now(),
    )
    .await?;
    log::info!("Created backup job {} for database {}", job.id, job.database_id);
    Ok((StatusCode::CREATED, Json(respond(&state, job))))
}

/// GET /backups/jobs/{id}
pub(crate) async fn job_get(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>> {
    let job = jobs::get(state.pipeline.pool(), id).await?.ok_or_else(|| job_not_found(id))?;
    Ok(Json(respond(&state, job)))
}

/// PUT /backups/jobs/{id} - Deactivating a job cancels its running attempt.
pub(crate) async fn job_update(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<JobChange>,
) -> Result<Json<JobResponse>> {
    check_retention(req.retention_days)?;
    let name = match req.name {
        Some(name) if name.trim().is_empty() => {
            return Err(AppError::Validation("Job name must not be empty".into()));
        }
        other => other.map(|n| n.trim().to_string()),
    };
    let update = JobUpdate {
        name,
        backup_type: req.backup_type,
        frequency: req.frequency,
        retention_days: req.retention_days,
        is_active: req.is_active,
    };
    let job = jobs::update(state.pipeline.pool(), id, &update, Utc::now())
        .await?
        .ok_or_else(|| job_not_found(id))?;
    if !job.is_active {
        state.pipeline.cancel(id);
    }
    Ok(Json(respond(&state, job)))
}

/// DELETE /backups/jobs/{id} - Cancels a running attempt; history goes with the job.
pub(crate) async fn job_delete(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    state.pipeline.cancel(id);
    if !jobs::delete(state.pipeline.pool(), id).await? {
        return Err(job_not_found(id));
    }
    log::info!("Deleted backup job {}", id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /backups/jobs/{id}/pause
pub(crate) async fn job_pause(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>> {
    let job = jobs::set_active(state.pipeline.pool(), id, false, Utc::now())
        .await?
        .ok_or_else(|| job_not_found(id))?;
    state.pipeline.cancel(id);
    Ok(Json(respond(&state, job)))
}

/// POST /backups/jobs/{id}/resume
pub(crate) async fn job_resume(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<JobResponse>> {
    let job = jobs::set_active(state.pipeline.pool(), id, true, Utc::now())
        .await?
        .ok_or_else(|| job_not_found(id))?;
    Ok(Json(respond(&state, job)))
}

/// POST /backups/jobs/{id}/run - Accepts the attempt and returns its pending record.
pub(crate) async fn job_run(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<BackupRecord>)> {
    let started = state.pipeline.start(id).await?;
    Ok((StatusCode::ACCEPTED, Json(started.record)))
}

/// GET /backups/history
pub(crate) async fn history(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(filter): Query<HistoryFilter>,
) -> Result<Json<Vec<BackupRecord>>> {
    if let (Some(from), Some(to)) = (filter.from, filter.to) {
        if from > to {
            return Err(AppError::Validation("'from' must not be after 'to'".into()));
        }
    }
    Ok(Json(records::history(state.pipeline.pool(), &filter).await?))
}

/// GET /backups/status/{record_id}
pub(crate) async fn record_status(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(record_id): Path<i64>,
) -> Result<Json<BackupRecord>> {
    let record = records::get(state.pipeline.pool(), record_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Backup record {} not found", record_id)))?;
    Ok(Json(record))
}
