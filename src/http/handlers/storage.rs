//! Remote storage handlers: usage, listing, download links and cleanup.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::CurrentUser;
use crate::database::{BackupRecord, BackupStatus};
use crate::error::{AppError, Result};
use crate::http::AppState;
use crate::repository::{jobs, records};
use crate::storage::{self, CleanupReport, StorageUsage, StoredObject, DEFAULT_LINK_EXPIRY};
use crate::utils::format_size;

/// Presigned links are capped at a week.
const MAX_LINK_EXPIRY_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    #[serde(flatten)]
    pub usage: StorageUsage,
    pub warning_threshold: f64,
    pub warning: bool,
}

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub database_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileListing {
    pub files: Vec<StoredObject>,
    pub total_count: usize,
    pub total_size: u64,
    pub total_size_human: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DownloadLink {
    pub download_url: String,
    pub expires_in: u64,
    pub file_name: String,
}

async fn load_record(state: &AppState, record_id: i64) -> Result<BackupRecord> {
    records::get(state.pipeline.pool(), record_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Backup record {} not found", record_id)))
}

/// GET /storage/usage - Also feeds the storage warning alarm.
pub(crate) async fn storage_usage(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<UsageResponse>> {
    let config = state.pipeline.config().snapshot();
    let usage = storage::usage(state.pipeline.pool(), &config.storage).await?;
    let threshold = config.alerts.storage_warning_threshold;
    state.pipeline.dispatcher().observe_usage(usage.used_percentage, threshold).await;
    Ok(Json(UsageResponse {
        warning: usage.used_percentage >= threshold,
        warning_threshold: threshold,
        usage,
    }))
}

/// GET /storage/files
pub(crate) async fn storage_files(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<FilesQuery>,
) -> Result<Json<FileListing>> {
    let prefix = query
        .database_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| format!("{}/", name.trim_matches('/')));
    let files = state.pipeline.storage().current().list(prefix.as_deref()).await?;
    let total_size = files.iter().map(|f| f.size).sum();
    Ok(Json(FileListing {
        total_count: files.len(),
        total_size,
        total_size_human: format_size(total_size),
        files,
    }))
}

/// GET /storage/files/{record_id}/download
pub(crate) async fn storage_download(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(record_id): Path<i64>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadLink>> {
    let expires_in = query.expires_in.unwrap_or(DEFAULT_LINK_EXPIRY.as_secs());
    if expires_in == 0 || expires_in > MAX_LINK_EXPIRY_SECS {
        return Err(AppError::Validation(format!(
            "expires_in must be within 1..={} seconds",
            MAX_LINK_EXPIRY_SECS
        )));
    }

    let record = load_record(&state, record_id).await?;
    let key = match (&record.status, &record.cloud_storage_path) {
        (BackupStatus::Completed, Some(key)) => key.clone(),
        _ => {
            return Err(AppError::NotFound(format!(
                "Backup record {} has no stored artifact",
                record_id
            )))
        }
    };
    let download_url = state
        .pipeline
        .storage()
        .current()
        .presign(&key, Duration::from_secs(expires_in))
        .await?;
    let file_name = key.rsplit('/').next().unwrap_or(&key).to_string();
    Ok(Json(DownloadLink {
        download_url,
        expires_in,
        file_name,
    }))
}

/// DELETE /storage/files/{record_id} - Removes the artifact and its record.
pub(crate) async fn storage_delete(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(record_id): Path<i64>,
) -> Result<StatusCode> {
    current.require_superuser()?;
    let record = load_record(&state, record_id).await?;
    if !record.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Backup record {} is still {}",
            record_id, record.status
        )));
    }
    let backend = state.pipeline.storage().current();
    storage::remove_artifact(state.pipeline.pool(), backend.as_ref(), &record).await?;
    log::info!("User {} deleted backup record {}", current.user.id, record_id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /storage/cleanup/{job_id} - Applies the job's retention now.
pub(crate) async fn storage_cleanup(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(job_id): Path<i64>,
) -> Result<Json<CleanupReport>> {
    let pool = state.pipeline.pool();
    let job = jobs::get(pool, job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Backup job {} not found", job_id)))?;
    let backend = state.pipeline.storage().current();
    let report = storage::cleanup_job(pool, backend.as_ref(), &job, Utc::now()).await?;
    Ok(Json(report))
}
