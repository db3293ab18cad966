//! The JSON API consumed by the dashboard. Everything except `/` and the
//! health probe requires a bearer token.

pub mod handlers;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::error::AppError;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        AppState { pipeline }
    }
}

/// Maps a unique-constraint violation to 409, anything else to a database error.
pub(crate) fn conflict_on_unique(error: sqlx::Error, message: impl Into<String>) -> AppError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => AppError::Conflict(message.into()),
        _ => AppError::Database(error),
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// GET / - Service banner.
async fn root() -> Json<Value> {
    Json(json!({
        "message": "MSSQL Backup Manager API",
        "version": env!("CARGO_PKG_VERSION"),
        "api": "/api",
    }))
}

pub fn router(state: AppState) -> Router {
    let config = state.pipeline.config().snapshot();
    let api = Router::new()
        // auth
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/register", post(handlers::register))
        .route("/auth/me", get(handlers::me).put(handlers::update_me))
        .route("/auth/password/change", post(handlers::change_password))
        .route("/auth/verify", post(handlers::verify))
        // databases
        .route("/databases", get(handlers::database_list).post(handlers::database_create))
        .route(
            "/databases/{id}",
            get(handlers::database_get)
                .put(handlers::database_update)
                .delete(handlers::database_delete),
        )
        .route("/databases/{id}/test", post(handlers::database_test))
        // backups
        .route("/backups/jobs", get(handlers::job_list).post(handlers::job_create))
        .route(
            "/backups/jobs/{id}",
            get(handlers::job_get).put(handlers::job_update).delete(handlers::job_delete),
        )
        .route("/backups/jobs/{id}/pause", post(handlers::job_pause))
        .route("/backups/jobs/{id}/resume", post(handlers::job_resume))
        .route("/backups/jobs/{id}/run", post(handlers::job_run))
        .route("/backups/history", get(handlers::history))
        .route("/backups/status/{record_id}", get(handlers::record_status))
        // storage
        .route("/storage/usage", get(handlers::storage_usage))
        .route("/storage/files", get(handlers::storage_files))
        .route("/storage/files/{record_id}", delete(handlers::storage_delete))
        .route("/storage/files/{record_id}/download", get(handlers::storage_download))
        .route("/storage/cleanup/{job_id}", post(handlers::storage_cleanup))
        // monitoring
        .route("/monitoring/health", get(handlers::health))
        .route("/monitoring/status", get(handlers::system_status))
        .route("/monitoring/metrics/backups", get(handlers::backup_metrics))
        .route("/monitoring/metrics/jobs", get(handlers::job_metrics))
        .route("/monitoring/alerts", get(handlers::alerts))
        .route("/monitoring/logs", get(handlers::logs))
        .route("/monitoring/test-notification", post(handlers::test_notification))
        // settings
        .route(
            "/settings/notifications",
            get(handlers::notification_settings).put(handlers::update_notification_settings),
        )
        .route(
            "/settings/system",
            get(handlers::system_settings).put(handlers::update_system_settings),
        )
        .route("/settings/system/reload", post(handlers::reload_system_settings));

    Router::new()
        .route("/", get(root))
        .nest("/api", api)
        .layer(cors_layer(&config.server.cors_origins))
        .with_state(state)
}


#[cfg(test)]
mod tests {
    use super::test_support::app;
    use crate::testing::EngineOutcome;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_root_and_health_are_public() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let (status, body) = t.send("GET", "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "MSSQL Backup Manager API");

        let (status, body) = t.send("GET", "/api/monitoring/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_protected_routes_require_token() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let (status, body) = t.send("GET", "/api/backups/jobs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "Not authenticated");

        let (status, _) = t.send("GET", "/api/backups/jobs", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
