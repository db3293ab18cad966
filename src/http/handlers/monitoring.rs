//! Health, status, metrics and event log handlers.

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::database::{self, Event, EventLevel};
use crate::error::{AppError, Result};
use crate::http::AppState;
use crate::monitoring::{self, BackupMetrics, JobMetrics, SystemStatus};
use crate::repository::events;

const DEFAULT_EVENT_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestNotification {
    pub email: Option<String>,
}

/// GET /monitoring/health - Unauthenticated liveness probe.
pub(crate) async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = database::check_connection(state.pipeline.pool()).await;
    Json(json!({
        "status": if database { "healthy" } else { "degraded" },
        "database": database,
        "timestamp": Utc::now(),
    }))
}

/// GET /monitoring/status
pub(crate) async fn system_status(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Json<SystemStatus> {
    Json(monitoring::system_status(&state.pipeline).await)
}

/// GET /monitoring/metrics/backups
pub(crate) async fn backup_metrics(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<DaysQuery>,
) -> Result<Json<BackupMetrics>> {
    let days = monitoring::clamp_days(query.days);
    Ok(Json(monitoring::backup_metrics(state.pipeline.pool(), days, Utc::now()).await?))
}

/// GET /monitoring/metrics/jobs
pub(crate) async fn job_metrics(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<DaysQuery>,
) -> Result<Json<Vec<JobMetrics>>> {
    let days = monitoring::clamp_days(query.days);
    Ok(Json(monitoring::job_metrics(&state.pipeline, days, Utc::now()).await?))
}

/// GET /monitoring/alerts
pub(crate) async fn alerts(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<Event>>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Ok(Json(events::alerts(state.pipeline.pool(), limit).await?))
}

/// GET /monitoring/logs
pub(crate) async fn logs(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<Event>>> {
    let level = query
        .level
        .as_deref()
        .map(str::parse::<EventLevel>)
        .transpose()
        .map_err(AppError::Validation)?;
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Ok(Json(events::recent(state.pipeline.pool(), limit, level).await?))
}

/// POST /monitoring/test-notification - Sends to the caller unless an address is given.
pub(crate) async fn test_notification(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Option<Json<TestNotification>>,
) -> Result<Json<Value>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let to = request.email.unwrap_or_else(|| current.user.email.clone());
    let dispatcher = state.pipeline.dispatcher();
    dispatcher.send_test(&to).await?;
    Ok(Json(json!({
        "detail": format!("Test notification sent to {}", to),
        "channel": dispatcher.notifier().channel(),
    })))
}

#[cfg(test)]
mod tests {
    use crate::database::{BackupType, EventCategory, EventLevel};
    use crate::http::test_support::app;
    use crate::notify::Notification;
    use crate::repository::events::{self, NewEvent};
    use crate::testing::{self, EngineOutcome};
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_status_and_metrics() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;
        let db = testing::database(&t.pool, "sales").await;
        let job = testing::job(&t.pool, db.id, BackupType::Full).await;
        testing::completed_record(&t.pool, job.id, Utc::now(), 2048).await;
        testing::failed_record(&t.pool, job.id, Utc::now(), "boom").await;

        let (status, body) = t.send("GET", "/api/monitoring/status", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"]["healthy"], true);
        assert_eq!(body["active_jobs"], 1);

        let (status, body) = t
            .send("GET", "/api/monitoring/metrics/backups?days=3", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["days"], 3);
        assert_eq!(body["completed"], 1);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["success_rate"], 50.0);

        let (status, body) = t
            .send("GET", "/api/monitoring/metrics/jobs?days=1000", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["job_id"], job.id);
        assert_eq!(body[0]["total"], 2);
    }

    #[tokio::test]
    async fn test_logs_and_alerts() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;
        events::insert(&t.pool, &NewEvent::new(EventLevel::Info, EventCategory::Scheduler, "tick"))
            .await
            .unwrap();
        events::insert(
            &t.pool,
            &NewEvent::new(EventLevel::Error, EventCategory::BackupFailure, "sales failed"),
        )
        .await
        .unwrap();

        let (_, body) = t.send("GET", "/api/monitoring/alerts", Some(&token), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["message"], "sales failed");

        let (_, body) = t.send("GET", "/api/monitoring/logs?level=info", Some(&token), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["category"], "scheduler");

        let (status, _) = t
            .send("GET", "/api/monitoring/logs?level=verbose", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_notification_defaults_to_caller() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;

        let (status, body) = t
            .send("POST", "/api/monitoring/test-notification", Some(&token), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["channel"], "recording");

        t.send(
            "POST",
            "/api/monitoring/test-notification",
            Some(&token),
            Some(json!({ "email": "dba@example.com" })),
        )
        .await;
        let sent = t.stubs.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "admin@example.com");
        assert_eq!(sent[1].0, "dba@example.com");
        assert!(matches!(sent[0].1, Notification::Test));
    }
}
