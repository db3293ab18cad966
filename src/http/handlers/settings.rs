//! Per-user notification preferences and the operator-editable system settings.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::auth::CurrentUser;
use crate::config::{SystemSettings, SystemSettingsView};
use crate::database::NotificationSettings;
use crate::error::Result;
use crate::http::AppState;
use crate::repository::{settings, users};

#[derive(Debug, Default, Deserialize)]
pub struct NotificationSettingsUpdate {
    pub email_notifications: Option<bool>,
    pub backup_success: Option<bool>,
    pub backup_failure: Option<bool>,
    pub storage_warning: Option<bool>,
}

/// GET /settings/notifications
pub(crate) async fn notification_settings(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<NotificationSettings>> {
    Ok(Json(users::notification_settings(state.pipeline.pool(), current.user.id).await?))
}

/// PUT /settings/notifications
pub(crate) async fn update_notification_settings(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(req): Json<NotificationSettingsUpdate>,
) -> Result<Json<NotificationSettings>> {
    let pool = state.pipeline.pool();
    let mut stored = users::notification_settings(pool, current.user.id).await?;
    if let Some(v) = req.email_notifications {
        stored.email_notifications = v;
    }
    if let Some(v) = req.backup_success {
        stored.backup_success = v;
    }
    if let Some(v) = req.backup_failure {
        stored.backup_failure = v;
    }
    if let Some(v) = req.storage_warning {
        stored.storage_warning = v;
    }
    Ok(Json(users::save_notification_settings(pool, &stored).await?))
}

/// GET /settings/system - Secrets are masked.
pub(crate) async fn system_settings(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Json<SystemSettingsView> {
    Json(state.pipeline.config().snapshot().system_view())
}

/// PUT /settings/system - Validates, persists and applies the overlay.
pub(crate) async fn update_system_settings(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(mut update): Json<SystemSettings>,
) -> Result<Json<SystemSettingsView>> {
    current.require_superuser()?;
    update.drop_redacted();

    let pool = state.pipeline.pool();
    let mut overlay = settings::load_system(pool).await?;
    overlay.merge(update);

    let mut candidate = (*state.pipeline.config().snapshot()).clone();
    candidate.apply_overlay(&overlay);
    candidate.validate()?;

    settings::save_system(pool, &overlay).await?;
    let config = state.pipeline.reload().await?;
    log::info!("System settings updated by user {}", current.user.id);
    Ok(Json(config.system_view()))
}

/// POST /settings/system/reload - Re-reads file, environment and stored overlay.
pub(crate) async fn reload_system_settings(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<SystemSettingsView>> {
    current.require_superuser()?;
    let config = state.pipeline.reload().await?;
    Ok(Json(config.system_view()))
}

#[cfg(test)]
mod tests {
    use crate::http::test_support::app;
    use crate::repository::settings;
    use crate::testing::EngineOutcome;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_notification_toggles_merge() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;

        let (status, body) = t.send("GET", "/api/settings/notifications", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backup_success"], true);

        let (status, body) = t
            .send(
                "PUT",
                "/api/settings/notifications",
                Some(&token),
                Some(json!({ "backup_success": false })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backup_success"], false);
        assert_eq!(body["backup_failure"], true);

        let (_, body) = t.send("GET", "/api/settings/notifications", Some(&token), None).await;
        assert_eq!(body["backup_success"], false);
    }

    #[tokio::test]
    async fn test_system_settings_update_and_redaction() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let admin = t.token_for("admin@example.com").await;
        let operator = t.token_for("ops@example.com").await;
        let change = json!({ "retention_days": 14, "smtp_password": "hunter2" });

        let (status, _) = t
            .send("PUT", "/api/settings/system", Some(&operator), Some(change.clone()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            t.send("PUT", "/api/settings/system", Some(&admin), Some(change)).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["retention_days"], 14);
        assert_eq!(body["smtp_password"], "********");

        // posting the masked value back keeps the stored secret
        t.send(
            "PUT",
            "/api/settings/system",
            Some(&admin),
            Some(json!({ "smtp_password": "********" })),
        )
        .await;
        let stored = settings::load_system(&t.pool).await.unwrap();
        assert_eq!(stored.smtp_password.as_deref(), Some("hunter2"));
        assert_eq!(stored.retention_days, Some(14));

        let (_, body) = t.send("GET", "/api/settings/system", Some(&operator), None).await;
        assert_eq!(body["retention_days"], 14);
    }

    #[tokio::test]
    async fn test_invalid_system_settings_are_not_saved() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let admin = t.token_for("admin@example.com").await;

        let (status, _) = t
            .send("PUT", "/api/settings/system", Some(&admin), Some(json!({ "retention_days": 0 })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(settings::load_system(&t.pool).await.unwrap().retention_days, None);

        let (status, _) = t.send("POST", "/api/settings/system/reload", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
