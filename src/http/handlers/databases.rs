//! Database registry handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::CurrentUser;
use crate::database::Database;
use crate::error::{AppError, Result};
use crate::http::{conflict_on_unique, AppState};
use crate::repository::databases::{self, DatabaseUpdate, NewDatabase};
use crate::service::mssql::{redact_connection_string, restore_password, MssqlConnection};

#[derive(Debug, Deserialize)]
pub struct DatabaseCreate {
    pub name: String,
    #[serde(default)]
    pub server: String,
    pub connection_string: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatabaseChange {
    pub name: Option<String>,
    pub server: Option<String>,
    pub connection_string: Option<String>,
    pub is_active: Option<bool>,
}

/// A registry entry with the password masked out of its descriptor.
#[derive(Debug, Serialize)]
pub struct DatabaseResponse {
    pub id: i64,
    pub name: String,
    pub server: String,
    pub connection_string: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Database> for DatabaseResponse {
    fn from(db: Database) -> Self {
        DatabaseResponse {
            connection_string: redact_connection_string(&db.connection_string),
            id: db.id,
            name: db.name,
            server: db.server,
            is_active: db.is_active,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
}

fn check_descriptor(connection_string: &str, server: &str) -> Result<()> {
    MssqlConnection::resolve(connection_string, server)?;
    Ok(())
}

fn check_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Database name must not be empty".into()));
    }
    Ok(name.to_string())
}

async fn load(state: &AppState, id: i64) -> Result<Database> {
    databases::get(state.pipeline.pool(), id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Database {} not found", id)))
}

/// GET /databases
pub(crate) async fn database_list(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<Vec<DatabaseResponse>>> {
    let all = databases::list(state.pipeline.pool()).await?;
    Ok(Json(all.into_iter().map(DatabaseResponse::from).collect()))
}

/// POST /databases
pub(crate) async fn database_create(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(req): Json<DatabaseCreate>,
) -> Result<(StatusCode, Json<DatabaseResponse>)> {
    let name = check_name(&req.name)?;
    check_descriptor(&req.connection_string, &req.server)?;
    let created = databases::create(
        state.pipeline.pool(),
        &NewDatabase {
            name: name.clone(),
            server: req.server.trim().to_string(),
            connection_string: req.connection_string,
        },
    )
    .await
    .map_err(|e| conflict_on_unique(e, format!("A database named '{}' already exists", name)))?;
    log::info!("Registered database {} ({})", created.id, created.name);
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// GET /databases/{id}
pub(crate) async fn database_get(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<DatabaseResponse>> {
    Ok(Json(load(&state, id).await?.into()))
}

/// PUT /databases/{id}
pub(crate) async fn database_update(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<DatabaseChange>,
) -> Result<Json<DatabaseResponse>> {
    let current = load(&state, id).await?;
    let name = req.name.as_deref().map(check_name).transpose()?;
    let connection_string = req
        .connection_string
        .map(|edited| restore_password(&edited, &current.connection_string));
    if connection_string.is_some() || req.server.is_some() {
        check_descriptor(
            connection_string.as_deref().unwrap_or(&current.connection_string),
            req.server.as_deref().unwrap_or(&current.server),
        )?;
    }
    let updated = databases::update(
        state.pipeline.pool(),
        id,
        &DatabaseUpdate {
            name,
            server: req.server.map(|s| s.trim().to_string()),
            connection_string,
            is_active: req.is_active,
        },
    )
    .await
    .map_err(|e| conflict_on_unique(e, "A database with this name already exists"))?
    .ok_or_else(|| AppError::NotFound(format!("Database {} not found", id)))?;
    Ok(Json(updated.into()))
}

/// DELETE /databases/{id} - Refused while backup jobs reference the database.
pub(crate) async fn database_delete(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let pool = state.pipeline.pool();
    load(&state, id).await?;
    let jobs = databases::job_count(pool, id).await?;
    if jobs > 0 {
        return Err(AppError::Conflict(format!(
            "Database {} is used by {} backup jobs; delete them first",
            id, jobs
        )));
    }
    databases::delete(pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /databases/{id}/test - Probe failures are reported in the body.
pub(crate) async fn database_test(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<ConnectionTest>> {
    let db = load(&state, id).await?;
    let result = match state.pipeline.engine().check_connection(&db).await {
        Ok(()) => ConnectionTest {
            success: true,
            message: format!("Connected to '{}'", db.name),
        },
        Err(e) => ConnectionTest {
            success: false,
            message: e.to_string(),
        },
    };
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use crate::database::BackupType;
    use crate::http::test_support::app;
    use crate::testing::{self, EngineOutcome};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_redacts_password() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;
        let (status, body) = t
            .send(
                "POST",
                "/api/databases",
                Some(&token),
                Some(json!({
                    "name": "sales",
                    "server": "sql01",
                    "connection_string": "Database=sales;User Id=backup;Password=hunter2",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let descriptor = body["connection_string"].as_str().unwrap();
        assert!(!descriptor.contains("hunter2"));
        assert!(descriptor.contains("User Id=backup"));

        let (status, _) = t
            .send(
                "POST",
                "/api/databases",
                Some(&token),
                Some(json!({
                    "name": "sales",
                    "server": "sql01",
                    "connection_string": "User Id=backup;Password=x",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_create_rejects_unusable_descriptor() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;
        let descriptor = json!({
            "name": "sales",
            "server": "sql01",
            "connection_string": "Database=sales",
        });
        let (status, _) = t.send("POST", "/api/databases", Some(&token), Some(descriptor)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_refused_while_referenced() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;
        let db = testing::database(&t.pool, "sales").await;
        let job = testing::job(&t.pool, db.id, BackupType::Full).await;

        let uri = format!("/api/databases/{}", db.id);
        let (status, _) = t.send("DELETE", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = t
            .send("DELETE", &format!("/api/backups/jobs/{}", job.id), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = t.send("DELETE", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = t.send("GET", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connection_probe_reports_failure_in_body() {
        let t = app(EngineOutcome::Artifact(1)).await;
        let token = t.token_for("admin@example.com").await;
        let db = testing::database(&t.pool, "sales").await;
        let uri = format!("/api/databases/{}/test", db.id);

        let (status, body) = t.send("POST", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        t.stubs.engine.set_reachable(false);
        let (status, body) = t.send("POST", &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("Login timeout"));
    }
}
