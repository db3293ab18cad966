//! Account handlers: sign-in, token refresh, registration and profile.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::{self, CurrentUser, TokenPair};
use crate::database::User;
use crate::error::{AppError, Result};
use crate::http::{conflict_on_unique, AppState};
use crate::repository::users;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "username")]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ProfileUpdate {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub email: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id,
            email: user.email.clone(),
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            created_at: user.created_at,
        }
    }
}

/// POST /auth/login
pub(crate) async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenPair>> {
    let config = state.pipeline.config().snapshot();
    let pool = state.pipeline.pool();
    let tokens = auth::login(pool, &config.auth, &req.email, &req.password).await?;
    Ok(Json(tokens))
}

/// POST /auth/refresh
pub(crate) async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    let config = state.pipeline.config().snapshot();
    let tokens = auth::refresh(state.pipeline.pool(), &config.auth, &req.refresh_token).await?;
    Ok(Json(tokens))
}

/// POST /auth/register
pub(crate) async fn register(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenPair>> {
    let config = state.pipeline.config().snapshot();
    let pool = state.pipeline.pool();
    let (_, tokens) = auth::register(pool, &config.auth, &req.email, &req.password).await?;
    Ok(Json(tokens))
}

/// GET /auth/me
pub(crate) async fn me(current: CurrentUser) -> Json<UserResponse> {
    Json(UserResponse::from(&current.user))
}

/// PUT /auth/me
pub(crate) async fn update_me(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(req): Json<ProfileUpdate>,
) -> Result<Json<UserResponse>> {
    let email = req.email.trim();
    if !email.contains('@') {
        return Err(AppError::Validation(format!("'{}' is not a valid email address", email)));
    }
    let user = users::update_email(state.pipeline.pool(), current.user.id, email)
        .await
        .map_err(|e| conflict_on_unique(e, "A user with this email already exists"))?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    Ok(Json(UserResponse::from(&user)))
}

/// POST /auth/password/change
pub(crate) async fn change_password(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(req): Json<PasswordChange>,
) -> Result<Json<Value>> {
    let pool = state.pipeline.pool();
    let revoked =
        auth::change_password(pool, &current, &req.current_password, &req.new_password).await?;
    Ok(Json(json!({
        "detail": "Password updated successfully",
        "revoked_sessions": revoked,
    })))
}

/// POST /auth/verify
pub(crate) async fn verify(current: CurrentUser) -> Json<Value> {
    Json(json!({ "valid": true, "user": UserResponse::from(&current.user) }))
}

#[cfg(test)]
mod tests {
    use crate::http::test_support::app;
    use crate::testing::EngineOutcome;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_login_me_and_refresh() {
        let t = app(EngineOutcome::Artifact(1)).await;
        t.token_for("admin@example.com").await;

        let (status, tokens) = t
            .send(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({ "username": "admin@example.com", "password": "s3cret-pass" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tokens["token_type"], "bearer");
        let access = tokens["access_token"].as_str().unwrap();

        let (status, me) = t.send("GET", "/api/auth/me", Some(access), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["email"], "admin@example.com");
        assert_eq!(me["is_superuser"], true);
        assert!(me.get("hashed_password").is_none());

        let (status, rotated) = t
            .send(
                "POST",
                "/api/auth/refresh",
                None,
                Some(json!({ "refresh_token": tokens["refresh_token"] })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(rotated["access_token"], tokens["access_token"]);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let t = app(EngineOutcome::Artifact(1)).await;
        t.token_for("admin@example.com").await;
        let (status, body) = t
            .send(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({ "email": "admin@example.com", "password": "wrong-password" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["detail"], "Incorrect email or password");
    }

    #[tokio::test]
    async fn test_update_profile_conflict() {
        let t = app(EngineOutcome::Artifact(1)).await;
        t.token_for("admin@example.com").await;
        let token = t.token_for("ops@example.com").await;

        let taken = json!({ "email": "admin@example.com" });
        let (status, _) = t.send("PUT", "/api/auth/me", Some(&token), Some(taken)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = t
            .send("PUT", "/api/auth/me", Some(&token), Some(json!({ "email": "dba@example.com" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["email"], "dba@example.com");
    }
}
