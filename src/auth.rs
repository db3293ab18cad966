//! Password hashing, opaque bearer tokens and request authentication.
//!
//! Tokens are random strings handed to the client once; only a SHA-256
//! digest keyed with the configured secret is stored.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::database::{TokenKind, User};
use crate::error::{AppError, Result};
use crate::http::AppState;
use crate::repository::users;

const MIN_PASSWORD_LEN: usize = 8;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("could not hash password: {}", e)))
}

/// A stored hash that does not parse never verifies.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    match PasswordHash::new(hashed) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn token_digest(secret_key: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret_key.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn validate_credentials(email: &str, password: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(AppError::Validation(format!("'{}' is not a valid email address", email)));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

/// Opens an access and a refresh session for the user.
pub async fn issue_tokens(
    pool: &SqlitePool,
    config: &AuthConfig,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<TokenPair> {
    let access_token = new_token();
    let refresh_token = new_token();
    let access_ttl = Duration::minutes(config.access_token_expire_minutes);
    users::create_session(
        pool,
        user_id,
        &token_digest(&config.secret_key, &access_token),
        TokenKind::Access,
        now + access_ttl,
    )
    .await?;
    users::create_session(
        pool,
        user_id,
        &token_digest(&config.secret_key, &refresh_token),
        TokenKind::Refresh,
        now + Duration::days(config.refresh_token_expire_days),
    )
    .await?;
    Ok(TokenPair {
        access_token,
        refresh_token,
        token_type: "bearer",
        expires_in: access_ttl.num_seconds(),
    })
}

pub async fn login(
    pool: &SqlitePool,
    config: &AuthConfig,
    email: &str,
    password: &str,
) -> Result<TokenPair> {
    let user = users::find_by_email(pool, email.trim())
        .await?
        .filter(|user| verify_password(password, &user.hashed_password))
        .ok_or_else(|| AppError::Unauthorized("Incorrect email or password".into()))?;
    if !user.is_active {
        return Err(AppError::Validation("Inactive user".into()));
    }
    log::info!("User {} logged in", user.id);
    issue_tokens(pool, config, user.id, Utc::now()).await
}

/// Creates the account and signs it in. The first account becomes superuser.
pub async fn register(
    pool: &SqlitePool,
    config: &AuthConfig,
    email: &str,
    password: &str,
) -> Result<(User, TokenPair)> {
    validate_credentials(email, password)?;
    let email = email.trim();
    if users::find_by_email(pool, email).await?.is_some() {
        return Err(AppError::Validation("A user with this email already exists".into()));
    }
    let user = users::create(pool, email, &hash_password(password)?).await?;
    log::info!("Registered user {} (superuser: {})", user.id, user.is_superuser);
    let tokens = issue_tokens(pool, config, user.id, Utc::now()).await?;
    Ok((user, tokens))
}

/// Exchanges a refresh token for a new pair; the old refresh token is spent.
pub async fn refresh(
    pool: &SqlitePool,
    config: &AuthConfig,
    refresh_token: &str,
) -> Result<TokenPair> {
    let now = Utc::now();
    let session = users::find_session(
        pool,
        &token_digest(&config.secret_key, refresh_token),
        TokenKind::Refresh,
        now,
    )
    .await?
    .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".into()))?;
    let user = users::get(pool, session.user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".into()))?;
    if !user.is_active {
        return Err(AppError::Validation("Inactive user".into()));
    }
    users::delete_session(pool, session.id).await?;
    issue_tokens(pool, config, user.id, now).await
}

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub session_id: i64,
}

impl CurrentUser {
    pub fn require_superuser(&self) -> Result<()> {
        if self.user.is_superuser {
            Ok(())
        } else {
            Err(AppError::Forbidden("The user doesn't have enough privileges".into()))
        }
    }
}

pub async fn authenticate(
    pool: &SqlitePool,
    config: &AuthConfig,
    access_token: &str,
) -> Result<CurrentUser> {
    let invalid = || AppError::Unauthorized("Could not validate credentials".into());
    let session = users::find_session(
        pool,
        &token_digest(&config.secret_key, access_token),
        TokenKind::Access,
        Utc::now(),
    )
    .await?
    .ok_or_else(invalid)?;
    let user = users::get(pool, session.user_id).await?.ok_or_else(invalid)?;
    if !user.is_active {
        return Err(AppError::Validation("Inactive user".into()));
    }
    Ok(CurrentUser {
        user,
        session_id: session.id,
    })
}

/// Sets a new password and revokes every other session of the user.
pub async fn change_password(
    pool: &SqlitePool,
    current: &CurrentUser,
    current_password: &str,
    new_password: &str,
) -> Result<u64> {
    if !verify_password(current_password, &current.user.hashed_password) {
        return Err(AppError::Validation("Incorrect password".into()));
    }
    validate_credentials(&current.user.email, new_password)?;
    users::update_password(pool, current.user.id, &hash_password(new_password)?).await?;
    let revoked =
        users::delete_sessions_except(pool, current.user.id, &[current.session_id]).await?;
    log::info!("User {} changed password, revoked {} sessions", current.user.id, revoked);
    Ok(revoked)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Not authenticated".into()))?;
        let config = state.pipeline.config().snapshot();
        authenticate(state.pipeline.pool(), &config.auth, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;

    const ADMIN: &str = "admin@example.com";
    const PASSWORD: &str = "s3cret-pass";

    fn config() -> AuthConfig {
        AuthConfig {
            secret_key: "test-secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let hashed = hash_password("correct horse").unwrap();
        assert!(hashed.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hashed));
        assert!(!verify_password("wrong horse", &hashed));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_digest_depends_on_secret() {
        let a = token_digest("one", "token");
        assert_eq!(a.len(), 64);
        assert_eq!(a, token_digest("one", "token"));
        assert_ne!(a, token_digest("two", "token"));
    }

    #[tokio::test]
    async fn test_register_login_authenticate() {
        let pool = memory_pool().await;
        let config = config();
        let (user, tokens) = register(&pool, &config, ADMIN, PASSWORD).await.unwrap();
        assert!(user.is_superuser);
        assert_eq!(tokens.token_type, "bearer");

        let current = authenticate(&pool, &config, &tokens.access_token).await.unwrap();
        assert_eq!(current.user.id, user.id);
        // refresh tokens are not access tokens
        assert!(matches!(
            authenticate(&pool, &config, &tokens.refresh_token).await,
            Err(AppError::Unauthorized(_))
        ));

        assert!(login(&pool, &config, "ADMIN@example.com", "s3cret-pass").await.is_ok());
        assert!(matches!(
            login(&pool, &config, "admin@example.com", "nope").await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            register(&pool, &config, "admin@example.com", "another-pass").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            register(&pool, &config, "ops@example.com", "short").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_user_rejected() {
        let pool = memory_pool().await;
        let config = config();
        let (user, tokens) = register(&pool, &config, ADMIN, PASSWORD).await.unwrap();
        users::set_active(&pool, user.id, false).await.unwrap();

        assert!(matches!(
            login(&pool, &config, "admin@example.com", "s3cret-pass").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            authenticate(&pool, &config, &tokens.access_token).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let pool = memory_pool().await;
        let config = config();
        let (_, tokens) = register(&pool, &config, ADMIN, PASSWORD).await.unwrap();

        let rotated = refresh(&pool, &config, &tokens.refresh_token).await.unwrap();
        assert_ne!(rotated.access_token, tokens.access_token);
        assert!(authenticate(&pool, &config, &rotated.access_token).await.is_ok());
        // the spent refresh token cannot be used again
        assert!(matches!(
            refresh(&pool, &config, &tokens.refresh_token).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_access_token() {
        let pool = memory_pool().await;
        let config = config();
        let (user, _) = register(&pool, &config, ADMIN, PASSWORD).await.unwrap();
        let stale = issue_tokens(&pool, &config, user.id, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert!(matches!(
            authenticate(&pool, &config, &stale.access_token).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_change_password_revokes_other_sessions() {
        let pool = memory_pool().await;
        let config = config();
        let (_, first) = register(&pool, &config, ADMIN, PASSWORD).await.unwrap();
        let second = login(&pool, &config, "admin@example.com", "s3cret-pass").await.unwrap();
        let current = authenticate(&pool, &config, &first.access_token).await.unwrap();

        assert!(matches!(
            change_password(&pool, &current, "wrong", "new-s3cret-pass").await,
            Err(AppError::Validation(_))
        ));
        change_password(&pool, &current, "s3cret-pass", "new-s3cret-pass").await.unwrap();

        assert!(authenticate(&pool, &config, &first.access_token).await.is_ok());
        assert!(authenticate(&pool, &config, &second.access_token).await.is_err());
        assert!(login(&pool, &config, "admin@example.com", "new-s3cret-pass").await.is_ok());
    }
}
