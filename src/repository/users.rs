use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::{
    NotificationCategory, NotificationSettings, Recipient, Session, TokenKind, User,
};

const COLUMNS: &str = "id, email, hashed_password, is_active, is_superuser, created_at, updated_at";

pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users WHERE email = ? COLLATE NOCASE"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await
}

/// Inserts a user together with its notification settings (all toggles on).
/// The first user of an empty table becomes superuser.
pub async fn create(
    pool: &SqlitePool,
    email: &str,
    hashed_password: &str,
) -> Result<User, sqlx::Error> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let user = sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users \
         (email, hashed_password, is_active, is_superuser, created_at, updated_at) \
         VALUES (?, ?, 1, (SELECT COUNT(*) = 0 FROM users), ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(email)
    .bind(hashed_password)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO notification_settings (user_id, email_notifications, backup_success, \
         backup_failure, storage_warning, updated_at) VALUES (?, 1, 1, 1, 1, ?)",
    )
    .bind(user.id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(user)
}

pub async fn update_email(
    pool: &SqlitePool,
    id: i64,
    email: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET email = ?, updated_at = ? WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(email)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn update_password(
    pool: &SqlitePool,
    id: i64,
    hashed_password: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET hashed_password = ?, updated_at = ? WHERE id = ?")
        .bind(hashed_password)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
pub async fn set_active(pool: &SqlitePool, id: i64, is_active: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")
        .bind(is_active)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_session(
    pool: &SqlitePool,
    user_id: i64,
    token_hash: &str,
    kind: TokenKind,
    expires_at: DateTime<Utc>,
) -> Result<Session, sqlx::Error> {
    sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (user_id, token_hash, kind, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id, user_id, kind, expires_at",
    )
    .bind(user_id)
    .bind(token_hash)
    .bind(kind)
    .bind(expires_at)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
}

/// Looks up an unexpired session of the given kind by token digest.
pub async fn find_session(
    pool: &SqlitePool,
    token_hash: &str,
    kind: TokenKind,
    now: DateTime<Utc>,
) -> Result<Option<Session>, sqlx::Error> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT id, user_id, kind, expires_at FROM sessions WHERE token_hash = ? AND kind = ?",
    )
    .bind(token_hash)
    .bind(kind)
    .fetch_optional(pool)
    .await?;
    Ok(session.filter(|s| s.expires_at > now))
}

pub async fn delete_session(pool: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Revokes every session of the user except the listed ones.
pub async fn delete_sessions_except(
    pool: &SqlitePool,
    user_id: i64,
    keep: &[i64],
) -> Result<u64, sqlx::Error> {
    let mut query =
        sqlx::QueryBuilder::<sqlx::Sqlite>::new("DELETE FROM sessions WHERE user_id = ");
    query.push_bind(user_id);
    if !keep.is_empty() {
        query.push(" AND id NOT IN (");
        let mut ids = query.separated(", ");
        for id in keep {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
    }
    let result = query.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn purge_expired_sessions(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Settings of the user; a user without a row gets every toggle on.
pub async fn notification_settings(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<NotificationSettings, sqlx::Error> {
    let row = sqlx::query_as::<_, NotificationSettings>(
        "SELECT user_id, email_notifications, backup_success, backup_failure, storage_warning \
         FROM notification_settings WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or(NotificationSettings {
        user_id,
        email_notifications: true,
        backup_success: true,
        backup_failure: true,
        storage_warning: true,
    }))
}

pub async fn save_notification_settings(
    pool: &SqlitePool,
    settings: &NotificationSettings,
) -> Result<NotificationSettings, sqlx::Error> {
    sqlx::query_as::<_, NotificationSettings>(
        "INSERT INTO notification_settings (user_id, email_notifications, backup_success, \
         backup_failure, storage_warning, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (user_id) DO UPDATE SET email_notifications = excluded.email_notifications, \
         backup_success = excluded.backup_success, backup_failure = excluded.backup_failure, \
         storage_warning = excluded.storage_warning, updated_at = excluded.updated_at \
         RETURNING user_id, email_notifications, backup_success, backup_failure, storage_warning",
    )
    .bind(settings.user_id)
    .bind(settings.email_notifications)
    .bind(settings.backup_success)
    .bind(settings.backup_failure)
    .bind(settings.storage_warning)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
}

/// Active users with email notifications on and the category enabled.
pub async fn recipients(
    pool: &SqlitePool,
    category: NotificationCategory,
) -> Result<Vec<Recipient>, sqlx::Error> {
    let toggle = match category.column() {
        Some(column) => format!(" AND n.{column} = 1"),
        None => String::new(),
    };
    sqlx::query_as::<_, Recipient>(&format!(
        "SELECT u.id AS user_id, u.email FROM users u \
         JOIN notification_settings n ON n.user_id = u.id \
         WHERE u.is_active = 1 AND n.email_notifications = 1{toggle} ORDER BY u.id"
    ))
    .fetch_all(pool)
    .await
}
