use chrono::Utc;
use sqlx::SqlitePool;

use crate::database::Database;

const COLUMNS: &str = "id, name, server, connection_string, is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct NewDatabase {
    pub name: String,
    pub server: String,
    pub connection_string: String,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseUpdate {
    pub name: Option<String>,
    pub server: Option<String>,
    pub connection_string: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<Database>, sqlx::Error> {
    sqlx::query_as::<_, Database>(&format!("SELECT {COLUMNS} FROM databases ORDER BY name"))
        .fetch_all(pool)
        .await
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Database>, sqlx::Error> {
    sqlx::query_as::<_, Database>(&format!("SELECT {COLUMNS} FROM databases WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn create(pool: &SqlitePool, new: &NewDatabase) -> Result<Database, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, Database>(&format!(
        "INSERT INTO databases \
         (name, server, connection_string, is_active, created_at, updated_at) \
         VALUES (?, ?, ?, 1, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(&new.name)
    .bind(&new.server)
    .bind(&new.connection_string)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
}

pub async fn update(
    pool: &SqlitePool,
    id: i64,
    update: &DatabaseUpdate,
) -> Result<Option<Database>, sqlx::Error> {
    let Some(current) = get(pool, id).await? else {
        return Ok(None);
    };
    sqlx::query_as::<_, Database>(&format!(
        "UPDATE databases SET name = ?, server = ?, connection_string = ?, is_active = ?, \
         updated_at = ? WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(update.name.as_ref().unwrap_or(&current.name))
    .bind(update.server.as_ref().unwrap_or(&current.server))
    .bind(update.connection_string.as_ref().unwrap_or(&current.connection_string))
    .bind(update.is_active.unwrap_or(current.is_active))
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Number of backup jobs referencing the database.
pub async fn job_count(pool: &SqlitePool, id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM backup_jobs WHERE database_id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM databases WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
