use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::SystemSettings;

const SYSTEM_KEY: &str = "system";

/// The persisted configuration overlay; empty when nothing was saved yet.
/// A row that no longer parses is ignored with a warning.
pub async fn load_system(pool: &SqlitePool) -> Result<SystemSettings, sqlx::Error> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM system_settings WHERE key = ?")
            .bind(SYSTEM_KEY)
            .fetch_optional(pool)
            .await?;
    Ok(match value {
        Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable system settings: {}", e);
            SystemSettings::default()
        }),
        None => SystemSettings::default(),
    })
}

pub async fn save_system(pool: &SqlitePool, settings: &SystemSettings) -> Result<(), sqlx::Error> {
    let json =
        serde_json::to_string(settings).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
    sqlx::query(
        "INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(SYSTEM_KEY)
    .bind(json)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
