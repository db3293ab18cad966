use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::database::{Event, EventCategory, EventLevel};

const COLUMNS: &str = "id, level, category, message, backup_job_id, backup_record_id, created_at";

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub level: EventLevel,
    pub category: EventCategory,
    pub message: String,
    pub backup_job_id: Option<i64>,
    pub backup_record_id: Option<i64>,
}

impl NewEvent {
    pub fn new(level: EventLevel, category: EventCategory, message: impl Into<String>) -> Self {
        NewEvent {
            level,
            category,
            message: message.into(),
            backup_job_id: None,
            backup_record_id: None,
        }
    }

    pub fn job(mut self, job_id: i64) -> Self {
        self.backup_job_id = Some(job_id);
        self
    }

    pub fn record(mut self, record_id: i64) -> Self {
        self.backup_record_id = Some(record_id);
        self
    }
}

pub async fn insert(pool: &SqlitePool, event: &NewEvent) -> Result<Event, sqlx::Error> {
    sqlx::query_as::<_, Event>(&format!(
        "INSERT INTO events \
         (level, category, message, backup_job_id, backup_record_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(event.level)
    .bind(event.category)
    .bind(&event.message)
    .bind(event.backup_job_id)
    .bind(event.backup_record_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
}

/// Persists the event and mirrors it to the process log. Persisting is best
/// effort: a failure is logged and swallowed.
pub async fn record(pool: &SqlitePool, event: NewEvent) {
    match event.level {
        EventLevel::Info => log::info!("{}", event.message),
        EventLevel::Warning => log::warn!("{}", event.message),
        EventLevel::Error => log::error!("{}", event.message),
    }
    if let Err(e) = insert(pool, &event).await {
        log::error!("Failed to persist event: {}", e);
    }
}

/// Most recent events, optionally restricted to one level.
pub async fn recent(
    pool: &SqlitePool,
    limit: i64,
    level: Option<EventLevel>,
) -> Result<Vec<Event>, sqlx::Error> {
    let mut query: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {COLUMNS} FROM events"));
    if let Some(level) = level {
        query.push(" WHERE level = ").push_bind(level);
    }
    query
        .push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(limit.clamp(1, 1000));
    query.build_query_as::<Event>().fetch_all(pool).await
}

/// Most recent warning and error events.
pub async fn alerts(pool: &SqlitePool, limit: i64) -> Result<Vec<Event>, sqlx::Error> {
    sqlx::query_as::<_, Event>(&format!(
        "SELECT {COLUMNS} FROM events WHERE level IN ('warning', 'error') \
         ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(limit.clamp(1, 1000))
    .fetch_all(pool)
    .await
}

pub async fn count_alerts_since(
    pool: &SqlitePool,
    since: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM events WHERE level IN ('warning', 'error') AND created_at >= ?",
    )
    .bind(since)
    .fetch_one(pool)
    .await
}
