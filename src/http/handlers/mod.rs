//! HTTP API handlers organized by resource.

pub mod auth;
pub mod backups;
pub mod databases;
pub mod monitoring;
pub mod settings;
pub mod storage;

pub(crate) use auth::{change_password, login, me, refresh, register, update_me, verify};
pub(crate) use backups::{
    history, job_create, job_delete, job_get, job_list, job_pause, job_resume, job_run, job_update,
    record_status,
};
pub(crate) use databases::{
    database_create, database_delete, database_get, database_list, database_test, database_update,
};
pub(crate) use monitoring::{
    alerts, backup_metrics, health, job_metrics, logs, system_status, test_notification,
};
pub(crate) use settings::{
    notification_settings, reload_system_settings, system_settings, update_notification_settings,
    update_system_settings,
};
pub(crate) use storage::{
    storage_cleanup, storage_delete, storage_download, storage_files, storage_usage,
};
