use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use cron::Schedule;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "BACKUP_MANAGER_CONFIG";
const REDACTED: &str = "********";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    Env { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub cors_origins: Vec<String>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "0.0.0.0:8000".to_string(),
            cors_origins: vec!["*".to_string()],
            log_level: "info".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub secret_key: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            secret_key: "change-me".to_string(),
            access_token_expire_minutes: 60 * 24 * 8,
            refresh_token_expire_days: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: "sqlite://backup-manager.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Six field cron expression (with seconds) driving the due-job scan.
    pub tick: String,
    pub upload_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: true,
            tick: "0 * * * * *".to_string(),
            upload_retries: 3,
            retry_initial_delay_ms: 500,
            retry_max_delay_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub storage_path: PathBuf,
    pub retention_days: i64,
    pub max_backup_size_mb: u64,
    pub keep_local_copy: bool,
    /// Explicit sqlcmd binary; looked up on PATH when unset.
    pub sqlcmd_path: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            storage_path: PathBuf::from("/backups"),
            retention_days: 30,
            max_backup_size_mb: 1000,
            keep_local_copy: false,
            sqlcmd_path: None,
        }
    }
}

impl BackupConfig {
    pub fn max_backup_size_bytes(&self) -> u64 {
        self.max_backup_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    Local,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(StorageKind::S3),
            "local" => Ok(StorageKind::Local),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    pub bucket: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Root directory used by the local backend.
    pub local_path: PathBuf,
    pub capacity_gb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageKind::Local,
            bucket: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            local_path: PathBuf::from("./remote-backups"),
            capacity_gb: 100,
        }
    }
}

impl StorageConfig {
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_gb.saturating_mul(1024 * 1024 * 1024)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
    pub starttls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            host: None,
            port: 587,
            username: None,
            password: None,
            from: None,
            starttls: true,
        }
    }
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        self.host.as_deref().is_some_and(|h| !h.is_empty()) && self.sender().is_some()
    }

    /// Sender address, falling back to the login name like most relays expect.
    pub fn sender(&self) -> Option<&str> {
        self.from
            .as_deref()
            .or(self.username.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub storage_warning_threshold: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            storage_warning_threshold: 90.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub smtp: SmtpConfig,
    pub alerts: AlertConfig,
}

/// Operator-editable subset of the configuration, persisted by the settings
/// API and layered over the file and environment on every (re)load.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SystemSettings {
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    pub storage_bucket: Option<String>,
    pub storage_access_key_id: Option<String>,
    pub storage_secret_access_key: Option<String>,
    pub retention_days: Option<i64>,
    pub max_backup_size_mb: Option<u64>,
    pub capacity_gb: Option<u64>,
}

impl SystemSettings {
    /// Field-wise merge, values present in `update` win.
    pub fn merge(&mut self, update: SystemSettings) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if update.$field.is_some() { self.$field = update.$field; })*
            };
        }
        take!(
            smtp_host,
            smtp_port,
            smtp_user,
            smtp_password,
            smtp_from,
            storage_bucket,
            storage_access_key_id,
            storage_secret_access_key,
            retention_days,
            max_backup_size_mb,
            capacity_gb
        );
    }

    /// Clears secrets that still carry the redaction placeholder, so a view
    /// posted back unchanged keeps the stored values.
    pub fn drop_redacted(&mut self) {
        for secret in [
            &mut self.smtp_password,
            &mut self.storage_access_key_id,
            &mut self.storage_secret_access_key,
        ] {
            if secret.as_deref() == Some(REDACTED) {
                *secret = None;
            }
        }
    }
}

/// Effective system configuration as shown to the dashboard.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SystemSettingsView {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    pub storage_backend: StorageKind,
    pub storage_bucket: Option<String>,
    pub storage_access_key_id: Option<String>,
    pub storage_secret_access_key: Option<String>,
    pub retention_days: i64,
    pub max_backup_size_mb: u64,
    pub capacity_gb: u64,
    pub scheduler_enabled: bool,
    pub storage_warning_threshold: f64,
}

fn redact(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|_| REDACTED.to_string())
}

impl Config {
    pub async fn new(path: &str) -> Result<Config, ConfigError> {
        let config_str = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config)
    }

    /// File (when present) plus process environment, validated.
    pub async fn load(path: &Path) -> Result<Config, ConfigError> {
        let mut config = if fs::try_exists(path).await.unwrap_or(false) {
            Config::new(&path.to_string_lossy()).await?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("SECRET_KEY") {
            self.auth.secret_key = v;
        }
        if let Some(v) = lookup("ACCESS_TOKEN_EXPIRE_MINUTES") {
            self.auth.access_token_expire_minutes = parse("ACCESS_TOKEN_EXPIRE_MINUTES", v)?;
        }
        if let Some(v) = lookup("REFRESH_TOKEN_EXPIRE_DAYS") {
            self.auth.refresh_token_expire_days = parse("REFRESH_TOKEN_EXPIRE_DAYS", v)?;
        }
        if let Some(v) = lookup("STORAGE_BACKEND") {
            self.storage.backend = parse("STORAGE_BACKEND", v)?;
        }
        if let Some(v) = lookup("S3_BUCKET") {
            self.storage.bucket = Some(v);
        }
        if let Some(v) = lookup("S3_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = lookup("S3_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Some(v) = lookup("S3_ACCESS_KEY_ID") {
            self.storage.access_key_id = Some(v);
        }
        if let Some(v) = lookup("S3_SECRET_ACCESS_KEY") {
            self.storage.secret_access_key = Some(v);
        }
        if let Some(v) = lookup("STORAGE_CAPACITY_GB") {
            self.storage.capacity_gb = parse("STORAGE_CAPACITY_GB", v)?;
        }
        if let Some(v) = lookup("SMTP_HOST") {
            self.smtp.host = Some(v);
        }
        if let Some(v) = lookup("SMTP_PORT") {
            self.smtp.port = parse("SMTP_PORT", v)?;
        }
        if let Some(v) = lookup("SMTP_USER") {
            self.smtp.username = Some(v);
        }
        if let Some(v) = lookup("SMTP_PASSWORD") {
            self.smtp.password = Some(v);
        }
        if let Some(v) = lookup("SMTP_FROM") {
            self.smtp.from = Some(v);
        }
        if let Some(v) = lookup("BACKUP_RETENTION_DAYS") {
            self.backup.retention_days = parse("BACKUP_RETENTION_DAYS", v)?;
        }
        if let Some(v) = lookup("MAX_BACKUP_SIZE_MB") {
            self.backup.max_backup_size_mb = parse("MAX_BACKUP_SIZE_MB", v)?;
        }
        if let Some(v) = lookup("BACKUP_STORAGE_PATH") {
            self.backup.storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SQLCMD_PATH") {
            self.backup.sqlcmd_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CORS_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Some(v) = lookup("SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse("SCHEDULER_ENABLED", v)?;
        }
        if let Some(v) = lookup("BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        Ok(())
    }

    pub fn apply_overlay(&mut self, overlay: &SystemSettings) {
        if let Some(v) = &overlay.smtp_host {
            self.smtp.host = Some(v.clone());
        }
        if let Some(v) = overlay.smtp_port {
            self.smtp.port = v;
        }
        if let Some(v) = &overlay.smtp_user {
            self.smtp.username = Some(v.clone());
        }
        if let Some(v) = &overlay.smtp_password {
            self.smtp.password = Some(v.clone());
        }
        if let Some(v) = &overlay.smtp_from {
            self.smtp.from = Some(v.clone());
        }
        if let Some(v) = &overlay.storage_bucket {
            self.storage.bucket = Some(v.clone());
        }
        if let Some(v) = &overlay.storage_access_key_id {
            self.storage.access_key_id = Some(v.clone());
        }
        if let Some(v) = &overlay.storage_secret_access_key {
            self.storage.secret_access_key = Some(v.clone());
        }
        if let Some(v) = overlay.retention_days {
            self.backup.retention_days = v;
        }
        if let Some(v) = overlay.max_backup_size_mb {
            self.backup.max_backup_size_mb = v;
        }
        if let Some(v) = overlay.capacity_gb {
            self.storage.capacity_gb = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret_key.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.secret_key must not be empty".into()));
        }
        if self.auth.access_token_expire_minutes <= 0 || self.auth.refresh_token_expire_days <= 0 {
            return Err(ConfigError::Invalid("token lifetimes must be positive".into()));
        }
        Schedule::from_str(&self.scheduler.tick).map_err(|e| {
            ConfigError::Invalid(format!("scheduler.tick '{}': {}", self.scheduler.tick, e))
        })?;
        let threshold = self.alerts.storage_warning_threshold;
        if !(1.0..=100.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "alerts.storage_warning_threshold must be within 1..=100, got {}",
                threshold
            )));
        }
        if self.backup.retention_days <= 0 {
            return Err(ConfigError::Invalid("backup.retention_days must be positive".into()));
        }
        if self.storage.backend == StorageKind::S3
            && self.storage.bucket.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid("s3 storage requires storage.bucket".into()));
        }
        Ok(())
    }

    pub fn system_view(&self) -> SystemSettingsView {
        SystemSettingsView {
            smtp_host: self.smtp.host.clone(),
            smtp_port: self.smtp.port,
            smtp_user: self.smtp.username.clone(),
            smtp_password: redact(&self.smtp.password),
            smtp_from: self.smtp.from.clone(),
            storage_backend: self.storage.backend,
            storage_bucket: self.storage.bucket.clone(),
            storage_access_key_id: redact(&self.storage.access_key_id),
            storage_secret_access_key: redact(&self.storage.secret_access_key),
            retention_days: self.backup.retention_days,
            max_backup_size_mb: self.backup.max_backup_size_mb,
            capacity_gb: self.storage.capacity_gb,
            scheduler_enabled: self.scheduler.enabled,
            storage_warning_threshold: self.alerts.storage_warning_threshold,
        }
    }
}

/// Shared, explicitly reloadable configuration. Components receive snapshots
/// at construction; nothing reads the configuration through a global.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(path: Option<PathBuf>, config: Config) -> Self {
        ConfigHandle {
            path,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, config: Config) -> Arc<Config> {
        let config = Arc::new(config);
        match self.current.write() {
            Ok(mut guard) => *guard = config.clone(),
            Err(poisoned) => *poisoned.into_inner() = config.clone(),
        }
        config
    }

    /// Re-reads file and environment and re-applies the persisted overlay.
    /// Without a backing file the in-memory base is kept.
    pub async fn reload(&self, overlay: &SystemSettings) -> Result<Arc<Config>, ConfigError> {
        let mut config = match &self.path {
            Some(path) => Config::load(path).await?,
            None => (*self.snapshot()).clone(),
        };
        config.apply_overlay(overlay);
        config.validate()?;
        Ok(self.replace(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_new_reads_sections() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]").unwrap();
        writeln!(file, "bind_address = \"127.0.0.1:9000\"").unwrap();
        writeln!(file, "[backup]").unwrap();
        writeln!(file, "storage_path = \"/var/backups\"").unwrap();
        writeln!(file, "retention_days = 14").unwrap();
        writeln!(file, "[alerts]").unwrap();
        writeln!(file, "storage_warning_threshold = 80.0").unwrap();

        let config = Config::new(file.path().to_str().unwrap()).await.unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.backup.storage_path, PathBuf::from("/var/backups"));
        assert_eq!(config.backup.retention_days, 14);
        assert_eq!(config.alerts.storage_warning_threshold, 80.0);
        // untouched sections keep defaults
        assert_eq!(config.scheduler.tick, "0 * * * * *");
        assert_eq!(config.smtp.port, 587);
    }

    #[tokio::test]
    async fn test_load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.toml")).await.unwrap();
        assert_eq!(config.backup.max_backup_size_mb, 1000);
        assert_eq!(config.storage.backend, StorageKind::Local);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_PORT", "2525"),
            ("CORS_ORIGINS", "http://a.test, http://b.test"),
            ("SCHEDULER_ENABLED", "false"),
            ("STORAGE_BACKEND", "s3"),
            ("S3_BUCKET", "backups"),
            ("MAX_BACKUP_SIZE_MB", "250"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.smtp.host.as_deref(), Some("smtp.example.com"));
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.server.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.storage.backend, StorageKind::S3);
        assert_eq!(config.backup.max_backup_size_mb, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_invalid_number() {
        let mut config = Config::default();
        let result = config.apply_env(|key| (key == "SMTP_PORT").then(|| "not-a-port".to_string()));
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.scheduler.tick = "every minute".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.alerts.storage_warning_threshold = 150.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.backend = StorageKind::S3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.secret_key = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlay_and_redaction() {
        let mut config = Config::default();
        config.apply_overlay(&SystemSettings {
            smtp_host: Some("mail.internal".into()),
            smtp_password: Some("hunter2".into()),
            storage_secret_access_key: Some("secret".into()),
            retention_days: Some(7),
            ..Default::default()
        });

        assert_eq!(config.backup.retention_days, 7);
        let view = config.system_view();
        assert_eq!(view.smtp_host.as_deref(), Some("mail.internal"));
        assert_eq!(view.smtp_password.as_deref(), Some(REDACTED));
        assert_eq!(view.storage_secret_access_key.as_deref(), Some(REDACTED));
        assert_eq!(view.storage_access_key_id, None);
    }

    #[test]
    fn test_settings_merge_keeps_existing() {
        let mut stored = SystemSettings {
            smtp_host: Some("a".into()),
            retention_days: Some(10),
            ..Default::default()
        };
        stored.merge(SystemSettings {
            retention_days: Some(20),
            ..Default::default()
        });
        assert_eq!(stored.smtp_host.as_deref(), Some("a"));
        assert_eq!(stored.retention_days, Some(20));

        let mut posted = SystemSettings {
            smtp_password: Some(REDACTED.into()),
            storage_secret_access_key: Some("rotated".into()),
            ..Default::default()
        };
        posted.drop_redacted();
        assert_eq!(posted.smtp_password, None);
        assert_eq!(posted.storage_secret_access_key.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn test_handle_reload_applies_overlay() {
        let handle = ConfigHandle::new(None, Config::default());
        let before = handle.snapshot();
        let after = handle
            .reload(&SystemSettings {
                max_backup_size_mb: Some(42),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(before.backup.max_backup_size_mb, 1000);
        assert_eq!(after.backup.max_backup_size_mb, 42);
        assert_eq!(handle.snapshot().backup.max_backup_size_mb, 42);
    }
}
