use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::database::{BackupType, Database};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} was not found on PATH")]
    ToolMissing(String),

    #[error("invalid connection descriptor: {0}")]
    InvalidConnection(String),

    #[error("backup command exited with {}: {output}", exit_code(.code))]
    Command { code: Option<i32>, output: String },

    #[error("backup command reported success but {} does not exist", .0.display())]
    ArtifactMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// What one engine invocation should produce.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub database: Database,
    pub backup_type: BackupType,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub size: u64,
}

/// A database engine's native backup mechanism.
///
/// Implementations must leave no child process behind when the returned
/// future is dropped, since cancellation is done by dropping it.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    async fn run_backup(&self, request: &BackupRequest) -> Result<BackupArtifact, EngineError>;

    async fn check_connection(&self, database: &Database) -> Result<(), EngineError>;
}

/// `backup_<database>_<YYYYmmdd_HHMMSS>.bak`, with a `_diff` suffix for
/// differential backups. Path separators in the name are replaced.
pub fn artifact_name(database_name: &str, backup_type: BackupType, at: DateTime<Utc>) -> String {
    let safe: String = database_name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect();
    let suffix = match backup_type {
        BackupType::Full => "",
        BackupType::Differential => "_diff",
    };
    format!("backup_{}_{}{}.bak", safe, at.format("%Y%m%d_%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_artifact_name() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            artifact_name("sales", BackupType::Full, at),
            "backup_sales_20240102_030405.bak"
        );
        assert_eq!(
            artifact_name("sales", BackupType::Differential, at),
            "backup_sales_20240102_030405_diff.bak"
        );
        assert_eq!(artifact_name("a/b", BackupType::Full, at), "backup_a_b_20240102_030405.bak");
    }

    #[test]
    fn test_command_error_message() {
        let err = EngineError::Command {
            code: Some(1),
            output: "Msg 3201: Cannot open backup device".into(),
        };
        assert_eq!(
            err.to_string(),
            "backup command exited with 1: Msg 3201: Cannot open backup device"
        );
    }
}
