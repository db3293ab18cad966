use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use log::{debug, info};
use tokio::fs;

use crate::database::Database;
use crate::service::mssql::config::MssqlConnection;
use crate::service::mssql::sqlcmd;
use crate::service::service::{BackupArtifact, BackupEngine, BackupRequest, EngineError};
use crate::utils::artifact_size;

/// SQL Server through `sqlcmd`. The binary is looked up on every call unless
/// a path was pinned, so installing the tools does not need a restart.
#[derive(Debug, Clone, Default)]
pub struct MssqlService {
    sqlcmd: Option<PathBuf>,
}

impl MssqlService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sqlcmd(path: PathBuf) -> Self {
        MssqlService { sqlcmd: Some(path) }
    }

    fn program(&self) -> Result<PathBuf, EngineError> {
        match &self.sqlcmd {
            Some(path) => Ok(path.clone()),
            None => sqlcmd::locate(),
        }
    }

    async fn run(&self, connection: &MssqlConnection, query: &str) -> Result<Output, EngineError> {
        let program = self.program()?;
        let output = sqlcmd::create_command(&program, connection, query).output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(EngineError::Command {
                code: output.status.code(),
                output: diagnostic(&output),
            })
        }
    }
}

/// sqlcmd prints server messages on stdout, its own errors on stderr.
fn diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Name of the database on the server: the descriptor's catalog when given,
/// otherwise the registry name.
fn target_database<'a>(connection: &'a MssqlConnection, database: &'a Database) -> &'a str {
    connection
        .database
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(&database.name)
}

#[async_trait]
impl BackupEngine for MssqlService {
    async fn run_backup(&self, request: &BackupRequest) -> Result<BackupArtifact, EngineError> {
        let database = &request.database;
        let connection = MssqlConnection::resolve(&database.connection_string, &database.server)?;
        let target = target_database(&connection, database);

        if let Some(parent) = request.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let statement = sqlcmd::backup_statement(target, &request.destination, request.backup_type);
        info!(
            "Running {} backup of {} on {} into {}",
            request.backup_type.as_str(),
            target,
            connection.server(),
            request.destination.display()
        );
        let output = self.run(&connection, &statement).await?;
        debug!("sqlcmd: {}", diagnostic(&output));

        if !fs::try_exists(&request.destination).await.unwrap_or(false) {
            return Err(EngineError::ArtifactMissing(request.destination.clone()));
        }
        let path = request.destination.clone();
        let size = tokio::task::spawn_blocking({
            let path = path.clone();
            move || artifact_size(path)
        })
        .await
        .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        Ok(BackupArtifact { path, size })
    }

    async fn check_connection(&self, database: &Database) -> Result<(), EngineError> {
        let connection = MssqlConnection::resolve(&database.connection_string, &database.server)?;
        self.run(&connection, "SET NOCOUNT ON; SELECT 1").await?;
        Ok(())
    }
}
