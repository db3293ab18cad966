use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use which::which;

use crate::database::BackupType;
use crate::service::mssql::config::MssqlConnection;
use crate::service::service::EngineError;

/// Seconds sqlcmd waits for a login before giving up.
const LOGIN_TIMEOUT_SECS: u32 = 15;

pub fn locate() -> Result<PathBuf, EngineError> {
    which("sqlcmd").map_err(|_| EngineError::ToolMissing("sqlcmd".to_string()))
}

/// `[name]` with closing brackets doubled.
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `N'value'` with single quotes doubled.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

pub fn backup_statement(database: &str, destination: &Path, backup_type: BackupType) -> String {
    let options = match backup_type {
        BackupType::Full => "COMPRESSION, INIT",
        BackupType::Differential => "DIFFERENTIAL, COMPRESSION, INIT",
    };
    format!(
        "BACKUP DATABASE {} TO DISK = {} WITH {}",
        quote_identifier(database),
        quote_literal(&destination.to_string_lossy()),
        options
    )
}

/// Builds a sqlcmd invocation running `query` against the connection. The
/// password travels in `SQLCMDPASSWORD`, never on the command line, and the
/// child is killed if the future awaiting it is dropped.
pub fn create_command(program: &Path, connection: &MssqlConnection, query: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-S").arg(connection.server());
    if connection.trusted {
        cmd.arg("-E");
    } else if let Some(user) = &connection.user {
        cmd.arg("-U").arg(user);
        if let Some(password) = &connection.password {
            cmd.env("SQLCMDPASSWORD", password);
        }
    }
    if connection.trust_server_certificate {
        cmd.arg("-C");
    }
    // Abort on the first error so the exit code reflects failure.
    cmd.arg("-b");
    cmd.arg("-l").arg(LOGIN_TIMEOUT_SECS.to_string());
    cmd.arg("-Q").arg(query);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
