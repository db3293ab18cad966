use std::str::FromStr;

use crate::service::service::EngineError;

const REDACTED: &str = "********";

/// Parsed ADO-style connection descriptor, e.g.
/// `Server=sql01,1433;Database=sales;User Id=backup;Password=secret`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MssqlConnection {
    pub server: Option<String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub trusted: bool,
    pub trust_server_certificate: bool,
}

fn is_password_key(key: &str) -> bool {
    matches!(key, "password" | "pwd")
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "sspi" | "1")
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for (open, close) in [('{', '}'), ('"', '"'), ('\'', '\'')] {
        if value.len() >= 2 && value.starts_with(open) && value.ends_with(close) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Key/value pairs of a descriptor, keys lower-cased. Empty segments are
/// skipped; a segment without `=` is an error.
fn pairs(descriptor: &str) -> Result<Vec<(String, &str)>, EngineError> {
    descriptor
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once('=')
                .map(|(key, value)| (key.trim().to_ascii_lowercase(), value))
                .ok_or_else(|| {
                    let segment = redact_segment(segment);
                    EngineError::InvalidConnection(format!("'{}' is not a key=value pair", segment))
                })
        })
        .collect()
}

fn redact_segment(segment: &str) -> &str {
    let lowered = segment.to_ascii_lowercase();
    if lowered.contains("password") || lowered.contains("pwd") {
        REDACTED
    } else {
        segment
    }
}

impl FromStr for MssqlConnection {
    type Err = EngineError;

    fn from_str(descriptor: &str) -> Result<Self, Self::Err> {
        let mut connection = MssqlConnection::default();
        for (key, value) in pairs(descriptor)? {
            let value = unquote(value);
            match key.as_str() {
                "server" | "data source" | "address" | "addr" => {
                    connection.server = Some(value.to_string())
                }
                "database" | "initial catalog" => connection.database = Some(value.to_string()),
                "user id" | "uid" | "user" => connection.user = Some(value.to_string()),
                key if is_password_key(key) => connection.password = Some(value.to_string()),
                "trusted_connection" | "integrated security" => {
                    connection.trusted = parse_flag(value)
                }
                "trustservercertificate" => connection.trust_server_certificate = parse_flag(value),
                _ => {}
            }
        }
        Ok(connection)
    }
}

impl MssqlConnection {
    /// Parses the descriptor and fills the server from the registry entry when
    /// the descriptor does not name one.
    pub fn resolve(descriptor: &str, fallback_server: &str) -> Result<Self, EngineError> {
        let mut connection: MssqlConnection = descriptor.parse()?;
        if connection.server.as_deref().map_or(true, str::is_empty) {
            if fallback_server.trim().is_empty() {
                return Err(EngineError::InvalidConnection("no server given".into()));
            }
            connection.server = Some(fallback_server.trim().to_string());
        }
        if !connection.trusted && connection.user.is_none() {
            return Err(EngineError::InvalidConnection(
                "either User Id or Trusted_Connection is required".into(),
            ));
        }
        Ok(connection)
    }

    /// Server as handed to `sqlcmd -S`, e.g. `host,port` or `host\instance`.
    pub fn server(&self) -> &str {
        self.server.as_deref().unwrap_or_default()
    }
}

/// The descriptor with password values masked, safe to return from the API.
pub fn redact_connection_string(descriptor: &str) -> String {
    descriptor
        .split(';')
        .map(|segment| match segment.split_once('=') {
            Some((key, _)) if is_password_key(&key.trim().to_ascii_lowercase()) => {
                format!("{}={}", key, REDACTED)
            }
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Puts the stored password back into a descriptor that was edited from its
/// redacted form.
pub fn restore_password(edited: &str, stored: &str) -> String {
    let stored_password = stored.split(';').find_map(|segment| {
        let (key, value) = segment.split_once('=')?;
        is_password_key(&key.trim().to_ascii_lowercase()).then_some(value)
    });
    let Some(stored_password) = stored_password else {
        return edited.to_string();
    };
    edited
        .split(';')
        .map(|segment| match segment.split_once('=') {
            Some((key, value))
                if is_password_key(&key.trim().to_ascii_lowercase()) && value.trim() == REDACTED =>
            {
                format!("{}={}", key, stored_password)
            }
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}
