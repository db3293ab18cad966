pub mod config;
pub mod mssql_service;
pub mod sqlcmd;

pub use config::{redact_connection_string, restore_password, MssqlConnection};
pub use mssql_service::MssqlService;
