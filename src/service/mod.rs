pub mod mssql;
#[allow(clippy::module_inception)]
pub mod service;

pub use service::{BackupArtifact, BackupEngine, BackupRequest, EngineError};
