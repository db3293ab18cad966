//! Query functions over the control database, one module per table family.

pub mod databases;
pub mod events;
pub mod jobs;
pub mod records;
pub mod settings;
pub mod users;
