pub mod connection;
pub mod models;
pub mod repositories;

pub use connection::Database;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid value in column {column}: {message}")]
    InvalidValue {
        column: &'static str,
        message: String,
    },

    #[error("Could not prepare database location: {0}")]
    Location(String),
}

/// Default database file, `<data dir>/mediadedup/mediadedup.db`.
pub fn get_database_path() -> Result<PathBuf, DatabaseError> {
    let data_dir = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| DatabaseError::Location("Could not find home directory".to_string()))?;

    let app_dir = data_dir.join("mediadedup");
    std::fs::create_dir_all(&app_dir)
        .map_err(|e| DatabaseError::Location(format!("Could not create app directory: {}", e)))?;

    Ok(app_dir.join("mediadedup.db"))
}
