//! Error types for the charcoal library

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CharcoalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No unit model loaded")]
    ModelNotLoaded,

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Cannot convert {from} to {to}")]
    IncompatibleUnits { from: String, to: String },

    #[error("Value cannot be represented as a decimal: {0}")]
    InvalidValue(String),

    #[error("Arithmetic overflow during conversion")]
    Overflow,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Scheduler has been shut down")]
    SchedulerShutdown,
}
