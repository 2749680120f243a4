use std::path::PathBuf;

use thiserror::Error;

use crate::domain::Entity;

/// Fatal errors. Anything here aborts the run and leaves the previous store in place.
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("{entity} source unavailable at {}: {source}", path.display())]
    SourceUnavailable {
        entity: Entity,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{entity} source is missing required columns: {}", columns.join(", "))]
    MissingColumns { entity: Entity, columns: Vec<String> },

    #[error("constraint violation while loading {table}: {detail}")]
    ConstraintViolation { table: String, detail: String },

    #[error("SQLite error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl EtlError {
    /// Stable code reported to operators and used as the process failure reason.
    pub fn code(&self) -> &'static str {
        match self {
            EtlError::SourceUnavailable { .. }
            | EtlError::MissingColumns { .. }
            | EtlError::Csv(_) => "SOURCE_UNAVAILABLE",
            EtlError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            EtlError::Store(_) => "STORE_FAILURE",
            EtlError::Json(_) | EtlError::Io(_) => "IO_FAILURE",
            EtlError::Toml(_) | EtlError::Config(_) => "CONFIG_INVALID",
            EtlError::Task(_) => "TASK_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
