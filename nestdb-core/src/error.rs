// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NestDbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid field name: {0}")]
    InvalidFieldName(String),

    #[error("Can't insert key {key}, it violates the unique constraint on '{field}'")]
    UniqueConstraintViolation { key: String, field: String },

    #[error("Cannot create an index without a fieldName")]
    MissingFieldName,

    #[error(
        "{:.0}% of the data file is corrupt ({corrupt_items}/{total_lines} lines), \
         more than the allowed {:.0}%; refusing to load to prevent data loss",
        .corruption_rate * 100.0,
        .threshold * 100.0
    )]
    CorruptionThresholdExceeded {
        corruption_rate: f64,
        corrupt_items: usize,
        total_lines: usize,
        threshold: f64,
    },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Could not generate an unused _id after {0} attempts")]
    IdGenerationExhausted(usize),

    #[error("Task was dropped before it could run")]
    TaskDropped,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Datastore failed to load: {0}")]
    LoadFailed(String),
}

pub type Result<T> = std::result::Result<T, NestDbError>;
