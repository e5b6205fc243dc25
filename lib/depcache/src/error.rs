use std::path::PathBuf;

use thiserror::Error;

use crate::RowId;

/// Boxed error returned by user-supplied compute functions, codecs and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a [`RowStore`](crate::RowStore) backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated on {table}: {key}")]
    Conflict { table: String, key: String },

    #[error("Unsupported value for column {column}: {reason}")]
    UnsupportedValue { column: String, reason: String },
}

/// Errors raised by the cache engine.
///
/// Every variant carries the table (and where relevant the config hash and
/// rows) that were being processed when the failure happened.
#[derive(Error, Debug)]
pub enum DepcacheError {
    #[error("Config encoding error: {0}")]
    ConfigEncoding(String),

    #[error("Schema mismatch in table {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("Compute failed for table {table} (config {config_hash}) on parents {parents:?}: {source}")]
    Compute {
        table: String,
        config_hash: String,
        parents: Vec<Vec<RowId>>,
        #[source]
        source: BoxError,
    },

    /// Any other failure while encoding, writing or inserting a chunk, tagged
    /// with the parent keys it was processing.
    #[error("Chunk failed for table {table} (config {config_hash}) on parents {parents:?}: {source}")]
    Chunk {
        table: String,
        config_hash: String,
        parents: Vec<Vec<RowId>>,
        #[source]
        source: Box<DepcacheError>,
    },

    #[error("External I/O error in table {table} at {}: {source}", .path.display())]
    ExternalIo {
        table: String,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Store error in table {table} during {operation}: {source}")]
    Store {
        table: String,
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("Pre-delete hook failed for table {table} on rows {rowids:?}: {source}")]
    DeleteHook {
        table: String,
        rowids: Vec<RowId>,
        #[source]
        source: BoxError,
    },

    #[error("Unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("Value conversion error: {0}")]
    ValueConversion(String),
}

impl DepcacheError {
    pub(crate) fn schema(table: &str, message: impl Into<String>) -> Self {
        DepcacheError::SchemaMismatch {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn store(table: &str, operation: &'static str, source: StorageError) -> Self {
        DepcacheError::Store {
            table: table.to_string(),
            operation,
            source,
        }
    }
}
