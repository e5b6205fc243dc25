//! Backend connection lifecycle.
//!
//! - `ConnectionConfig`: how to reach a backend
//! - `StoreConnection`: connect to a backend and prepare it for use

use async_trait::async_trait;

use crate::StorageError;

/// Connection configuration for database backends.
///
/// This enum is extensible for future authentication methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// Connect using a database URL string.
    Url(String),
}

impl From<&str> for ConnectionConfig {
    fn from(url: &str) -> Self {
        ConnectionConfig::Url(url.to_string())
    }
}

impl From<String> for ConnectionConfig {
    fn from(url: String) -> Self {
        ConnectionConfig::Url(url)
    }
}

impl From<&String> for ConnectionConfig {
    fn from(url: &String) -> Self {
        ConnectionConfig::Url(url.clone())
    }
}

/// Trait for backends that live behind a connection.
///
/// Implementors also implement [`RowStore`](crate::RowStore); cache tables
/// create their own physical tables, so `initialize` only has to prepare
/// whatever the backend needs before the first `add_table`.
#[async_trait]
pub trait StoreConnection: Sized + Send + Sync {
    /// Connect to the database using the provided configuration.
    async fn connect(config: impl Into<ConnectionConfig> + Send) -> Result<Self, StorageError>;

    /// Prepare the backend for use.
    async fn initialize(&self) -> Result<(), StorageError>;
}
