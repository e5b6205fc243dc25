//! Depcache - persistent dependency cache tables.
//!
//! A cache table memoizes a derived property for each row of one or more
//! parent tables. Rows are keyed by their superkey, the parent rowids plus the
//! rowid of the configuration that produced them, and are computed lazily,
//! only for the parent rows that have nothing cached yet.
//!
//! # Core Concepts
//!
//! - **Superkey**: `(parent rowids..., config_rowid)`, unique per table.
//! - **Config**: any `Serialize` value, identified by the hash of its
//!   canonical JSON form and interned in the shared `config` table.
//! - **External column**: a value stored as a file under
//!   `<cache_root>/extern_<table>/`, with only its relative path in the row.
//!
//! # Types
//!
//! - [`Depcache`]: engine entry point holding the store, registry and cache root
//! - [`TableDescriptor`]: static declaration of a cache table
//! - [`CacheTable`]: a registered table with lookup, lazy add, read and delete
//! - [`RowStore`]: the relational backend boundary, with [`MemoryStore`] built in
//! - [`CacheRow`]: typed rows, derivable with `#[derive(CacheRow)]`

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unwrap_in_result
    )
)]

extern crate self as depcache;

mod column;
mod config;
mod connection;
mod context;
mod descriptor;
mod error;
mod external;
mod memory;
mod row;
mod store;
mod table;
mod value;

/// Rowid of a row in any table.
pub type RowId = i64;

pub use column::{
    BlobCodec, ColumnCodec, ColumnKind, ColumnSelect, ColumnSpec, EXTERN_SUFFIX, JsonBlob,
    PhysicalColumn, RawBytes, ReadPlan, ScalarType,
};
pub use config::{
    CONFIG_HASHID, CONFIG_ROWID, CONFIG_TABLE, ConfigKey, ConfigRegistry, TableConfig,
    canonicalize, compute_hashid,
};
pub use connection::{ConnectionConfig, StoreConnection};
pub use context::{Depcache, DepcacheSettings};
pub use descriptor::{
    Compute, ComputeContext, DeleteHook, ParentBatch, ParentColumn, ParentKey, ParentLoader,
    TableDescriptor, TableKind,
};
pub use error::{BoxError, DepcacheError, StorageError};
pub use external::ExternalStore;
pub use memory::MemoryStore;
pub use row::{CacheRow, bytes_from_value, json_from_value, json_to_value};
pub use store::{ColumnDef, RowStore, TableSchema, rowid_column};
pub use table::{CacheTable, DeleteTarget, Lookup};
pub use value::{ColumnValue, ScalarValue, Value};

// Re-export derive macro
pub use depcache_derive::CacheRow;
