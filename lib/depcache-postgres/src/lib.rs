//! PostgreSQL row store for depcache.
//!
//! Every cache table becomes a PostgreSQL table with a `BIGSERIAL` rowid
//! primary key and a `UNIQUE` constraint over its superkey, so two callers
//! racing to add the same row get a conflict instead of a duplicate.
//!
//! # Usage
//!
//! ```text
//! use depcache::{Depcache, DepcacheSettings, StoreConnection};
//! use depcache_postgres::PgPool;
//!
//! let pool = <PgPool as StoreConnection>::connect("postgres://localhost/ibeis").await?;
//! pool.initialize().await?;
//! let cache = Depcache::open(Arc::new(pool), DepcacheSettings::new("/var/cache/ibeis")).await?;
//! ```

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

mod bind;
mod executor;
mod sql;

pub use bind::{bind_row, bind_value, extract_row, extract_value};
pub use executor::PgPool;

// Re-export core types for convenience
pub use depcache::{ConnectionConfig, RowStore, StorageError, StoreConnection, TableSchema, Value};
