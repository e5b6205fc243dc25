//! The relational store boundary.
//!
//! Cache tables never issue raw queries: everything they need from the store
//! goes through [`RowStore`]. Backends (the in-process [`MemoryStore`], the
//! PostgreSQL pool in `depcache-postgres`) translate these calls to their own
//! storage.
//!
//! [`MemoryStore`]: crate::MemoryStore

use async_trait::async_trait;

use crate::column::ScalarType;
use crate::{RowId, StorageError, Value};

/// Name of the integer primary key column of `table`.
pub fn rowid_column(table: &str) -> String {
    format!("{}_rowid", table)
}

/// A physical column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ScalarType,
    pub not_null: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ScalarType) -> Self {
        Self {
            name: name.into(),
            ty,
            not_null: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

/// Physical schema of one table.
///
/// The primary key is always `<name>_rowid`, assigned by the store on insert
/// and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// The table name.
    pub name: String,
    /// Data columns, excluding the rowid.
    pub columns: Vec<ColumnDef>,
    /// Columns whose combined value is unique across rows.
    pub superkey: Vec<String>,
    /// Tables this table's rows are derived from.
    pub depends_on: Vec<String>,
    pub docstr: String,
}

impl TableSchema {
    pub fn rowid_column(&self) -> String {
        rowid_column(&self.name)
    }
}

/// Storage operations consumed by cache tables and the config registry.
///
/// Row results are positional: `get_by_id` and `get_where` return one entry
/// per requested id or parameter tuple, `None` where nothing matched, with
/// values in the order of `columns`.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Check whether a table exists.
    async fn has_table(&self, table: &str) -> Result<bool, StorageError>;

    /// Create a table. Creating an existing table is a no-op.
    async fn add_table(&self, schema: &TableSchema) -> Result<(), StorageError>;

    /// Insert rows, returning the new rowids in input order.
    ///
    /// All-or-nothing: if any row is rejected, none of them are stored.
    async fn insert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<RowId>, StorageError>;

    /// Insert `row` unless a row with equal `key_columns` exists; return the
    /// rowid of whichever row holds the key afterwards.
    ///
    /// Must be atomic: concurrent callers with the same key observe one rowid.
    async fn insert_unique(
        &self,
        table: &str,
        columns: &[String],
        row: Vec<Value>,
        key_columns: &[String],
    ) -> Result<RowId, StorageError>;

    /// Fetch `columns` of the rows with the given rowids.
    async fn get_by_id(
        &self,
        table: &str,
        columns: &[String],
        ids: &[RowId],
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError>;

    /// For each parameter tuple, fetch `columns` of the first row whose
    /// `where_columns` equal the tuple.
    async fn get_where(
        &self,
        table: &str,
        columns: &[String],
        params: &[Vec<Value>],
        where_columns: &[String],
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError>;

    /// Delete rows by rowid, returning how many existed.
    async fn delete_by_id(&self, table: &str, ids: &[RowId]) -> Result<u64, StorageError>;
}
