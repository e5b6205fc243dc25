//! Static table declarations.
//!
//! A [`TableDescriptor`] names a table, its parents, its logical columns and
//! the function that computes rows. It is checked once, when the table is
//! registered, instead of on every call.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::column::{ColumnCodec, ColumnSpec};
use crate::config::{CONFIG_ROWID, ConfigKey, TableConfig};
use crate::row::CacheRow;
use crate::store::rowid_column;
use crate::{BoxError, DepcacheError, RowId, Value};

/// The parent rowids of one row, one per parent table.
pub type ParentKey = Vec<RowId>;

/// Rowids (and optionally loaded handles) of one parent table for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentColumn {
    pub table: String,
    pub rowids: Vec<RowId>,
    pub objects: Option<Vec<Value>>,
}

/// The dirty rows handed to a compute function.
///
/// `keys()[i]` is the superkey prefix of output row `i`; `rowids(p)[i]` is its
/// rowid in parent table `p`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentBatch {
    parents: Vec<ParentColumn>,
    keys: Vec<ParentKey>,
}

impl ParentBatch {
    pub(crate) fn new(parents: Vec<ParentColumn>, keys: Vec<ParentKey>) -> Self {
        Self { parents, keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[ParentKey] {
        &self.keys
    }

    pub fn parents(&self) -> &[ParentColumn] {
        &self.parents
    }

    /// Rowids in parent table `parent` (empty if out of range).
    pub fn rowids(&self, parent: usize) -> &[RowId] {
        self.parents
            .get(parent)
            .map(|p| p.rowids.as_slice())
            .unwrap_or(&[])
    }

    /// Loaded parent handles, for tables declared `as_object`.
    pub fn objects(&self, parent: usize) -> Option<&[Value]> {
        self.parents
            .get(parent)
            .and_then(|p| p.objects.as_deref())
    }
}

/// What a compute function knows about the call it serves.
#[derive(Debug)]
pub struct ComputeContext<'a> {
    pub table: &'a str,
    pub config: &'a ConfigKey,
    pub cache_root: &'a Path,
    /// Index of the chunk being computed within the current call.
    pub chunk: usize,
}

/// Computes one output row per input row, in input order.
pub trait Compute: Send + Sync {
    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        parents: &ParentBatch,
        config: &TableConfig,
    ) -> Result<Vec<Vec<Value>>, BoxError>;
}

impl<F> Compute for F
where
    F: Fn(&ComputeContext<'_>, &ParentBatch, &TableConfig) -> Result<Vec<Vec<Value>>, BoxError>
        + Send
        + Sync,
{
    fn compute(
        &self,
        ctx: &ComputeContext<'_>,
        parents: &ParentBatch,
        config: &TableConfig,
    ) -> Result<Vec<Vec<Value>>, BoxError> {
        self(ctx, parents, config)
    }
}

/// Resolves parent rowids to richer handles for `as_object` tables.
#[async_trait]
pub trait ParentLoader: Send + Sync {
    /// Return one handle per rowid, in order.
    async fn load(&self, parent: &str, rowids: &[RowId]) -> Result<Vec<Value>, BoxError>;
}

/// Runs before rows are struck from the store.
pub trait DeleteHook: Send + Sync {
    fn before_delete(&self, table: &str, rowids: &[RowId]) -> Result<(), BoxError>;
}

impl<F> DeleteHook for F
where
    F: Fn(&str, &[RowId]) -> Result<(), BoxError> + Send + Sync,
{
    fn before_delete(&self, table: &str, rowids: &[RowId]) -> Result<(), BoxError> {
        self(table, rowids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Ordinary property table.
    Node,
    /// Algorithm result table, usually a single external column.
    Algo,
}

impl TableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Node => "node",
            TableKind::Algo => "algo",
        }
    }
}

/// Declaration of one cache table.
#[derive(Clone)]
pub struct TableDescriptor {
    pub(crate) name: String,
    pub(crate) parents: Vec<String>,
    pub(crate) columns: Vec<ColumnSpec>,
    pub(crate) compute: Arc<dyn Compute>,
    pub(crate) chunk_size: Option<usize>,
    pub(crate) as_object: bool,
    pub(crate) kind: TableKind,
    pub(crate) docstr: String,
    pub(crate) on_delete: Option<Arc<dyn DeleteHook>>,
}

impl TableDescriptor {
    /// Declare a table computed by a closure.
    pub fn new<F>(
        name: impl Into<String>,
        parents: impl IntoIterator<Item = impl Into<String>>,
        columns: Vec<ColumnSpec>,
        compute: F,
    ) -> Self
    where
        F: Fn(&ComputeContext<'_>, &ParentBatch, &TableConfig) -> Result<Vec<Vec<Value>>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self::with_compute(name, parents, columns, Arc::new(compute))
    }

    /// Declare a table computed by any [`Compute`] implementation.
    pub fn with_compute(
        name: impl Into<String>,
        parents: impl IntoIterator<Item = impl Into<String>>,
        columns: Vec<ColumnSpec>,
        compute: Arc<dyn Compute>,
    ) -> Self {
        Self {
            name: name.into(),
            parents: parents.into_iter().map(Into::into).collect(),
            columns,
            compute,
            chunk_size: None,
            as_object: false,
            kind: TableKind::Node,
            docstr: "no docstr".to_string(),
            on_delete: None,
        }
    }

    /// Declare a table whose rows are a [`CacheRow`] type; the logical schema
    /// comes from the type.
    pub fn typed<R, F>(
        name: impl Into<String>,
        parents: impl IntoIterator<Item = impl Into<String>>,
        compute: F,
    ) -> Self
    where
        R: CacheRow + 'static,
        F: Fn(&ComputeContext<'_>, &ParentBatch, &TableConfig) -> Result<Vec<R>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, parents, R::columns(), move |ctx, parents, config| {
            compute(ctx, parents, config)?
                .into_iter()
                .map(|row| row.into_values().map_err(BoxError::from))
                .collect()
        })
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn as_object(mut self) -> Self {
        self.as_object = true;
        self
    }

    pub fn algo(mut self) -> Self {
        self.kind = TableKind::Algo;
        self
    }

    pub fn docstr(mut self, docstr: impl Into<String>) -> Self {
        self.docstr = docstr.into();
        self
    }

    pub fn on_delete(mut self, hook: impl DeleteHook + 'static) -> Self {
        self.on_delete = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Check the declaration and derive its column codec.
    pub(crate) fn validate(&self) -> Result<ColumnCodec, DepcacheError> {
        let table = self.name.as_str();
        if !is_identifier(table) {
            return Err(DepcacheError::schema(
                table,
                "table names must be non-empty and contain only ASCII letters, digits and '_'",
            ));
        }
        if self.parents.is_empty() {
            return Err(DepcacheError::schema(table, "a cache table needs at least one parent"));
        }
        let mut seen = HashSet::new();
        for parent in &self.parents {
            if !is_identifier(parent) {
                return Err(DepcacheError::schema(table, format!("invalid parent name {:?}", parent)));
            }
            if !seen.insert(parent.as_str()) {
                return Err(DepcacheError::schema(table, format!("parent {} listed twice", parent)));
            }
        }
        if self.columns.is_empty() {
            return Err(DepcacheError::schema(table, "a cache table needs at least one column"));
        }
        if self.chunk_size == Some(0) {
            return Err(DepcacheError::schema(table, "chunk size must be positive"));
        }

        let codec = ColumnCodec::new(table, self.columns.clone())?;

        let mut reserved: HashSet<String> = self.parents.iter().map(|p| rowid_column(p)).collect();
        reserved.insert(CONFIG_ROWID.to_string());
        reserved.insert(rowid_column(table));
        for column in codec.physical() {
            if !is_identifier(&column.name) {
                return Err(DepcacheError::schema(
                    table,
                    format!("invalid column name {:?}", column.name),
                ));
            }
            if reserved.contains(&column.name) {
                return Err(DepcacheError::schema(
                    table,
                    format!("column {} collides with a key column", column.name),
                ));
            }
        }

        let mut extensions = HashSet::new();
        for column in codec.extern_columns() {
            if let crate::ColumnKind::External(blob) = &column.kind {
                if !extensions.insert(blob.extension().to_string()) {
                    return Err(DepcacheError::schema(
                        table,
                        format!(
                            "external columns need distinct extensions, {} repeats {}",
                            column.name,
                            blob.extension()
                        ),
                    ));
                }
            }
        }

        Ok(codec)
    }
}

impl fmt::Debug for TableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("name", &self.name)
            .field("parents", &self.parents)
            .field("columns", &self.columns)
            .field("chunk_size", &self.chunk_size)
            .field("as_object", &self.as_object)
            .field("kind", &self.kind)
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
