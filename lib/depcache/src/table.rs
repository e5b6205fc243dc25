//! The cache table: one node of the dependency graph.
//!
//! Rows are keyed by their superkey `(parent rowids..., config_rowid)` and are
//! immutable once inserted. A row is either absent or present; staleness is a
//! different superkey (new config or new parents) or an explicit delete.
//!
//! Physical layout of a table `T` with parents `P1..Pn`:
//!
//! ```text
//! T_rowid | P1_rowid .. Pn_rowid | config_rowid | physical data columns
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::column::{ColumnCodec, ColumnSelect, ColumnSpec, EXTERN_SUFFIX, ScalarType};
use crate::config::{CONFIG_ROWID, ConfigKey, ConfigRegistry, TableConfig};
use crate::descriptor::{
    ComputeContext, ParentBatch, ParentColumn, ParentKey, ParentLoader, TableDescriptor, TableKind,
};
use crate::external::ExternalStore;
use crate::row::CacheRow;
use crate::store::{ColumnDef, RowStore, TableSchema, rowid_column};
use crate::{DepcacheError, RowId, StorageError, Value};

/// How [`CacheTable::get_rowids`] treats rows that are not cached yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Only report existing rows; missing ones come back as `None`.
    Existing,
    /// Compute missing rows first.
    Ensure,
    /// Delete whatever exists for the batch and compute it again.
    Recompute,
}

/// Rows to remove with [`CacheTable::delete`].
#[derive(Debug, Clone, Copy)]
pub enum DeleteTarget<'a> {
    Rowids(&'a [RowId]),
    Parents(&'a [ParentKey]),
}

/// Dirty superkeys of one batch, in first-occurrence order, each with the
/// batch positions that requested it.
type DirtySet = IndexMap<ParentKey, Vec<usize>>;

/// A registered cache table bound to a store, a config registry and a blob
/// directory.
pub struct CacheTable {
    descriptor: TableDescriptor,
    codec: ColumnCodec,
    store: Arc<dyn RowStore>,
    registry: Arc<ConfigRegistry>,
    externals: ExternalStore,
    loader: Option<Arc<dyn ParentLoader>>,
    rowid_column: String,
    parent_columns: Vec<String>,
    superkey: Vec<String>,
    chunk_size: Option<usize>,
}

impl CacheTable {
    /// Validate `descriptor` and create its physical table if missing.
    pub async fn register(
        descriptor: TableDescriptor,
        store: Arc<dyn RowStore>,
        registry: Arc<ConfigRegistry>,
        externals: ExternalStore,
        loader: Option<Arc<dyn ParentLoader>>,
        default_chunk_size: Option<usize>,
    ) -> Result<Self, DepcacheError> {
        let codec = descriptor.validate()?;
        if descriptor.as_object && loader.is_none() {
            return Err(DepcacheError::schema(
                &descriptor.name,
                "table needs parent objects but no parent loader was provided",
            ));
        }

        let parent_columns: Vec<String> =
            descriptor.parents.iter().map(|p| rowid_column(p)).collect();
        let mut superkey = parent_columns.clone();
        superkey.push(CONFIG_ROWID.to_string());
        let chunk_size = descriptor.chunk_size.or(default_chunk_size.filter(|n| *n > 0));

        let table = Self {
            rowid_column: rowid_column(&descriptor.name),
            descriptor,
            codec,
            store,
            registry,
            externals,
            loader,
            parent_columns,
            superkey,
            chunk_size,
        };
        table.initialize().await?;
        Ok(table)
    }

    async fn initialize(&self) -> Result<(), DepcacheError> {
        let name = self.name();
        let exists = self
            .store
            .has_table(name)
            .await
            .map_err(|e| DepcacheError::store(name, "has_table", e))?;
        if !exists {
            self.store
                .add_table(&self.schema())
                .await
                .map_err(|e| DepcacheError::store(name, "add_table", e))?;
            debug!(table = name, kind = self.kind().as_str(), "created table");
        }
        Ok(())
    }

    /// Physical schema of this table.
    pub fn schema(&self) -> TableSchema {
        let mut columns: Vec<ColumnDef> = self
            .parent_columns
            .iter()
            .map(|c| ColumnDef::new(c.clone(), ScalarType::Integer).not_null())
            .collect();
        columns.push(ColumnDef::new(CONFIG_ROWID, ScalarType::Integer).not_null());
        columns.extend(
            self.codec
                .physical()
                .iter()
                .map(|c| ColumnDef::new(c.name.clone(), c.ty)),
        );
        TableSchema {
            name: self.descriptor.name.clone(),
            columns,
            superkey: self.superkey.clone(),
            depends_on: self.descriptor.parents.clone(),
            docstr: self.descriptor.docstr.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn parents(&self) -> &[String] {
        &self.descriptor.parents
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        self.codec.columns()
    }

    pub fn kind(&self) -> TableKind {
        self.descriptor.kind
    }

    pub fn rowid_column(&self) -> &str {
        &self.rowid_column
    }

    /// Names of the external columns.
    pub fn extern_columns(&self) -> Vec<&str> {
        self.codec.extern_columns().map(|c| c.name.as_str()).collect()
    }

    fn check_keys(&self, keys: &[ParentKey]) -> Result<(), DepcacheError> {
        let arity = self.descriptor.parents.len();
        match keys.iter().find(|k| k.len() != arity) {
            Some(bad) => Err(DepcacheError::schema(
                self.name(),
                format!("parent key {:?} has {} ids, table has {} parents", bad, bad.len(), arity),
            )),
            None => Ok(()),
        }
    }

    /// Look up rowids by superkey without computing anything.
    async fn lookup(
        &self,
        keys: &[ParentKey],
        config: &ConfigKey,
    ) -> Result<Vec<Option<RowId>>, DepcacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let params: Vec<Vec<Value>> = keys
            .iter()
            .map(|key| {
                key.iter()
                    .copied()
                    .chain(std::iter::once(config.rowid))
                    .map(Value::Int)
                    .collect()
            })
            .collect();
        let rows = self
            .store
            .get_where(
                self.name(),
                std::slice::from_ref(&self.rowid_column),
                &params,
                &self.superkey,
            )
            .await
            .map_err(|e| DepcacheError::store(self.name(), "lookup", e))?;
        Ok(rows
            .into_iter()
            .map(|row| row.and_then(|values| values.first().and_then(Value::as_int)))
            .collect())
    }

    /// Resolve rowids for a batch of parent keys under `config`.
    pub async fn get_rowids(
        &self,
        keys: &[ParentKey],
        config: &TableConfig,
        mode: Lookup,
    ) -> Result<Vec<Option<RowId>>, DepcacheError> {
        self.check_keys(keys)?;
        debug!(
            table = self.name(),
            count = keys.len(),
            config = config.hashid(),
            ?mode,
            "lookup rowids from superkey"
        );
        match mode {
            Lookup::Existing => {
                let config_key = self.registry.intern(config).await?;
                self.lookup(keys, &config_key).await
            }
            Lookup::Ensure => Ok(self
                .add_rows_from_parent(keys, config)
                .await?
                .into_iter()
                .map(Some)
                .collect()),
            Lookup::Recompute => {
                let config_key = self.registry.intern(config).await?;
                let existing: Vec<RowId> = self
                    .lookup(keys, &config_key)
                    .await?
                    .into_iter()
                    .flatten()
                    .collect();
                self.delete_rows(&existing).await?;
                Ok(self
                    .add_rows_from_parent(keys, config)
                    .await?
                    .into_iter()
                    .map(Some)
                    .collect())
            }
        }
    }

    /// Rowids for every key, computing the missing ones.
    pub async fn ensure_rowids(
        &self,
        keys: &[ParentKey],
        config: &TableConfig,
    ) -> Result<Vec<RowId>, DepcacheError> {
        self.add_rows_from_parent(keys, config).await
    }

    /// Lazy add: compute and insert rows for the keys that have none yet, then
    /// return the rowids of the whole batch in input order.
    pub async fn add_rows_from_parent(
        &self,
        keys: &[ParentKey],
        config: &TableConfig,
    ) -> Result<Vec<RowId>, DepcacheError> {
        self.check_keys(keys)?;
        let config_key = self.registry.intern(config).await?;
        let rowids = self.lookup(keys, &config_key).await?;

        let mut dirty = DirtySet::new();
        for (idx, (key, rowid)) in keys.iter().zip(&rowids).enumerate() {
            if rowid.is_none() {
                dirty.entry(key.clone()).or_default().push(idx);
            }
        }

        if dirty.is_empty() {
            return Ok(rowids.into_iter().flatten().collect());
        }

        info!(
            table = self.name(),
            kind = self.kind().as_str(),
            dirty = dirty.len(),
            total = keys.len(),
            repeated = dirty.values().filter(|positions| positions.len() > 1).count(),
            config_rowid = config_key.rowid,
            "adding new rows"
        );
        let dirty_keys: Vec<ParentKey> = dirty.into_keys().collect();
        let chunk_size = self.chunk_size.unwrap_or(dirty_keys.len()).max(1);
        for (chunk, chunk_keys) in dirty_keys.chunks(chunk_size).enumerate() {
            self.add_chunk(chunk_keys, config, &config_key, chunk).await?;
        }

        let rowids = self.lookup(keys, &config_key).await?;
        rowids
            .into_iter()
            .zip(keys)
            .map(|(rowid, key)| {
                rowid.ok_or_else(|| {
                    DepcacheError::store(
                        self.name(),
                        "ensure",
                        StorageError::NotFound(format!("row for parents {:?}", key)),
                    )
                })
            })
            .collect()
    }

    async fn gather_parents(
        &self,
        keys: &[ParentKey],
        config_key: &ConfigKey,
    ) -> Result<ParentBatch, DepcacheError> {
        let mut parents = Vec::with_capacity(self.descriptor.parents.len());
        for (idx, parent) in self.descriptor.parents.iter().enumerate() {
            let rowids: Vec<RowId> = keys.iter().map(|key| key[idx]).collect();
            let objects = match (&self.loader, self.descriptor.as_object) {
                (Some(loader), true) => {
                    let objects = loader.load(parent, &rowids).await.map_err(|source| {
                        DepcacheError::Compute {
                            table: self.name().to_string(),
                            config_hash: config_key.hashid.clone(),
                            parents: keys.to_vec(),
                            source,
                        }
                    })?;
                    if objects.len() != rowids.len() {
                        let mismatch = DepcacheError::schema(
                            self.name(),
                            format!(
                                "parent loader returned {} objects for {} {} rows",
                                objects.len(),
                                rowids.len(),
                                parent
                            ),
                        );
                        return Err(self.chunk_error(config_key, keys, mismatch));
                    }
                    Some(objects)
                }
                _ => None,
            };
            parents.push(ParentColumn {
                table: parent.clone(),
                rowids,
                objects,
            });
        }
        Ok(ParentBatch::new(parents, keys.to_vec()))
    }

    /// Compute, encode and insert one chunk of dirty keys. Either every row of
    /// the chunk is inserted or none is.
    async fn add_chunk(
        &self,
        keys: &[ParentKey],
        config: &TableConfig,
        config_key: &ConfigKey,
        chunk: usize,
    ) -> Result<(), DepcacheError> {
        let name = self.name();
        let batch = self.gather_parents(keys, config_key).await?;
        let ctx = ComputeContext {
            table: name,
            config: config_key,
            cache_root: self.externals.cache_root(),
            chunk,
        };
        let compute_error = |source| DepcacheError::Compute {
            table: name.to_string(),
            config_hash: config_key.hashid.clone(),
            parents: keys.to_vec(),
            source,
        };

        let rows = self
            .descriptor
            .compute
            .compute(&ctx, &batch, config)
            .map_err(compute_error)?;
        if rows.len() != keys.len() {
            return Err(DepcacheError::schema(
                name,
                format!(
                    "compute returned {} rows for {} parents {:?} (config {})",
                    rows.len(),
                    keys.len(),
                    keys,
                    config_key.hashid
                ),
            ));
        }

        if self.codec.extern_columns().next().is_some() {
            self.externals
                .ensure_dir(name)
                .map_err(|e| self.chunk_error(config_key, keys, e))?;
        }

        let mut written = Vec::new();
        let physical_rows = match self.encode_chunk(keys, rows, config_key, &mut written) {
            Ok(physical_rows) => physical_rows,
            Err(e) => {
                self.discard_blobs(written.iter().map(|(_, reference)| reference));
                return Err(e);
            }
        };

        let mut columns = self.superkey.clone();
        columns.extend(self.codec.physical_names());
        let source = match self.store.insert(name, &columns, physical_rows).await {
            Ok(rowids) => {
                debug!(table = name, chunk, rows = rowids.len(), "inserted chunk");
                return Ok(());
            }
            Err(source) => source,
        };

        // A concurrent writer may have inserted some of these superkeys after
        // our lookup. Their rows can point at blobs this call wrote, so those
        // stay on disk.
        let present = match &source {
            StorageError::Conflict { .. } => self.present_keys(keys, config_key).await,
            _ => Some(vec![false; keys.len()]),
        };
        if let Some(present) = present {
            self.discard_blobs(
                written
                    .iter()
                    .filter(|(idx, _)| !present[*idx])
                    .map(|(_, reference)| reference),
            );
            if present.iter().all(|p| *p) {
                info!(
                    table = name,
                    chunk,
                    rows = keys.len(),
                    "chunk was inserted by a concurrent writer"
                );
                return Ok(());
            }
        }
        Err(self.chunk_error(config_key, keys, DepcacheError::store(name, "insert", source)))
    }

    /// Which keys have a row now, or `None` if that cannot be told. Without an
    /// answer every blob stays, since any of them may be referenced.
    async fn present_keys(&self, keys: &[ParentKey], config_key: &ConfigKey) -> Option<Vec<bool>> {
        match self.lookup(keys, config_key).await {
            Ok(rowids) => Some(rowids.iter().map(Option::is_some).collect()),
            Err(e) => {
                warn!(table = self.name(), error = %e, "failed to look up conflicting rows");
                None
            }
        }
    }

    fn chunk_error(
        &self,
        config_key: &ConfigKey,
        keys: &[ParentKey],
        source: DepcacheError,
    ) -> DepcacheError {
        DepcacheError::Chunk {
            table: self.name().to_string(),
            config_hash: config_key.hashid.clone(),
            parents: keys.to_vec(),
            source: Box::new(source),
        }
    }

    /// Encode every row of a chunk, writing its blobs. `written` collects the
    /// blob files this call created, with the index of the key they belong to.
    fn encode_chunk(
        &self,
        keys: &[ParentKey],
        rows: Vec<Vec<Value>>,
        config_key: &ConfigKey,
        written: &mut Vec<(usize, String)>,
    ) -> Result<Vec<Vec<Value>>, DepcacheError> {
        let name = self.name();
        let mut physical_rows = Vec::with_capacity(rows.len());
        for (idx, (key, row)) in keys.iter().zip(rows).enumerate() {
            let data = self
                .codec
                .encode_row(row, |_, codec, value| {
                    let reference =
                        ExternalStore::reference(name, key, &config_key.hashid, codec.extension());
                    let bytes = codec.encode(&value).map_err(|source| DepcacheError::ExternalIo {
                        table: name.to_string(),
                        path: self.externals.resolve(&reference),
                        source,
                    })?;
                    if self.externals.write(name, &reference, &bytes)? {
                        written.push((idx, reference.clone()));
                    }
                    Ok(reference)
                })
                .map_err(|e| self.chunk_error(config_key, std::slice::from_ref(key), e))?;

            let mut physical: Vec<Value> = key.iter().copied().map(Value::Int).collect();
            physical.push(Value::Int(config_key.rowid));
            physical.extend(data);
            physical_rows.push(physical);
        }
        Ok(physical_rows)
    }

    /// Remove blobs, logging failures. Returns how many could not be removed.
    fn discard_blobs<'a>(&self, references: impl IntoIterator<Item = &'a String>) -> usize {
        let mut failed = 0;
        for reference in references {
            if let Err(e) = self.externals.remove(self.name(), reference) {
                failed += 1;
                warn!(
                    table = self.name(),
                    reference = reference.as_str(),
                    error = %e,
                    "failed to discard blob"
                );
            }
        }
        failed
    }

    /// Read and decode the selected columns of the given rows.
    ///
    /// Unknown rowids yield `None`. A missing blob file for a present row is an
    /// error.
    pub async fn get_row_data(
        &self,
        rowids: &[RowId],
        select: ColumnSelect<'_>,
    ) -> Result<Vec<Option<Value>>, DepcacheError> {
        let name = self.name();
        let plan = self.codec.plan(select)?;
        debug!(table = name, count = rowids.len(), columns = ?plan.physical, "get row data");
        if rowids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .store
            .get_by_id(name, &plan.physical, rowids)
            .await
            .map_err(|e| DepcacheError::store(name, "get_row_data", e))?;

        rows.into_iter()
            .map(|row| {
                row.map(|physical| {
                    self.codec.decode_row(&plan, physical, |_, codec, reference| {
                        let bytes = self.externals.read(name, reference)?;
                        codec.decode(bytes).map_err(|source| DepcacheError::ExternalIo {
                            table: name.to_string(),
                            path: self.externals.resolve(reference),
                            source,
                        })
                    })
                })
                .transpose()
            })
            .collect()
    }

    /// Typed full-row read.
    pub async fn get_typed<R: CacheRow>(
        &self,
        rowids: &[RowId],
    ) -> Result<Vec<Option<R>>, DepcacheError> {
        self.get_row_data(rowids, ColumnSelect::All)
            .await?
            .into_iter()
            .map(|value| value.map(R::from_value).transpose())
            .collect()
    }

    /// Delete rows, running the pre-delete hook first and removing their blobs
    /// afterwards. Returns how many rows existed.
    ///
    /// Blobs that cannot be removed once the rows are gone are logged and left
    /// behind as orphans.
    pub async fn delete_rows(&self, rowids: &[RowId]) -> Result<u64, DepcacheError> {
        let name = self.name();
        if rowids.is_empty() {
            return Ok(0);
        }

        let references = self.blob_references(rowids).await?;

        if let Some(hook) = &self.descriptor.on_delete {
            hook.before_delete(name, rowids)
                .map_err(|source| DepcacheError::DeleteHook {
                    table: name.to_string(),
                    rowids: rowids.to_vec(),
                    source,
                })?;
        }

        let deleted = self
            .store
            .delete_by_id(name, rowids)
            .await
            .map_err(|e| DepcacheError::store(name, "delete", e))?;

        let orphaned = self.discard_blobs(&references);
        info!(
            table = name,
            requested = rowids.len(),
            deleted,
            orphaned,
            "deleted rows"
        );
        Ok(deleted)
    }

    async fn blob_references(&self, rowids: &[RowId]) -> Result<Vec<String>, DepcacheError> {
        let extern_names: Vec<String> = self
            .codec
            .extern_columns()
            .map(|c| format!("{}{}", c.name, EXTERN_SUFFIX))
            .collect();
        if extern_names.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .store
            .get_by_id(self.name(), &extern_names, rowids)
            .await
            .map_err(|e| DepcacheError::store(self.name(), "delete", e))?;
        Ok(rows
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|value| match value {
                Value::String(reference) => Some(reference),
                _ => None,
            })
            .collect())
    }

    /// Values for a batch of parent keys.
    ///
    /// With `ensure` missing rows are computed first; without it they come
    /// back as `None`.
    pub async fn get(
        &self,
        keys: &[ParentKey],
        select: ColumnSelect<'_>,
        config: &TableConfig,
        ensure: bool,
    ) -> Result<Vec<Option<Value>>, DepcacheError> {
        let mode = if ensure { Lookup::Ensure } else { Lookup::Existing };
        let rowids = self.get_rowids(keys, config, mode).await?;
        let present: Vec<RowId> = rowids.iter().flatten().copied().collect();
        let mut data = self.get_row_data(&present, select).await?.into_iter();
        Ok(rowids
            .into_iter()
            .map(|rowid| rowid.and_then(|_| data.next().flatten()))
            .collect())
    }

    /// Delete by rowid, or by parent keys under `config`.
    pub async fn delete(
        &self,
        target: DeleteTarget<'_>,
        config: &TableConfig,
    ) -> Result<u64, DepcacheError> {
        match target {
            DeleteTarget::Rowids(rowids) => self.delete_rows(rowids).await,
            DeleteTarget::Parents(keys) => {
                let rowids: Vec<RowId> = self
                    .get_rowids(keys, config, Lookup::Existing)
                    .await?
                    .into_iter()
                    .flatten()
                    .collect();
                self.delete_rows(&rowids).await
            }
        }
    }
}

impl std::fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<CacheTable({}) {}>", self.name(), self.kind().as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::column::{JsonBlob, RawBytes};
    use crate::{BoxError, MemoryStore};

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<ConfigRegistry>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let registry = Arc::new(ConfigRegistry::open(store.clone()).await.unwrap());
            Self {
                store,
                registry,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        async fn register(&self, descriptor: TableDescriptor) -> CacheTable {
            self.try_register(descriptor, None).await.unwrap()
        }

        async fn try_register(
            &self,
            descriptor: TableDescriptor,
            loader: Option<Arc<dyn ParentLoader>>,
        ) -> Result<CacheTable, DepcacheError> {
            CacheTable::register(
                descriptor,
                self.store.clone(),
                self.registry.clone(),
                ExternalStore::new(self.dir.path()),
                loader,
                None,
            )
            .await
        }

        fn blob_count(&self, table: &str) -> usize {
            blob_count(self.dir.path(), table)
        }
    }

    fn blob_count(root: &Path, table: &str) -> usize {
        std::fs::read_dir(root.join(ExternalStore::dir_name(table)))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Records every batch a compute function is called with.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<AtomicUsize>,
        batches: Arc<Mutex<Vec<Vec<ParentKey>>>>,
    }

    impl Recorder {
        fn record(&self, parents: &ParentBatch) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(parents.keys().to_vec());
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_batch(&self) -> Vec<ParentKey> {
            self.batches.lock().last().cloned().unwrap_or_default()
        }
    }

    fn keys(ids: impl IntoIterator<Item = RowId>) -> Vec<ParentKey> {
        ids.into_iter().map(|id| vec![id]).collect()
    }

    /// `width = parent rowid * scale`, where `scale` comes from the config.
    fn widths(recorder: &Recorder) -> TableDescriptor {
        let recorder = recorder.clone();
        TableDescriptor::new(
            "chips",
            ["images"],
            vec![ColumnSpec::scalar("width", ScalarType::Integer)],
            move |_, parents, config| {
                recorder.record(parents);
                let scale = config.get("scale").and_then(|v| v.as_i64()).unwrap_or(1);
                Ok(parents
                    .rowids(0)
                    .iter()
                    .map(|id| vec![Value::Int(id * scale)])
                    .collect())
            },
        )
    }

    fn scale(n: i64) -> TableConfig {
        TableConfig::new(&json!({ "scale": n })).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let table = h.register(widths(&recorder)).await;

        let first = table.ensure_rowids(&keys([1, 2, 3]), &scale(1)).await.unwrap();
        let second = table.ensure_rowids(&keys([1, 2, 3]), &scale(1)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(recorder.calls(), 1);
        assert_eq!(h.store.row_count("chips"), 3);

        // Registering the same table again reuses the physical table.
        let again = h.register(widths(&recorder)).await;
        let third = again.ensure_rowids(&keys([3, 2, 1]), &scale(1)).await.unwrap();
        assert_eq!(third, vec![first[2], first[1], first[0]]);
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn test_configs_are_isolated() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let table = h.register(widths(&recorder)).await;

        let ones = table.ensure_rowids(&keys([1, 2]), &scale(1)).await.unwrap();
        let tens = table.ensure_rowids(&keys([1, 2]), &scale(10)).await.unwrap();
        assert!(ones.iter().all(|id| !tens.contains(id)));
        assert_eq!(h.store.row_count("chips"), 4);

        let values = table.get_row_data(&tens, "width".into()).await.unwrap();
        assert_eq!(values, vec![Some(Value::Int(10)), Some(Value::Int(20))]);

        // Same fields in a different order are the same config.
        let a = TableConfig::new(&json!({"scale": 3, "mode": "fast"})).unwrap();
        let b = TableConfig::new(&json!({"mode": "fast", "scale": 3})).unwrap();
        let first = table.ensure_rowids(&keys([1]), &a).await.unwrap();
        let calls = recorder.calls();
        assert_eq!(table.ensure_rowids(&keys([1]), &b).await.unwrap(), first);
        assert_eq!(recorder.calls(), calls);
    }

    #[tokio::test]
    async fn test_round_trip_all_column_kinds() {
        let h = Harness::new().await;
        let blob: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected_blob = blob.clone();
        let table = h
            .register(TableDescriptor::new(
                "features",
                ["annotations"],
                vec![
                    ColumnSpec::scalar("label", ScalarType::Text),
                    ColumnSpec::tuple("center", [ScalarType::Real, ScalarType::Real]),
                    ColumnSpec::tuple(
                        "summary",
                        [
                            ScalarType::Integer,
                            ScalarType::Real,
                            ScalarType::Text,
                            ScalarType::Boolean,
                            ScalarType::Blob,
                        ],
                    ),
                    ColumnSpec::external("vecs", RawBytes::new(".bin")),
                    ColumnSpec::external("meta", JsonBlob::new()),
                ],
                move |_, parents, _| {
                    Ok(parents
                        .rowids(0)
                        .iter()
                        .map(|id| {
                            vec![
                                Value::from(format!("aid{}", id)),
                                Value::Tuple(vec![Value::Float(0.5), Value::Float(-2.25)]),
                                Value::Tuple(vec![
                                    Value::Int(*id),
                                    Value::Float(1.5),
                                    Value::from("kp"),
                                    Value::Bool(true),
                                    Value::Bytes(vec![1, 2, 3]),
                                ]),
                                Value::Bytes(blob.clone()),
                                Value::Tuple(vec![Value::Int(*id), Value::Null]),
                            ]
                        })
                        .collect())
                },
            ))
            .await;

        let config = TableConfig::empty();
        let rowids = table.ensure_rowids(&keys([4]), &config).await.unwrap();

        let row = table.get_row_data(&rowids, ColumnSelect::All).await.unwrap();
        let expected = Value::Tuple(vec![
            Value::from("aid4"),
            Value::Tuple(vec![Value::Float(0.5), Value::Float(-2.25)]),
            Value::Tuple(vec![
                Value::Int(4),
                Value::Float(1.5),
                Value::from("kp"),
                Value::Bool(true),
                Value::Bytes(vec![1, 2, 3]),
            ]),
            Value::Bytes(expected_blob.clone()),
            Value::Tuple(vec![Value::Int(4), Value::Null]),
        ]);
        assert_eq!(row, vec![Some(expected)]);

        let center = table.get_row_data(&rowids, "center".into()).await.unwrap();
        assert_eq!(
            center,
            vec![Some(Value::Tuple(vec![Value::Float(0.5), Value::Float(-2.25)]))]
        );

        let names: &[&str] = &["vecs"];
        let vecs = table.get_row_data(&rowids, names.into()).await.unwrap();
        assert_eq!(vecs, vec![Some(Value::Tuple(vec![Value::Bytes(expected_blob)]))]);
        assert_eq!(h.blob_count("features"), 2);

        let err = table.get_row_data(&rowids, "nope".into()).await.unwrap_err();
        assert!(matches!(err, DepcacheError::UnknownColumn { .. }));
    }

    #[tokio::test]
    async fn test_only_missing_rows_are_computed() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let table = h.register(widths(&recorder)).await;

        table.ensure_rowids(&keys(1..=6), &scale(1)).await.unwrap();
        let rowids = table
            .ensure_rowids(&keys([7, 1, 8, 2, 3, 9, 4, 5, 10, 6]), &scale(1))
            .await
            .unwrap();

        assert_eq!(recorder.calls(), 2);
        assert_eq!(recorder.last_batch(), keys([7, 8, 9, 10]));
        assert_eq!(rowids.len(), 10);

        let values = table.get_row_data(&rowids, "width".into()).await.unwrap();
        let expected: Vec<Option<Value>> = [7, 1, 8, 2, 3, 9, 4, 5, 10, 6]
            .into_iter()
            .map(|id| Some(Value::Int(id)))
            .collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_chunking_is_transparent() {
        let mut results = Vec::new();
        for (chunk_size, expected_calls) in [(None, 1), (Some(1), 7), (Some(3), 3)] {
            let h = Harness::new().await;
            let recorder = Recorder::default();
            let mut desc = widths(&recorder);
            if let Some(n) = chunk_size {
                desc = desc.chunk_size(n);
            }
            let table = h.register(desc).await;

            let rowids = table.ensure_rowids(&keys(1..=7), &scale(2)).await.unwrap();
            assert_eq!(recorder.calls(), expected_calls, "chunk size {:?}", chunk_size);
            let values = table.get_row_data(&rowids, "width".into()).await.unwrap();
            results.push((rowids, values));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
    }

    #[tokio::test]
    async fn test_default_chunk_size_applies() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let table = CacheTable::register(
            widths(&recorder),
            h.store.clone(),
            h.registry.clone(),
            ExternalStore::new(h.dir.path()),
            None,
            Some(2),
        )
        .await
        .unwrap();
        table.ensure_rowids(&keys(1..=5), &scale(1)).await.unwrap();
        assert_eq!(recorder.calls(), 3);
    }

    #[tokio::test]
    async fn test_repeated_keys_are_computed_once() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let table = h.register(widths(&recorder)).await;

        let rowids = table
            .ensure_rowids(&keys([1, 1, 2, 1]), &scale(1))
            .await
            .unwrap();
        assert_eq!(recorder.last_batch(), keys([1, 2]));
        assert_eq!(rowids[0], rowids[1]);
        assert_eq!(rowids[0], rowids[3]);
        assert_ne!(rowids[0], rowids[2]);
        assert_eq!(h.store.row_count("chips"), 2);
    }

    #[tokio::test]
    async fn test_delete_then_recompute() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let table = h.register(widths(&recorder)).await;
        let config = scale(1);

        let old = table.ensure_rowids(&keys([1, 2]), &config).await.unwrap();
        assert_eq!(table.delete_rows(&old).await.unwrap(), 2);
        assert_eq!(table.delete_rows(&old).await.unwrap(), 0);
        assert_eq!(h.store.row_count("chips"), 0);

        let missing = table.get_rowids(&keys([1, 2]), &config, Lookup::Existing).await.unwrap();
        assert_eq!(missing, vec![None, None]);

        let new = table.ensure_rowids(&keys([1, 2]), &config).await.unwrap();
        assert_eq!(recorder.calls(), 2);
        assert!(new.iter().all(|id| !old.contains(id)));

        let recomputed = table
            .get_rowids(&keys([1, 2]), &config, Lookup::Recompute)
            .await
            .unwrap();
        assert_eq!(recorder.calls(), 3);
        assert!(recomputed.iter().flatten().all(|id| !new.contains(id)));
        assert_eq!(h.store.row_count("chips"), 2);
    }

    #[tokio::test]
    async fn test_thumbnails() {
        let h = Harness::new().await;
        let table = h
            .register(
                TableDescriptor::new(
                    "thumbnails",
                    ["images"],
                    vec![
                        ColumnSpec::external("img", RawBytes::new(".png")),
                        ColumnSpec::scalar("width", ScalarType::Integer),
                        ColumnSpec::scalar("height", ScalarType::Integer),
                    ],
                    |_, parents, config| {
                        let size = config
                            .get("thumbsize")
                            .and_then(|v| v.as_i64())
                            .ok_or("thumbsize is required")?;
                        Ok(parents
                            .rowids(0)
                            .iter()
                            .map(|id| {
                                vec![
                                    Value::Bytes(vec![*id as u8; 16]),
                                    Value::Int(size),
                                    Value::Int(size),
                                ]
                            })
                            .collect())
                    },
                )
                .algo(),
            )
            .await;
        assert_eq!(table.kind(), TableKind::Algo);
        assert_eq!(table.extern_columns(), vec!["img"]);

        let config = TableConfig::new(&json!({"thumbsize": 221})).unwrap();
        let parents = keys([1, 2]);
        let widths = table.get(&parents, "width".into(), &config, true).await.unwrap();
        assert_eq!(widths, vec![Some(Value::Int(221)), Some(Value::Int(221))]);
        assert_eq!(h.blob_count("thumbnails"), 2);

        let imgs = table.get(&parents, "img".into(), &config, false).await.unwrap();
        assert_eq!(imgs[1], Some(Value::Bytes(vec![2; 16])));

        let deleted = table
            .delete(DeleteTarget::Parents(&parents), &config)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(h.blob_count("thumbnails"), 0);

        let gone = table.get(&parents, "width".into(), &config, false).await.unwrap();
        assert_eq!(gone, vec![None, None]);
    }

    #[tokio::test]
    async fn test_row_count_mismatch() {
        let h = Harness::new().await;
        let table = h
            .register(TableDescriptor::new(
                "chips",
                ["images"],
                vec![ColumnSpec::scalar("width", ScalarType::Integer)],
                |_, _, _| Ok(vec![vec![Value::Int(1)]]),
            ))
            .await;

        let err = table.ensure_rowids(&keys([1, 2]), &scale(1)).await.unwrap_err();
        assert!(matches!(err, DepcacheError::SchemaMismatch { ref table, .. } if table == "chips"));
        assert_eq!(h.store.row_count("chips"), 0);
    }

    #[tokio::test]
    async fn test_compute_error_carries_context() {
        let h = Harness::new().await;
        let table = h
            .register(TableDescriptor::new(
                "chips",
                ["images"],
                vec![ColumnSpec::scalar("width", ScalarType::Integer)],
                |_, _, _| Err(BoxError::from("decoder exploded")),
            ))
            .await;

        let config = scale(1);
        let err = table.ensure_rowids(&keys([5]), &config).await.unwrap_err();
        match err {
            DepcacheError::Compute {
                table,
                config_hash,
                parents,
                source,
            } => {
                assert_eq!(table, "chips");
                assert_eq!(config_hash, config.hashid());
                assert_eq!(parents, keys([5]));
                assert_eq!(source.to_string(), "decoder exploded");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_blob_is_fatal() {
        let h = Harness::new().await;
        let table = h
            .register(TableDescriptor::new(
                "vecs",
                ["images"],
                vec![ColumnSpec::external("data", RawBytes::new(".bin"))],
                |_, parents, _| {
                    Ok(parents
                        .rowids(0)
                        .iter()
                        .map(|_| vec![Value::Bytes(vec![9])])
                        .collect())
                },
            ))
            .await;

        let rowids = table.ensure_rowids(&keys([1]), &TableConfig::empty()).await.unwrap();
        let dir = h.dir.path().join(ExternalStore::dir_name("vecs"));
        for entry in std::fs::read_dir(&dir).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }

        let err = table.get_row_data(&rowids, "data".into()).await.unwrap_err();
        assert!(matches!(err, DepcacheError::ExternalIo { .. }));

        // Unknown rowids are a plain miss.
        assert_eq!(table.get_row_data(&[999], "data".into()).await.unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_earlier_chunks() {
        let h = Harness::new().await;
        let table = h
            .register(
                TableDescriptor::new(
                    "chips",
                    ["images"],
                    vec![
                        ColumnSpec::external("data", RawBytes::new(".bin")),
                        ColumnSpec::scalar("width", ScalarType::Integer),
                    ],
                    |_, parents, _| {
                        Ok(parents
                            .rowids(0)
                            .iter()
                            .map(|id| {
                                let width = if *id == 6 {
                                    Value::from("wide")
                                } else {
                                    Value::Int(*id)
                                };
                                vec![Value::Bytes(vec![*id as u8]), width]
                            })
                            .collect())
                    },
                )
                .chunk_size(2),
            )
            .await;

        let config = TableConfig::empty();
        let err = table.ensure_rowids(&keys(1..=6), &config).await.unwrap_err();
        match err {
            DepcacheError::Chunk {
                table,
                config_hash,
                parents,
                source,
            } => {
                assert_eq!(table, "chips");
                assert_eq!(config_hash, config.hashid());
                assert_eq!(parents, keys([6]));
                assert!(matches!(*source, DepcacheError::SchemaMismatch { .. }));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(h.store.row_count("chips"), 4);
        assert_eq!(h.blob_count("chips"), 4);

        let existing = table.get_rowids(&keys(1..=6), &config, Lookup::Existing).await.unwrap();
        assert_eq!(existing.iter().filter(|id| id.is_some()).count(), 4);
        assert!(existing[4].is_none() && existing[5].is_none());
    }

    struct NamedLoader;

    #[async_trait]
    impl ParentLoader for NamedLoader {
        async fn load(&self, parent: &str, rowids: &[RowId]) -> Result<Vec<Value>, BoxError> {
            Ok(rowids.iter().map(|id| Value::from(format!("{}#{}", parent, id))).collect())
        }
    }

    fn labels() -> TableDescriptor {
        TableDescriptor::new(
            "pairs",
            ["images", "annotations"],
            vec![ColumnSpec::scalar("label", ScalarType::Text)],
            |_, parents, _| {
                let images = parents.objects(0).ok_or("images not loaded")?;
                let annots = parents.objects(1).ok_or("annotations not loaded")?;
                Ok(images
                    .iter()
                    .zip(annots)
                    .map(|(image, annot)| {
                        let label = format!(
                            "{}/{}",
                            image.as_str().unwrap_or_default(),
                            annot.as_str().unwrap_or_default()
                        );
                        vec![Value::from(label)]
                    })
                    .collect())
            },
        )
        .as_object()
    }

    #[tokio::test]
    async fn test_parent_objects_are_loaded() {
        let h = Harness::new().await;
        let err = h.try_register(labels(), None).await.unwrap_err();
        assert!(matches!(err, DepcacheError::SchemaMismatch { .. }));

        let table = h.try_register(labels(), Some(Arc::new(NamedLoader))).await.unwrap();
        let values = table
            .get(&[vec![1, 7], vec![2, 8]], "label".into(), &TableConfig::empty(), true)
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![
                Some(Value::from("images#1/annotations#7")),
                Some(Value::from("images#2/annotations#8")),
            ]
        );

        let err = table
            .ensure_rowids(&[vec![1]], &TableConfig::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, DepcacheError::SchemaMismatch { .. }));
    }

    fn thumbs(fill: u8) -> TableDescriptor {
        TableDescriptor::new(
            "thumbs",
            ["images"],
            vec![
                ColumnSpec::external("img", RawBytes::new(".png")),
                ColumnSpec::scalar("width", ScalarType::Integer),
            ],
            move |_, parents, _| {
                Ok(parents
                    .rowids(0)
                    .iter()
                    .map(|id| vec![Value::Bytes(vec![fill; 4]), Value::Int(*id)])
                    .collect())
            },
        )
    }

    /// Runs a rival writer's ensure the first time parents are loaded, which
    /// is after the loading table's own lookup.
    struct RacingLoader {
        rival: Mutex<Option<(Arc<CacheTable>, Vec<ParentKey>)>>,
    }

    impl RacingLoader {
        fn new(rival: Arc<CacheTable>, keys: Vec<ParentKey>) -> Arc<dyn ParentLoader> {
            Arc::new(Self {
                rival: Mutex::new(Some((rival, keys))),
            })
        }
    }

    #[async_trait]
    impl ParentLoader for RacingLoader {
        async fn load(&self, parent: &str, rowids: &[RowId]) -> Result<Vec<Value>, BoxError> {
            let rival = self.rival.lock().take();
            if let Some((table, keys)) = rival {
                table.ensure_rowids(&keys, &TableConfig::empty()).await?;
            }
            Ok(rowids.iter().map(|id| Value::from(format!("{}#{}", parent, id))).collect())
        }
    }

    #[tokio::test]
    async fn test_losing_a_race_keeps_the_winners_blob() {
        let h = Harness::new().await;
        let config = TableConfig::empty();
        let winner = Arc::new(h.register(thumbs(1)).await);
        let loser = h
            .try_register(thumbs(2).as_object(), Some(RacingLoader::new(winner.clone(), keys([1]))))
            .await
            .unwrap();

        let rowids = loser.ensure_rowids(&keys([1]), &config).await.unwrap();
        assert_eq!(rowids, winner.ensure_rowids(&keys([1]), &config).await.unwrap());
        assert_eq!(h.store.row_count("thumbs"), 1);
        assert_eq!(h.blob_count("thumbs"), 1);

        let img = winner.get_row_data(&rowids, "img".into()).await.unwrap();
        assert_eq!(img, vec![Some(Value::Bytes(vec![1; 4]))]);
        let img = loser.get_row_data(&rowids, "img".into()).await.unwrap();
        assert_eq!(img, vec![Some(Value::Bytes(vec![1; 4]))]);
    }

    #[tokio::test]
    async fn test_partial_conflict_fails_the_chunk_with_context() {
        let h = Harness::new().await;
        let config = TableConfig::empty();
        let winner = Arc::new(h.register(thumbs(1)).await);
        let loser = h
            .try_register(thumbs(2).as_object(), Some(RacingLoader::new(winner.clone(), keys([2]))))
            .await
            .unwrap();

        let err = loser.ensure_rowids(&keys([1, 2]), &config).await.unwrap_err();
        match err {
            DepcacheError::Chunk {
                table,
                config_hash,
                parents,
                source,
            } => {
                assert_eq!(table, "thumbs");
                assert_eq!(config_hash, config.hashid());
                assert_eq!(parents, keys([1, 2]));
                assert!(matches!(
                    *source,
                    DepcacheError::Store {
                        source: StorageError::Conflict { .. },
                        ..
                    }
                ));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The loser's blob for parent 1 is gone, the winner's for parent 2 stays.
        assert_eq!(h.store.row_count("thumbs"), 1);
        assert_eq!(h.blob_count("thumbs"), 1);
        let won = winner.get(&keys([2]), "img".into(), &config, false).await.unwrap();
        assert_eq!(won, vec![Some(Value::Bytes(vec![1; 4]))]);

        // Retrying computes only what is still missing.
        let rowids = loser.ensure_rowids(&keys([1, 2]), &config).await.unwrap();
        let imgs = loser.get_row_data(&rowids, "img".into()).await.unwrap();
        assert_eq!(
            imgs,
            vec![Some(Value::Bytes(vec![2; 4])), Some(Value::Bytes(vec![1; 4]))]
        );
        assert_eq!(h.blob_count("thumbs"), 2);
    }

    #[tokio::test]
    async fn test_delete_counts_rows_when_a_blob_is_stuck() {
        let h = Harness::new().await;
        let table = h.register(thumbs(1)).await;
        let config = TableConfig::empty();
        let rowids = table.ensure_rowids(&keys([1, 2]), &config).await.unwrap();

        let reference = ExternalStore::reference("thumbs", &[1], config.hashid(), ".png");
        let stuck = ExternalStore::new(h.dir.path()).resolve(&reference);
        std::fs::remove_file(&stuck).unwrap();
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("pinned"), b"x").unwrap();

        assert_eq!(table.delete_rows(&rowids).await.unwrap(), 2);
        assert_eq!(h.store.row_count("thumbs"), 0);
        assert_eq!(h.blob_count("thumbs"), 1);
        assert!(stuck.is_dir());
    }

    #[tokio::test]
    async fn test_delete_hook_runs_first() {
        let h = Harness::new().await;
        let recorder = Recorder::default();
        let seen: Arc<Mutex<Vec<RowId>>> = Arc::default();
        let hook_seen = seen.clone();
        let table = h
            .register(widths(&recorder).on_delete(move |_: &str, rowids: &[RowId]| {
                hook_seen.lock().extend_from_slice(rowids);
                if rowids.contains(&3) {
                    return Err(BoxError::from("row 3 is pinned"));
                }
                Ok(())
            }))
            .await;

        let config = scale(1);
        let rowids = table.ensure_rowids(&keys([1, 2, 3]), &config).await.unwrap();
        let deleted = table
            .delete(DeleteTarget::Rowids(&rowids[..2]), &config)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(*seen.lock(), rowids[..2].to_vec());

        let err = table.delete_rows(&rowids[2..]).await.unwrap_err();
        assert!(matches!(err, DepcacheError::DeleteHook { .. }));
        assert_eq!(h.store.row_count("chips"), 1);
    }

    #[tokio::test]
    async fn test_schema_layout() {
        let h = Harness::new().await;
        let table = h
            .try_register(labels().docstr("pair labels"), Some(Arc::new(NamedLoader)))
            .await
            .unwrap();
        let schema = table.schema();
        let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["images_rowid", "annotations_rowid", "config_rowid", "label"]);
        assert_eq!(schema.superkey, vec!["images_rowid", "annotations_rowid", "config_rowid"]);
        assert_eq!(schema.docstr, "pair labels");
        assert_eq!(table.rowid_column(), "pairs_rowid");
    }
}
