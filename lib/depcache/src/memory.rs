//! In-process [`RowStore`].
//!
//! Keeps every table in a `BTreeMap<RowId, row>` behind one mutex, with a
//! hash index over each table's superkey. Rowids start at 1 and are never
//! reused, matching what the SQL backends do with sequences. Nothing is
//! persisted; this is the store used by tests and throwaway caches.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::store::{RowStore, TableSchema};
use crate::{RowId, StorageError, Value};

struct MemoryTable {
    schema: TableSchema,
    rowid_column: String,
    rows: BTreeMap<RowId, Vec<Value>>,
    superkey_index: HashMap<String, RowId>,
    next_rowid: RowId,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            rowid_column: schema.rowid_column(),
            schema,
            rows: BTreeMap::new(),
            superkey_index: HashMap::new(),
            next_rowid: 1,
        }
    }

    /// Position of `column` in a stored row; `None` means the rowid column.
    fn position(&self, column: &str) -> Result<Option<usize>, StorageError> {
        if column == self.rowid_column {
            return Ok(None);
        }
        self.schema
            .columns
            .iter()
            .position(|c| c.name == column)
            .map(Some)
            .ok_or_else(|| {
                StorageError::NotFound(format!("column {}.{}", self.schema.name, column))
            })
    }

    fn positions(&self, columns: &[String]) -> Result<Vec<Option<usize>>, StorageError> {
        columns.iter().map(|c| self.position(c)).collect()
    }

    fn project(&self, rowid: RowId, row: &[Value], positions: &[Option<usize>]) -> Vec<Value> {
        positions
            .iter()
            .map(|pos| match pos {
                Some(idx) => row.get(*idx).cloned().unwrap_or(Value::Null),
                None => Value::Int(rowid),
            })
            .collect()
    }

    fn superkey_of(&self, row: &[Value]) -> Result<Option<String>, StorageError> {
        if self.schema.superkey.is_empty() {
            return Ok(None);
        }
        let mut key = Vec::with_capacity(self.schema.superkey.len());
        for column in &self.schema.superkey {
            match self.position(column)? {
                Some(idx) => key.push(row.get(idx).cloned().unwrap_or(Value::Null)),
                None => return Ok(None),
            }
        }
        Ok(Some(serde_json::to_string(&key)?))
    }

    /// Lay out `values` (ordered as `columns`) as a full stored row.
    fn build_row(
        &self,
        columns: &[String],
        values: Vec<Value>,
    ) -> Result<Vec<Value>, StorageError> {
        if columns.len() != values.len() {
            return Err(StorageError::StorageError(format!(
                "{} columns but {} values for {}",
                columns.len(),
                values.len(),
                self.schema.name
            )));
        }
        let mut row = vec![Value::Null; self.schema.columns.len()];
        for (column, value) in columns.iter().zip(values) {
            let idx = self.position(column)?.ok_or_else(|| {
                StorageError::StorageError(format!("{} is assigned by the store", column))
            })?;
            let def = &self.schema.columns[idx];
            if value.is_null() && def.not_null {
                return Err(StorageError::UnsupportedValue {
                    column: column.clone(),
                    reason: "column is NOT NULL".to_string(),
                });
            }
            if !value.fits(def.ty) {
                return Err(StorageError::UnsupportedValue {
                    column: column.clone(),
                    reason: format!("{} does not fit {}", value.type_name(), def.ty.as_str()),
                });
            }
            row[idx] = value;
        }
        Ok(row)
    }

    fn push(&mut self, row: Vec<Value>, key: Option<String>) -> RowId {
        let rowid = self.next_rowid;
        self.next_rowid += 1;
        if let Some(key) = key {
            self.superkey_index.insert(key, rowid);
        }
        self.rows.insert(rowid, row);
        rowid
    }
}

/// In-memory implementation of [`RowStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored in `table` (0 if it does not exist).
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

fn missing_table(table: &str) -> StorageError {
    StorageError::NotFound(format!("table {}", table))
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn has_table(&self, table: &str) -> Result<bool, StorageError> {
        Ok(self.tables.lock().contains_key(table))
    }

    async fn add_table(&self, schema: &TableSchema) -> Result<(), StorageError> {
        self.tables
            .lock()
            .entry(schema.name.clone())
            .or_insert_with(|| MemoryTable::new(schema.clone()));
        Ok(())
    }

    async fn insert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<RowId>, StorageError> {
        let mut tables = self.tables.lock();
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;

        // Validate everything before touching the table.
        let mut staged = Vec::with_capacity(rows.len());
        let mut batch_keys = std::collections::HashSet::new();
        for values in rows {
            let row = t.build_row(columns, values)?;
            let key = t.superkey_of(&row)?;
            if let Some(key) = &key {
                if t.superkey_index.contains_key(key) || !batch_keys.insert(key.clone()) {
                    return Err(StorageError::Conflict {
                        table: table.to_string(),
                        key: key.clone(),
                    });
                }
            }
            staged.push((row, key));
        }

        Ok(staged
            .into_iter()
            .map(|(row, key)| t.push(row, key))
            .collect())
    }

    async fn insert_unique(
        &self,
        table: &str,
        columns: &[String],
        row: Vec<Value>,
        key_columns: &[String],
    ) -> Result<RowId, StorageError> {
        let mut tables = self.tables.lock();
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;

        let key_positions = t.positions(key_columns)?;
        let row = t.build_row(columns, row)?;
        let wanted = t.project(0, &row, &key_positions);
        let existing = t
            .rows
            .iter()
            .find(|(rowid, stored)| t.project(**rowid, stored, &key_positions) == wanted)
            .map(|(rowid, _)| *rowid);
        if let Some(rowid) = existing {
            return Ok(rowid);
        }

        let key = t.superkey_of(&row)?;
        Ok(t.push(row, key))
    }

    async fn get_by_id(
        &self,
        table: &str,
        columns: &[String],
        ids: &[RowId],
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError> {
        let tables = self.tables.lock();
        let t = tables.get(table).ok_or_else(|| missing_table(table))?;
        let positions = t.positions(columns)?;
        Ok(ids
            .iter()
            .map(|id| t.rows.get(id).map(|row| t.project(*id, row, &positions)))
            .collect())
    }

    async fn get_where(
        &self,
        table: &str,
        columns: &[String],
        params: &[Vec<Value>],
        where_columns: &[String],
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError> {
        let tables = self.tables.lock();
        let t = tables.get(table).ok_or_else(|| missing_table(table))?;
        let positions = t.positions(columns)?;
        let where_positions = t.positions(where_columns)?;
        let by_superkey = where_columns == t.schema.superkey.as_slice();

        let mut out = Vec::with_capacity(params.len());
        for param in params {
            let found = if by_superkey {
                let key = serde_json::to_string(param)?;
                t.superkey_index
                    .get(&key)
                    .and_then(|rowid| t.rows.get_key_value(rowid))
            } else {
                t.rows
                    .iter()
                    .find(|(rowid, row)| t.project(**rowid, row, &where_positions) == *param)
            };
            out.push(found.map(|(rowid, row)| t.project(*rowid, row, &positions)));
        }
        Ok(out)
    }

    async fn delete_by_id(&self, table: &str, ids: &[RowId]) -> Result<u64, StorageError> {
        let mut tables = self.tables.lock();
        let t = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let mut deleted = 0;
        for id in ids {
            if let Some(row) = t.rows.remove(id) {
                if let Some(key) = t.superkey_of(&row)? {
                    t.superkey_index.remove(&key);
                }
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
