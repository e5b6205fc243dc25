//! PostgreSQL implementation of RowStore.

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// Parameter tuples per `get_where` statement.
const WHERE_BATCH: usize = 256;

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use depcache::{
    ConnectionConfig, RowId, RowStore, ScalarType, StorageError, StoreConnection, TableSchema,
    Value, rowid_column,
};
use parking_lot::RwLock;
use sqlx::Row;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use tracing::debug;

use crate::bind::{bind_row, extract_row};
use crate::sql;

type ColumnTypes = HashMap<String, ScalarType>;

/// Wrapper around sqlx::PgPool that implements RowStore.
///
/// Column types are looked up once per table (from the schema on
/// `add_table`, otherwise from `information_schema`) and used to bind and
/// decode values.
#[derive(Clone, Debug)]
pub struct PgPool {
    pool: sqlx::PgPool,
    column_types: Arc<RwLock<HashMap<String, Arc<ColumnTypes>>>>,
}

impl PgPool {
    /// Create a new PgPool from an sqlx PgPool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            column_types: Arc::default(),
        }
    }

    /// Connect to a PostgreSQL database.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(url)
            .await
            .map_err(|e| StorageError::StorageError(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Get the inner sqlx::PgPool.
    pub fn inner(&self) -> &sqlx::PgPool {
        &self.pool
    }

    async fn types(&self, table: &str) -> Result<Arc<ColumnTypes>, StorageError> {
        let cached = self.column_types.read().get(table).cloned();
        if let Some(types) = cached {
            return Ok(types);
        }

        let rows = sqlx::query(sql::column_types())
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(table, e))?;
        if rows.is_empty() {
            return Err(StorageError::NotFound(format!("table {}", table)));
        }

        let mut types = ColumnTypes::new();
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|e| StorageError::StorageError(e.to_string()))?;
            let data_type: String = row
                .try_get(1)
                .map_err(|e| StorageError::StorageError(e.to_string()))?;
            types.insert(name, sql::scalar_type(&data_type));
        }
        Ok(self.cache_types(table, types))
    }

    fn cache_types(&self, table: &str, types: ColumnTypes) -> Arc<ColumnTypes> {
        let types = Arc::new(types);
        self.column_types
            .write()
            .insert(table.to_string(), types.clone());
        types
    }

    async fn typed_columns(
        &self,
        table: &str,
        columns: &[String],
    ) -> Result<Vec<(String, ScalarType)>, StorageError> {
        let types = self.types(table).await?;
        columns
            .iter()
            .map(|c| {
                types
                    .get(c)
                    .map(|ty| (c.clone(), *ty))
                    .ok_or_else(|| StorageError::NotFound(format!("column {}.{}", table, c)))
            })
            .collect()
    }
}

impl Deref for PgPool {
    type Target = sqlx::PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Map a driver error, surfacing unique violations as conflicts.
fn db_error(table: &str, e: sqlx::Error) -> StorageError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            return StorageError::Conflict {
                table: table.to_string(),
                key: db.message().to_string(),
            };
        }
    }
    StorageError::StorageError(e.to_string())
}

fn scalar_types(columns: &[(String, ScalarType)]) -> Vec<ScalarType> {
    columns.iter().map(|(_, ty)| *ty).collect()
}

#[async_trait]
impl RowStore for PgPool {
    async fn has_table(&self, table: &str) -> Result<bool, StorageError> {
        let row = sqlx::query(sql::table_exists())
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error(table, e))?;
        row.try_get::<bool, _>(0)
            .map_err(|e| StorageError::StorageError(e.to_string()))
    }

    async fn add_table(&self, schema: &TableSchema) -> Result<(), StorageError> {
        for statement in sql::create_table(schema) {
            debug!(table = schema.name.as_str(), %statement, "creating table");
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error(&schema.name, e))?;
        }

        let mut types: ColumnTypes = schema
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.ty))
            .collect();
        types.insert(schema.rowid_column(), ScalarType::Integer);
        self.cache_types(&schema.name, types);
        Ok(())
    }

    async fn insert(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<Vec<RowId>, StorageError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let typed = self.typed_columns(table, columns).await?;
        let statement = sql::insert_returning(table, columns, &rowid_column(table));

        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await.map_err(|e| db_error(table, e))?;
        let mut rowids = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut args = PgArguments::default();
            bind_row(&mut args, &typed, row)?;
            let inserted = sqlx::query_with(&statement, args)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_error(table, e))?;
            rowids.push(
                inserted
                    .try_get::<i64, _>(0)
                    .map_err(|e| StorageError::StorageError(e.to_string()))?,
            );
        }
        tx.commit().await.map_err(|e| db_error(table, e))?;

        debug!(table, rows = rowids.len(), "inserted rows");
        Ok(rowids)
    }

    async fn insert_unique(
        &self,
        table: &str,
        columns: &[String],
        row: Vec<Value>,
        key_columns: &[String],
    ) -> Result<RowId, StorageError> {
        let typed = self.typed_columns(table, columns).await?;
        let rowid_name = rowid_column(table);

        let mut args = PgArguments::default();
        bind_row(&mut args, &typed, &row)?;
        let statement = sql::insert_if_absent(table, columns, key_columns, &rowid_name);
        let inserted = sqlx::query_with(&statement, args)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(table, e))?;
        if let Some(inserted) = inserted {
            return inserted
                .try_get::<i64, _>(0)
                .map_err(|e| StorageError::StorageError(e.to_string()));
        }

        // Someone else inserted the key first; read their rowid.
        let key: Vec<Value> = key_columns
            .iter()
            .map(|k| {
                columns
                    .iter()
                    .position(|c| c == k)
                    .and_then(|idx| row.get(idx).cloned())
                    .ok_or_else(|| {
                        StorageError::StorageError(format!("key column {} has no value", k))
                    })
            })
            .collect::<Result<_, _>>()?;
        let existing = self
            .get_where(table, std::slice::from_ref(&rowid_name), &[key], key_columns)
            .await?;
        existing
            .into_iter()
            .flatten()
            .next()
            .and_then(|values| values.first().and_then(Value::as_int))
            .ok_or_else(|| StorageError::NotFound(format!("{} row after conflict", table)))
    }

    async fn get_by_id(
        &self,
        table: &str,
        columns: &[String],
        ids: &[RowId],
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let types = scalar_types(&self.typed_columns(table, columns).await?);
        let statement = sql::select_by_ids(table, columns, &rowid_column(table));
        let rows = sqlx::query(&statement)
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(table, e))?;

        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let rowid: i64 = row
                .try_get(0)
                .map_err(|e| StorageError::StorageError(e.to_string()))?;
            by_id.insert(rowid, extract_row(row, 1, &types)?);
        }
        Ok(ids.iter().map(|id| by_id.get(id).cloned()).collect())
    }

    async fn get_where(
        &self,
        table: &str,
        columns: &[String],
        params: &[Vec<Value>],
        where_columns: &[String],
    ) -> Result<Vec<Option<Vec<Value>>>, StorageError> {
        if params.is_empty() {
            return Ok(Vec::new());
        }
        let where_typed = self.typed_columns(table, where_columns).await?;
        let where_types = scalar_types(&where_typed);
        let types = scalar_types(&self.typed_columns(table, columns).await?);

        let mut out = Vec::with_capacity(params.len());
        for batch in params.chunks(WHERE_BATCH) {
            let statement = sql::select_where(table, columns, where_columns, batch.len());
            let mut args = PgArguments::default();
            for param in batch {
                bind_row(&mut args, &where_typed, param)?;
            }
            let rows = sqlx::query_with(&statement, args)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error(table, e))?;

            let mut found = Vec::with_capacity(rows.len());
            for row in &rows {
                found.push((
                    extract_row(row, 0, &where_types)?,
                    extract_row(row, where_types.len(), &types)?,
                ));
            }
            out.extend(batch.iter().map(|param| {
                found
                    .iter()
                    .find(|(key, _)| key == param)
                    .map(|(_, values)| values.clone())
            }));
        }
        Ok(out)
    }

    async fn delete_by_id(&self, table: &str, ids: &[RowId]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&sql::delete_by_ids(table, &rowid_column(table)))
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(|e| db_error(table, e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StoreConnection for PgPool {
    async fn connect(config: impl Into<ConnectionConfig> + Send) -> Result<Self, StorageError> {
        match config.into() {
            ConnectionConfig::Url(url) => PgPool::connect(&url).await,
        }
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::StorageError(e.to_string()))?;
        debug!("postgres store ready");
        Ok(())
    }
}
