//! Binding `depcache::Value`s to PostgreSQL queries and reading them back.
//!
//! Binding is driven by the column's declared type so that NULLs are sent
//! with the right type and integers bound to real columns are widened.

use depcache::{ScalarType, StorageError, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Row};

fn bind_error(column: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::UnsupportedValue {
        column: column.to_string(),
        reason: e.to_string(),
    }
}

/// Bind one value destined for a column of type `ty`.
pub fn bind_value(
    args: &mut PgArguments,
    column: &str,
    ty: ScalarType,
    value: &Value,
) -> Result<(), StorageError> {
    let result = match (ty, value) {
        (ScalarType::Integer, Value::Null) => args.add(None::<i64>),
        (ScalarType::Real, Value::Null) => args.add(None::<f64>),
        (ScalarType::Text, Value::Null) => args.add(None::<String>),
        (ScalarType::Boolean, Value::Null) => args.add(None::<bool>),
        (ScalarType::Blob, Value::Null) => args.add(None::<Vec<u8>>),
        (ScalarType::Integer, Value::Int(n)) => args.add(*n),
        (ScalarType::Real, Value::Int(n)) => args.add(*n as f64),
        (ScalarType::Real, Value::Float(n)) => args.add(*n),
        (ScalarType::Text, Value::String(s)) => args.add(s.clone()),
        (ScalarType::Boolean, Value::Bool(b)) => args.add(*b),
        (ScalarType::Blob, Value::Bytes(bytes)) => args.add(bytes.clone()),
        (ty, other) => {
            return Err(bind_error(
                column,
                format!("{} does not fit {}", other.type_name(), ty.as_str()),
            ));
        }
    };
    result.map_err(|e| bind_error(column, e))
}

/// Bind a row of values, one per `(column, type)` pair.
pub fn bind_row(
    args: &mut PgArguments,
    columns: &[(String, ScalarType)],
    values: &[Value],
) -> Result<(), StorageError> {
    if columns.len() != values.len() {
        return Err(StorageError::StorageError(format!(
            "{} columns but {} values",
            columns.len(),
            values.len()
        )));
    }
    for ((column, ty), value) in columns.iter().zip(values) {
        bind_value(args, column, *ty, value)?;
    }
    Ok(())
}

/// Read column `idx` of `row` as a value of type `ty`.
pub fn extract_value(row: &PgRow, idx: usize, ty: ScalarType) -> Result<Value, StorageError> {
    let map = |e: sqlx::Error| StorageError::StorageError(e.to_string());
    let value = match ty {
        ScalarType::Integer => row
            .try_get::<Option<i64>, _>(idx)
            .map_err(map)?
            .map(Value::Int),
        ScalarType::Real => row
            .try_get::<Option<f64>, _>(idx)
            .map_err(map)?
            .map(Value::Float),
        ScalarType::Text => row
            .try_get::<Option<String>, _>(idx)
            .map_err(map)?
            .map(Value::String),
        ScalarType::Boolean => row
            .try_get::<Option<bool>, _>(idx)
            .map_err(map)?
            .map(Value::Bool),
        ScalarType::Blob => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .map_err(map)?
            .map(Value::Bytes),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Read `types.len()` columns starting at `offset`.
pub fn extract_row(
    row: &PgRow,
    offset: usize,
    types: &[ScalarType],
) -> Result<Vec<Value>, StorageError> {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| extract_value(row, offset + i, *ty))
        .collect()
}
