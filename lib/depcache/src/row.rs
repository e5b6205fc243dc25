//! Typed rows.
//!
//! Implement [`CacheRow`] (normally through `#[derive(CacheRow)]`) to declare a
//! table's logical schema with a plain struct:
//!
//! ```text
//! #[derive(CacheRow)]
//! struct Thumbnail {
//!     #[column(external = ".png")]
//!     img: Vec<u8>,
//!     width: u32,
//!     height: u32,
//! }
//! ```
//!
//! Each field becomes one logical column, in declaration order. Scalar and
//! tuple kinds come from the field's [`ColumnValue`](crate::ColumnValue) impl.
//! `#[column(external = "<ext>")]` stores a `Vec<u8>` field in a file as is,
//! `#[column(external = "<ext>", json)]` stores any serde type as a JSON
//! document, and `#[column(name = "...")]` renames the column.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::column::ColumnSpec;
use crate::{DepcacheError, Value};

pub trait CacheRow: Sized {
    /// Logical columns, in the order used by `into_values` and `from_values`.
    fn columns() -> Vec<ColumnSpec>;

    fn into_values(self) -> Result<Vec<Value>, DepcacheError>;

    fn from_values(values: Vec<Value>) -> Result<Self, DepcacheError>;

    /// Rebuild a row from the tuple returned by a full-row read.
    fn from_value(value: Value) -> Result<Self, DepcacheError> {
        match value {
            Value::Tuple(values) => Self::from_values(values),
            other => Err(DepcacheError::ValueConversion(format!(
                "expected a row tuple, found {}",
                other.type_name()
            ))),
        }
    }
}

/// Bytes of a raw external field.
pub fn bytes_from_value(value: Value) -> Result<Vec<u8>, DepcacheError> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        other => Err(DepcacheError::ValueConversion(format!(
            "expected bytes, found {}",
            other.type_name()
        ))),
    }
}

/// Serialize a JSON external field into the document stored in its file.
pub fn json_to_value<T: Serialize>(field: &T) -> Result<Value, DepcacheError> {
    serde_json::to_vec(field)
        .map(Value::Bytes)
        .map_err(|e| DepcacheError::ValueConversion(e.to_string()))
}

pub fn json_from_value<T: DeserializeOwned>(value: Value) -> Result<T, DepcacheError> {
    let bytes = bytes_from_value(value)?;
    serde_json::from_slice(&bytes).map_err(|e| DepcacheError::ValueConversion(e.to_string()))
}
