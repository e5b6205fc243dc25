//! Cell values exchanged between compute functions, the column codec and the
//! store.
//!
//! A single [`Value`] enum covers both sides of the codec: stores only ever see
//! the scalar variants, while logical rows may also carry [`Value::Tuple`] for
//! fixed-width tuple columns.

use serde::{Deserialize, Serialize};

use crate::column::{ColumnKind, ScalarType};
use crate::DepcacheError;

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Whether this value can be stored in a physical column of type `ty`.
    ///
    /// `Null` fits every type; integers are accepted by real columns.
    pub fn fits(&self, ty: ScalarType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Int(_), ScalarType::Integer)
                | (Value::Int(_), ScalarType::Real)
                | (Value::Float(_), ScalarType::Real)
                | (Value::Bool(_), ScalarType::Boolean)
                | (Value::String(_), ScalarType::Text)
                | (Value::Bytes(_), ScalarType::Blob)
        )
    }

    /// The representation a column of type `ty` stores for this value, or
    /// `None` if it does not fit. Integers in real columns become floats so
    /// every store reads them back the same way.
    pub fn conform(self, ty: ScalarType) -> Option<Value> {
        match (self, ty) {
            (Value::Int(i), ScalarType::Real) => Some(Value::Float(i as f64)),
            (value, ty) if value.fits(ty) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn mismatch(expected: &str, found: &Value) -> DepcacheError {
    DepcacheError::ValueConversion(format!(
        "expected {}, found {}",
        expected,
        found.type_name()
    ))
}

/// Rust types that map onto a logical column.
///
/// Implemented for the scalar primitives, `Option` of a scalar, and tuples of
/// two to five scalars. `#[derive(CacheRow)]` relies on this trait to derive a
/// table's logical schema from a struct.
pub trait ColumnValue: Sized {
    fn column_kind() -> ColumnKind;
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Result<Self, DepcacheError>;
}

/// Column values that occupy exactly one physical column.
pub trait ScalarValue: ColumnValue {
    const SCALAR: ScalarType;
}

macro_rules! scalar_value {
    ($ty:ty, $scalar:ident, $variant:ident, $conv:expr) => {
        impl ColumnValue for $ty {
            fn column_kind() -> ColumnKind {
                ColumnKind::Scalar(ScalarType::$scalar)
            }

            fn into_value(self) -> Value {
                Value::from(self)
            }

            fn from_value(value: Value) -> Result<Self, DepcacheError> {
                match value {
                    Value::$variant(v) => $conv(v),
                    other => Err(mismatch(stringify!($ty), &other)),
                }
            }
        }

        impl ScalarValue for $ty {
            const SCALAR: ScalarType = ScalarType::$scalar;
        }
    };
}

scalar_value!(i64, Integer, Int, |v: i64| Ok(v));
scalar_value!(i32, Integer, Int, |v: i64| i32::try_from(v)
    .map_err(|e| DepcacheError::ValueConversion(e.to_string())));
scalar_value!(u32, Integer, Int, |v: i64| u32::try_from(v)
    .map_err(|e| DepcacheError::ValueConversion(e.to_string())));
scalar_value!(bool, Boolean, Bool, |v: bool| Ok(v));
scalar_value!(String, Text, String, |v: String| Ok(v));
scalar_value!(Vec<u8>, Blob, Bytes, |v: Vec<u8>| Ok(v));

impl ColumnValue for f64 {
    fn column_kind() -> ColumnKind {
        ColumnKind::Scalar(ScalarType::Real)
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }

    fn from_value(value: Value) -> Result<Self, DepcacheError> {
        value.as_float().ok_or_else(|| mismatch("f64", &value))
    }
}

impl ScalarValue for f64 {
    const SCALAR: ScalarType = ScalarType::Real;
}

impl ColumnValue for f32 {
    fn column_kind() -> ColumnKind {
        ColumnKind::Scalar(ScalarType::Real)
    }

    fn into_value(self) -> Value {
        Value::Float(self.into())
    }

    fn from_value(value: Value) -> Result<Self, DepcacheError> {
        value
            .as_float()
            .map(|v| v as f32)
            .ok_or_else(|| mismatch("f32", &value))
    }
}

impl ScalarValue for f32 {
    const SCALAR: ScalarType = ScalarType::Real;
}

impl<T: ScalarValue> ColumnValue for Option<T> {
    fn column_kind() -> ColumnKind {
        ColumnKind::Scalar(T::SCALAR)
    }

    fn into_value(self) -> Value {
        self.map(T::into_value).unwrap_or(Value::Null)
    }

    fn from_value(value: Value) -> Result<Self, DepcacheError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: ScalarValue> ScalarValue for Option<T> {
    const SCALAR: ScalarType = T::SCALAR;
}

macro_rules! tuple_value {
    ($width:literal; $($name:ident $var:ident),+) => {
        impl<$($name: ScalarValue),+> ColumnValue for ($($name,)+) {
            fn column_kind() -> ColumnKind {
                ColumnKind::FixedTuple(vec![$($name::SCALAR),+])
            }

            fn into_value(self) -> Value {
                let ($($var,)+) = self;
                Value::Tuple(vec![$($var.into_value()),+])
            }

            fn from_value(value: Value) -> Result<Self, DepcacheError> {
                let items = match value {
                    Value::Tuple(items) if items.len() == $width => items,
                    other => return Err(mismatch(concat!("tuple of width ", $width), &other)),
                };
                let mut items = items.into_iter();
                Ok(($(
                    $name::from_value(items.next().unwrap_or(Value::Null))?,
                )+))
            }
        }
    };
}

tuple_value!(2; A a, B b);
tuple_value!(3; A a, B b, C c);
tuple_value!(4; A a, B b, C c, D d);
tuple_value!(5; A a, B b, C c, D d, E e);
