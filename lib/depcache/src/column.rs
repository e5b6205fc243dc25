//! Logical column kinds and the codec that flattens them into physical
//! columns.
//!
//! - `Scalar` maps to one physical column of the same name.
//! - `FixedTuple` of width W maps to `<col>_0 .. <col>_{W-1}`.
//! - `External` maps to one text column `<col>_extern_uri` holding a path
//!   relative to the cache root; the value itself lives in a file.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::{BoxError, DepcacheError, Value};

/// Suffix of the physical column holding an external column's file reference.
pub const EXTERN_SUFFIX: &str = "_extern_uri";

/// Native type of a physical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Integer,
    Real,
    Text,
    Boolean,
    Blob,
}

impl ScalarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::Integer => "integer",
            ScalarType::Real => "real",
            ScalarType::Text => "text",
            ScalarType::Boolean => "boolean",
            ScalarType::Blob => "blob",
        }
    }
}

/// Serializer pair for an external column.
///
/// The engine owns the file I/O (placement, atomic writes, reads); a codec only
/// turns a value into bytes and back.
pub trait BlobCodec: Send + Sync {
    /// Short identifier, used for schema comparison and logging.
    fn name(&self) -> &'static str;

    /// File extension including the leading dot.
    fn extension(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BoxError>;

    fn decode(&self, bytes: Vec<u8>) -> Result<Value, BoxError>;
}

/// Stores `Value::Bytes` verbatim.
#[derive(Debug, Clone)]
pub struct RawBytes {
    extension: String,
}

impl RawBytes {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl BlobCodec for RawBytes {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BoxError> {
        match value {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(format!("raw blob columns hold bytes, got {}", other.type_name()).into()),
        }
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<Value, BoxError> {
        Ok(Value::Bytes(bytes))
    }
}

/// Stores any value as a JSON document.
#[derive(Debug, Clone)]
pub struct JsonBlob {
    extension: String,
}

impl JsonBlob {
    pub fn new() -> Self {
        Self {
            extension: ".json".to_string(),
        }
    }

    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl Default for JsonBlob {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobCodec for JsonBlob {
    fn name(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: Vec<u8>) -> Result<Value, BoxError> {
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Kind of a logical column, fixed when the table is declared.
#[derive(Clone)]
pub enum ColumnKind {
    Scalar(ScalarType),
    FixedTuple(Vec<ScalarType>),
    External(Arc<dyn BlobCodec>),
}

impl ColumnKind {
    pub fn external(codec: impl BlobCodec + 'static) -> Self {
        ColumnKind::External(Arc::new(codec))
    }

    pub fn is_external(&self) -> bool {
        matches!(self, ColumnKind::External(_))
    }
}

impl fmt::Debug for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Scalar(ty) => f.debug_tuple("Scalar").field(ty).finish(),
            ColumnKind::FixedTuple(tys) => f.debug_tuple("FixedTuple").field(tys).finish(),
            ColumnKind::External(codec) => f
                .debug_struct("External")
                .field("codec", &codec.name())
                .field("extension", &codec.extension())
                .finish(),
        }
    }
}

impl PartialEq for ColumnKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ColumnKind::Scalar(a), ColumnKind::Scalar(b)) => a == b,
            (ColumnKind::FixedTuple(a), ColumnKind::FixedTuple(b)) => a == b,
            (ColumnKind::External(a), ColumnKind::External(b)) => {
                a.name() == b.name() && a.extension() == b.extension()
            }
            _ => false,
        }
    }
}

/// A named logical column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn scalar(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, ColumnKind::Scalar(ty))
    }

    pub fn tuple(name: impl Into<String>, tys: impl Into<Vec<ScalarType>>) -> Self {
        Self::new(name, ColumnKind::FixedTuple(tys.into()))
    }

    pub fn external(name: impl Into<String>, codec: impl BlobCodec + 'static) -> Self {
        Self::new(name, ColumnKind::external(codec))
    }
}

/// A flattened column as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalColumn {
    pub name: String,
    pub ty: ScalarType,
}

#[derive(Debug, Clone)]
enum Slot {
    Scalar(usize),
    Nested(Range<usize>),
    Extern(usize),
}

/// Which logical columns a read returns.
#[derive(Debug, Clone, Copy)]
pub enum ColumnSelect<'a> {
    /// All logical columns in declared order, one tuple per row.
    All,
    /// A single column, returned as a bare value per row.
    One(&'a str),
    /// The listed columns, one tuple per row (even for a single name).
    Many(&'a [&'a str]),
}

impl<'a> From<&'a str> for ColumnSelect<'a> {
    fn from(name: &'a str) -> Self {
        ColumnSelect::One(name)
    }
}

impl<'a> From<Option<&'a str>> for ColumnSelect<'a> {
    fn from(name: Option<&'a str>) -> Self {
        name.map(ColumnSelect::One).unwrap_or(ColumnSelect::All)
    }
}

impl<'a> From<&'a [&'a str]> for ColumnSelect<'a> {
    fn from(names: &'a [&'a str]) -> Self {
        ColumnSelect::Many(names)
    }
}

/// Physical columns and decode instructions for one read.
#[derive(Debug, Clone)]
pub struct ReadPlan {
    pub physical: Vec<String>,
    columns: Vec<(usize, Slot)>,
    unwrap: bool,
}

/// Bidirectional mapping between a table's logical and physical columns.
#[derive(Clone)]
pub struct ColumnCodec {
    table: String,
    columns: Vec<ColumnSpec>,
    physical: Vec<PhysicalColumn>,
    slots: Vec<Slot>,
}

impl ColumnCodec {
    /// Derive the physical layout; rejects duplicate names and empty tuples.
    pub fn new(table: &str, columns: Vec<ColumnSpec>) -> Result<Self, DepcacheError> {
        let mut physical = Vec::new();
        let mut slots = Vec::with_capacity(columns.len());
        let mut logical_names = HashSet::new();

        for column in &columns {
            if !logical_names.insert(column.name.as_str()) {
                return Err(DepcacheError::schema(
                    table,
                    format!("duplicate column {}", column.name),
                ));
            }
            match &column.kind {
                ColumnKind::Scalar(ty) => {
                    slots.push(Slot::Scalar(physical.len()));
                    physical.push(PhysicalColumn {
                        name: column.name.clone(),
                        ty: *ty,
                    });
                }
                ColumnKind::FixedTuple(tys) => {
                    if tys.is_empty() {
                        return Err(DepcacheError::schema(
                            table,
                            format!("tuple column {} has no members", column.name),
                        ));
                    }
                    let start = physical.len();
                    for (i, ty) in tys.iter().enumerate() {
                        physical.push(PhysicalColumn {
                            name: format!("{}_{}", column.name, i),
                            ty: *ty,
                        });
                    }
                    slots.push(Slot::Nested(start..physical.len()));
                }
                ColumnKind::External(_) => {
                    slots.push(Slot::Extern(physical.len()));
                    physical.push(PhysicalColumn {
                        name: format!("{}{}", column.name, EXTERN_SUFFIX),
                        ty: ScalarType::Text,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        for column in &physical {
            if !seen.insert(column.name.as_str()) {
                return Err(DepcacheError::schema(
                    table,
                    format!("physical column {} is produced twice", column.name),
                ));
            }
        }

        Ok(Self {
            table: table.to_string(),
            columns,
            physical,
            slots,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn physical(&self) -> &[PhysicalColumn] {
        &self.physical
    }

    pub fn physical_names(&self) -> Vec<String> {
        self.physical.iter().map(|c| c.name.clone()).collect()
    }

    pub fn extern_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.kind.is_external())
    }

    /// Flatten one logical row.
    ///
    /// `write_extern` receives each external column with its value and returns
    /// the reference to store in its place.
    pub fn encode_row<F>(
        &self,
        row: Vec<Value>,
        mut write_extern: F,
    ) -> Result<Vec<Value>, DepcacheError>
    where
        F: FnMut(&ColumnSpec, &Arc<dyn BlobCodec>, Value) -> Result<String, DepcacheError>,
    {
        if row.len() != self.columns.len() {
            return Err(DepcacheError::schema(
                &self.table,
                format!(
                    "compute produced {} values per row, schema has {} columns",
                    row.len(),
                    self.columns.len()
                ),
            ));
        }

        let mut out = Vec::with_capacity(self.physical.len());
        for (column, value) in self.columns.iter().zip(row) {
            match &column.kind {
                ColumnKind::Scalar(ty) => {
                    out.push(self.conform(&column.name, value, *ty)?);
                }
                ColumnKind::FixedTuple(tys) => {
                    let items = match value {
                        Value::Tuple(items) if items.len() == tys.len() => items,
                        other => {
                            return Err(DepcacheError::schema(
                                &self.table,
                                format!(
                                    "column {} expects a tuple of width {}, got {}",
                                    column.name,
                                    tys.len(),
                                    describe(&other)
                                ),
                            ));
                        }
                    };
                    for (item, ty) in items.into_iter().zip(tys) {
                        out.push(self.conform(&column.name, item, *ty)?);
                    }
                }
                ColumnKind::External(codec) => {
                    let reference = write_extern(column, codec, value)?;
                    out.push(Value::String(reference));
                }
            }
        }
        Ok(out)
    }

    fn conform(&self, column: &str, value: Value, ty: ScalarType) -> Result<Value, DepcacheError> {
        let found = value.type_name();
        value.conform(ty).ok_or_else(|| {
            DepcacheError::schema(
                &self.table,
                format!("column {} has type {}, got {}", column, ty.as_str(), found),
            )
        })
    }

    /// Resolve a column selection to the physical columns to fetch.
    pub fn plan(&self, select: ColumnSelect<'_>) -> Result<ReadPlan, DepcacheError> {
        let (indices, unwrap): (Vec<usize>, bool) = match select {
            ColumnSelect::All => ((0..self.columns.len()).collect(), false),
            ColumnSelect::One(name) => (vec![self.index_of(name)?], true),
            ColumnSelect::Many(names) => (
                names
                    .iter()
                    .map(|name| self.index_of(name))
                    .collect::<Result<_, _>>()?,
                false,
            ),
        };

        let mut physical = Vec::new();
        let mut columns = Vec::with_capacity(indices.len());
        for idx in indices {
            let slot = match &self.slots[idx] {
                Slot::Scalar(p) => {
                    physical.push(self.physical[*p].name.clone());
                    Slot::Scalar(physical.len() - 1)
                }
                Slot::Extern(p) => {
                    physical.push(self.physical[*p].name.clone());
                    Slot::Extern(physical.len() - 1)
                }
                Slot::Nested(range) => {
                    let start = physical.len();
                    physical.extend(self.physical[range.clone()].iter().map(|c| c.name.clone()));
                    Slot::Nested(start..physical.len())
                }
            };
            columns.push((idx, slot));
        }

        Ok(ReadPlan {
            physical,
            columns,
            unwrap,
        })
    }

    fn index_of(&self, name: &str) -> Result<usize, DepcacheError> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DepcacheError::UnknownColumn {
                table: self.table.clone(),
                column: name.to_string(),
            })
    }

    /// Rebuild a logical value from one row of physical values fetched with
    /// `plan`.
    ///
    /// `read_extern` receives each external column with its stored reference.
    pub fn decode_row<F>(
        &self,
        plan: &ReadPlan,
        mut physical: Vec<Value>,
        mut read_extern: F,
    ) -> Result<Value, DepcacheError>
    where
        F: FnMut(&ColumnSpec, &Arc<dyn BlobCodec>, &str) -> Result<Value, DepcacheError>,
    {
        if physical.len() != plan.physical.len() {
            return Err(DepcacheError::schema(
                &self.table,
                format!(
                    "store returned {} columns, expected {}",
                    physical.len(),
                    plan.physical.len()
                ),
            ));
        }

        let mut values = Vec::with_capacity(plan.columns.len());
        for (idx, slot) in &plan.columns {
            let column = &self.columns[*idx];
            let value = match (slot, &column.kind) {
                (Slot::Scalar(p), _) => std::mem::replace(&mut physical[*p], Value::Null),
                (Slot::Nested(range), _) => Value::Tuple(
                    physical[range.clone()]
                        .iter_mut()
                        .map(|v| std::mem::replace(v, Value::Null))
                        .collect(),
                ),
                (Slot::Extern(p), ColumnKind::External(codec)) => match &physical[*p] {
                    Value::String(reference) => read_extern(column, codec, reference)?,
                    Value::Null => Value::Null,
                    other => {
                        return Err(DepcacheError::schema(
                            &self.table,
                            format!(
                                "external column {} holds {} instead of a reference",
                                column.name,
                                other.type_name()
                            ),
                        ));
                    }
                },
                (Slot::Extern(_), _) => {
                    return Err(DepcacheError::schema(
                        &self.table,
                        format!("column {} is not external", column.name),
                    ));
                }
            };
            values.push(value);
        }

        if plan.unwrap {
            Ok(values.pop().unwrap_or(Value::Null))
        } else {
            Ok(Value::Tuple(values))
        }
    }
}

impl fmt::Debug for ColumnCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnCodec")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("physical", &self.physical)
            .finish()
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Tuple(items) => format!("a tuple of width {}", items.len()),
        other => other.type_name().to_string(),
    }
}
