#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int64,
    Float64,
    Utf8,
    Bytes,
    Array,
    Map,
    Struct,
}

/// One value carried by a source record.
///
/// The text form (`Display` / [`FieldValue::to_text`]) is what the verifier
/// compares, so it must never depend on pointer identity or locale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
    Struct(StructRecord),
}

impl FieldValue {
    /// `None` for nulls, which carry no type of their own.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(FieldType::Bool),
            Self::Int64(_) => Some(FieldType::Int64),
            Self::Float64(_) => Some(FieldType::Float64),
            Self::Utf8(_) => Some(FieldType::Utf8),
            Self::Bytes(_) => Some(FieldType::Bytes),
            Self::Array(_) => Some(FieldType::Array),
            Self::Map(_) => Some(FieldType::Map),
            Self::Struct(_) => Some(FieldType::Struct),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => f.write_str(v),
            Self::Bytes(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::Array(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (idx, (key, value)) in entries.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}={value}")?;
                }
                f.write_str("}")
            }
            Self::Struct(record) => write!(f, "{record}"),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int64(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub optional: bool,
}

impl FieldDescriptor {
    #[must_use]
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: false,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            optional: true,
        }
    }
}

/// Ordered field list with unique names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldDescriptor>", into = "Vec<FieldDescriptor>")]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    pub fn new(fields: Vec<FieldDescriptor>) -> Result<Self, TypeError> {
        let mut seen = BTreeSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(TypeError::DuplicateField {
                    name: field.name.clone(),
                });
            }
        }
        Ok(Self { fields })
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

impl TryFrom<Vec<FieldDescriptor>> for Schema {
    type Error = TypeError;

    fn try_from(fields: Vec<FieldDescriptor>) -> Result<Self, Self::Error> {
        Self::new(fields)
    }
}

impl From<Schema> for Vec<FieldDescriptor> {
    fn from(schema: Schema) -> Self {
        schema.fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StructRecordParts {
    schema: Schema,
    values: Vec<FieldValue>,
}

/// A schema-typed record: values line up positionally with the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StructRecordParts", into = "StructRecordParts")]
pub struct StructRecord {
    schema: Schema,
    values: Vec<FieldValue>,
}

impl StructRecord {
    pub fn new(schema: Schema, values: Vec<FieldValue>) -> Result<Self, TypeError> {
        if schema.len() != values.len() {
            return Err(TypeError::ArityMismatch {
                expected: schema.len(),
                actual: values.len(),
            });
        }

        for (field, value) in schema.fields().iter().zip(&values) {
            match value.field_type() {
                None if field.optional => {}
                None => {
                    return Err(TypeError::NullInRequiredField {
                        field: field.name.clone(),
                    });
                }
                Some(actual) if actual != field.field_type => {
                    return Err(TypeError::FieldTypeMismatch {
                        field: field.name.clone(),
                        expected: field.field_type,
                        actual,
                    });
                }
                Some(_) => {}
            }
        }

        Ok(Self { schema, values })
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[must_use]
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema.index_of(name).map(|idx| &self.values[idx])
    }

    /// Fields in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name.as_str())
            .zip(self.values.iter())
    }
}

impl fmt::Display for StructRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Struct{")?;
        for (idx, (name, value)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

impl TryFrom<StructRecordParts> for StructRecord {
    type Error = TypeError;

    fn try_from(parts: StructRecordParts) -> Result<Self, Self::Error> {
        Self::new(parts.schema, parts.values)
    }
}

impl From<StructRecord> for StructRecordParts {
    fn from(record: StructRecord) -> Self {
        Self {
            schema: record.schema,
            values: record.values,
        }
    }
}

/// One record as produced by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourceRecord {
    Flat(BTreeMap<String, FieldValue>),
    Structured(StructRecord),
}

impl SourceRecord {
    pub fn flat<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Flat(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Field name to text value. Duplicate names cannot occur: flat records
    /// are keyed maps and schemas reject duplicates.
    #[must_use]
    pub fn to_canonical_mapping(&self) -> BTreeMap<String, String> {
        match self {
            Self::Flat(entries) => entries
                .iter()
                .map(|(key, value)| (key.clone(), value.to_text()))
                .collect(),
            Self::Structured(record) => record
                .iter()
                .map(|(name, value)| (name.to_owned(), value.to_text()))
                .collect(),
        }
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        match self {
            Self::Flat(entries) => entries.len(),
            Self::Structured(record) => record.values().len(),
        }
    }
}

impl From<StructRecord> for SourceRecord {
    fn from(record: StructRecord) -> Self {
        Self::Structured(record)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("schema declares field {name:?} more than once")]
    DuplicateField { name: String },
    #[error("struct has {actual} values but schema declares {expected} fields")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("field {field:?} expects {expected:?} but value has type {actual:?}")]
    FieldTypeMismatch {
        field: String,
        expected: FieldType,
        actual: FieldType,
    },
    #[error("field {field:?} is required but value is null")]
    NullInRequiredField { field: String },
}
