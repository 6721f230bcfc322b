//! Record adapter between pipeline records and database rows
//!
//! Write direction: [`project`] narrows a [`StructuredRecord`] to the sink's
//! column list, then [`TypedRow`] pairs every value with the resolved SQL
//! type so drivers bind it correctly.
//!
//! Read direction: [`record_from_row`] turns a result row into a record
//! whose schema is derived from the result column types. The record model
//! has no temporal field types; dates and times are carried as ISO text.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::ColumnTypeMap;
use crate::types::{ColumnDescriptor, Row, SqlType, Value};

/// Field type in the pipeline record model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Boolean
    Boolean,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Arbitrary precision decimal
    Decimal,
    /// Text
    String,
    /// Binary
    Bytes,
}

impl FieldType {
    /// Record field type for a column type
    pub fn from_sql_type(sql_type: SqlType) -> Self {
        match sql_type {
            SqlType::BIT | SqlType::BOOLEAN => Self::Boolean,
            SqlType::TINYINT | SqlType::SMALLINT | SqlType::INTEGER => Self::Int,
            SqlType::BIGINT => Self::Long,
            SqlType::REAL => Self::Float,
            SqlType::FLOAT | SqlType::DOUBLE => Self::Double,
            SqlType::NUMERIC | SqlType::DECIMAL => Self::Decimal,
            SqlType::BINARY | SqlType::VARBINARY | SqlType::LONGVARBINARY | SqlType::BLOB => {
                Self::Bytes
            }
            _ => Self::String,
        }
    }

    /// Convert a driver value to this field type's canonical value
    pub fn convert(self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let converted = match self {
            Self::Boolean => value.as_bool().map(Value::Bool),
            Self::Int => value
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Value::Int32),
            Self::Long => value.as_i64().map(Value::Int64),
            Self::Float => value.as_f64().map(|f| Value::Float32(f as f32)),
            Self::Double => value.as_f64().map(Value::Float64),
            Self::Decimal => to_decimal(&value).map(Value::Decimal),
            Self::String => value.as_string().map(Value::String),
            Self::Bytes => match &value {
                Value::Bytes(b) => Some(Value::Bytes(b.clone())),
                other => other.as_string().map(|s| Value::Bytes(s.into_bytes())),
            },
        };
        converted.ok_or_else(|| {
            Error::type_conversion(format!("Cannot read {:?} as {:?}", value, self))
        })
    }
}

/// Named, typed field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether NULL is allowed
    pub nullable: bool,
}

impl Field {
    /// Nullable field
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
        }
    }

    /// Non-nullable field
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
        }
    }
}

/// Record schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name
    pub name: String,
    /// Fields in order
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a schema
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Derive a schema from result-set column metadata
    pub fn from_columns(name: impl Into<String>, columns: &[ColumnDescriptor]) -> Self {
        let fields = columns
            .iter()
            .map(|c| Field::nullable(c.name.clone(), FieldType::from_sql_type(c.sql_type)))
            .collect();
        Self::new(name, fields)
    }

    /// Position of a field
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Field by name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in order
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// A record with a schema
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRecord {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl StructuredRecord {
    /// Start building a record; unset fields are NULL
    pub fn builder(schema: Arc<Schema>) -> RecordBuilder {
        let values = vec![Value::Null; schema.fields.len()];
        RecordBuilder {
            schema,
            values,
            unknown: Vec::new(),
        }
    }

    /// Record schema
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Value of a field; `None` if the schema has no such field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    /// Values in schema order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// JSON object keyed by field name
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .schema
            .fields
            .iter()
            .zip(&self.values)
            .map(|(f, v)| (f.name.clone(), value_to_json(v)))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Builder for [`StructuredRecord`]
#[derive(Debug)]
pub struct RecordBuilder {
    schema: Arc<Schema>,
    values: Vec<Value>,
    unknown: Vec<String>,
}

impl RecordBuilder {
    /// Set a field value
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        match self.schema.index_of(name) {
            Some(i) => self.values[i] = value.into(),
            None => self.unknown.push(name.to_string()),
        }
        self
    }

    /// Build, rejecting unknown fields and NULLs in non-nullable fields
    pub fn build(self) -> Result<StructuredRecord> {
        if let Some(name) = self.unknown.first() {
            return Err(Error::schema(format!(
                "Field '{}' is not in schema '{}'",
                name, self.schema.name
            )));
        }
        for (field, value) in self.schema.fields.iter().zip(&self.values) {
            if !field.nullable && value.is_null() {
                return Err(Error::missing_field(field.name.clone()));
            }
        }
        Ok(StructuredRecord {
            schema: self.schema,
            values: self.values,
        })
    }
}

/// Keep only `columns`, in that order. A column the record's schema
/// lacks is a missing-field error.
pub fn project(record: &StructuredRecord, columns: &[String]) -> Result<Row> {
    let values = columns
        .iter()
        .map(|c| {
            record
                .get(c)
                .cloned()
                .ok_or_else(|| Error::missing_field(c.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns.to_vec(), values))
}

/// A value paired with the SQL type of its target column
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    /// Raw value
    pub value: Value,
    /// Target column type
    pub sql_type: SqlType,
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok()
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Decimal(d) => Some(*d),
        Value::Float32(f) => Decimal::from_f32(*f),
        Value::Float64(f) => Decimal::from_f64(*f),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        other => other.as_i64().map(Decimal::from),
    }
}

impl TypedValue {
    /// Pair a value with a type
    pub fn new(value: Value, sql_type: SqlType) -> Self {
        Self { value, sql_type }
    }

    /// The value coerced to what the column type expects
    pub fn bind_value(&self) -> Result<Value> {
        let v = &self.value;
        if v.is_null() {
            return Ok(Value::Null);
        }

        let bound = match self.sql_type {
            SqlType::BIT | SqlType::BOOLEAN => v.as_bool().map(Value::Bool),
            SqlType::TINYINT => v.as_i64().and_then(|n| i8::try_from(n).ok()).map(Value::Int8),
            SqlType::SMALLINT => v.as_i64().and_then(|n| i16::try_from(n).ok()).map(Value::Int16),
            SqlType::INTEGER => v.as_i64().and_then(|n| i32::try_from(n).ok()).map(Value::Int32),
            SqlType::BIGINT => v.as_i64().map(Value::Int64),
            SqlType::REAL => v.as_f64().map(|f| Value::Float32(f as f32)),
            SqlType::FLOAT | SqlType::DOUBLE => v.as_f64().map(Value::Float64),
            SqlType::NUMERIC | SqlType::DECIMAL => to_decimal(v).map(Value::Decimal),
            t if t.is_textual() => v.as_string().map(Value::String),
            SqlType::DATE => match v {
                Value::Date(d) => Some(Value::Date(*d)),
                Value::DateTime(dt) => Some(Value::Date(dt.date())),
                Value::String(s) => parse_date(s).map(Value::Date),
                _ => None,
            },
            SqlType::TIME | SqlType::TIME_WITH_TIMEZONE => match v {
                Value::Time(t) => Some(Value::Time(*t)),
                Value::DateTime(dt) => Some(Value::Time(dt.time())),
                Value::String(s) => parse_time(s).map(Value::Time),
                _ => None,
            },
            SqlType::TIMESTAMP => match v {
                Value::DateTime(dt) => Some(Value::DateTime(*dt)),
                Value::DateTimeTz(dt) => Some(Value::DateTime(dt.naive_utc())),
                Value::Date(d) => d.and_hms_opt(0, 0, 0).map(Value::DateTime),
                Value::String(s) => parse_timestamp(s).map(Value::DateTime),
                _ => None,
            },
            SqlType::TIMESTAMP_WITH_TIMEZONE => match v {
                Value::DateTimeTz(dt) => Some(Value::DateTimeTz(*dt)),
                Value::DateTime(dt) => Some(Value::DateTimeTz(dt.and_utc())),
                Value::String(s) => parse_timestamp(s).map(|dt| Value::DateTimeTz(dt.and_utc())),
                _ => None,
            },
            SqlType::BINARY | SqlType::VARBINARY | SqlType::LONGVARBINARY | SqlType::BLOB => {
                match v {
                    Value::Bytes(b) => Some(Value::Bytes(b.clone())),
                    Value::String(s) => Some(Value::Bytes(s.as_bytes().to_vec())),
                    _ => None,
                }
            }
            _ => Some(v.clone()),
        };

        bound.ok_or_else(|| {
            Error::type_conversion(format!("Cannot bind {:?} as {}", v, self.sql_type))
        })
    }
}

/// A projected row with a type per column
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow {
    columns: Vec<String>,
    values: Vec<TypedValue>,
}

impl TypedRow {
    /// Pair a projected row with types in column order
    pub fn new(row: Row, types: &[SqlType]) -> Result<Self> {
        if row.len() != types.len() {
            return Err(Error::schema(format!(
                "Row has {} columns but {} types were resolved",
                row.len(),
                types.len()
            )));
        }
        let (columns, values) = row.into_parts();
        let values = values
            .into_iter()
            .zip(types.iter().copied())
            .map(|(v, t)| TypedValue::new(v, t))
            .collect();
        Ok(Self { columns, values })
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Typed values
    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    /// Resolved types in column order
    pub fn types(&self) -> Vec<SqlType> {
        self.values.iter().map(|v| v.sql_type).collect()
    }

    /// Values coerced for binding
    pub fn bind_values(&self) -> Result<Vec<Value>> {
        self.values.iter().map(TypedValue::bind_value).collect()
    }
}

/// Pair each value of a projected row with its column's type
pub fn to_typed_row(row: Row, types: &ColumnTypeMap, table: &str) -> Result<TypedRow> {
    let resolved = types.types_for(table, row.columns())?;
    TypedRow::new(row, &resolved)
}

/// Convert a result row into a record of `schema`
pub fn record_from_row(row: Row, schema: &Arc<Schema>) -> Result<StructuredRecord> {
    let (_, values) = row.into_parts();
    if values.len() != schema.fields.len() {
        return Err(Error::schema(format!(
            "Row has {} values but schema '{}' has {} fields",
            values.len(),
            schema.name,
            schema.fields.len()
        )));
    }
    let values = schema
        .fields
        .iter()
        .zip(values)
        .map(|(field, value)| field.field_type.convert(value))
        .collect::<Result<Vec<_>>>()?;
    Ok(StructuredRecord {
        schema: Arc::clone(schema),
        values,
    })
}

/// JSON rendering of a value
pub fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        Value::Null => J::Null,
        Value::Bool(b) => J::Bool(*b),
        Value::Int8(n) => J::from(*n),
        Value::Int16(n) => J::from(*n),
        Value::Int32(n) => J::from(*n),
        Value::Int64(n) => J::from(*n),
        Value::Float32(f) => J::from(f64::from(*f)),
        Value::Float64(f) => J::from(*f),
        Value::Json(j) => j.clone(),
        Value::Bytes(b) => J::Array(b.iter().map(|x| J::from(*x)).collect()),
        other => other.as_string().map(J::String).unwrap_or(J::Null),
    }
}
