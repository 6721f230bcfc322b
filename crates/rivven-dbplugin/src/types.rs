//! Value types for rivven-dbplugin
//!
//! - `Value`: a database value as exchanged with drivers
//! - `SqlType`: numeric SQL type codes as reported by result metadata
//! - `Row` / `ResultSet`: query results with column metadata
//!
//! Type codes follow the `java.sql.Types` numbering so that codes reported
//! by JDBC-style drivers can be carried through unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// SQL value type that can hold any supported database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer (TINYINT)
    Int8(i8),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BYTEA, BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The SQL type a value of this kind is naturally bound as
    pub fn natural_type(&self) -> SqlType {
        match self {
            Self::Null => SqlType::NULL,
            Self::Bool(_) => SqlType::BOOLEAN,
            Self::Int8(_) => SqlType::TINYINT,
            Self::Int16(_) => SqlType::SMALLINT,
            Self::Int32(_) => SqlType::INTEGER,
            Self::Int64(_) => SqlType::BIGINT,
            Self::Float32(_) => SqlType::REAL,
            Self::Float64(_) => SqlType::DOUBLE,
            Self::Decimal(_) => SqlType::DECIMAL,
            Self::String(_) | Self::Uuid(_) | Self::Json(_) => SqlType::VARCHAR,
            Self::Bytes(_) => SqlType::VARBINARY,
            Self::Date(_) => SqlType::DATE,
            Self::Time(_) => SqlType::TIME,
            Self::DateTime(_) => SqlType::TIMESTAMP,
            Self::DateTimeTz(_) => SqlType::TIMESTAMP_WITH_TIMEZONE,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int8(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int8(n) => Some(f64::from(*n)),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render as text. `None` for NULL and binary values.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Null | Self::Bytes(_) => None,
            Self::String(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Int8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => Some(t.format("%H:%M:%S%.f").to_string()),
            Self::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Self::DateTimeTz(dt) => Some(dt.to_rfc3339()),
            Self::Uuid(u) => Some(u.to_string()),
            Self::Json(j) => Some(j.to_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Numeric SQL type code reported by result metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SqlType(pub i32);

#[allow(missing_docs)]
impl SqlType {
    pub const BIT: SqlType = SqlType(-7);
    pub const TINYINT: SqlType = SqlType(-6);
    pub const SMALLINT: SqlType = SqlType(5);
    pub const INTEGER: SqlType = SqlType(4);
    pub const BIGINT: SqlType = SqlType(-5);
    pub const FLOAT: SqlType = SqlType(6);
    pub const REAL: SqlType = SqlType(7);
    pub const DOUBLE: SqlType = SqlType(8);
    pub const NUMERIC: SqlType = SqlType(2);
    pub const DECIMAL: SqlType = SqlType(3);
    pub const CHAR: SqlType = SqlType(1);
    pub const VARCHAR: SqlType = SqlType(12);
    pub const LONGVARCHAR: SqlType = SqlType(-1);
    pub const NCHAR: SqlType = SqlType(-15);
    pub const NVARCHAR: SqlType = SqlType(-9);
    pub const LONGNVARCHAR: SqlType = SqlType(-16);
    pub const DATE: SqlType = SqlType(91);
    pub const TIME: SqlType = SqlType(92);
    pub const TIMESTAMP: SqlType = SqlType(93);
    pub const TIME_WITH_TIMEZONE: SqlType = SqlType(2013);
    pub const TIMESTAMP_WITH_TIMEZONE: SqlType = SqlType(2014);
    pub const BINARY: SqlType = SqlType(-2);
    pub const VARBINARY: SqlType = SqlType(-3);
    pub const LONGVARBINARY: SqlType = SqlType(-4);
    pub const NULL: SqlType = SqlType(0);
    pub const OTHER: SqlType = SqlType(1111);
    pub const BLOB: SqlType = SqlType(2004);
    pub const CLOB: SqlType = SqlType(2005);
    pub const NCLOB: SqlType = SqlType(2011);
    pub const BOOLEAN: SqlType = SqlType(16);
}

impl SqlType {
    /// Raw type code
    #[inline]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Standard name of the type code
    pub fn name(self) -> &'static str {
        match self {
            Self::BIT => "BIT",
            Self::TINYINT => "TINYINT",
            Self::SMALLINT => "SMALLINT",
            Self::INTEGER => "INTEGER",
            Self::BIGINT => "BIGINT",
            Self::FLOAT => "FLOAT",
            Self::REAL => "REAL",
            Self::DOUBLE => "DOUBLE",
            Self::NUMERIC => "NUMERIC",
            Self::DECIMAL => "DECIMAL",
            Self::CHAR => "CHAR",
            Self::VARCHAR => "VARCHAR",
            Self::LONGVARCHAR => "LONGVARCHAR",
            Self::NCHAR => "NCHAR",
            Self::NVARCHAR => "NVARCHAR",
            Self::LONGNVARCHAR => "LONGNVARCHAR",
            Self::DATE => "DATE",
            Self::TIME => "TIME",
            Self::TIMESTAMP => "TIMESTAMP",
            Self::TIME_WITH_TIMEZONE => "TIME_WITH_TIMEZONE",
            Self::TIMESTAMP_WITH_TIMEZONE => "TIMESTAMP_WITH_TIMEZONE",
            Self::BINARY => "BINARY",
            Self::VARBINARY => "VARBINARY",
            Self::LONGVARBINARY => "LONGVARBINARY",
            Self::NULL => "NULL",
            Self::BLOB => "BLOB",
            Self::CLOB => "CLOB",
            Self::NCLOB => "NCLOB",
            Self::BOOLEAN => "BOOLEAN",
            _ => "OTHER",
        }
    }

    /// Character types
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            Self::CHAR
                | Self::VARCHAR
                | Self::LONGVARCHAR
                | Self::NCHAR
                | Self::NVARCHAR
                | Self::LONGNVARCHAR
                | Self::CLOB
                | Self::NCLOB
        )
    }

    /// Exact and approximate numeric types
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::TINYINT
                | Self::SMALLINT
                | Self::INTEGER
                | Self::BIGINT
                | Self::FLOAT
                | Self::REAL
                | Self::DOUBLE
                | Self::NUMERIC
                | Self::DECIMAL
        )
    }

    /// Date and time types
    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            Self::DATE
                | Self::TIME
                | Self::TIMESTAMP
                | Self::TIME_WITH_TIMEZONE
                | Self::TIMESTAMP_WITH_TIMEZONE
        )
    }

    /// Map a vendor type name (as reported by native drivers) to a type code
    pub fn from_type_name(type_name: &str) -> Self {
        let upper = type_name.trim().to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "BIT" => Self::BIT,
            "BOOL" | "BOOLEAN" => Self::BOOLEAN,
            "TINYINT" | "INT1" => Self::TINYINT,
            "SMALLINT" | "INT2" | "SMALLSERIAL" => Self::SMALLINT,
            "INT" | "INTEGER" | "INT4" | "MEDIUMINT" | "SERIAL" => Self::INTEGER,
            "BIGINT" | "INT8" | "BIGSERIAL" => Self::BIGINT,
            "FLOAT" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => Self::DOUBLE,
            "REAL" | "FLOAT4" => Self::REAL,
            "NUMERIC" | "NUMBER" => Self::NUMERIC,
            "DECIMAL" | "MONEY" | "SMALLMONEY" => Self::DECIMAL,
            "CHAR" | "BPCHAR" | "CHARACTER" => Self::CHAR,
            "VARCHAR" | "VARCHAR2" | "CHARACTER VARYING" | "UUID" | "UNIQUEIDENTIFIER"
            | "JSON" | "JSONB" | "ENUM" => Self::VARCHAR,
            "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "TINYTEXT" => Self::LONGVARCHAR,
            "NCHAR" => Self::NCHAR,
            "NVARCHAR" | "NVARCHAR2" => Self::NVARCHAR,
            "NTEXT" => Self::LONGNVARCHAR,
            "DATE" => Self::DATE,
            "TIME" => Self::TIME,
            "TIMETZ" | "TIME WITH TIME ZONE" => Self::TIME_WITH_TIMEZONE,
            "TIMESTAMP" | "DATETIME" | "DATETIME2" | "SMALLDATETIME"
            | "TIMESTAMP WITHOUT TIME ZONE" => Self::TIMESTAMP,
            "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" | "DATETIMEOFFSET" => {
                Self::TIMESTAMP_WITH_TIMEZONE
            }
            "BINARY" => Self::BINARY,
            "VARBINARY" | "BYTEA" | "RAW" => Self::VARBINARY,
            "IMAGE" | "LONGBLOB" | "MEDIUMBLOB" => Self::LONGVARBINARY,
            "BLOB" | "TINYBLOB" => Self::BLOB,
            "CLOB" => Self::CLOB,
            "NCLOB" => Self::NCLOB,
            _ => Self::OTHER,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Result column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Column name as reported by the driver
    pub name: String,
    /// Type code
    pub sql_type: SqlType,
    /// Vendor type name, when the driver reports one
    pub type_name: Option<String>,
}

impl ColumnDescriptor {
    /// Create column metadata
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            type_name: None,
        }
    }

    /// Attach the vendor type name
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Split into columns and values
    pub fn into_parts(self) -> (Vec<String>, Vec<Value>) {
        (self.columns, self.values)
    }

    /// Convert row to HashMap
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// Query result: column metadata plus materialized rows
///
/// Metadata is present even when no rows matched, which is what the
/// zero-row schema probe relies on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column metadata in select-list order
    pub columns: Vec<ColumnDescriptor>,
    /// Result rows
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Create a result set
    pub fn new(columns: Vec<ColumnDescriptor>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Number of rows
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in select-list order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
