//! Target-table column type resolution for sinks.
//!
//! A zero-row probe (`SELECT cols FROM table WHERE 1 = 0`) yields result
//! metadata only; the reported column types are collected into a
//! case-insensitive [`ColumnTypeMap`] and looked up for every column the
//! sink writes.

use std::collections::BTreeMap;
use tracing::debug;

use crate::connection::Connection;
use crate::dialect::DialectStrategy;
use crate::error::{Error, Result};
use crate::security::{validate_sql_identifier, validate_table_name};
use crate::types::{ColumnDescriptor, SqlType};

/// Case-insensitive column name to SQL type mapping, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnTypeMap {
    entries: BTreeMap<String, ColumnDescriptor>,
}

impl ColumnTypeMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from result-set column metadata
    pub fn from_columns(columns: impl IntoIterator<Item = ColumnDescriptor>) -> Self {
        let mut map = Self::new();
        for column in columns {
            map.insert(column);
        }
        map
    }

    /// Add a column; a later column with the same name (ignoring case) wins
    pub fn insert(&mut self, column: ColumnDescriptor) {
        self.entries.insert(column.name.to_lowercase(), column);
    }

    /// Type code for a column name, ignoring case
    pub fn get(&self, name: &str) -> Option<SqlType> {
        self.entries.get(&name.to_lowercase()).map(|c| c.sql_type)
    }

    /// Column metadata for a name, ignoring case
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.entries.get(&name.to_lowercase())
    }

    /// Whether a column is present
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Columns in case-insensitive name order
    pub fn iter(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.entries.values()
    }

    /// Types for `columns`, in the given order. A missing column is a
    /// schema mismatch naming that column.
    pub fn types_for(&self, table: &str, columns: &[String]) -> Result<Vec<SqlType>> {
        columns
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| Error::missing_column(table, name.as_str()))
            })
            .collect()
    }
}

/// Column list of a sink paired with the resolved types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumns {
    /// Target table
    pub table: String,
    /// Columns in write order
    pub columns: Vec<String>,
    /// Type code per column, same order
    pub types: Vec<SqlType>,
}

impl ResolvedColumns {
    /// Type code for a column, ignoring case
    pub fn type_of(&self, column: &str) -> Option<SqlType> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| self.types[i])
    }

    /// Iterate `(column, type)` pairs in write order
    pub fn iter(&self) -> impl Iterator<Item = (&str, SqlType)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.types.iter().copied())
    }
}

/// Resolves target column types through a probe query
#[derive(Debug)]
pub struct SchemaResolver<'a> {
    dialect: &'a dyn DialectStrategy,
}

impl<'a> SchemaResolver<'a> {
    /// Resolver issuing probes in the given dialect
    pub fn new(dialect: &'a dyn DialectStrategy) -> Self {
        Self { dialect }
    }

    /// Probe `table` and resolve the type of every column in `columns`
    pub async fn resolve(
        &self,
        connection: &dyn Connection,
        table: &str,
        columns: &[String],
    ) -> Result<ResolvedColumns> {
        validate_table_name(table)?;
        if columns.is_empty() {
            return Err(Error::config(format!("No columns to write to table '{}'", table)));
        }
        for column in columns {
            validate_sql_identifier(column)?;
        }

        let sql = self.dialect.probe_sql(table, columns);
        debug!(table = %table, sql = %sql, "Probing column metadata");
        let result = connection.query(&sql).await?;

        let map = ColumnTypeMap::from_columns(result.columns);
        let types = map.types_for(table, columns)?;
        debug!(table = %table, columns = columns.len(), "Resolved column types");

        Ok(ResolvedColumns {
            table: table.to_string(),
            columns: columns.to_vec(),
            types,
        })
    }
}
