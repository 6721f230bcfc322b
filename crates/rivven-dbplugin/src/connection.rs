//! Connection traits for rivven-dbplugin
//!
//! - Connection: statement execution against one open session
//! - IsolationLevel: transaction isolation requested by sinks
//!
//! Connections are owned by one unit of work and never shared; every call is
//! awaited to completion before the next one is issued.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::dialect::DialectStrategy;
use crate::error::{Error, Result};
use crate::types::{ResultSet, Row};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows. Column metadata is populated even
    /// when no rows come back.
    async fn query(&self, sql: &str) -> Result<ResultSet>;

    /// Execute a statement, returns affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a query and return the first row
    async fn query_one(&self, sql: &str) -> Result<Option<Row>> {
        let result = self.query(sql).await?;
        Ok(result.rows.into_iter().next())
    }

    /// Check whether a possibly schema-qualified table exists
    async fn table_exists(&self, dialect: &dyn DialectStrategy, table_name: &str) -> Result<bool> {
        let sql = dialect.table_exists_query(table_name);
        Ok(!self.query(&sql).await?.is_empty())
    }

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Transaction isolation levels, named after the JDBC constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
pub enum IsolationLevel {
    /// No transactions
    #[serde(rename = "TRANSACTION_NONE")]
    None,
    /// Dirty reads possible
    #[serde(rename = "TRANSACTION_READ_UNCOMMITTED")]
    ReadUncommitted,
    /// No dirty reads
    #[serde(rename = "TRANSACTION_READ_COMMITTED")]
    ReadCommitted,
    /// No non-repeatable reads
    #[serde(rename = "TRANSACTION_REPEATABLE_READ")]
    RepeatableRead,
    /// Full isolation
    #[default]
    #[serde(rename = "TRANSACTION_SERIALIZABLE")]
    Serializable,
}

impl IsolationLevel {
    /// Configuration name, e.g. `TRANSACTION_SERIALIZABLE`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "TRANSACTION_NONE",
            Self::ReadUncommitted => "TRANSACTION_READ_UNCOMMITTED",
            Self::ReadCommitted => "TRANSACTION_READ_COMMITTED",
            Self::RepeatableRead => "TRANSACTION_REPEATABLE_READ",
            Self::Serializable => "TRANSACTION_SERIALIZABLE",
        }
    }

    /// JDBC integer code
    pub fn code(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::ReadUncommitted => 1,
            Self::ReadCommitted => 2,
            Self::RepeatableRead => 4,
            Self::Serializable => 8,
        }
    }

    /// SQL for `SET TRANSACTION ISOLATION LEVEL`, `None` has no SQL form
    pub fn to_sql(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::Serializable => Some("SERIALIZABLE"),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRANSACTION_NONE" => Ok(Self::None),
            "TRANSACTION_READ_UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "TRANSACTION_READ_COMMITTED" => Ok(Self::ReadCommitted),
            "TRANSACTION_REPEATABLE_READ" => Ok(Self::RepeatableRead),
            "TRANSACTION_SERIALIZABLE" => Ok(Self::Serializable),
            other => Err(Error::config(format!(
                "Unknown transaction isolation level '{}'",
                other
            ))),
        }
    }
}
