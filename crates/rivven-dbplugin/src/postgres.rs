//! PostgreSQL driver backed by `tokio-postgres`.
//!
//! Accepts `jdbc:postgresql://host:port/database` URLs. Credentials come from
//! the `user` and `password` properties; `connectionTimeout` is read in
//! seconds.
//!
//! Result columns must have a type the driver can decode. Others, such as
//! `interval`, `inet` or arrays, fail the query with a type conversion error
//! and can be selected with a `::text` cast instead.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error};

use crate::connection::Connection;
use crate::descriptor::{Properties, PASSWORD_KEY, USER_KEY};
use crate::dialect::keys;
use crate::driver::{parse_jdbc_url, Driver, DriverClass};
use crate::error::{Error, Result};
use crate::types::{ColumnDescriptor, ResultSet, Row, SqlType, Value};

/// URL prefix handled by [`PgDriver`]
pub const URL_PREFIX: &str = "jdbc:postgresql:";

/// Class name reported by [`PgDriverClass`]
pub const CLASS_NAME: &str = "org.postgresql.Driver";

/// Build the native client configuration from a URL and properties
pub(crate) fn client_config(url: &str, properties: &Properties) -> Result<tokio_postgres::Config> {
    let parsed = parse_jdbc_url(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::connection(format!("Missing host in {}", url)))?;

    let mut config = tokio_postgres::Config::new();
    config.host(host);
    config.port(parsed.port().unwrap_or(5432));

    let database = parsed.path().trim_start_matches('/');
    if !database.is_empty() {
        config.dbname(database);
    }
    if let Some(user) = properties.get(USER_KEY) {
        config.user(user);
    }
    if let Some(password) = properties.get(PASSWORD_KEY) {
        config.password(password);
    }
    if let Some(timeout) = properties.get(keys::CONNECTION_TIMEOUT) {
        let secs: u64 = timeout.parse().map_err(|_| {
            Error::config(format!("'{}' must be a number of seconds", keys::CONNECTION_TIMEOUT))
        })?;
        config.connect_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

/// PostgreSQL driver
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDriver;

#[async_trait]
impl Driver for PgDriver {
    fn name(&self) -> &str {
        "postgresql"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with(URL_PREFIX)
    }

    async fn connect(&self, url: &str, properties: &Properties) -> Result<Box<dyn Connection>> {
        let config = client_config(url, properties)?;
        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| Error::connection_with_source(format!("Failed to connect to {}", url), e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        debug!(url = %url, "Opened PostgreSQL connection");
        Ok(Box::new(PgConnection::new(client)))
    }
}

/// Loadable class for [`PgDriver`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDriverClass;

impl DriverClass for PgDriverClass {
    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn instantiate(&self) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(PgDriver))
    }
}

/// Whether values of this type decode natively
fn decodable(pg_type: &Type) -> bool {
    match *pg_type {
        Type::BOOL
        | Type::INT2
        | Type::INT4
        | Type::INT8
        | Type::FLOAT4
        | Type::FLOAT8
        | Type::NUMERIC
        | Type::BYTEA
        | Type::DATE
        | Type::TIME
        | Type::TIMESTAMP
        | Type::TIMESTAMPTZ
        | Type::UUID
        | Type::JSON
        | Type::JSONB => true,
        _ => <String as FromSql>::accepts(pg_type),
    }
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let column = row
            .columns()
            .get(idx)
            .map(|c| format!("'{}' of type {}", c.name(), c.type_()))
            .unwrap_or_else(|| idx.to_string());
        Error::type_conversion(format!("Cannot decode column {}: {}", column, e))
    })
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    let value = match *pg_type {
        Type::BOOL => get(row, idx)?.map(Value::Bool),
        Type::INT2 => get(row, idx)?.map(Value::Int16),
        Type::INT4 => get(row, idx)?.map(Value::Int32),
        Type::INT8 => get(row, idx)?.map(Value::Int64),
        Type::FLOAT4 => get(row, idx)?.map(Value::Float32),
        Type::FLOAT8 => get(row, idx)?.map(Value::Float64),
        Type::NUMERIC => get(row, idx)?.map(Value::Decimal),
        Type::BYTEA => get(row, idx)?.map(Value::Bytes),
        Type::DATE => get(row, idx)?.map(Value::Date),
        Type::TIME => get(row, idx)?.map(Value::Time),
        Type::TIMESTAMP => get(row, idx)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx)?.map(Value::DateTimeTz),
        Type::UUID => get(row, idx)?.map(Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx)?.map(Value::Json),
        _ => get(row, idx)?.map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Connection over a `tokio-postgres` client
pub struct PgConnection {
    client: Client,
    closed: AtomicBool,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        self.ensure_open()?;
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| Error::statement_with_source("Failed to prepare query", sql, e))?;

        let columns: Vec<ColumnDescriptor> = statement
            .columns()
            .iter()
            .map(|c| {
                ColumnDescriptor::new(c.name(), SqlType::from_type_name(c.type_().name()))
                    .with_type_name(c.type_().name())
            })
            .collect();
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        if let Some(c) = statement.columns().iter().find(|c| !decodable(c.type_())) {
            return Err(Error::type_conversion(format!(
                "Column '{}' has unsupported type {}; cast it to text",
                c.name(),
                c.type_()
            )));
        }

        let pg_rows = self
            .client
            .query(&statement, &[])
            .await
            .map_err(|e| Error::statement_with_source("Query failed", sql, e))?;

        let rows = pg_rows
            .iter()
            .map(|r| {
                let values = statement
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(i, c)| pg_value_to_value(r, i, c.type_()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Row::new(names.clone(), values))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ResultSet::new(columns, rows))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_open()?;
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| Error::statement_with_source("Statement failed", sql, e))?;

        Ok(messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum())
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_url() {
        assert!(PgDriver.accepts_url("jdbc:postgresql://localhost:5432/app"));
        assert!(!PgDriver.accepts_url("jdbc:mysql://localhost:3306/app"));
        assert_eq!(PgDriverClass.class_name(), "org.postgresql.Driver");
    }

    #[test]
    fn test_client_config() {
        let props = Properties::new()
            .with("user", "app")
            .with("password", "pw")
            .with("connectionTimeout", "5");
        let config = client_config("jdbc:postgresql://db.internal:6543/orders", &props).unwrap();
        assert_eq!(config.get_ports(), &[6543]);
        assert_eq!(config.get_dbname(), Some("orders"));
        assert_eq!(config.get_user(), Some("app"));
        assert_eq!(config.get_connect_timeout(), Some(&Duration::from_secs(5)));
    }

    #[test]
    fn test_decodable_types() {
        for t in [Type::INT4, Type::NUMERIC, Type::TIMESTAMPTZ, Type::JSONB, Type::TEXT] {
            assert!(decodable(&t), "{} should decode", t);
        }
        assert!(decodable(&Type::VARCHAR));
        assert!(decodable(&Type::NAME));
        for t in [Type::INTERVAL, Type::INET, Type::INT4_ARRAY, Type::MONEY] {
            assert!(!decodable(&t), "{} should be rejected", t);
        }
    }

    #[test]
    fn test_default_port() {
        let config = client_config("jdbc:postgresql://localhost/app", &Properties::new()).unwrap();
        assert_eq!(config.get_ports(), &[5432]);
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(client_config("postgresql://localhost/app", &Properties::new()).is_err());
        let props = Properties::new().with("connectionTimeout", "soon");
        assert!(client_config("jdbc:postgresql://localhost/app", &props).is_err());
    }
}
