//! MySQL driver backed by `mysql_async`.
//!
//! Accepts `jdbc:mysql://host:port/database` URLs. Queries run over the text
//! protocol, so values arrive as strings and are typed from the column
//! metadata.
//!
//! Connection arguments honoured by the driver:
//! - `allowMultiQueries`: `;`-separated scripts are rejected unless `true`
//! - `maxRows`: query results are cut after this many rows, `0` for no limit
//! - `autoReconnect`: after a lost connection the failing statement errors
//!   and the next one runs on a fresh connection

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, DriverError, Opts, OptsBuilder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::descriptor::{Properties, PASSWORD_KEY, USER_KEY};
use crate::dialect::keys;
use crate::driver::{parse_jdbc_url, Driver, DriverClass};
use crate::error::{Error, Result};
use crate::record::TypedValue;
use crate::security::statement_count;
use crate::types::{ColumnDescriptor, ResultSet, Row, SqlType, Value};

/// URL prefix handled by [`MySqlDriver`]
pub const URL_PREFIX: &str = "jdbc:mysql:";

/// Class name reported by [`MySqlDriverClass`]
pub const CLASS_NAME: &str = "com.mysql.cj.jdbc.Driver";

/// Character set id MySQL reports for binary columns
const BINARY_CHARSET: u16 = 63;

pub(crate) fn connect_options(url: &str, properties: &Properties) -> Result<OptsBuilder> {
    let parsed = parse_jdbc_url(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::connection(format!("Missing host in {}", url)))?;
    let database = parsed.path().trim_start_matches('/');

    Ok(OptsBuilder::default()
        .ip_or_hostname(host.to_string())
        .tcp_port(parsed.port().unwrap_or(3306))
        .db_name((!database.is_empty()).then(|| database.to_string()))
        .user(properties.get(USER_KEY).map(str::to_string))
        .pass(properties.get(PASSWORD_KEY).map(str::to_string)))
}

/// Driver-side behaviour selected by connection arguments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SessionSettings {
    allow_multi_queries: bool,
    max_rows: Option<usize>,
    auto_reconnect: bool,
}

impl SessionSettings {
    pub(crate) fn from_properties(properties: &Properties) -> Result<Self> {
        let max_rows = match properties.get_ignore_case(keys::MAX_ROWS) {
            None => None,
            Some(v) => match v.trim().parse::<usize>() {
                Ok(0) => None,
                Ok(n) => Some(n),
                Err(_) => {
                    return Err(Error::config(format!(
                        "'{}' must be a non-negative integer, got '{}'",
                        keys::MAX_ROWS,
                        v
                    )))
                }
            },
        };
        Ok(Self {
            allow_multi_queries: bool_argument(properties, keys::ALLOW_MULTI_QUERIES)?,
            max_rows,
            auto_reconnect: bool_argument(properties, keys::AUTO_RECONNECT)?,
        })
    }

    fn check_statement(&self, sql: &str) -> Result<()> {
        if !self.allow_multi_queries && statement_count(sql) > 1 {
            return Err(Error::statement(
                format!("Multiple statements require {}=true", keys::ALLOW_MULTI_QUERIES),
                sql,
            ));
        }
        Ok(())
    }
}

fn bool_argument(properties: &Properties, key: &str) -> Result<bool> {
    match properties.get_ignore_case(key).map(str::trim) {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) => Err(Error::config(format!(
            "'{}' must be true or false, got '{}'",
            key, v
        ))),
    }
}

fn is_connection_lost(e: &mysql_async::Error) -> bool {
    matches!(
        e,
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(DriverError::ConnectionClosed)
    )
}

/// MySQL driver
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDriver;

#[async_trait]
impl Driver for MySqlDriver {
    fn name(&self) -> &str {
        "mysql"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with(URL_PREFIX)
    }

    async fn connect(&self, url: &str, properties: &Properties) -> Result<Box<dyn Connection>> {
        let settings = SessionSettings::from_properties(properties)?;
        let opts: Opts = connect_options(url, properties)?.into();
        let conn = Conn::new(opts.clone())
            .await
            .map_err(|e| Error::connection_with_source(format!("Failed to connect to {}", url), e))?;
        debug!(url = %url, ?settings, "Opened MySQL connection");
        Ok(Box::new(MySqlConnection::new(conn, opts, settings)))
    }
}

/// Loadable class for [`MySqlDriver`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDriverClass;

impl DriverClass for MySqlDriverClass {
    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn instantiate(&self) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(MySqlDriver))
    }
}

fn column_sql_type(column_type: ColumnType, binary: bool) -> SqlType {
    match column_type {
        ColumnType::MYSQL_TYPE_BIT => SqlType::BIT,
        ColumnType::MYSQL_TYPE_TINY => SqlType::TINYINT,
        ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => SqlType::SMALLINT,
        ColumnType::MYSQL_TYPE_LONG | ColumnType::MYSQL_TYPE_INT24 => SqlType::INTEGER,
        ColumnType::MYSQL_TYPE_LONGLONG => SqlType::BIGINT,
        ColumnType::MYSQL_TYPE_FLOAT => SqlType::REAL,
        ColumnType::MYSQL_TYPE_DOUBLE => SqlType::DOUBLE,
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => SqlType::DECIMAL,
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => SqlType::DATE,
        ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => SqlType::TIME,
        ColumnType::MYSQL_TYPE_DATETIME
        | ColumnType::MYSQL_TYPE_DATETIME2
        | ColumnType::MYSQL_TYPE_TIMESTAMP
        | ColumnType::MYSQL_TYPE_TIMESTAMP2 => SqlType::TIMESTAMP,
        ColumnType::MYSQL_TYPE_NULL => SqlType::NULL,
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB => {
            if binary {
                SqlType::BLOB
            } else {
                SqlType::LONGVARCHAR
            }
        }
        ColumnType::MYSQL_TYPE_VARCHAR
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_ENUM
        | ColumnType::MYSQL_TYPE_SET
        | ColumnType::MYSQL_TYPE_JSON => {
            if binary {
                SqlType::VARBINARY
            } else {
                SqlType::VARCHAR
            }
        }
        _ => SqlType::OTHER,
    }
}

fn mysql_value_to_value(value: mysql_async::Value, sql_type: SqlType) -> Value {
    let raw = match value {
        mysql_async::Value::NULL => return Value::Null,
        mysql_async::Value::Bytes(b) if sql_type.is_textual() || !is_binary(sql_type) => {
            match String::from_utf8(b) {
                Ok(s) => Value::String(s),
                Err(e) => Value::Bytes(e.into_bytes()),
            }
        }
        mysql_async::Value::Bytes(b) => return Value::Bytes(b),
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => match i64::try_from(n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::String(n.to_string()),
        },
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(y, mo, d, h, mi, s, us) => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        mysql_async::Value::Time(neg, days, h, mi, s, us) => Value::String(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if neg { "-" } else { "" },
            days * 24 + u32::from(h),
            mi,
            s,
            us
        )),
    };
    TypedValue::new(raw.clone(), sql_type).bind_value().unwrap_or(raw)
}

fn is_binary(sql_type: SqlType) -> bool {
    matches!(
        sql_type,
        SqlType::BINARY | SqlType::VARBINARY | SqlType::LONGVARBINARY | SqlType::BLOB
    )
}

/// Connection over a single `mysql_async` connection
pub struct MySqlConnection {
    conn: Mutex<Option<Conn>>,
    opts: Opts,
    settings: SessionSettings,
    closed: AtomicBool,
}

impl MySqlConnection {
    pub(crate) fn new(conn: Conn, opts: Opts, settings: SessionSettings) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            opts,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    fn closed_error() -> Error {
        Error::connection("connection is closed")
    }

    /// Replace a lost connection when `autoReconnect` is set
    async fn recover(&self, slot: &mut Option<Conn>, error: &mysql_async::Error) {
        if !self.settings.auto_reconnect || !is_connection_lost(error) {
            return;
        }
        match Conn::new(self.opts.clone()).await {
            Ok(conn) => {
                info!("Reconnected to MySQL");
                *slot = Some(conn);
            }
            Err(e) => {
                warn!(error = %e, "MySQL reconnect failed");
                *slot = None;
            }
        }
    }
}

async fn fetch(
    conn: &mut Conn,
    sql: &str,
    max_rows: Option<usize>,
) -> std::result::Result<ResultSet, mysql_async::Error> {
    let mut result = conn.query_iter(sql).await?;

    let columns: Vec<ColumnDescriptor> = result
        .columns()
        .map(|cols| {
            cols.iter()
                .map(|c| {
                    let binary = c.character_set() == BINARY_CHARSET;
                    ColumnDescriptor::new(
                        c.name_str().into_owned(),
                        column_sql_type(c.column_type(), binary),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut raw_rows: Vec<mysql_async::Row> = result.collect().await?;
    drop(result);
    if let Some(limit) = max_rows {
        raw_rows.truncate(limit);
    }

    let rows = raw_rows
        .iter()
        .map(|r| {
            let values = columns
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let raw = r.as_ref(i).cloned().unwrap_or(mysql_async::Value::NULL);
                    mysql_value_to_value(raw, c.sql_type)
                })
                .collect();
            Row::new(names.clone(), values)
        })
        .collect();
    Ok(ResultSet::new(columns, rows))
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        self.settings.check_statement(sql)?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed_error)?;

        let outcome = fetch(conn, sql, self.settings.max_rows).await;
        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                self.recover(&mut guard, &e).await;
                Err(Error::statement_with_source("Query failed", sql, e))
            }
        }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        self.settings.check_statement(sql)?;
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::closed_error)?;

        let outcome = conn.query_drop(sql).await;
        match outcome {
            Ok(()) => Ok(conn.affected_rows()),
            Err(e) => {
                self.recover(&mut guard, &e).await;
                Err(Error::statement_with_source("Statement failed", sql, e))
            }
        }
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.conn.lock().await;
        let valid = match guard.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };
        valid
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err(e) = conn.disconnect().await {
                warn!(error = %e, "MySQL disconnect failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_url() {
        assert!(MySqlDriver.accepts_url("jdbc:mysql://localhost:3306/app"));
        assert!(!MySqlDriver.accepts_url("jdbc:postgresql://localhost/app"));
    }

    #[test]
    fn test_connect_options() {
        let props = Properties::new().with("user", "root").with("password", "pw");
        let opts: mysql_async::Opts =
            connect_options("jdbc:mysql://db:3307/shop", &props).unwrap().into();
        assert_eq!(opts.ip_or_hostname(), "db");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.db_name(), Some("shop"));
        assert_eq!(opts.user(), Some("root"));
    }

    #[test]
    fn test_session_settings() {
        let props = Properties::new()
            .with("allowMultiQueries", "TRUE")
            .with("maxRows", "10")
            .with("autoReconnect", "false");
        let settings = SessionSettings::from_properties(&props).unwrap();
        assert!(settings.allow_multi_queries);
        assert_eq!(settings.max_rows, Some(10));
        assert!(!settings.auto_reconnect);
        assert!(settings.check_statement("DELETE FROM a; DELETE FROM b").is_ok());

        let unlimited = Properties::new().with("maxRows", "0");
        assert_eq!(SessionSettings::from_properties(&unlimited).unwrap().max_rows, None);
    }

    #[test]
    fn test_multi_statements_need_opt_in() {
        let settings = SessionSettings::from_properties(&Properties::new()).unwrap();
        assert!(settings.check_statement("DELETE FROM a;").is_ok());
        let err = settings
            .check_statement("DELETE FROM a; DELETE FROM b")
            .unwrap_err();
        assert!(matches!(err, Error::StatementExecution { .. }));
        assert!(err.to_string().contains("allowMultiQueries"));
    }

    #[test]
    fn test_invalid_session_arguments() {
        for (key, value) in [("maxRows", "-1"), ("maxRows", "ten"), ("autoReconnect", "yes")] {
            let props = Properties::new().with(key, value);
            assert!(matches!(
                SessionSettings::from_properties(&props),
                Err(Error::Configuration { .. })
            ));
        }
    }

    #[test]
    fn test_column_types() {
        assert_eq!(column_sql_type(ColumnType::MYSQL_TYPE_LONG, false), SqlType::INTEGER);
        assert_eq!(column_sql_type(ColumnType::MYSQL_TYPE_VAR_STRING, false), SqlType::VARCHAR);
        assert_eq!(column_sql_type(ColumnType::MYSQL_TYPE_VAR_STRING, true), SqlType::VARBINARY);
        assert_eq!(column_sql_type(ColumnType::MYSQL_TYPE_BLOB, false), SqlType::LONGVARCHAR);
    }

    #[test]
    fn test_text_values_are_typed() {
        let v = mysql_value_to_value(mysql_async::Value::Bytes(b"42".to_vec()), SqlType::INTEGER);
        assert_eq!(v, Value::Int32(42));

        let v = mysql_value_to_value(
            mysql_async::Value::Bytes(b"2024-03-01".to_vec()),
            SqlType::DATE,
        );
        assert_eq!(v.as_string().as_deref(), Some("2024-03-01"));

        let v = mysql_value_to_value(mysql_async::Value::Bytes(vec![0xff, 0x00]), SqlType::BLOB);
        assert_eq!(v, Value::Bytes(vec![0xff, 0x00]));
        assert_eq!(mysql_value_to_value(mysql_async::Value::NULL, SqlType::VARCHAR), Value::Null);
    }
}
