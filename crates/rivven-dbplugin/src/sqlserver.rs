//! SQL Server driver and data source backed by `tiberius`.
//!
//! The driver accepts `jdbc:sqlserver://host:port;databaseName=db;k=v` URLs.
//! [`SqlServerDataSourceFactory`] serves the data-source path used for
//! authentication variants. Only SQL logins are available natively; the
//! Azure AD variants need a data source supplied by the engine.
//!
//! `instanceName` is resolved through the SQL Browser service unless the URL
//! names a port. `queryTimeout` bounds each statement in seconds; a
//! connection whose statement timed out is closed.

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnType, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::auth::{AuthMode, DataSource, DataSourceFactory};
use crate::connection::Connection;
use crate::descriptor::{Properties, SensitiveString, PASSWORD_KEY, USER_KEY};
use crate::dialect::keys;
use crate::driver::{Driver, DriverClass};
use crate::error::{Error, Result};
use crate::types::{ColumnDescriptor, ResultSet, Row, SqlType, Value};

/// URL prefix handled by [`SqlServerDriver`]
pub const URL_PREFIX: &str = "jdbc:sqlserver:";

/// Class name reported by [`SqlServerDriverClass`]
pub const CLASS_NAME: &str = "com.microsoft.sqlserver.jdbc.SQLServerDriver";

/// Class name reported by [`SqlServerDataSourceFactory`]
pub const DATA_SOURCE_CLASS_NAME: &str = "com.microsoft.sqlserver.jdbc.SQLServerDataSource";

const DEFAULT_PORT: u16 = 1433;
const DATABASE_NAME_KEY: &str = "databaseName";
const TRUST_CERT_KEY: &str = "trustServerCertificate";
const ENCRYPT_KEY: &str = "encrypt";

type TdsClient = Client<Compat<TcpStream>>;

/// Parts of a SQL Server connection URL
#[derive(Debug, Clone, PartialEq)]
pub struct SqlServerUrl {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// `key=value` segments after the address
    pub properties: Properties,
}

impl SqlServerUrl {
    /// Parse `jdbc:sqlserver://host[:port][;k=v]*`
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_PREFIX)
            .and_then(|r| r.strip_prefix("//"))
            .ok_or_else(|| Error::connection(format!("Not a SQL Server URL: {}", url)))?;

        let mut segments = rest.split(';');
        let address = segments.next().unwrap_or_default();
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::connection(format!("Invalid port in {}", url)))?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::connection(format!("Missing host in {}", url)));
        }

        let mut properties = Properties::new();
        for segment in segments.filter(|s| !s.trim().is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| Error::connection(format!("Malformed URL segment '{}'", segment)))?;
            properties.insert(key.trim(), value.trim());
        }

        Ok(Self {
            host: host.to_string(),
            port,
            properties,
        })
    }

    /// Database named by the URL
    pub fn database(&self) -> Option<&str> {
        self.properties.get_ignore_case(DATABASE_NAME_KEY)
    }
}

fn flag(properties: &Properties, key: &str) -> bool {
    properties
        .get_ignore_case(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Connection arguments the driver acts on
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ConnectOptions {
    instance_name: Option<String>,
    query_timeout: Option<Duration>,
    trust_cert: bool,
    encrypt_off: bool,
}

impl ConnectOptions {
    pub(crate) fn from_properties(properties: &Properties) -> Result<Self> {
        let instance_name = properties
            .get_ignore_case(keys::INSTANCE_NAME)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        // zero and negative values mean no limit
        let query_timeout = match properties.get_ignore_case(keys::QUERY_TIMEOUT) {
            None => None,
            Some(v) => {
                let seconds: i64 = v.trim().parse().map_err(|_| {
                    Error::config(format!(
                        "'{}' must be an integer number of seconds, got '{}'",
                        keys::QUERY_TIMEOUT,
                        v
                    ))
                })?;
                u64::try_from(seconds)
                    .ok()
                    .filter(|s| *s > 0)
                    .map(Duration::from_secs)
            }
        };

        Ok(Self {
            instance_name,
            query_timeout,
            trust_cert: flag(properties, TRUST_CERT_KEY),
            encrypt_off: properties
                .get_ignore_case(ENCRYPT_KEY)
                .is_some_and(|v| v.eq_ignore_ascii_case("false")),
        })
    }
}

fn base_config(host: &str, port: u16, database: Option<&str>, options: &ConnectOptions) -> Config {
    let mut config = Config::new();
    config.host(host);
    match &options.instance_name {
        // the browser service reports the instance port
        Some(instance) if port == DEFAULT_PORT => config.instance_name(instance),
        _ => config.port(port),
    }
    if let Some(database) = database {
        config.database(database);
    }
    if options.trust_cert {
        config.trust_cert();
    }
    if options.encrypt_off {
        config.encryption(EncryptionLevel::Off);
    }
    config
}

async fn open(config: Config, options: ConnectOptions) -> Result<SqlServerConnection> {
    let addr = config.get_addr();
    let tcp = if options.instance_name.is_some() {
        TcpStream::connect_named(&config).await.map_err(|e| {
            Error::connection_with_source(format!("Failed to resolve instance at {}", addr), e)
        })?
    } else {
        TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connection_with_source(format!("Failed to reach {}", addr), e))?
    };
    tcp.set_nodelay(true)
        .map_err(|e| Error::connection_with_source("Failed to configure socket", e))?;
    let client = Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| Error::connection_with_source(format!("Failed to connect to {}", addr), e))?;
    debug!(addr = %addr, ?options, "Opened SQL Server connection");
    Ok(SqlServerConnection::new(client, options.query_timeout))
}

/// SQL Server driver
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerDriver;

#[async_trait]
impl Driver for SqlServerDriver {
    fn name(&self) -> &str {
        "sqlserver"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with(URL_PREFIX)
    }

    async fn connect(&self, url: &str, properties: &Properties) -> Result<Box<dyn Connection>> {
        let parsed = SqlServerUrl::parse(url)?;
        let mut merged = parsed.properties.clone();
        merged.extend(properties.clone());

        let options = ConnectOptions::from_properties(&merged)?;
        let mut config = base_config(&parsed.host, parsed.port, parsed.database(), &options);
        if let Some(user) = merged.get(USER_KEY) {
            config.authentication(AuthMethod::sql_server(
                user,
                merged.get(PASSWORD_KEY).unwrap_or_default(),
            ));
        }
        Ok(Box::new(open(config, options).await?))
    }
}

/// Loadable class for [`SqlServerDriver`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlServerDriverClass;

impl DriverClass for SqlServerDriverClass {
    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn instantiate(&self) -> Result<Arc<dyn Driver>> {
        Ok(Arc::new(SqlServerDriver))
    }
}

/// Data source configured through setters, then opened once per call
#[derive(Default)]
pub struct SqlServerDataSource {
    server_name: String,
    port: Option<u16>,
    database_name: Option<String>,
    authentication: Option<String>,
    user: Option<String>,
    password: Option<SensitiveString>,
    msi_client_id: Option<String>,
    options: Properties,
}

impl std::fmt::Debug for SqlServerDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlServerDataSource")
            .field("server_name", &self.server_name)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .field("authentication", &self.authentication)
            .field("user", &self.user)
            .field("msi_client_id", &self.msi_client_id)
            .finish_non_exhaustive()
    }
}

impl SqlServerDataSource {
    fn auth_method(&self) -> Result<AuthMethod> {
        let mode = match self.authentication.as_deref() {
            None => AuthMode::SqlPassword,
            Some(tag) => tag.parse()?,
        };
        match mode {
            AuthMode::SqlPassword => {
                let user = self
                    .user
                    .as_deref()
                    .ok_or_else(|| Error::config("SQL login requires a user"))?;
                let password = self
                    .password
                    .as_ref()
                    .ok_or_else(|| Error::config("SQL login requires a password"))?;
                Ok(AuthMethod::sql_server(user, password.expose_secret()))
            }
            other => Err(Error::unsupported_auth_mode("sqlserver", other.as_str())),
        }
    }
}

#[async_trait]
impl DataSource for SqlServerDataSource {
    fn set_server_name(&mut self, host: &str) {
        self.server_name = host.to_string();
    }

    fn set_port_number(&mut self, port: u16) {
        self.port = Some(port);
    }

    fn set_database_name(&mut self, database: &str) {
        self.database_name = Some(database.to_string());
    }

    fn set_authentication(&mut self, mode: &str) {
        self.authentication = Some(mode.to_string());
    }

    fn set_user(&mut self, user: &str) {
        self.user = Some(user.to_string());
    }

    fn set_password(&mut self, password: &SensitiveString) {
        self.password = Some(password.clone());
    }

    fn set_msi_client_id(&mut self, client_id: &str) {
        self.msi_client_id = Some(client_id.to_string());
    }

    async fn get_connection(&self) -> Result<Box<dyn Connection>> {
        if self.server_name.is_empty() {
            return Err(Error::config("Data source has no server name"));
        }
        let auth = self.auth_method()?;
        let options = ConnectOptions::from_properties(&self.options)?;
        let mut config = base_config(
            &self.server_name,
            self.port.unwrap_or(DEFAULT_PORT),
            self.database_name.as_deref(),
            &options,
        );
        config.authentication(auth);
        Ok(Box::new(open(config, options).await?))
    }
}

/// Factory for [`SqlServerDataSource`]
#[derive(Debug, Default, Clone)]
pub struct SqlServerDataSourceFactory {
    options: Properties,
}

impl SqlServerDataSourceFactory {
    /// Factory with default TLS settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the server certificate without validation
    pub fn with_trust_server_certificate(mut self, trust: bool) -> Self {
        self.options.insert(TRUST_CERT_KEY, trust.to_string());
        self
    }
}

impl DataSourceFactory for SqlServerDataSourceFactory {
    fn class_name(&self) -> &str {
        DATA_SOURCE_CLASS_NAME
    }

    fn create(&self) -> Result<Box<dyn DataSource>> {
        Ok(Box::new(SqlServerDataSource {
            options: self.options.clone(),
            ..Default::default()
        }))
    }
}

fn column_sql_type(column_type: ColumnType) -> SqlType {
    match column_type {
        ColumnType::Null => SqlType::NULL,
        ColumnType::Bit | ColumnType::Bitn => SqlType::BIT,
        ColumnType::Int1 => SqlType::TINYINT,
        ColumnType::Int2 => SqlType::SMALLINT,
        ColumnType::Int4 | ColumnType::Intn => SqlType::INTEGER,
        ColumnType::Int8 => SqlType::BIGINT,
        ColumnType::Float4 => SqlType::REAL,
        ColumnType::Float8 | ColumnType::Floatn => SqlType::DOUBLE,
        ColumnType::Money | ColumnType::Money4 | ColumnType::Decimaln => SqlType::DECIMAL,
        ColumnType::Numericn => SqlType::NUMERIC,
        ColumnType::Guid => SqlType::CHAR,
        ColumnType::Daten => SqlType::DATE,
        ColumnType::Timen => SqlType::TIME,
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2 => SqlType::TIMESTAMP,
        ColumnType::DatetimeOffsetn => SqlType::TIMESTAMP_WITH_TIMEZONE,
        ColumnType::BigChar => SqlType::CHAR,
        ColumnType::BigVarChar => SqlType::VARCHAR,
        ColumnType::Text => SqlType::LONGVARCHAR,
        ColumnType::NChar => SqlType::NCHAR,
        ColumnType::NVarchar | ColumnType::Xml => SqlType::NVARCHAR,
        ColumnType::NText => SqlType::LONGNVARCHAR,
        ColumnType::BigBinary => SqlType::BINARY,
        ColumnType::BigVarBin => SqlType::VARBINARY,
        ColumnType::Image => SqlType::LONGVARBINARY,
        _ => SqlType::OTHER,
    }
}

fn tiberius_to_value(row: &tiberius::Row, idx: usize, sql_type: SqlType) -> Value {
    macro_rules! get {
        ($t:ty) => {
            row.try_get::<$t, _>(idx).ok().flatten()
        };
    }

    let value = match sql_type {
        SqlType::BIT => get!(bool).map(Value::Bool),
        SqlType::TINYINT => get!(u8).map(|v| Value::Int16(i16::from(v))),
        SqlType::SMALLINT => get!(i16).map(Value::Int16),
        SqlType::INTEGER => get!(i32)
            .map(Value::Int32)
            .or_else(|| get!(i64).map(Value::Int64))
            .or_else(|| get!(i16).map(Value::Int16))
            .or_else(|| get!(u8).map(|v| Value::Int16(i16::from(v)))),
        SqlType::BIGINT => get!(i64).map(Value::Int64),
        SqlType::REAL => get!(f32).map(Value::Float32),
        SqlType::DOUBLE => get!(f64)
            .map(Value::Float64)
            .or_else(|| get!(f32).map(Value::Float32)),
        SqlType::DECIMAL | SqlType::NUMERIC => get!(rust_decimal::Decimal)
            .map(Value::Decimal)
            .or_else(|| get!(f64).map(Value::Float64)),
        SqlType::DATE => get!(chrono::NaiveDate).map(Value::Date),
        SqlType::TIME => get!(chrono::NaiveTime).map(Value::Time),
        SqlType::TIMESTAMP => get!(chrono::NaiveDateTime).map(Value::DateTime),
        SqlType::TIMESTAMP_WITH_TIMEZONE => {
            get!(chrono::DateTime<chrono::Utc>).map(Value::DateTimeTz)
        }
        SqlType::BINARY | SqlType::VARBINARY | SqlType::LONGVARBINARY => {
            get!(&[u8]).map(|b| Value::Bytes(b.to_vec()))
        }
        _ => get!(&str)
            .map(|s| Value::String(s.to_string()))
            .or_else(|| get!(uuid::Uuid).map(|u| Value::String(u.to_string()))),
    };
    value.unwrap_or(Value::Null)
}

async fn run_query(client: &mut TdsClient, sql: &str) -> Result<ResultSet> {
    let mut stream = client
        .simple_query(sql)
        .await
        .map_err(|e| Error::statement_with_source("Query failed", sql, e))?;

    let columns: Vec<ColumnDescriptor> = stream
        .columns()
        .await
        .map_err(|e| Error::statement_with_source("Failed to read result metadata", sql, e))?
        .map(|cols| {
            cols.iter()
                .map(|c| ColumnDescriptor::new(c.name(), column_sql_type(c.column_type())))
                .collect()
        })
        .unwrap_or_default();
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let tds_rows = stream
        .into_first_result()
        .await
        .map_err(|e| Error::statement_with_source("Failed to read rows", sql, e))?;

    let rows = tds_rows
        .iter()
        .map(|r| {
            let values = columns
                .iter()
                .enumerate()
                .map(|(i, c)| tiberius_to_value(r, i, c.sql_type))
                .collect();
            Row::new(names.clone(), values)
        })
        .collect();
    Ok(ResultSet::new(columns, rows))
}

async fn run_execute(client: &mut TdsClient, sql: &str) -> Result<u64> {
    let result = client
        .execute(sql, &[])
        .await
        .map_err(|e| Error::statement_with_source("Statement failed", sql, e))?;
    Ok(result.total())
}

/// `None` when the limit elapsed first
async fn within<T>(
    limit: Option<Duration>,
    work: impl Future<Output = Result<T>>,
) -> Option<Result<T>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, work).await.ok(),
        None => Some(work.await),
    }
}

/// Connection over a `tiberius` client
pub struct SqlServerConnection {
    client: Mutex<Option<TdsClient>>,
    query_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl SqlServerConnection {
    fn new(client: TdsClient, query_timeout: Option<Duration>) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            query_timeout,
            closed: AtomicBool::new(false),
        }
    }

    fn closed_error() -> Error {
        Error::connection("connection is closed")
    }

    /// Drop a client left mid-statement by a timeout
    fn abandon(&self, slot: &mut Option<TdsClient>, sql: &str) -> Error {
        slot.take();
        self.closed.store(true, Ordering::Release);
        let seconds = self.query_timeout.map(|d| d.as_secs()).unwrap_or_default();
        warn!(timeout_secs = seconds, "SQL Server statement timed out, closing connection");
        Error::statement(format!("Query timeout of {}s exceeded", seconds), sql)
    }
}

#[async_trait]
impl Connection for SqlServerConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(Self::closed_error)?;

        let outcome = within(self.query_timeout, run_query(client, sql)).await;
        match outcome {
            Some(result) => result,
            None => Err(self.abandon(&mut guard, sql)),
        }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(Self::closed_error)?;

        let outcome = within(self.query_timeout, run_execute(client, sql)).await;
        match outcome {
            Some(result) => result,
            None => Err(self.abandon(&mut guard, sql)),
        }
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.client.lock().await;
        let Some(client) = guard.as_mut() else {
            return false;
        };
        let valid = match client.simple_query("SELECT 1").await {
            Ok(stream) => stream.into_row().await.is_ok(),
            Err(_) => false,
        };
        valid
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                warn!(error = %e, "SQL Server close failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let url = SqlServerUrl::parse(
            "jdbc:sqlserver://db.local:4000;databaseName=sales;trustServerCertificate=true",
        )
        .unwrap();
        assert_eq!(url.host, "db.local");
        assert_eq!(url.port, 4000);
        assert_eq!(url.database(), Some("sales"));
        assert!(flag(&url.properties, "trustservercertificate"));
    }

    #[test]
    fn test_parse_url_defaults() {
        let url = SqlServerUrl::parse("jdbc:sqlserver://db").unwrap();
        assert_eq!(url.port, 1433);
        assert!(url.properties.is_empty());
        assert_eq!(url.database(), None);
    }

    #[test]
    fn test_parse_url_errors() {
        assert!(SqlServerUrl::parse("jdbc:mysql://db:3306/x").is_err());
        assert!(SqlServerUrl::parse("jdbc:sqlserver://db:port").is_err());
        assert!(SqlServerUrl::parse("jdbc:sqlserver://db;broken").is_err());
        assert!(SqlServerUrl::parse("jdbc:sqlserver://:1433").is_err());
    }

    #[test]
    fn test_connect_options() {
        let url = SqlServerUrl::parse(
            "jdbc:sqlserver://db.local;databaseName=sales;instanceName=REPORTS;queryTimeout=30",
        )
        .unwrap();
        let options = ConnectOptions::from_properties(&url.properties).unwrap();
        assert_eq!(options.instance_name.as_deref(), Some("REPORTS"));
        assert_eq!(options.query_timeout, Some(Duration::from_secs(30)));

        let unlimited = Properties::new().with("queryTimeout", "-1");
        let options = ConnectOptions::from_properties(&unlimited).unwrap();
        assert_eq!(options.query_timeout, None);
        assert_eq!(options.instance_name, None);

        let bad = Properties::new().with("queryTimeout", "soon");
        assert!(matches!(
            ConnectOptions::from_properties(&bad),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_base_config_instance_name() {
        let named = ConnectOptions::from_properties(
            &Properties::new().with("instanceName", "REPORTS"),
        )
        .unwrap();
        // browser service port
        assert_eq!(
            base_config("db.local", DEFAULT_PORT, None, &named).get_addr(),
            "db.local:1434"
        );
        assert_eq!(
            base_config("db.local", 4000, None, &named).get_addr(),
            "db.local:4000"
        );
        assert_eq!(
            base_config("db.local", DEFAULT_PORT, None, &ConnectOptions::default()).get_addr(),
            "db.local:1433"
        );
    }

    #[tokio::test]
    async fn test_within_reports_elapsed_limit() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<u64, Error>(1)
        };
        assert!(within(Some(Duration::from_millis(10)), slow).await.is_none());

        let fast = async { Ok::<u64, Error>(2) };
        let result = within(Some(Duration::from_secs(5)), fast).await;
        assert_eq!(result.map(|r| r.unwrap()), Some(2));
        assert_eq!(within(None, async { Ok::<u64, Error>(3) }).await.map(|r| r.unwrap()), Some(3));
    }

    #[test]
    fn test_column_types() {
        assert_eq!(column_sql_type(ColumnType::Intn), SqlType::INTEGER);
        assert_eq!(column_sql_type(ColumnType::NVarchar), SqlType::NVARCHAR);
        assert_eq!(column_sql_type(ColumnType::Daten), SqlType::DATE);
    }

    #[tokio::test]
    async fn test_data_source_rejects_ad_modes() {
        let factory = SqlServerDataSourceFactory::new();
        let mut ds = factory.create().unwrap();
        ds.set_server_name("db.local");
        ds.set_authentication(AuthMode::ActiveDirectoryManagedIdentity.as_str());
        ds.set_msi_client_id("client");
        let err = ds.get_connection().await.err().unwrap();
        assert!(matches!(err, Error::UnsupportedAuthMode { .. }));
    }

    #[tokio::test]
    async fn test_data_source_requires_credentials() {
        let mut ds = SqlServerDataSourceFactory::new().create().unwrap();
        ds.set_server_name("db.local");
        let err = ds.get_connection().await.err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
