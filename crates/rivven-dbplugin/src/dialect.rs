//! Provider dialects for rivven-dbplugin
//!
//! A [`DialectStrategy`] knows, for one provider family:
//! - the provider key `(name, kind)` a driver is registered under
//! - how to render a JDBC-style connection URL from a [`ConnectionDescriptor`]
//! - which provider-specific extras become driver arguments
//! - which authentication variant applies (SQL Server family only)
//! - the catalog queries used by the sink (table existence, column probe)
//!
//! Dialects are stateless; [`dialect_for`] hands out one per provider.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::auth::AuthMode;
use crate::descriptor::{ConnectionDescriptor, Properties};
use crate::error::{Error, Result};
use crate::security::{escape_string_literal, split_table_name};

/// Driver kind used by every bundled provider
pub const JDBC_KIND: &str = "jdbc";

/// Extra and argument keys understood by the dialects
pub mod keys {
    /// MySQL: reconnect on stale connections
    pub const AUTO_RECONNECT: &str = "autoReconnect";
    /// MySQL: allow `;`-separated statements
    pub const ALLOW_MULTI_QUERIES: &str = "allowMultiQueries";
    /// MySQL: row limit for sources
    pub const MAX_ROWS: &str = "maxRows";
    /// SQL Server: named instance
    pub const INSTANCE_NAME: &str = "instanceName";
    /// SQL Server: query timeout in seconds, `-1` for none
    pub const QUERY_TIMEOUT: &str = "queryTimeout";
    /// SQL Server: `Azure Active Directory` selects an auth variant; Oracle: `sid` or `service`
    pub const CONNECTION_TYPE: &str = "connectionType";
    /// SQL Server: auth variant tag
    pub const AZURE_AUTH_TYPE: &str = "azureAuthType";
    /// SQL Server: plugin name of the data source used for Azure AD connections
    pub const AZURE_DRIVER_NAME: &str = "azureDriverName";
    /// SQL Server: plugin type of the Azure data source
    pub const AZURE_DRIVER_TYPE: &str = "azureDriverType";
    /// SQL Server: managed identity client id
    pub const MSI_CLIENT_ID: &str = "msiClientID";
    /// Oracle: statement batch size
    pub const DEFAULT_BATCH_VALUE: &str = "defaultBatchValue";
    /// Oracle: rows fetched per round trip
    pub const DEFAULT_ROW_PREFETCH: &str = "defaultRowPrefetch";
    /// PostgreSQL: connect timeout in seconds
    pub const CONNECTION_TIMEOUT: &str = "connectionTimeout";
    /// Generic: full connection URL
    pub const CONNECTION_STRING: &str = "connectionString";
}

/// SQL Server `connectionType` value that enables Azure AD auth variants
pub const AZURE_AD_CONNECTION_TYPE: &str = "Azure Active Directory";

/// Database product family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// MySQL / MariaDB
    Mysql,
    /// PostgreSQL
    Postgres,
    /// Oracle
    Oracle,
    /// Microsoft SQL Server / Azure SQL
    Sqlserver,
    /// Any other JDBC-style database reached through a literal connection string
    Generic,
}

impl Provider {
    /// All providers
    pub const ALL: [Provider; 5] = [
        Provider::Mysql,
        Provider::Postgres,
        Provider::Oracle,
        Provider::Sqlserver,
        Provider::Generic,
    ];

    /// Provider name used as the driver registration name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Oracle => "oracle",
            Self::Sqlserver => "sqlserver",
            Self::Generic => "generic",
        }
    }

    /// Default port, if the provider has one
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Mysql => Some(3306),
            Self::Postgres => Some(5432),
            Self::Oracle => Some(1521),
            Self::Sqlserver => Some(1433),
            Self::Generic => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "oracle" => Ok(Self::Oracle),
            "sqlserver" | "mssql" => Ok(Self::Sqlserver),
            "generic" | "database" => Ok(Self::Generic),
            other => Err(Error::config(format!("Unknown database provider '{}'", other))),
        }
    }
}

/// Key a driver registration is tracked under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderKey {
    /// Driver kind, e.g. `jdbc`
    pub kind: String,
    /// Driver name, e.g. `mysql`
    pub name: String,
}

impl ProviderKey {
    /// Build a key
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Per-provider connection behaviour
pub trait DialectStrategy: Send + Sync + fmt::Debug {
    /// Provider family
    fn provider(&self) -> Provider;

    /// Provider name, e.g. `mysql`
    fn name(&self) -> &'static str {
        self.provider().name()
    }

    /// Driver kind, e.g. `jdbc`
    fn driver_kind(&self) -> &'static str {
        JDBC_KIND
    }

    /// Registration key for this provider's driver
    fn provider_key(&self) -> ProviderKey {
        ProviderKey::new(self.driver_kind(), self.name())
    }

    /// Render the connection URL. Pure and deterministic.
    fn build_connection_string(&self, descriptor: &ConnectionDescriptor) -> Result<String>;

    /// Driver arguments derived from provider-specific extras
    fn provider_arguments(&self, extras: &BTreeMap<String, String>) -> Result<Properties> {
        let _ = extras;
        Ok(Properties::new())
    }

    /// Authentication variant chosen by the extras, if the provider has any
    fn auth_mode(&self, descriptor: &ConnectionDescriptor) -> Result<Option<AuthMode>> {
        let _ = descriptor;
        Ok(None)
    }

    /// Check the descriptor's credentials against the selected auth variant
    fn validate_descriptor(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        match self.auth_mode(descriptor)? {
            Some(mode) => mode.validate(descriptor),
            None => descriptor.validate_credentials(),
        }
    }

    /// Quote an identifier
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Query returning one row when the table exists and none otherwise
    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String {
        let table = escape_string_literal(table);
        match schema {
            Some(schema) => format!(
                "SELECT 1 FROM information_schema.tables WHERE table_schema = '{}' AND table_name = '{}'",
                escape_string_literal(schema),
                table
            ),
            None => format!(
                "SELECT 1 FROM information_schema.tables WHERE table_name = '{}'",
                table
            ),
        }
    }

    /// Zero-row query used only for result-set metadata
    fn probe_sql(&self, table: &str, columns: &[String]) -> String {
        format!("SELECT {} FROM {} WHERE 1 = 0", columns.join(", "), table)
    }

    /// Table-existence query for a possibly schema-qualified table name
    fn table_exists_query(&self, table_name: &str) -> String {
        let (schema, table) = split_table_name(table_name);
        self.table_exists_sql(schema, table)
    }
}

fn parse_bool_extra(extras: &BTreeMap<String, String>, key: &str) -> Result<Option<bool>> {
    extras
        .get(key)
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(Error::config(format!("'{}' must be true or false, got '{}'", key, v))),
        })
        .transpose()
}

fn parse_int_extra(extras: &BTreeMap<String, String>, key: &str) -> Result<Option<i64>> {
    extras
        .get(key)
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| Error::config(format!("'{}' must be an integer, got '{}'", key, v)))
        })
        .transpose()
}

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl DialectStrategy for MySqlDialect {
    fn provider(&self) -> Provider {
        Provider::Mysql
    }

    fn build_connection_string(&self, d: &ConnectionDescriptor) -> Result<String> {
        Ok(format!("jdbc:mysql://{}:{}/{}", d.host, d.port, d.database))
    }

    fn provider_arguments(&self, extras: &BTreeMap<String, String>) -> Result<Properties> {
        let mut props = Properties::new();
        let auto_reconnect = parse_bool_extra(extras, keys::AUTO_RECONNECT)?.unwrap_or(false);
        props.insert(keys::AUTO_RECONNECT, auto_reconnect.to_string());

        if let Some(multi) = parse_bool_extra(extras, keys::ALLOW_MULTI_QUERIES)? {
            props.insert(keys::ALLOW_MULTI_QUERIES, multi.to_string());
        }
        if let Some(max_rows) = parse_int_extra(extras, keys::MAX_ROWS)? {
            if max_rows < 0 {
                return Err(Error::config("'maxRows' must not be negative"));
            }
            props.insert(keys::MAX_ROWS, max_rows.to_string());
        }
        Ok(props)
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        format!(
            "SELECT 1 FROM information_schema.tables WHERE table_schema = {} AND table_name = '{}'",
            schema,
            escape_string_literal(table)
        )
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl DialectStrategy for PostgresDialect {
    fn provider(&self) -> Provider {
        Provider::Postgres
    }

    fn build_connection_string(&self, d: &ConnectionDescriptor) -> Result<String> {
        Ok(format!("jdbc:postgresql://{}:{}/{}", d.host, d.port, d.database))
    }

    fn provider_arguments(&self, extras: &BTreeMap<String, String>) -> Result<Properties> {
        let mut props = Properties::new();
        if let Some(timeout) = parse_int_extra(extras, keys::CONNECTION_TIMEOUT)? {
            props.insert(keys::CONNECTION_TIMEOUT, timeout.to_string());
        }
        Ok(props)
    }

    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String {
        format!(
            "SELECT 1 FROM information_schema.tables WHERE table_schema = '{}' AND table_name = '{}'",
            escape_string_literal(schema.unwrap_or("public")),
            escape_string_literal(table)
        )
    }
}

/// Oracle dialect
#[derive(Debug, Clone, Default)]
pub struct OracleDialect;

impl DialectStrategy for OracleDialect {
    fn provider(&self) -> Provider {
        Provider::Oracle
    }

    fn build_connection_string(&self, d: &ConnectionDescriptor) -> Result<String> {
        match d.extra(keys::CONNECTION_TYPE).map(str::to_ascii_lowercase).as_deref() {
            Some("service") => Ok(format!(
                "jdbc:oracle:thin:@//{}:{}/{}",
                d.host, d.port, d.database
            )),
            None | Some("sid") => Ok(format!("jdbc:oracle:thin:@{}:{}:{}", d.host, d.port, d.database)),
            Some(other) => Err(Error::config(format!(
                "Oracle connectionType must be 'sid' or 'service', got '{}'",
                other
            ))),
        }
    }

    fn provider_arguments(&self, extras: &BTreeMap<String, String>) -> Result<Properties> {
        let mut props = Properties::new();
        for key in [keys::DEFAULT_BATCH_VALUE, keys::DEFAULT_ROW_PREFETCH] {
            if let Some(value) = parse_int_extra(extras, key)? {
                if value <= 0 {
                    return Err(Error::config(format!("'{}' must be positive", key)));
                }
                props.insert(key, value.to_string());
            }
        }
        Ok(props)
    }

    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String {
        // Oracle folds unquoted names to upper case
        let table = escape_string_literal(&table.to_uppercase());
        match schema {
            Some(owner) => format!(
                "SELECT 1 FROM all_tables WHERE owner = '{}' AND table_name = '{}'",
                escape_string_literal(&owner.to_uppercase()),
                table
            ),
            None => format!("SELECT 1 FROM user_tables WHERE table_name = '{}'", table),
        }
    }
}

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl DialectStrategy for SqlServerDialect {
    fn provider(&self) -> Provider {
        Provider::Sqlserver
    }

    fn build_connection_string(&self, d: &ConnectionDescriptor) -> Result<String> {
        Ok(format!(
            "jdbc:sqlserver://{}:{};databaseName={}",
            d.host, d.port, d.database
        ))
    }

    fn provider_arguments(&self, extras: &BTreeMap<String, String>) -> Result<Properties> {
        let mut props = Properties::new();
        if let Some(instance) = extras.get(keys::INSTANCE_NAME) {
            props.insert(keys::INSTANCE_NAME, instance.as_str());
        }
        let timeout = parse_int_extra(extras, keys::QUERY_TIMEOUT)?.unwrap_or(-1);
        props.insert(keys::QUERY_TIMEOUT, timeout.to_string());
        Ok(props)
    }

    fn auth_mode(&self, d: &ConnectionDescriptor) -> Result<Option<AuthMode>> {
        if d.extra(keys::CONNECTION_TYPE) != Some(AZURE_AD_CONNECTION_TYPE) {
            return Ok(None);
        }
        let tag = d.extra(keys::AZURE_AUTH_TYPE).ok_or_else(|| {
            Error::config("'azureAuthType' is required for Azure Active Directory connections")
        })?;
        AuthMode::parse_for(self.provider(), tag).map(Some)
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn table_exists_sql(&self, schema: Option<&str>, table: &str) -> String {
        format!(
            "SELECT 1 FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}'",
            escape_string_literal(schema.unwrap_or("dbo")),
            escape_string_literal(table)
        )
    }
}

/// Dialect for databases reached through a literal connection string
#[derive(Debug, Clone, Default)]
pub struct GenericDialect;

impl DialectStrategy for GenericDialect {
    fn provider(&self) -> Provider {
        Provider::Generic
    }

    fn build_connection_string(&self, d: &ConnectionDescriptor) -> Result<String> {
        d.extra(keys::CONNECTION_STRING)
            .map(str::to_string)
            .ok_or_else(|| Error::config("'connectionString' is required for the generic provider"))
    }
}

/// Get the dialect for a provider
pub fn dialect_for(provider: Provider) -> Box<dyn DialectStrategy> {
    match provider {
        Provider::Mysql => Box::new(MySqlDialect),
        Provider::Postgres => Box::new(PostgresDialect),
        Provider::Oracle => Box::new(OracleDialect),
        Provider::Sqlserver => Box::new(SqlServerDialect),
        Provider::Generic => Box::new(GenericDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::new("db.local", 4000, "sales")
    }

    #[test]
    fn test_connection_strings() {
        let d = descriptor();
        assert_eq!(
            MySqlDialect.build_connection_string(&d).unwrap(),
            "jdbc:mysql://db.local:4000/sales"
        );
        assert_eq!(
            PostgresDialect.build_connection_string(&d).unwrap(),
            "jdbc:postgresql://db.local:4000/sales"
        );
        assert_eq!(
            OracleDialect.build_connection_string(&d).unwrap(),
            "jdbc:oracle:thin:@db.local:4000:sales"
        );
        assert_eq!(
            SqlServerDialect.build_connection_string(&d).unwrap(),
            "jdbc:sqlserver://db.local:4000;databaseName=sales"
        );
    }

    #[test]
    fn test_oracle_service_name() {
        let d = descriptor().with_extra("connectionType", "service");
        assert_eq!(
            OracleDialect.build_connection_string(&d).unwrap(),
            "jdbc:oracle:thin:@//db.local:4000/sales"
        );
        let d = descriptor().with_extra("connectionType", "tns");
        assert!(OracleDialect.build_connection_string(&d).is_err());
    }

    #[test]
    fn test_generic_requires_connection_string() {
        assert!(GenericDialect.build_connection_string(&descriptor()).is_err());
        let d = descriptor().with_extra("connectionString", "jdbc:h2:mem:test");
        assert_eq!(GenericDialect.build_connection_string(&d).unwrap(), "jdbc:h2:mem:test");
    }

    #[test]
    fn test_mysql_arguments() {
        let props = MySqlDialect.provider_arguments(&BTreeMap::new()).unwrap();
        assert_eq!(props.get("autoReconnect"), Some("false"));
        assert!(!props.contains_key("allowMultiQueries"));

        let extras: BTreeMap<String, String> = [("allowMultiQueries", "TRUE"), ("maxRows", "10")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let props = MySqlDialect.provider_arguments(&extras).unwrap();
        assert_eq!(props.get("allowMultiQueries"), Some("true"));
        assert_eq!(props.get("maxRows"), Some("10"));
    }

    #[test]
    fn test_invalid_extras_rejected() {
        let extras: BTreeMap<String, String> =
            [("autoReconnect".to_string(), "yes".to_string())].into_iter().collect();
        assert!(MySqlDialect.provider_arguments(&extras).is_err());

        let extras: BTreeMap<String, String> =
            [("queryTimeout".to_string(), "soon".to_string())].into_iter().collect();
        assert!(SqlServerDialect.provider_arguments(&extras).is_err());
    }

    #[test]
    fn test_sqlserver_arguments_default_timeout() {
        let props = SqlServerDialect.provider_arguments(&BTreeMap::new()).unwrap();
        assert_eq!(props.get("queryTimeout"), Some("-1"));
        assert!(!props.contains_key("instanceName"));
    }

    #[test]
    fn test_sqlserver_auth_mode_selection() {
        assert_eq!(SqlServerDialect.auth_mode(&descriptor()).unwrap(), None);

        let d = descriptor()
            .with_extra("connectionType", AZURE_AD_CONNECTION_TYPE)
            .with_extra("azureAuthType", "ActiveDirectoryMSI");
        assert_eq!(
            SqlServerDialect.auth_mode(&d).unwrap(),
            Some(AuthMode::ActiveDirectoryManagedIdentity)
        );

        let d = descriptor()
            .with_extra("connectionType", AZURE_AD_CONNECTION_TYPE)
            .with_extra("azureAuthType", "Kerberos");
        assert!(matches!(
            SqlServerDialect.auth_mode(&d),
            Err(Error::UnsupportedAuthMode { .. })
        ));
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("MySQL".parse::<Provider>().unwrap(), Provider::Mysql);
        assert_eq!("postgresql".parse::<Provider>().unwrap(), Provider::Postgres);
        assert_eq!("mssql".parse::<Provider>().unwrap(), Provider::Sqlserver);
        assert!("db2".parse::<Provider>().is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(MySqlDialect.quote_identifier("users"), "`users`");
        assert_eq!(PostgresDialect.quote_identifier("users"), "\"users\"");
        assert_eq!(SqlServerDialect.quote_identifier("users"), "[users]");
    }

    #[test]
    fn test_probe_and_exists_sql() {
        let cols = vec!["id".to_string(), "name".to_string()];
        assert_eq!(
            MySqlDialect.probe_sql("users", &cols),
            "SELECT id, name FROM users WHERE 1 = 0"
        );
        let sql = PostgresDialect.table_exists_query("app.users");
        assert!(sql.contains("table_schema = 'app'"));
        assert!(sql.contains("table_name = 'users'"));

        let sql = OracleDialect.table_exists_query("users");
        assert!(sql.contains("user_tables"));
        assert!(sql.contains("'USERS'"));
    }

    #[test]
    fn test_provider_key() {
        let key = dialect_for(Provider::Mysql).provider_key();
        assert_eq!(key, ProviderKey::new("jdbc", "mysql"));
        assert_eq!(key.to_string(), "jdbc:mysql");
    }
}
