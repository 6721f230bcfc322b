//! Connection configuration shared by sources, sinks and actions
//!
//! Configs use camelCase keys and load from YAML, JSON, or the engine's flat
//! string property map:
//!
//! ```yaml
//! provider: sqlserver
//! host: sql.internal
//! port: 1433
//! database: sales
//! user: etl
//! password: "${secret:sql-password}"
//! connectionArguments: "encrypt=true;trustServerCertificate=false"
//! jdbcPluginName: sqlserver42
//! instanceName: REPORTING
//! queryTimeout: 30
//! ```
//!
//! Keys not named by the config struct are provider extras and are handed to
//! the dialect.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use validator::Validate;

use crate::descriptor::{ConnectionDescriptor, Properties, SensitiveString};
use crate::dialect::{dialect_for, DialectStrategy, Provider};
use crate::error::{Error, Result};

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database provider
    pub provider: Provider,

    /// Database host
    #[serde(default)]
    #[validate(length(max = 255))]
    pub host: String,

    /// Database port (default: the provider's standard port)
    #[serde(default, deserialize_with = "number_or_string")]
    #[schemars(with = "Option<u16>")]
    #[validate(range(min = 1))]
    pub port: Option<u16>,

    /// Database name (SID or service name for Oracle)
    #[serde(default)]
    pub database: String,

    /// User name
    #[serde(default)]
    pub user: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Additional driver arguments as `key1=value1;key2=value2`
    #[serde(default)]
    pub connection_arguments: Option<String>,

    /// Plugin id of the driver to load (default: the provider name)
    #[serde(default)]
    pub jdbc_plugin_name: Option<String>,

    /// Provider extras (`instanceName`, `azureAuthType`, `autoReconnect`, ...)
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl DatabaseConfig {
    /// Config with no credentials or extras
    pub fn new(provider: Provider, host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            provider,
            host: host.into(),
            port: None,
            database: database.into(),
            user: None,
            password: None,
            connection_arguments: None,
            jdbc_plugin_name: None,
            extras: BTreeMap::new(),
        }
    }

    /// Set credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<SensitiveString>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the argument string
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.connection_arguments = Some(arguments.into());
        self
    }

    /// Add a provider extra
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Set the driver plugin id
    pub fn with_plugin_name(mut self, name: impl Into<String>) -> Self {
        self.jdbc_plugin_name = Some(name.into());
        self
    }

    /// Dialect for the configured provider
    pub fn dialect(&self) -> Box<dyn DialectStrategy> {
        dialect_for(self.provider)
    }

    /// Driver plugin id
    pub fn plugin_name(&self) -> &str {
        self.jdbc_plugin_name
            .as_deref()
            .unwrap_or_else(|| self.provider.name())
    }

    /// Extras rendered as strings
    pub fn extras_as_strings(&self) -> BTreeMap<String, String> {
        self.extras
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
            .collect()
    }

    /// Immutable connection descriptor
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.host.clone(),
            port: self.port.or_else(|| self.provider.default_port()).unwrap_or(0),
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connection_arguments: self.connection_arguments.clone(),
            provider_specific: self.extras_as_strings(),
        }
    }

    /// Connection URL built by the dialect
    pub fn connection_string(&self) -> Result<String> {
        self.dialect().build_connection_string(&self.descriptor())
    }

    /// Merged driver properties: arguments, credentials, provider extras
    pub fn connection_properties(&self) -> Result<Properties> {
        let dialect = self.dialect();
        let provider_args = dialect.provider_arguments(&self.extras_as_strings())?;
        self.descriptor().merged_arguments(&provider_args)
    }

    /// Field rules, credentials against the auth variant, and everything the
    /// dialect will need at connection time
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Validation failed: {}", e)))?;

        if self.provider != Provider::Generic {
            if self.host.trim().is_empty() {
                return Err(Error::config("'host' is required"));
            }
            if self.database.trim().is_empty() {
                return Err(Error::config("'database' is required"));
            }
        }

        let descriptor = self.descriptor();
        let dialect = self.dialect();
        dialect.validate_descriptor(&descriptor)?;
        dialect.build_connection_string(&descriptor)?;
        self.connection_properties()?;
        Ok(())
    }
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString<T> {
    Number(T),
    String(String),
}

/// Accept a number either as a number or as its string form.
///
/// The engine's property map carries every value as a string.
pub(crate) fn number_or_string<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Option::<NumberOrString<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) if s.trim().is_empty() => Ok(None),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Load a config from YAML
pub fn from_yaml<T: DeserializeOwned>(yaml: &str) -> Result<T> {
    serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("Invalid YAML config: {}", e)))
}

/// Load a config from JSON
pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| Error::config(format!("Invalid JSON config: {}", e)))
}

/// Load a config from the engine's flat string property map
pub fn from_properties<T: DeserializeOwned>(properties: &BTreeMap<String, String>) -> Result<T> {
    let object = properties
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect::<serde_json::Map<_, _>>();
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| Error::config(format!("Invalid config properties: {}", e)))
}

/// JSON schema of a config type, for UI surfacing
pub fn json_schema<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
}
