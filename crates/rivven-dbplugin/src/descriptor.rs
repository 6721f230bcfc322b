//! Connection descriptor and connection-argument merging
//!
//! A [`ConnectionDescriptor`] is the immutable description of how to reach a
//! database. [`merge_arguments`] turns the free-form argument string, the
//! explicit credentials and the provider-specific extras into the property
//! set handed to the driver.
//!
//! Precedence, lowest to highest:
//! 1. `key=value` pairs parsed from the free-form argument string
//! 2. explicit `user` / `password`
//! 3. provider-specific extras

use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Property key carrying the user name
pub const USER_KEY: &str = "user";
/// Property key carrying the password
pub const PASSWORD_KEY: &str = "password";

/// A string that is redacted in Debug/Display/Serialize output.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use sparingly - only when the actual value is needed (e.g., for authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for SensitiveString {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Serialize as redacted to prevent accidental exposure in config dumps/logs
impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

impl JsonSchema for SensitiveString {
    fn schema_name() -> String {
        "SensitiveString".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
            obj.metadata().description =
                Some("Sensitive value. Will be redacted in logs.".to_string());
        }
        schema
    }
}

/// Connection properties handed to a driver.
///
/// Ordered so that rendering is deterministic. The password value is
/// redacted from `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or override a property
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up a property ignoring ASCII case of the key
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Remove a property
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Merge `other` on top of `self`; keys in `other` win
    pub fn extend(&mut self, other: Properties) {
        self.0.extend(other.0);
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Property keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Render back to `key=value;key=value` form
    pub fn to_argument_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.0 {
            if k.eq_ignore_ascii_case(PASSWORD_KEY) {
                map.entry(k, &"[REDACTED]");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for Properties {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Parse a `key1=value1;key2=value2` argument string.
///
/// Whitespace around `;` and `=` is ignored and empty segments are skipped.
/// A segment without `=` or with an empty key is rejected. Values may
/// contain `=`; only the first one separates key from value.
pub fn parse_arguments(arguments: &str) -> Result<Properties> {
    let mut properties = Properties::new();

    for segment in arguments.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let (key, value) = segment.split_once('=').ok_or_else(|| {
            Error::config(format!(
                "Invalid connection argument '{}': expected key=value",
                segment
            ))
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(Error::config(format!(
                "Invalid connection argument '{}': empty key",
                segment
            )));
        }

        properties.insert(key, value.trim());
    }

    Ok(properties)
}

/// Merge connection arguments, explicit credentials and provider extras.
///
/// When `user` is present both `user` and `password` are injected,
/// overriding any same-named keys parsed from `arguments`. A missing
/// password is injected as the empty string. Provider extras are applied
/// last.
pub fn merge_arguments(
    arguments: Option<&str>,
    user: Option<&str>,
    password: Option<&SensitiveString>,
    provider_specific: &Properties,
) -> Result<Properties> {
    let mut properties = match arguments {
        Some(args) if !args.trim().is_empty() => parse_arguments(args)?,
        _ => Properties::new(),
    };

    if let Some(user) = user {
        properties.insert(USER_KEY, user);
        properties.insert(
            PASSWORD_KEY,
            password.map(|p| p.expose_secret()).unwrap_or_default(),
        );
    }

    properties.extend(provider_specific.clone());
    Ok(properties)
}

/// Immutable description of how to reach a database.
#[derive(Clone, PartialEq)]
pub struct ConnectionDescriptor {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database (or SID / service name) to connect to
    pub database: String,
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<SensitiveString>,
    /// Free-form `key=value;...` connection arguments
    pub connection_arguments: Option<String>,
    /// Provider-specific extras (instance name, auth mode, ...)
    pub provider_specific: BTreeMap<String, String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password)
            .field("connection_arguments", &self.connection_arguments)
            .field("provider_specific", &self.provider_specific)
            .finish()
    }
}

impl ConnectionDescriptor {
    /// Create a descriptor without credentials
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: None,
            password: None,
            connection_arguments: None,
            provider_specific: BTreeMap::new(),
        }
    }

    /// Set credentials
    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<SensitiveString>,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the user only (for auth modes that take no password)
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the free-form argument string
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.connection_arguments = Some(arguments.into());
        self
    }

    /// Add a provider-specific extra
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider_specific.insert(key.into(), value.into());
        self
    }

    /// Provider-specific extra by key
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.provider_specific.get(key).map(String::as_str)
    }

    /// Whether both credentials are set
    pub fn has_credentials(&self) -> bool {
        self.user.is_some() && self.password.is_some()
    }

    /// Enforce the both-or-neither credential rule.
    ///
    /// Providers whose auth mode works without a password skip this check.
    pub fn validate_credentials(&self) -> Result<()> {
        match (&self.user, &self.password) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            (Some(_), None) => Err(Error::config("'password' is required when 'user' is set")),
            (None, Some(_)) => Err(Error::config("'user' is required when 'password' is set")),
        }
    }

    /// Merge this descriptor's arguments with the given provider extras
    pub fn merged_arguments(&self, provider_specific: &Properties) -> Result<Properties> {
        merge_arguments(
            self.connection_arguments.as_deref(),
            self.user.as_deref(),
            self.password.as_ref(),
            provider_specific,
        )
    }
}
