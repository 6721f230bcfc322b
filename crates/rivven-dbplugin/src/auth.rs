//! Authentication variants for the SQL Server family.
//!
//! Azure AD connections do not go through the driver manager. They are
//! opened through a data source object supplied by the engine, configured
//! by an [`AuthStrategy`] chosen from an [`AuthRegistry`] keyed on
//! `(provider, auth mode)`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::descriptor::{ConnectionDescriptor, SensitiveString};
use crate::dialect::{keys, Provider};
use crate::error::{Error, Result};

/// Authentication variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMode {
    /// SQL login with user and password
    #[serde(rename = "SqlPassword")]
    SqlPassword,
    /// Azure AD user and password
    #[serde(rename = "ActiveDirectoryPassword")]
    ActiveDirectoryPassword,
    /// Azure AD integrated (environment identity)
    #[serde(rename = "ActiveDirectoryIntegrated")]
    ActiveDirectoryIntegrated,
    /// Azure managed service identity
    #[serde(rename = "ActiveDirectoryMSI")]
    ActiveDirectoryManagedIdentity,
}

impl AuthMode {
    /// Tag passed to the data source's `authentication` setting
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlPassword => "SqlPassword",
            Self::ActiveDirectoryPassword => "ActiveDirectoryPassword",
            Self::ActiveDirectoryIntegrated => "ActiveDirectoryIntegrated",
            Self::ActiveDirectoryManagedIdentity => "ActiveDirectoryMSI",
        }
    }

    /// Parse a tag for a provider; providers without auth variants reject every tag
    pub fn parse_for(provider: Provider, tag: &str) -> Result<Self> {
        match provider {
            Provider::Sqlserver => tag
                .parse()
                .map_err(|_| Error::unsupported_auth_mode(provider.name(), tag)),
            _ => Err(Error::unsupported_auth_mode(provider.name(), tag)),
        }
    }

    /// Whether the variant authenticates with user and password
    pub fn uses_password(&self) -> bool {
        matches!(self, Self::SqlPassword | Self::ActiveDirectoryPassword)
    }

    /// Check the descriptor carries what this variant needs
    pub fn validate(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        match self {
            Self::SqlPassword | Self::ActiveDirectoryPassword => {
                if descriptor.user.is_none() || descriptor.password.is_none() {
                    return Err(Error::config(format!(
                        "'user' and 'password' are required for {} authentication",
                        self
                    )));
                }
            }
            Self::ActiveDirectoryIntegrated => {}
            Self::ActiveDirectoryManagedIdentity => {
                if descriptor
                    .extra(keys::MSI_CLIENT_ID)
                    .map_or(true, |id| id.trim().is_empty())
                {
                    return Err(Error::config(
                        "'msiClientID' is required for ActiveDirectoryMSI authentication",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "SqlPassword" => Ok(Self::SqlPassword),
            "ActiveDirectoryPassword" => Ok(Self::ActiveDirectoryPassword),
            "ActiveDirectoryIntegrated" => Ok(Self::ActiveDirectoryIntegrated),
            "ActiveDirectoryMSI" => Ok(Self::ActiveDirectoryManagedIdentity),
            other => Err(Error::unsupported_auth_mode("sqlserver", other)),
        }
    }
}

/// Narrow data-source capability used for auth-variant connections
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Server host
    fn set_server_name(&mut self, host: &str);
    /// Server port
    fn set_port_number(&mut self, port: u16);
    /// Database name
    fn set_database_name(&mut self, database: &str);
    /// Authentication tag, see [`AuthMode::as_str`]
    fn set_authentication(&mut self, mode: &str);
    /// Login user
    fn set_user(&mut self, user: &str);
    /// Login password
    fn set_password(&mut self, password: &SensitiveString);
    /// Managed identity client id
    fn set_msi_client_id(&mut self, client_id: &str);
    /// Open a connection with the configured settings
    async fn get_connection(&self) -> Result<Box<dyn Connection>>;
}

/// Creates fresh data sources; supplied by the engine per plugin
pub trait DataSourceFactory: Send + Sync {
    /// Data source class name, for logs
    fn class_name(&self) -> &str;
    /// New unconfigured data source
    fn create(&self) -> Result<Box<dyn DataSource>>;
}

/// Applies one auth variant's settings to a data source
pub trait AuthStrategy: Send + Sync {
    /// Set credentials on the data source
    fn configure(&self, data_source: &mut dyn DataSource, descriptor: &ConnectionDescriptor) -> Result<()>;
}

fn required_password(descriptor: &ConnectionDescriptor) -> Result<(&str, &SensitiveString)> {
    match (descriptor.user.as_deref(), descriptor.password.as_ref()) {
        (Some(user), Some(password)) => Ok((user, password)),
        _ => Err(Error::config("'user' and 'password' are required")),
    }
}

/// SQL login
#[derive(Debug, Default)]
pub struct SqlPasswordAuth;

impl AuthStrategy for SqlPasswordAuth {
    fn configure(&self, ds: &mut dyn DataSource, d: &ConnectionDescriptor) -> Result<()> {
        let (user, password) = required_password(d)?;
        ds.set_authentication(AuthMode::SqlPassword.as_str());
        ds.set_user(user);
        ds.set_password(password);
        Ok(())
    }
}

/// Azure AD user and password
#[derive(Debug, Default)]
pub struct ActiveDirectoryPasswordAuth;

impl AuthStrategy for ActiveDirectoryPasswordAuth {
    fn configure(&self, ds: &mut dyn DataSource, d: &ConnectionDescriptor) -> Result<()> {
        let (user, password) = required_password(d)?;
        ds.set_authentication(AuthMode::ActiveDirectoryPassword.as_str());
        ds.set_user(user);
        ds.set_password(password);
        Ok(())
    }
}

/// Azure AD integrated; no credentials are set
#[derive(Debug, Default)]
pub struct ActiveDirectoryIntegratedAuth;

impl AuthStrategy for ActiveDirectoryIntegratedAuth {
    fn configure(&self, ds: &mut dyn DataSource, _d: &ConnectionDescriptor) -> Result<()> {
        ds.set_authentication(AuthMode::ActiveDirectoryIntegrated.as_str());
        Ok(())
    }
}

/// Managed identity; only the client id is set
#[derive(Debug, Default)]
pub struct ManagedIdentityAuth;

impl AuthStrategy for ManagedIdentityAuth {
    fn configure(&self, ds: &mut dyn DataSource, d: &ConnectionDescriptor) -> Result<()> {
        let client_id = d.extra(keys::MSI_CLIENT_ID).ok_or_else(|| {
            Error::config("'msiClientID' is required for ActiveDirectoryMSI authentication")
        })?;
        ds.set_authentication(AuthMode::ActiveDirectoryManagedIdentity.as_str());
        ds.set_msi_client_id(client_id);
        Ok(())
    }
}

/// Auth strategies keyed on `(provider, auth mode)`
#[derive(Clone, Default)]
pub struct AuthRegistry {
    strategies: HashMap<(Provider, AuthMode), Arc<dyn AuthStrategy>>,
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AuthRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the SQL Server variants
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let p = Provider::Sqlserver;
        registry.register(p, AuthMode::SqlPassword, Arc::new(SqlPasswordAuth));
        registry.register(p, AuthMode::ActiveDirectoryPassword, Arc::new(ActiveDirectoryPasswordAuth));
        registry.register(p, AuthMode::ActiveDirectoryIntegrated, Arc::new(ActiveDirectoryIntegratedAuth));
        registry.register(p, AuthMode::ActiveDirectoryManagedIdentity, Arc::new(ManagedIdentityAuth));
        registry
    }

    /// Register or replace a strategy
    pub fn register(&mut self, provider: Provider, mode: AuthMode, strategy: Arc<dyn AuthStrategy>) {
        self.strategies.insert((provider, mode), strategy);
    }

    /// Look up a strategy
    pub fn get(&self, provider: Provider, mode: AuthMode) -> Result<Arc<dyn AuthStrategy>> {
        self.strategies
            .get(&(provider, mode))
            .cloned()
            .ok_or_else(|| Error::unsupported_auth_mode(provider.name(), mode.as_str()))
    }

    /// Validate the descriptor, build and configure a data source, open a connection
    pub async fn connect(
        &self,
        provider: Provider,
        mode: AuthMode,
        factory: &dyn DataSourceFactory,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn Connection>> {
        mode.validate(descriptor)?;
        let strategy = self.get(provider, mode)?;

        let mut data_source = factory.create()?;
        data_source.set_server_name(&descriptor.host);
        data_source.set_port_number(descriptor.port);
        data_source.set_database_name(&descriptor.database);
        strategy.configure(data_source.as_mut(), descriptor)?;

        debug!(
            data_source = factory.class_name(),
            auth = %mode,
            host = %descriptor.host,
            "Opening data source connection"
        );
        let connection = data_source.get_connection().await?;
        info!(auth = %mode, database = %descriptor.database, "Connected through data source");
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDataSourceFactory, MemoryDatabase};

    fn azure(mode: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new("server.database.windows.net", 1433, "sales")
            .with_extra("connectionType", "Azure Active Directory")
            .with_extra("azureAuthType", mode)
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!("ActiveDirectoryMSI".parse::<AuthMode>().unwrap(), AuthMode::ActiveDirectoryManagedIdentity);
        assert_eq!("SqlPassword".parse::<AuthMode>().unwrap(), AuthMode::SqlPassword);
        assert!(matches!(
            "Kerberos".parse::<AuthMode>(),
            Err(Error::UnsupportedAuthMode { .. })
        ));
        assert!(AuthMode::parse_for(Provider::Mysql, "SqlPassword").is_err());
    }

    #[test]
    fn test_required_fields() {
        let d = azure("ActiveDirectoryIntegrated");
        assert!(AuthMode::ActiveDirectoryIntegrated.validate(&d).is_ok());
        assert!(AuthMode::SqlPassword.validate(&d).is_err());
        assert!(AuthMode::ActiveDirectoryManagedIdentity.validate(&d).is_err());

        let d = d.with_extra("msiClientID", "client-1");
        assert!(AuthMode::ActiveDirectoryManagedIdentity.validate(&d).is_ok());

        let d = azure("SqlPassword").with_credentials("sa", "pw");
        assert!(AuthMode::SqlPassword.validate(&d).is_ok());
    }

    #[tokio::test]
    async fn test_managed_identity_never_sets_password() {
        let db = MemoryDatabase::new();
        let factory = MemoryDataSourceFactory::new(db.clone());
        let d = azure("ActiveDirectoryMSI").with_extra("msiClientID", "client-1");

        let conn = AuthRegistry::with_defaults()
            .connect(Provider::Sqlserver, AuthMode::ActiveDirectoryManagedIdentity, &factory, &d)
            .await
            .unwrap();
        assert!(conn.is_valid().await);

        let settings = factory.last_settings().unwrap();
        assert_eq!(settings.authentication.as_deref(), Some("ActiveDirectoryMSI"));
        assert_eq!(settings.msi_client_id.as_deref(), Some("client-1"));
        assert!(settings.password.is_none());
        assert!(settings.user.is_none());
        assert_eq!(settings.server_name.as_deref(), Some("server.database.windows.net"));
    }

    #[tokio::test]
    async fn test_ad_password_sets_user_and_password() {
        let factory = MemoryDataSourceFactory::new(MemoryDatabase::new());
        let d = azure("ActiveDirectoryPassword")
            .with_credentials("alice@corp", "s3cret")
            .with_extra("msiClientID", "client-1");

        AuthRegistry::with_defaults()
            .connect(Provider::Sqlserver, AuthMode::ActiveDirectoryPassword, &factory, &d)
            .await
            .unwrap();

        let settings = factory.last_settings().unwrap();
        assert_eq!(settings.user.as_deref(), Some("alice@corp"));
        assert_eq!(settings.password.as_deref(), Some("s3cret"));
        assert!(settings.msi_client_id.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_strategy() {
        let factory = MemoryDataSourceFactory::new(MemoryDatabase::new());
        let d = azure("ActiveDirectoryIntegrated");
        let result = AuthRegistry::new()
            .connect(Provider::Sqlserver, AuthMode::ActiveDirectoryIntegrated, &factory, &d)
            .await;
        assert!(matches!(result, Err(Error::UnsupportedAuthMode { .. })));
    }
}
