//! Engine boundary: driver acquisition and pipeline run metadata.
//!
//! The pipeline engine supplies driver classes and data-source factories by
//! plugin id through a [`DriverProvider`]. A [`StageContext`] bundles the
//! provider with the shared [`DriverRegistry`] and the [`AuthRegistry`], and
//! is what sources, sinks and actions are handed at lifecycle time.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{AuthRegistry, DataSourceFactory};
use crate::config::DatabaseConfig;
use crate::descriptor::Properties;
use crate::dialect::{keys, JDBC_KIND};
use crate::driver::DriverClass;
use crate::error::{Error, Result};
use crate::registry::{DriverHandle, DriverRegistry, ManagedConnection};

/// Supplies loadable drivers by plugin id
pub trait DriverProvider: Send + Sync {
    /// Driver class for `(plugin type, plugin name)`
    fn load_driver_class(&self, plugin_type: &str, plugin_name: &str) -> Result<Arc<dyn DriverClass>>;

    /// Data-source factory for `(plugin type, plugin name)`, used by
    /// authentication variants that bypass the driver manager
    fn load_data_source(
        &self,
        plugin_type: &str,
        plugin_name: &str,
    ) -> Result<Arc<dyn DataSourceFactory>> {
        Err(Error::driver_load(
            format!("{}:{}", plugin_type, plugin_name),
            "No data source available",
        ))
    }
}

/// [`DriverProvider`] backed by an in-process table
#[derive(Default, Clone)]
pub struct StaticDriverProvider {
    drivers: HashMap<(String, String), Arc<dyn DriverClass>>,
    data_sources: HashMap<(String, String), Arc<dyn DataSourceFactory>>,
}

impl fmt::Debug for StaticDriverProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDriverProvider")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("data_sources", &self.data_sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticDriverProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver class
    pub fn with_driver(
        mut self,
        plugin_type: &str,
        plugin_name: &str,
        class: Arc<dyn DriverClass>,
    ) -> Self {
        self.drivers
            .insert((plugin_type.to_string(), plugin_name.to_string()), class);
        self
    }

    /// Add a data-source factory
    pub fn with_data_source(
        mut self,
        plugin_type: &str,
        plugin_name: &str,
        factory: Arc<dyn DataSourceFactory>,
    ) -> Self {
        self.data_sources
            .insert((plugin_type.to_string(), plugin_name.to_string()), factory);
        self
    }
}

impl DriverProvider for StaticDriverProvider {
    fn load_driver_class(&self, plugin_type: &str, plugin_name: &str) -> Result<Arc<dyn DriverClass>> {
        self.drivers
            .get(&(plugin_type.to_string(), plugin_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::driver_load(
                    format!("{}:{}", plugin_type, plugin_name),
                    format!(
                        "Unable to load JDBC driver class for plugin name '{}'. \
                         Ensure that the plugin '{}' of type '{}' containing the driver \
                         has been installed correctly.",
                        plugin_name, plugin_name, plugin_type
                    ),
                )
            })
    }

    fn load_data_source(
        &self,
        plugin_type: &str,
        plugin_name: &str,
    ) -> Result<Arc<dyn DataSourceFactory>> {
        self.data_sources
            .get(&(plugin_type.to_string(), plugin_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::driver_load(
                    format!("{}:{}", plugin_type, plugin_name),
                    format!("Unable to load data source for plugin name '{}'", plugin_name),
                )
            })
    }
}

/// Final status of a pipeline run, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineRunStatus {
    /// All stages succeeded
    Completed,
    /// At least one stage failed
    Failed,
    /// Stopped by the user
    Killed,
}

impl PipelineRunStatus {
    /// Whether the run succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// When a post-run action fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunCondition {
    /// Always
    #[default]
    Completion,
    /// Only after a successful run
    Success,
    /// Only after a failed run
    Failure,
}

impl RunCondition {
    /// Whether an action with this condition runs for `status`
    pub fn should_run(&self, status: PipelineRunStatus) -> bool {
        match self {
            Self::Completion => true,
            Self::Success => status.is_success(),
            Self::Failure => !status.is_success(),
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for RunCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completion" => Ok(Self::Completion),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(Error::config(format!(
                "Invalid run condition '{}', expected completion, success or failure",
                other
            ))),
        }
    }
}

/// Everything a stage needs to reach a database
#[derive(Clone)]
pub struct StageContext {
    registry: Arc<DriverRegistry>,
    drivers: Arc<dyn DriverProvider>,
    auth: AuthRegistry,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("registry", &self.registry)
            .field("auth", &self.auth)
            .finish()
    }
}

impl StageContext {
    /// Context over a registry and a driver provider, with the default
    /// authentication strategies
    pub fn new(registry: Arc<DriverRegistry>, drivers: Arc<dyn DriverProvider>) -> Self {
        Self {
            registry,
            drivers,
            auth: AuthRegistry::with_defaults(),
        }
    }

    /// Replace the authentication strategies
    pub fn with_auth(mut self, auth: AuthRegistry) -> Self {
        self.auth = auth;
        self
    }

    /// The shared driver registry
    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Load the configured driver class and take a registry reference to it
    pub fn acquire_driver(&self, config: &DatabaseConfig) -> Result<DriverHandle> {
        let dialect = config.dialect();
        let plugin_name = config.plugin_name();
        let url = config.connection_string()?;

        let class = self.drivers.load_driver_class(dialect.driver_kind(), plugin_name)?;
        debug!(
            plugin = plugin_name,
            class = class.class_name(),
            "Loaded driver class"
        );
        self.registry
            .ensure_available(class.as_ref(), &url, dialect.driver_kind(), plugin_name)
    }

    /// Open a connection for `config` tied to `handle`.
    ///
    /// Configurations selecting an authentication variant connect through
    /// the plugin's data source; all others go through the driver manager
    /// with the merged connection properties plus `extra`.
    pub async fn open(
        &self,
        handle: &DriverHandle,
        config: &DatabaseConfig,
        extra: &Properties,
    ) -> Result<ManagedConnection> {
        let descriptor = config.descriptor();
        let dialect = config.dialect();

        if let Some(mode) = dialect.auth_mode(&descriptor)? {
            let plugin_type = descriptor.extra(keys::AZURE_DRIVER_TYPE).unwrap_or(JDBC_KIND);
            let plugin_name = descriptor.extra(keys::AZURE_DRIVER_NAME).ok_or_else(|| {
                Error::config(format!(
                    "'{}' is required for {} authentication",
                    keys::AZURE_DRIVER_NAME,
                    mode
                ))
            })?;
            let factory = self.drivers.load_data_source(plugin_type, plugin_name)?;
            let inner = self
                .auth
                .connect(config.provider, mode, factory.as_ref(), &descriptor)
                .await?;
            return Ok(handle.adopt(inner));
        }

        let url = config.connection_string()?;
        let mut properties = config.connection_properties()?;
        properties.extend(extra.clone());
        debug!(url = %url, properties = ?properties, "Opening connection");
        let connection = handle.connect(&url, &properties).await?;
        info!(
            provider = %config.provider,
            database = %config.database,
            "Connected"
        );
        Ok(connection)
    }
}
