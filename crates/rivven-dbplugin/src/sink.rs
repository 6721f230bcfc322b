//! Table sink: setup, output-format publication and per-record projection.
//!
//! Writing itself belongs to the engine's record writer. The sink checks the
//! target table at `prepare_run`, publishes an [`OutputFormatConfig`] for the
//! writer, resolves column types at `initialize` and turns every input record
//! into a [`TypedRow`] at `transform`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::config::DatabaseConfig;
use crate::connection::{Connection, IsolationLevel};
use crate::context::StageContext;
use crate::descriptor::{PASSWORD_KEY, USER_KEY};
use crate::error::{Error, Result};
use crate::record::{project, Schema, StructuredRecord, TypedRow};
use crate::registry::{DriverHandle, DriverRegistry, ManagedConnection};
use crate::schema::{ResolvedColumns, SchemaResolver};
use crate::security::{validate_sql_identifier, validate_table_name};

/// Keys of the published output-format configuration
pub mod output_keys {
    /// Driver class name
    pub const DRIVER_CLASS: &str = "jdbc.driver.class";
    /// Connection URL
    pub const URL: &str = "jdbc.url";
    /// Login user
    pub const USERNAME: &str = "jdbc.username";
    /// Login password
    pub const PASSWORD: &str = "jdbc.password";
    /// Target table
    pub const TABLE_NAME: &str = "jdbc.output.table.name";
    /// Comma-separated target columns
    pub const FIELD_NAMES: &str = "jdbc.output.field.names";
    /// Transaction isolation level name
    pub const ISOLATION_LEVEL: &str = "transaction.isolation.level";
    /// Remaining connection arguments as `k=v;k=v`
    pub const CONNECTION_ARGUMENTS: &str = "connection.arguments";
}

/// Database sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSinkConfig {
    /// Connection settings
    #[serde(flatten)]
    #[validate(nested)]
    pub connection: DatabaseConfig,

    /// Target table, optionally schema-qualified
    #[validate(length(min = 1, max = 511))]
    pub table_name: String,

    /// Isolation level for the writer's transactions
    #[serde(default)]
    pub transaction_isolation_level: IsolationLevel,
}

impl DatabaseSinkConfig {
    /// Sink writing to `table_name`
    pub fn new(connection: DatabaseConfig, table_name: impl Into<String>) -> Self {
        Self {
            connection,
            table_name: table_name.into(),
            transaction_isolation_level: IsolationLevel::default(),
        }
    }

    /// Check table name and connection settings
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Validation failed: {}", e)))?;
        validate_table_name(&self.table_name)?;
        self.connection.validate_config()
    }
}

/// Flat settings handed to the engine's record writer
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OutputFormatConfig(BTreeMap<String, String>);

impl OutputFormatConfig {
    /// Value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The underlying map
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl fmt::Debug for OutputFormatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| {
                let v = if k == output_keys::PASSWORD { "[REDACTED]" } else { v.as_str() };
                (k, v)
            }))
            .finish()
    }
}

struct Initialized {
    registry: Arc<DriverRegistry>,
    handle: DriverHandle,
    columns: ResolvedColumns,
}

/// Writes records to one table through the engine's record writer
pub struct DatabaseSink {
    config: DatabaseSinkConfig,
    state: Option<Initialized>,
}

impl fmt::Debug for DatabaseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSink")
            .field("config", &self.config)
            .field("columns", &self.resolved_columns())
            .finish()
    }
}

impl DatabaseSink {
    /// Create a sink
    pub fn new(config: DatabaseSinkConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    /// The sink's configuration
    pub fn config(&self) -> &DatabaseSinkConfig {
        &self.config
    }

    /// Column types resolved by [`initialize`](Self::initialize)
    pub fn resolved_columns(&self) -> Option<&ResolvedColumns> {
        self.state.as_ref().map(|s| &s.columns)
    }

    async fn connect(&self, ctx: &StageContext) -> Result<(DriverHandle, ManagedConnection)> {
        let handle = ctx.acquire_driver(&self.config.connection)?;
        let connection = ctx
            .open(&handle, &self.config.connection, &Default::default())
            .await?;
        Ok((handle, connection))
    }

    /// Verify the target table exists and build the writer configuration.
    ///
    /// The column list is the input schema's field names, in order.
    pub async fn prepare_run(
        &self,
        ctx: &StageContext,
        input_schema: &Schema,
    ) -> Result<OutputFormatConfig> {
        self.config.validate_config()?;
        let columns = output_columns(input_schema)?;
        let table = &self.config.table_name;

        let (handle, connection) = self.connect(ctx).await?;
        let dialect = self.config.connection.dialect();
        let exists = connection.table_exists(dialect.as_ref(), table).await;
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
        drop(connection);
        let class_name = handle.class_name().to_string();
        ctx.registry().release(handle);

        if !exists? {
            return Err(Error::schema(format!("Table '{}' does not exist", table)));
        }

        let connection = &self.config.connection;
        let mut arguments = connection.connection_properties()?;
        arguments.remove(USER_KEY);
        arguments.remove(PASSWORD_KEY);

        let mut out = BTreeMap::new();
        out.insert(output_keys::DRIVER_CLASS.to_string(), class_name);
        out.insert(output_keys::URL.to_string(), connection.connection_string()?);
        if let Some(user) = &connection.user {
            out.insert(output_keys::USERNAME.to_string(), user.clone());
        }
        if let Some(password) = &connection.password {
            out.insert(output_keys::PASSWORD.to_string(), password.expose_secret().to_string());
        }
        out.insert(output_keys::TABLE_NAME.to_string(), table.clone());
        out.insert(output_keys::FIELD_NAMES.to_string(), columns.join(","));
        out.insert(
            output_keys::ISOLATION_LEVEL.to_string(),
            self.config.transaction_isolation_level.as_str().to_string(),
        );
        out.insert(
            output_keys::CONNECTION_ARGUMENTS.to_string(),
            arguments.to_argument_string(),
        );

        info!(table = %table, columns = columns.len(), "Prepared sink output");
        Ok(OutputFormatConfig(out))
    }

    /// Take a driver reference for the stage and resolve target column types
    pub async fn initialize(&mut self, ctx: &StageContext, input_schema: &Schema) -> Result<()> {
        self.config.validate_config()?;
        let columns = output_columns(input_schema)?;

        let (handle, connection) = self.connect(ctx).await?;
        let dialect = self.config.connection.dialect();
        let resolved = SchemaResolver::new(dialect.as_ref())
            .resolve(&connection, &self.config.table_name, &columns)
            .await;
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
        drop(connection);

        let resolved = match resolved {
            Ok(r) => r,
            Err(e) => {
                ctx.registry().release(handle);
                return Err(e);
            }
        };

        debug!(table = %resolved.table, columns = ?resolved.columns, "Sink initialized");
        if let Some(previous) = self.state.replace(Initialized {
            registry: Arc::clone(ctx.registry()),
            handle,
            columns: resolved,
        }) {
            previous.registry.release(previous.handle);
        }
        Ok(())
    }

    /// Project a record to the target columns and attach their types
    pub fn transform(&self, record: &StructuredRecord) -> Result<TypedRow> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| Error::config("Sink is not initialized"))?;
        let row = project(record, &state.columns.columns)?;
        TypedRow::new(row, &state.columns.types)
    }

    /// Release the stage's driver reference
    pub fn destroy(&mut self) {
        if let Some(state) = self.state.take() {
            debug!(driver = %state.handle.key(), "Releasing sink driver");
            state.registry.release(state.handle);
        }
    }
}

fn output_columns(schema: &Schema) -> Result<Vec<String>> {
    let columns = schema.field_names();
    if columns.is_empty() {
        return Err(Error::config("Input schema has no fields"));
    }
    for column in &columns {
        validate_sql_identifier(column)?;
    }
    Ok(columns)
}
