//! Query source: runs one import query and streams the result as records.
//!
//! The engine resolves macros in the query before it reaches this module.
//! Split settings are validated here; the split itself belongs to the
//! engine's input format, so a source run covers the whole query, with any
//! `$CONDITIONS` placeholder treated as always true.

use futures::stream::BoxStream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::config::{number_or_string, DatabaseConfig};
use crate::connection::Connection;
use crate::context::StageContext;
use crate::descriptor::Properties;
use crate::error::{Error, Result};
use crate::record::{record_from_row, Schema, StructuredRecord};

/// Placeholder the engine's input format replaces with split bounds
pub const CONDITIONS_PLACEHOLDER: &str = "$CONDITIONS";

/// Connection argument carrying the configured fetch size
pub const FETCH_SIZE_KEY: &str = "fetchSize";

/// Database source configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSourceConfig {
    /// Connection settings
    #[serde(flatten)]
    #[validate(nested)]
    pub connection: DatabaseConfig,

    /// Query whose rows become records
    #[serde(alias = "query")]
    #[validate(length(min = 1))]
    pub import_query: String,

    /// Query returning the min and max of the split column
    #[serde(default)]
    pub bounding_query: Option<String>,

    /// Column used to split the import
    #[serde(default)]
    pub split_by: Option<String>,

    /// Number of splits (default: 1)
    #[serde(default, deserialize_with = "number_or_string")]
    #[schemars(with = "Option<u32>")]
    #[validate(range(min = 1))]
    pub num_splits: Option<u32>,

    /// Rows fetched per round trip, passed to the driver
    #[serde(default, deserialize_with = "number_or_string")]
    #[schemars(with = "Option<u32>")]
    #[validate(range(min = 1))]
    pub fetch_size: Option<u32>,

    /// Name of the output record schema
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
}

fn default_schema_name() -> String {
    "output".to_string()
}

impl DatabaseSourceConfig {
    /// Source over `query` with default split settings
    pub fn new(connection: DatabaseConfig, query: impl Into<String>) -> Self {
        Self {
            connection,
            import_query: query.into(),
            bounding_query: None,
            split_by: None,
            num_splits: None,
            fetch_size: None,
            schema_name: default_schema_name(),
        }
    }

    /// Check query, split settings and connection settings
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("Validation failed: {}", e)))?;

        if self.import_query.trim().is_empty() {
            return Err(Error::config("'importQuery' must not be empty"));
        }

        if self.num_splits.unwrap_or(1) > 1 {
            if self.split_by.as_deref().map_or(true, |s| s.trim().is_empty()) {
                return Err(Error::config("'splitBy' is required when 'numSplits' is greater than 1"));
            }
            if self
                .bounding_query
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
            {
                return Err(Error::config(
                    "'boundingQuery' is required when 'numSplits' is greater than 1",
                ));
            }
            if !self.import_query.contains(CONDITIONS_PLACEHOLDER) {
                return Err(Error::config(format!(
                    "'importQuery' must contain '{}' when 'numSplits' is greater than 1",
                    CONDITIONS_PLACEHOLDER
                )));
            }
        }

        self.connection.validate_config()
    }

    /// Import query for a single-split run
    pub fn resolved_query(&self) -> String {
        self.import_query.replace(CONDITIONS_PLACEHOLDER, "1 = 1")
    }

    fn connection_extras(&self) -> Properties {
        let mut props = Properties::new();
        if let Some(size) = self.fetch_size {
            props.insert(FETCH_SIZE_KEY, size.to_string());
        }
        props
    }
}

/// Reads the import query's rows as records
#[derive(Debug, Clone)]
pub struct DatabaseSource {
    config: DatabaseSourceConfig,
}

impl DatabaseSource {
    /// Create a source
    pub fn new(config: DatabaseSourceConfig) -> Self {
        Self { config }
    }

    /// The source's configuration
    pub fn config(&self) -> &DatabaseSourceConfig {
        &self.config
    }

    /// Derive the output schema from the query's result metadata.
    ///
    /// A `$CONDITIONS` placeholder is replaced with `1 = 0` so that no rows
    /// are fetched.
    pub async fn discover_schema(&self, ctx: &StageContext) -> Result<Schema> {
        self.config.validate_config()?;
        let handle = ctx.acquire_driver(&self.config.connection)?;
        let connection = ctx
            .open(&handle, &self.config.connection, &self.config.connection_extras())
            .await?;

        let sql = self.config.import_query.replace(CONDITIONS_PLACEHOLDER, "1 = 0");
        let result = connection.query(&sql).await;
        if let Err(e) = connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
        drop(connection);
        ctx.registry().release(handle);

        let result = result?;
        Ok(Schema::from_columns(&self.config.schema_name, &result.columns))
    }

    /// Open a connection, run the query and stream one record per row.
    ///
    /// The connection and the driver reference are held by the stream and
    /// released when it is exhausted or dropped.
    pub async fn read(
        &self,
        ctx: &StageContext,
    ) -> Result<BoxStream<'static, Result<StructuredRecord>>> {
        self.config.validate_config()?;

        let handle = ctx.acquire_driver(&self.config.connection)?;
        let connection = ctx
            .open(&handle, &self.config.connection, &self.config.connection_extras())
            .await?;

        let registry = Arc::clone(ctx.registry());
        let sql = self.config.resolved_query();
        let schema_name = self.config.schema_name.clone();

        let stream = async_stream::stream! {
            debug!(sql = %sql, "Executing import query");
            let result = connection.query(&sql).await;
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Failed to close source connection");
            }
            drop(connection);
            registry.release(handle);

            match result {
                Ok(result) => {
                    let schema = Arc::new(Schema::from_columns(schema_name, &result.columns));
                    info!(rows = result.len(), fields = schema.fields.len(), "Import query returned");
                    for row in result.rows {
                        yield record_from_row(row, &schema);
                    }
                }
                Err(e) => yield Err(e),
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::from_properties;
    use crate::dialect::Provider;
    use std::collections::BTreeMap;

    fn connection() -> DatabaseConfig {
        DatabaseConfig::new(Provider::Postgres, "localhost", "app").with_credentials("app", "pw")
    }

    #[test]
    fn test_split_settings() {
        let mut config = DatabaseSourceConfig::new(connection(), "SELECT id FROM t");
        assert!(config.validate_config().is_ok());

        config.num_splits = Some(4);
        assert!(config.validate_config().is_err());

        config.split_by = Some("id".into());
        config.bounding_query = Some("SELECT MIN(id), MAX(id) FROM t".into());
        assert!(config.validate_config().is_err());

        config.import_query = "SELECT id FROM t WHERE $CONDITIONS".into();
        assert!(config.validate_config().is_ok());
        assert_eq!(config.resolved_query(), "SELECT id FROM t WHERE 1 = 1");

        config.num_splits = Some(0);
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_from_properties() {
        let props: BTreeMap<String, String> = [
            ("provider", "postgres"),
            ("host", "db"),
            ("database", "app"),
            ("importQuery", "SELECT * FROM t"),
            ("numSplits", "1"),
            ("fetchSize", "500"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config: DatabaseSourceConfig = from_properties(&props).unwrap();
        assert_eq!(config.fetch_size, Some(500));
        assert_eq!(config.num_splits, Some(1));
        assert_eq!(config.connection_extras().get("fetchSize"), Some("500"));
        assert!(config.connection.extras.is_empty());
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_empty_query() {
        let config = DatabaseSourceConfig::new(connection(), " ");
        assert!(matches!(config.validate_config(), Err(Error::Configuration { .. })));
    }
}
