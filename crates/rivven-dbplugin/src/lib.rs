//! # rivven-dbplugin
//!
//! Driver-managed relational database plugins for Rivven pipelines.
//!
//! The crate provides three stage kinds over a pluggable driver layer:
//!
//! - **Source**: runs an import query and streams its rows as records
//! - **Sink**: checks the target table, publishes the writer configuration
//!   and projects every input record onto typed target columns
//! - **Action / post-action**: runs a statement as a pipeline step, or after
//!   a run depending on its outcome
//!
//! ## Drivers
//!
//! Driver implementations are supplied by the pipeline engine through a
//! [`DriverProvider`](context::DriverProvider). Each loaded driver is
//! registered with a [`DriverManager`](driver::DriverManager) and shared
//! between stages through a reference-counted [`DriverRegistry`]; the last
//! stage to release it deregisters it.
//!
//! Every provider has a dialect that builds its connection URL and its
//! connection arguments. SQL Server additionally supports Azure AD
//! authentication variants through a data source.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_dbplugin::prelude::*;
//!
//! let drivers = StaticDriverProvider::new()
//!     .with_driver("jdbc", "postgres", Arc::new(PgDriverClass));
//! let ctx = StageContext::new(DriverRegistry::with_shared_manager(), Arc::new(drivers));
//!
//! let config: DatabaseSourceConfig = from_yaml(r#"
//! provider: postgres
//! host: localhost
//! database: app
//! user: app
//! password: secret
//! importQuery: SELECT id, name FROM users
//! "#)?;
//!
//! let mut records = DatabaseSource::new(config).read(&ctx).await?;
//! while let Some(record) = records.next().await {
//!     println!("{}", record?.to_json());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL driver via tokio-postgres
//! - `mysql` - MySQL driver via mysql_async
//! - `sqlserver` - SQL Server driver and data source via tiberius
//! - `full` - All drivers

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod action;
pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod record;
pub mod registry;
pub mod schema;
pub mod security;
pub mod sink;
pub mod source;
pub mod testing;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{ColumnDescriptor, ResultSet, Row, SqlType, Value};

    pub use crate::connection::{Connection, IsolationLevel};
    pub use crate::descriptor::{ConnectionDescriptor, Properties, SensitiveString};
    pub use crate::dialect::{dialect_for, DialectStrategy, Provider, ProviderKey};
    pub use crate::driver::{Driver, DriverClass, DriverManager};

    pub use crate::auth::{AuthMode, AuthRegistry, AuthStrategy, DataSource, DataSourceFactory};
    pub use crate::registry::{DriverHandle, DriverRegistry, ManagedConnection};
    pub use crate::schema::{ColumnTypeMap, ResolvedColumns, SchemaResolver};

    pub use crate::config::{from_json, from_properties, from_yaml, json_schema, DatabaseConfig};
    pub use crate::context::{
        DriverProvider, PipelineRunStatus, RunCondition, StageContext, StaticDriverProvider,
    };
    pub use crate::record::{Field, FieldType, Schema, StructuredRecord, TypedRow, TypedValue};

    pub use crate::action::{
        ActionOutcome, ActionReport, ActionState, DatabaseAction, DatabasePostAction,
        PostActionConfig, QueryActionConfig,
    };
    pub use crate::sink::{DatabaseSink, DatabaseSinkConfig, OutputFormatConfig};
    pub use crate::source::{DatabaseSource, DatabaseSourceConfig};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgDriver, PgDriverClass};

    #[cfg(feature = "mysql")]
    pub use crate::mysql::{MySqlDriver, MySqlDriverClass};

    #[cfg(feature = "sqlserver")]
    pub use crate::sqlserver::{SqlServerDataSourceFactory, SqlServerDriver, SqlServerDriverClass};
}

pub use error::{Error, Result};
pub use registry::DriverRegistry;
