//! Error types for rivven-dbplugin
//!
//! Every error raised by this crate is fatal for the stage that hit it. Retry
//! policy belongs to the pipeline engine, so errors are classified for
//! reporting rather than for retrying:
//! - Configuration errors surface before any connection attempt
//! - Driver load errors mean a missing or incompatible driver
//! - Connection, schema and statement errors surface per stage instance

use std::fmt;
use thiserror::Error;

/// Result type for rivven-dbplugin operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error source carried by some variants
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed arguments, missing auth fields, unsupported auth mode
    Configuration,
    /// Driver class could not be instantiated or registered
    DriverLoad,
    /// Connection open or authentication failed
    Connection,
    /// Probe query missing a column, or the table is absent
    Schema,
    /// A record did not carry a configured field
    Record,
    /// A value could not be converted for binding
    TypeConversion,
    /// Statement execution failed
    Statement,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::DriverLoad => write!(f, "driver_load"),
            Self::Connection => write!(f, "connection"),
            Self::Schema => write!(f, "schema"),
            Self::Record => write!(f, "record"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Statement => write!(f, "statement"),
        }
    }
}

/// Main error type for rivven-dbplugin
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Invalid or incomplete configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Authentication mode tag not known to the provider
    #[error("unsupported authentication mode '{mode}' for {provider}")]
    UnsupportedAuthMode { provider: String, mode: String },

    /// Driver could not be instantiated or registered
    #[error("driver load error for {driver}: {message}")]
    DriverLoad {
        driver: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Connection could not be opened
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Target table or column does not match the configuration
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        message: String,
        column: Option<String>,
    },

    /// Input record does not carry a configured column
    #[error("missing schema field for column '{field}'")]
    MissingField { field: String },

    /// Value could not be converted to the target SQL type
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Statement failed to execute
    #[error("statement execution failed: {message} (statement: {statement})")]
    StatementExecution {
        message: String,
        statement: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::UnsupportedAuthMode { .. } => {
                ErrorCategory::Configuration
            }
            Self::DriverLoad { .. } => ErrorCategory::DriverLoad,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::SchemaMismatch { .. } => ErrorCategory::Schema,
            Self::MissingField { .. } => ErrorCategory::Record,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::StatementExecution { .. } => ErrorCategory::Statement,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported auth mode error
    pub fn unsupported_auth_mode(provider: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::UnsupportedAuthMode {
            provider: provider.into(),
            mode: mode.into(),
        }
    }

    /// Create a driver load error
    pub fn driver_load(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DriverLoad {
            driver: driver.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a driver load error with source
    pub fn driver_load_with_source(
        driver: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DriverLoad {
            driver: driver.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a schema mismatch error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
            column: None,
        }
    }

    /// Create a schema mismatch error naming the missing column
    pub fn missing_column(table: &str, column: impl Into<String>) -> Self {
        let column = column.into();
        Self::SchemaMismatch {
            message: format!("missing column '{}' in SQL table '{}'", column, table),
            column: Some(column),
        }
    }

    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a statement execution error
    pub fn statement(message: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::StatementExecution {
            message: message.into(),
            statement: statement.into(),
            source: None,
        }
    }

    /// Create a statement execution error with source
    pub fn statement_with_source(
        message: impl Into<String>,
        statement: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StatementExecution {
            message: message.into(),
            statement: statement.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The statement attached to this error, if any
    pub fn statement_text(&self) -> Option<&str> {
        match self {
            Self::StatementExecution { statement, .. } => Some(statement),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(
            Error::config("bad").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::unsupported_auth_mode("SQL Server", "Kerberos").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::driver_load("org.postgresql.Driver", "boom").category(),
            ErrorCategory::DriverLoad
        );
        assert_eq!(
            Error::missing_column("users", "email").category(),
            ErrorCategory::Schema
        );
        assert_eq!(
            Error::statement("syntax error", "SELEC 1").category(),
            ErrorCategory::Statement
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::missing_column("users", "email");
        assert!(err.to_string().contains("'email'"));
        assert!(err.to_string().contains("users"));

        let err = Error::statement("syntax error", "SELECT * FORM users");
        assert!(err.to_string().contains("SELECT * FORM users"));
        assert_eq!(err.statement_text(), Some("SELECT * FORM users"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::DriverLoad.to_string(), "driver_load");
        assert_eq!(ErrorCategory::TypeConversion.to_string(), "type_conversion");
    }
}
