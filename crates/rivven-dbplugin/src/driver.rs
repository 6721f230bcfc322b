//! Driver abstraction and the driver manager.
//!
//! A [`DriverClass`] is what the pipeline engine hands over for a plugin id:
//! a class name plus a factory. Instantiating it yields a [`Driver`], which
//! is registered with a [`DriverManager`]. Connections are opened through
//! the manager by URL, the first registered driver that accepts the URL
//! wins.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::connection::Connection;
use crate::descriptor::Properties;
use crate::error::{Error, Result};

/// A loaded database driver
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver name for logs
    fn name(&self) -> &str;

    /// Whether this driver understands the connection URL
    fn accepts_url(&self, url: &str) -> bool;

    /// Open a connection
    async fn connect(&self, url: &str, properties: &Properties) -> Result<Box<dyn Connection>>;
}

/// Loadable driver implementation supplied by the engine
pub trait DriverClass: Send + Sync {
    /// Fully qualified class name, e.g. `com.mysql.jdbc.Driver`
    fn class_name(&self) -> &str;

    /// Create a driver instance
    fn instantiate(&self) -> Result<Arc<dyn Driver>>;
}

impl fmt::Debug for dyn DriverClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverClass")
            .field("class_name", &self.class_name())
            .finish()
    }
}

/// Identifier of one registration in a [`DriverManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverId(u64);

struct Registration {
    id: DriverId,
    driver: Arc<dyn Driver>,
}

/// Set of registered drivers
pub struct DriverManager {
    drivers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

static SHARED: LazyLock<Arc<DriverManager>> = LazyLock::new(|| Arc::new(DriverManager::new()));

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DriverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .drivers
            .read()
            .iter()
            .map(|r| r.driver.name().to_string())
            .collect();
        f.debug_struct("DriverManager").field("drivers", &names).finish()
    }
}

impl DriverManager {
    /// Create an empty, isolated manager
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Process-wide manager
    pub fn shared() -> Arc<DriverManager> {
        Arc::clone(&SHARED)
    }

    /// Register a driver
    pub fn register(&self, driver: Arc<dyn Driver>) -> DriverId {
        let id = DriverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(driver = driver.name(), ?id, "Registering driver");
        self.drivers.write().push(Registration { id, driver });
        id
    }

    /// Remove a registration. Returns false if it was not present.
    pub fn deregister(&self, id: DriverId) -> bool {
        let mut drivers = self.drivers.write();
        let before = drivers.len();
        drivers.retain(|r| r.id != id);
        let removed = drivers.len() != before;
        if removed {
            debug!(?id, "Deregistered driver");
        }
        removed
    }

    /// Whether a registration is present
    pub fn is_registered(&self, id: DriverId) -> bool {
        self.drivers.read().iter().any(|r| r.id == id)
    }

    /// First registered driver accepting the URL
    pub fn driver_for(&self, url: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .read()
            .iter()
            .find(|r| r.driver.accepts_url(url))
            .map(|r| Arc::clone(&r.driver))
    }

    /// Open a connection through the first driver accepting the URL
    pub async fn connect(&self, url: &str, properties: &Properties) -> Result<Box<dyn Connection>> {
        let driver = self.driver_for(url).ok_or_else(|| {
            Error::connection(format!("No suitable driver found for {}", url))
        })?;
        driver.connect(url, properties).await
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    /// Whether no driver is registered
    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }
}

/// Parse `jdbc:<scheme>://host:port/db` into a URL with the `jdbc:` prefix removed
#[cfg(any(feature = "postgres", feature = "mysql"))]
pub(crate) fn parse_jdbc_url(url: &str) -> Result<url::Url> {
    let native = url
        .strip_prefix("jdbc:")
        .ok_or_else(|| Error::connection(format!("Not a JDBC URL: {}", url)))?;
    url::Url::parse(native)
        .map_err(|e| Error::connection_with_source(format!("Invalid connection URL {}", url), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDriver;

    #[tokio::test]
    async fn test_register_and_connect() {
        let manager = DriverManager::new();
        let driver = MemoryDriver::new();
        let id = manager.register(Arc::new(driver.clone()));

        assert!(manager.is_registered(id));
        assert!(manager.driver_for("jdbc:memory://test").is_some());
        assert!(manager.driver_for("jdbc:mysql://localhost/db").is_none());

        let conn = manager
            .connect("jdbc:memory://test", &Properties::new())
            .await
            .unwrap();
        assert!(conn.is_valid().await);
    }

    #[tokio::test]
    async fn test_no_suitable_driver() {
        let manager = DriverManager::new();
        let err = manager
            .connect("jdbc:mysql://localhost/db", &Properties::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("No suitable driver"));
    }

    #[test]
    fn test_deregister() {
        let manager = DriverManager::new();
        let id = manager.register(Arc::new(MemoryDriver::new()));
        assert_eq!(manager.len(), 1);
        assert!(manager.deregister(id));
        assert!(!manager.deregister(id));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_shared_is_singleton() {
        assert!(Arc::ptr_eq(&DriverManager::shared(), &DriverManager::shared()));
    }
}
