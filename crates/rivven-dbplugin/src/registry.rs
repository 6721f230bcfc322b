//! Reference-counted driver registration.
//!
//! Many stages in one process may need the same logical driver. The
//! [`DriverRegistry`] instantiates and registers a driver once per
//! `(kind, name)` key and counts the [`DriverHandle`]s referencing it. The
//! registration is removed from the [`DriverManager`] when the last handle,
//! and the last connection opened through a handle, is dropped. A handle
//! always connects through the driver registered under its own key, even
//! when another registered driver accepts the same URL.
//!
//! ```rust,ignore
//! let registry = DriverRegistry::new(Arc::new(DriverManager::new()));
//! let handle = registry.ensure_available(&*driver_class, &url, "jdbc", "mysql")?;
//! let conn = handle.connect(&url, &properties).await?;
//! // ... use conn ...
//! drop(conn);
//! registry.release(handle); // deregisters if nothing else references the key
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::descriptor::Properties;
use crate::dialect::{DialectStrategy, ProviderKey};
use crate::driver::{Driver, DriverClass, DriverId, DriverManager};
use crate::error::{Error, Result};
use crate::types::{ResultSet, Row};

/// Registration key: `(provider kind, provider name)`
pub type DriverKey = ProviderKey;

struct Entry {
    registration: DriverId,
    driver: Arc<dyn Driver>,
    class_name: String,
    references: usize,
}

/// Tracks driver registrations shared across stages
pub struct DriverRegistry {
    manager: Arc<DriverManager>,
    entries: Mutex<HashMap<DriverKey, Entry>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let counts: Vec<(String, usize)> = entries
            .iter()
            .map(|(k, e)| (k.to_string(), e.references))
            .collect();
        f.debug_struct("DriverRegistry").field("entries", &counts).finish()
    }
}

impl DriverRegistry {
    /// Registry over the given manager
    pub fn new(manager: Arc<DriverManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Registry over [`DriverManager::shared`]
    pub fn with_shared_manager() -> Arc<Self> {
        Self::new(DriverManager::shared())
    }

    /// The underlying driver manager
    pub fn manager(&self) -> &Arc<DriverManager> {
        &self.manager
    }

    /// Make sure a driver for `(kind, name)` is registered and take a reference to it.
    ///
    /// The first call for a key instantiates `driver_class` and registers the
    /// instance. Later calls only increment the reference count. The
    /// registered driver must accept `connection_url` on every call.
    pub fn ensure_available(
        self: &Arc<Self>,
        driver_class: &dyn DriverClass,
        connection_url: &str,
        kind: &str,
        name: &str,
    ) -> Result<DriverHandle> {
        let key = DriverKey::new(kind, name);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            if !entry.driver.accepts_url(connection_url) {
                return Err(Error::driver_load(
                    entry.class_name.clone(),
                    format!(
                        "Driver registered as {} does not accept connection URL '{}'",
                        key, connection_url
                    ),
                ));
            }
            entry.references += 1;
            debug!(
                driver = %key,
                references = entry.references,
                "Driver already registered"
            );
            let driver = Arc::clone(&entry.driver);
            let class_name = entry.class_name.clone();
            return Ok(self.handle(key, driver, class_name));
        }

        let class_name = driver_class.class_name().to_string();
        let driver = driver_class.instantiate().map_err(|e| match e {
            Error::DriverLoad { .. } => e,
            other => Error::driver_load_with_source(
                class_name.clone(),
                "Unable to instantiate driver",
                other,
            ),
        })?;

        if !driver.accepts_url(connection_url) {
            return Err(Error::driver_load(
                class_name,
                format!("Driver does not accept connection URL '{}'", connection_url),
            ));
        }

        let registration = self.manager.register(Arc::clone(&driver));
        info!(driver = %key, class = %class_name, "Registered driver");
        entries.insert(
            key.clone(),
            Entry {
                registration,
                driver: Arc::clone(&driver),
                class_name: class_name.clone(),
                references: 1,
            },
        );

        Ok(self.handle(key, driver, class_name))
    }

    fn handle(
        self: &Arc<Self>,
        key: DriverKey,
        driver: Arc<dyn Driver>,
        class_name: String,
    ) -> DriverHandle {
        DriverHandle {
            lease: Arc::new(Lease {
                registry: Arc::clone(self),
                key,
                driver,
            }),
            class_name,
        }
    }

    /// Give up a handle. Connections opened through it keep the
    /// registration alive until they are dropped.
    pub fn release(&self, handle: DriverHandle) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&handle.lease.registry)));
        drop(handle);
    }

    /// Number of live references for a key
    pub fn active_references(&self, key: &DriverKey) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.references)
    }

    /// Whether a key is currently registered
    pub fn is_registered(&self, key: &DriverKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    fn release_key(&self, key: &DriverKey) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            warn!(driver = %key, "Release for unknown driver registration");
            return;
        };

        entry.references -= 1;
        if entry.references > 0 {
            debug!(driver = %key, references = entry.references, "Released driver reference");
            return;
        }

        if let Some(entry) = entries.remove(key) {
            self.manager.deregister(entry.registration);
            info!(driver = %key, class = %entry.class_name, "Deregistered driver");
        }
    }
}

struct Lease {
    registry: Arc<DriverRegistry>,
    key: DriverKey,
    driver: Arc<dyn Driver>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release_key(&self.key);
    }
}

/// A reference to a registered driver.
///
/// Dropping the handle releases the reference; connections opened through
/// the handle hold it too.
pub struct DriverHandle {
    lease: Arc<Lease>,
    class_name: String,
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("key", &self.lease.key)
            .field("class_name", &self.class_name)
            .finish()
    }
}

impl DriverHandle {
    /// Registration key
    pub fn key(&self) -> &DriverKey {
        &self.lease.key
    }

    /// Driver class name
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Open a connection through the driver registered under this handle's key
    pub async fn connect(&self, url: &str, properties: &Properties) -> Result<ManagedConnection> {
        let driver = &self.lease.driver;
        if !driver.accepts_url(url) {
            return Err(Error::connection(format!(
                "Driver registered as {} does not accept {}",
                self.lease.key, url
            )));
        }
        let inner = driver.connect(url, properties).await?;
        Ok(self.adopt(inner))
    }

    /// Tie a connection opened by other means (e.g. a data source) to this handle
    pub fn adopt(&self, inner: Box<dyn Connection>) -> ManagedConnection {
        ManagedConnection {
            inner,
            lease: Arc::clone(&self.lease),
        }
    }
}

/// A connection that keeps its driver registration alive
pub struct ManagedConnection {
    inner: Box<dyn Connection>,
    lease: Arc<Lease>,
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("driver", &self.lease.key)
            .finish()
    }
}

#[async_trait]
impl Connection for ManagedConnection {
    async fn query(&self, sql: &str) -> Result<ResultSet> {
        self.inner.query(sql).await
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.inner.execute(sql).await
    }

    async fn query_one(&self, sql: &str) -> Result<Option<Row>> {
        self.inner.query_one(sql).await
    }

    async fn table_exists(&self, dialect: &dyn DialectStrategy, table_name: &str) -> Result<bool> {
        self.inner.table_exists(dialect, table_name).await
    }

    async fn is_valid(&self) -> bool {
        self.inner.is_valid().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryDriver, MemoryDriverClass};

    const URL: &str = "jdbc:memory://unit";

    fn setup() -> (Arc<DriverRegistry>, MemoryDriverClass) {
        let registry = DriverRegistry::new(Arc::new(DriverManager::new()));
        (registry, MemoryDriverClass::new(MemoryDriver::new()))
    }

    #[test]
    fn test_idempotent_registration() {
        let (registry, class) = setup();
        let key = DriverKey::new("jdbc", "memory");

        let h1 = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
        let h2 = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();

        assert_eq!(class.instantiations(), 1);
        assert_eq!(registry.manager().len(), 1);
        assert_eq!(registry.active_references(&key), 2);

        registry.release(h1);
        assert!(registry.is_registered(&key));
        assert_eq!(registry.manager().len(), 1);

        registry.release(h2);
        assert!(!registry.is_registered(&key));
        assert!(registry.manager().is_empty());
    }

    #[test]
    fn test_rejects_foreign_url() {
        let (registry, class) = setup();
        let err = registry
            .ensure_available(&class, "jdbc:mysql://localhost/db", "jdbc", "memory")
            .unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
        assert!(registry.manager().is_empty());
    }

    #[test]
    fn test_registered_key_rechecks_url() {
        let (registry, class) = setup();
        let key = DriverKey::new("jdbc", "memory");
        let handle = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();

        let err = registry
            .ensure_available(&class, "jdbc:mysql://localhost/db", "jdbc", "memory")
            .unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
        assert_eq!(registry.active_references(&key), 1);

        registry.release(handle);
        assert!(!registry.is_registered(&key));
    }

    #[test]
    fn test_instantiate_failure_is_driver_load() {
        let (registry, _) = setup();
        let class = MemoryDriverClass::new(MemoryDriver::new()).failing("class not found");
        let err = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap_err();
        assert!(matches!(err, Error::DriverLoad { .. }));
        assert_eq!(registry.active_references(&DriverKey::new("jdbc", "memory")), 0);
    }

    #[tokio::test]
    async fn test_connection_outlives_handle() {
        let (registry, class) = setup();
        let key = DriverKey::new("jdbc", "memory");

        let handle = registry.ensure_available(&class, URL, "jdbc", "memory").unwrap();
        let conn = handle.connect(URL, &Properties::new()).await.unwrap();
        registry.release(handle);

        assert!(registry.is_registered(&key));
        assert!(conn.is_valid().await);

        drop(conn);
        assert!(!registry.is_registered(&key));
    }
}
