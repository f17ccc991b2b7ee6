use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::SchemaCatalog;

/// Hands out per-request catalog snapshots.
pub trait CatalogSource: Send + Sync {
    /// Returns the snapshot the current request should compile against.
    fn snapshot(&self) -> Arc<SchemaCatalog>;
}

/// A catalog that never changes.
#[derive(Debug, Clone)]
pub struct StaticCatalog(Arc<SchemaCatalog>);

impl StaticCatalog {
    /// Wraps a catalog.
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self(Arc::new(catalog))
    }
}

impl CatalogSource for StaticCatalog {
    fn snapshot(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.0)
    }
}

/// A catalog that can be replaced wholesale when metadata changes.
///
/// In-flight requests keep the snapshot they started with; only requests
/// beginning after [`SwappableCatalog::replace`] observe the new one.
#[derive(Debug)]
pub struct SwappableCatalog {
    current: RwLock<Arc<SchemaCatalog>>,
    generation: AtomicU64,
}

impl SwappableCatalog {
    /// Starts at generation zero.
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
            generation: AtomicU64::new(0),
        }
    }

    /// Installs a new catalog and returns the new generation.
    pub fn replace(&self, catalog: SchemaCatalog) -> u64 {
        *self.current.write() = Arc::new(catalog);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of replacements so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl CatalogSource for SwappableCatalog {
    fn snapshot(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.current.read())
    }
}
