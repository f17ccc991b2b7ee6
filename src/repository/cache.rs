use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value as Json;
use tracing::debug;

use crate::Result;

/// Cache contract injected into repositories.
///
/// Repositories only ever call [`CacheService::invalidate`]; the route and
/// metadata layers populate entries through [`CacheService::get_or_load`].
pub trait CacheService: Send + Sync {
    /// Drops every entry of `scope`.
    fn invalidate(&self, scope: &str);

    /// Returns the cached value for `key` in `scope`, running `loader` on a
    /// miss.
    fn get_or_load(
        &self,
        scope: &str,
        key: &str,
        loader: &mut dyn FnMut() -> Result<Json>,
    ) -> Result<Arc<Json>>;
}

struct Scope {
    generation: u64,
    entries: LruCache<String, Arc<Json>>,
}

/// In-process cache with one LRU per scope.
///
/// Each scope carries a generation bumped by [`CacheService::invalidate`];
/// a value loaded while an invalidation raced past is returned to its caller
/// but not stored.
pub struct ScopedCache {
    capacity: NonZeroUsize,
    scopes: Mutex<HashMap<String, Scope>>,
}

impl ScopedCache {
    /// Cache holding up to `capacity` entries per scope.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Current generation of `scope`; zero if never touched.
    pub fn generation(&self, scope: &str) -> u64 {
        self.scopes
            .lock()
            .get(scope)
            .map(|s| s.generation)
            .unwrap_or(0)
    }

    /// Entries currently held for `scope`.
    pub fn len(&self, scope: &str) -> usize {
        self.scopes
            .lock()
            .get(scope)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn scope<'a>(&self, scopes: &'a mut HashMap<String, Scope>, name: &str) -> &'a mut Scope {
        scopes.entry(name.to_string()).or_insert_with(|| Scope {
            generation: 0,
            entries: LruCache::new(self.capacity),
        })
    }
}

impl Default for ScopedCache {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CacheService for ScopedCache {
    fn invalidate(&self, scope: &str) {
        let mut scopes = self.scopes.lock();
        let entry = self.scope(&mut scopes, scope);
        entry.generation += 1;
        entry.entries.clear();
        debug!(scope, generation = entry.generation, "cache scope invalidated");
    }

    fn get_or_load(
        &self,
        scope: &str,
        key: &str,
        loader: &mut dyn FnMut() -> Result<Json>,
    ) -> Result<Arc<Json>> {
        let generation = {
            let mut scopes = self.scopes.lock();
            let entry = self.scope(&mut scopes, scope);
            if let Some(hit) = entry.entries.get(key) {
                return Ok(Arc::clone(hit));
            }
            entry.generation
        };
        // Loaders may hit the store; never hold the lock across them.
        let value = Arc::new(loader()?);
        let mut scopes = self.scopes.lock();
        let entry = self.scope(&mut scopes, scope);
        if entry.generation == generation {
            entry.entries.put(key.to_string(), Arc::clone(&value));
        }
        Ok(value)
    }
}
