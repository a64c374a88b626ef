//! Register catalog cache. Loaded eagerly at startup, reloaded only on
//! explicit signal — never automatically. Reads never touch the
//! persistence port; refresh is serialised by the outer lock.

use std::sync::Arc;

use parking_lot::RwLock;
use tib_schemas::{CatalogEntry, CatalogKey};

use crate::port::CatalogMap;

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogLookup {
    Known(CatalogEntry),
    Unknown,
}

impl CatalogLookup {
    pub fn is_unknown(&self) -> bool {
        matches!(self, CatalogLookup::Unknown)
    }
}

#[derive(Debug, Default)]
pub struct CatalogCache {
    inner: RwLock<Arc<CatalogMap>>,
}

impl CatalogCache {
    pub fn new(initial: CatalogMap) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn empty() -> Self {
        Self::new(CatalogMap::new())
    }

    /// Swap in a freshly loaded map atomically. Readers never observe a
    /// partially-updated catalog.
    pub fn refresh(&self, fresh: CatalogMap) {
        *self.inner.write() = Arc::new(fresh);
    }

    pub fn lookup(&self, key: &CatalogKey) -> CatalogLookup {
        match self.inner.read().get(key) {
            Some(entry) => CatalogLookup::Known(entry.clone()),
            None => CatalogLookup::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
