//! Catalog collaborator seams.
//!
//! The core consumes a handful of catalog facts (extent rows, class
//! statistics, external blob stores, index membership, cache
//! invalidation) but does not own catalog storage. Outer layers implement
//! [`CatalogBridge`]; [`MemoryCatalog`] is a complete in-memory
//! implementation used by embedders and tests.

use crate::error::Result;
use crate::tuple::Tuple;
use crate::types::{BlockNumber, ItemPointer, Oid, RelFileId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Relation growth policy from the extent catalog: either a literal block
/// count or a percentage of the current relation size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentPolicy {
    pub amount: u32,
    pub percentage: bool,
}

/// Per-relation statistics vacuum maintains in the class catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassStats {
    pub relpages: BlockNumber,
    pub reltuples: u64,
    pub hasindex: bool,
}

/// Index-side cooperation for vacuum and fragmentation repair.
pub trait IndexCooperator: Send + Sync {
    /// Remove index entries pointing at the listed dead tuples; returns
    /// how many entries were actually removed.
    fn bulk_delete(&self, dead: &[ItemPointer]) -> Result<u64>;

    /// Insert an entry for a relocated tuple.
    fn insert_entry(&self, heap_tid: ItemPointer, tuple: &Tuple) -> Result<()>;

    /// Validate pointers on pages recovered from the shadow log.
    fn recover_pages(&self, _blocks: &[BlockNumber]) -> Result<()> {
        Ok(())
    }

    fn reindex(&self) -> Result<()> {
        Ok(())
    }
}

/// The catalog surface the storage core consumes.
pub trait CatalogBridge: Send + Sync {
    fn extent_policy(&self, _rel: RelFileId) -> Option<ExtentPolicy> {
        None
    }

    fn set_extent_policy(&self, _rel: RelFileId, _policy: ExtentPolicy) {}

    fn remove_extent_policy(&self, _rel: RelFileId) {}

    /// Overwrite relpages/reltuples in place. Vacuum depends on this not
    /// creating a new tuple version, so vacuuming the class catalog itself
    /// converges.
    fn update_class_stats(&self, _rel: RelFileId, _stats: ClassStats) {}

    fn class_stats(&self, _rel: RelFileId) -> Option<ClassStats> {
        None
    }

    /// External-store lookup: a different relation holding blob segments
    /// for (relation, attribute), if one is cataloged.
    fn blob_store_for(&self, _rel: RelFileId, _attnum: i16) -> Option<RelFileId> {
        None
    }

    fn indexes_of(&self, _rel: RelFileId) -> Vec<Arc<dyn IndexCooperator>> {
        Vec::new()
    }

    /// Invalidate dictionary caches holding this tuple.
    fn invalidate_tuple(&self, _rel: RelFileId, _tid: ItemPointer) {}

    /// Register a tuple for rollback invalidation (system relations).
    fn mark_for_rollback(&self, _rel: RelFileId, _tid: ItemPointer) {}

    /// Enumerate a database's relations for database-wide maintenance.
    fn relations_of_database(&self, _db: Oid) -> Vec<RelFileId> {
        Vec::new()
    }
}

/// A bridge that knows nothing; every hook is a no-op.
pub struct NullCatalog;

impl CatalogBridge for NullCatalog {}

/// In-memory catalog for embedders and tests.
#[derive(Default)]
pub struct MemoryCatalog {
    extents: Mutex<HashMap<Oid, ExtentPolicy>>,
    stats: Mutex<HashMap<RelFileId, ClassStats>>,
    blob_stores: Mutex<HashMap<(Oid, i16), RelFileId>>,
    indexes: Mutex<HashMap<Oid, Vec<Arc<dyn IndexCooperator>>>>,
    relations: Mutex<HashMap<Oid, Vec<RelFileId>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_relation(&self, rel: RelFileId) {
        let mut map = self.relations.lock().unwrap();
        map.entry(rel.db).or_default().push(rel);
    }

    pub fn register_index(&self, rel: RelFileId, index: Arc<dyn IndexCooperator>) {
        let mut map = self.indexes.lock().unwrap();
        map.entry(rel.rel).or_default().push(index);
    }

    pub fn register_blob_store(&self, rel: RelFileId, attnum: i16, store: RelFileId) {
        self.blob_stores
            .lock()
            .unwrap()
            .insert((rel.rel, attnum), store);
    }
}

impl CatalogBridge for MemoryCatalog {
    fn extent_policy(&self, rel: RelFileId) -> Option<ExtentPolicy> {
        self.extents.lock().unwrap().get(&rel.rel).copied()
    }

    fn set_extent_policy(&self, rel: RelFileId, policy: ExtentPolicy) {
        self.extents.lock().unwrap().insert(rel.rel, policy);
    }

    fn remove_extent_policy(&self, rel: RelFileId) {
        self.extents.lock().unwrap().remove(&rel.rel);
    }

    fn update_class_stats(&self, rel: RelFileId, stats: ClassStats) {
        self.stats.lock().unwrap().insert(rel, stats);
    }

    fn class_stats(&self, rel: RelFileId) -> Option<ClassStats> {
        self.stats.lock().unwrap().get(&rel).copied()
    }

    fn blob_store_for(&self, rel: RelFileId, attnum: i16) -> Option<RelFileId> {
        self.blob_stores
            .lock()
            .unwrap()
            .get(&(rel.rel, attnum))
            .copied()
    }

    fn indexes_of(&self, rel: RelFileId) -> Vec<Arc<dyn IndexCooperator>> {
        self.indexes
            .lock()
            .unwrap()
            .get(&rel.rel)
            .cloned()
            .unwrap_or_default()
    }

    fn relations_of_database(&self, db: Oid) -> Vec<RelFileId> {
        self.relations
            .lock()
            .unwrap()
            .get(&db)
            .cloned()
            .unwrap_or_default()
    }
}
