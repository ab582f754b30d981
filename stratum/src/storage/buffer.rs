//! Buffer pool.
//!
//! Page copies are faulted in on first access and written back through the
//! storage manager when dirty. Readers take the page read lock, writers
//! the write lock; vacuum's reclaim also runs under the write lock.
//!
//! Lazily-proven commit hints are applied through [`PinnedBuffer::
//! apply_hint_bits`]: a short write section restricted to the hint mask,
//! idempotent among racing observers, so visibility checks themselves only
//! need the read lock.

use crate::error::Result;
use crate::page::Page;
use crate::relation::RelationRef;
use crate::tuple;
use crate::types::{BlockNumber, OffsetNumber, RelFileId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BufferTag {
    rel: RelFileId,
    block: BlockNumber,
}

pub struct BufferDesc {
    tag: BufferTag,
    rel: RelationRef,
    page: RwLock<Page>,
    dirty: AtomicBool,
    pins: AtomicU64,
    last_use: AtomicU64,
}

impl BufferDesc {
    pub fn block(&self) -> BlockNumber {
        self.tag.block
    }
}

/// A pinned buffer. The pin is dropped with the value; mark dirty before
/// dropping to schedule write-back ("write buffer" in caller terms).
pub struct PinnedBuffer {
    desc: Arc<BufferDesc>,
}

impl PinnedBuffer {
    pub fn block(&self) -> BlockNumber {
        self.desc.tag.block
    }

    pub fn relation(&self) -> &RelationRef {
        &self.desc.rel
    }

    /// Share-lock the page for reading.
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.desc.page.read().unwrap()
    }

    /// Exclusive-lock the page for modification.
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.desc.page.write().unwrap()
    }

    pub fn mark_dirty(&self) {
        self.desc.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.desc.dirty.load(Ordering::Acquire)
    }

    /// Apply commit hints to the tuple at `offset`. Mask-restricted and
    /// OR-only, so racing appliers converge; takes the write lock only for
    /// the store itself.
    pub fn apply_hint_bits(&self, offset: OffsetNumber, hints: u16) {
        if hints & tuple::flags::HINT_MASK == 0 {
            return;
        }
        let mut page = self.desc.page.write().unwrap();
        if let Ok(item) = page.item_mut(offset) {
            tuple::apply_hint_bits(item, hints);
        }
        drop(page);
        self.desc.dirty.store(true, Ordering::Release);
    }

    /// Write the current page image through the storage manager and force
    /// it to disk.
    pub fn flush(&self) -> Result<()> {
        let mut page = self.desc.page.write().unwrap();
        page.update_checksum();
        self.desc.rel.flush_block(self.desc.tag.block, page.as_bytes())?;
        self.desc.dirty.store(false, Ordering::Release);
        Ok(())
    }
}

impl Clone for PinnedBuffer {
    fn clone(&self) -> Self {
        self.desc.pins.fetch_add(1, Ordering::AcqRel);
        PinnedBuffer {
            desc: self.desc.clone(),
        }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        self.desc.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct BufferPool {
    map: Mutex<HashMap<BufferTag, Arc<BufferDesc>>>,
    capacity: usize,
    clock: AtomicU64,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            map: Mutex::new(HashMap::new()),
            capacity: capacity.max(16),
            clock: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn touch(&self, desc: &BufferDesc) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        desc.last_use.store(tick, Ordering::Relaxed);
    }

    /// Fault in (or find) the page and return it pinned.
    pub fn read_buffer(&self, rel: &RelationRef, block: BlockNumber) -> Result<PinnedBuffer> {
        let tag = BufferTag {
            rel: rel.id,
            block,
        };
        {
            let map = self.map.lock().unwrap();
            if let Some(desc) = map.get(&tag) {
                desc.pins.fetch_add(1, Ordering::AcqRel);
                self.touch(desc);
                return Ok(PinnedBuffer { desc: desc.clone() });
            }
        }

        // load outside the map lock; a racing loader is resolved below
        let mut image = Page::zeroed();
        rel.read_block(block, image.as_bytes_mut())?;
        debug_assert!(image.checksum_ok(), "checksum hint mismatch on load");

        let mut map = self.map.lock().unwrap();
        if let Some(desc) = map.get(&tag) {
            desc.pins.fetch_add(1, Ordering::AcqRel);
            self.touch(desc);
            return Ok(PinnedBuffer { desc: desc.clone() });
        }
        if map.len() >= self.capacity {
            self.evict_one(&mut map)?;
        }
        let desc = Arc::new(BufferDesc {
            tag,
            rel: rel.clone(),
            page: RwLock::new(image),
            dirty: AtomicBool::new(false),
            pins: AtomicU64::new(1),
            last_use: AtomicU64::new(0),
        });
        self.touch(&desc);
        map.insert(tag, desc.clone());
        Ok(PinnedBuffer { desc })
    }

    fn evict_one(&self, map: &mut HashMap<BufferTag, Arc<BufferDesc>>) -> Result<()> {
        let victim = map
            .iter()
            .filter(|(_, d)| d.pins.load(Ordering::Acquire) == 0)
            .min_by_key(|(_, d)| d.last_use.load(Ordering::Relaxed))
            .map(|(tag, _)| *tag);
        let Some(tag) = victim else {
            warn!("buffer pool over capacity with every page pinned");
            return Ok(());
        };
        let desc = map.remove(&tag).expect("victim still mapped");
        if desc.dirty.load(Ordering::Acquire) {
            let mut page = desc.page.write().unwrap();
            page.update_checksum();
            desc.rel.write_block(desc.tag.block, page.as_bytes())?;
        }
        Ok(())
    }

    /// Write every dirty page back through the storage manager. With
    /// `force`, also fsync each touched relation.
    pub fn flush_all(&self, force: bool) -> Result<()> {
        let descs: Vec<Arc<BufferDesc>> = {
            let map = self.map.lock().unwrap();
            map.values().cloned().collect()
        };
        let mut touched: Vec<RelationRef> = Vec::new();
        for desc in descs {
            if desc.dirty.swap(false, Ordering::AcqRel) {
                let mut page = desc.page.write().unwrap();
                page.update_checksum();
                desc.rel.write_block(desc.tag.block, page.as_bytes())?;
                if !touched.iter().any(|r| r.id == desc.tag.rel) {
                    touched.push(desc.rel.clone());
                }
            }
        }
        if force {
            for rel in touched {
                rel.sync()?;
            }
        }
        Ok(())
    }

    /// Snapshot every dirty page (without clearing the dirty bits) for
    /// shadow logging.
    pub fn dirty_pages(&self) -> Vec<(RelationRef, BlockNumber, Vec<u8>)> {
        let descs: Vec<Arc<BufferDesc>> = {
            let map = self.map.lock().unwrap();
            map.values().cloned().collect()
        };
        let mut out = Vec::new();
        for desc in descs {
            if desc.dirty.load(Ordering::Acquire) {
                let mut image = {
                    let page = desc.page.read().unwrap();
                    Page::from_bytes(page.as_bytes())
                };
                // the image may replay verbatim; keep its checksum honest
                image.update_checksum();
                out.push((desc.rel.clone(), desc.tag.block, image.as_bytes().to_vec()));
            }
        }
        out
    }

    /// Write back and drop every cached page of one relation. Callers hold
    /// a lock that keeps new readers out.
    pub fn invalidate_relation(&self, rel: RelFileId) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        let tags: Vec<BufferTag> = map.keys().filter(|t| t.rel == rel).copied().collect();
        for tag in tags {
            let desc = map.remove(&tag).expect("tag just listed");
            if desc.pins.load(Ordering::Acquire) != 0 {
                debug!(rel = %rel, block = tag.block, "invalidating a pinned buffer");
            }
            if desc.dirty.load(Ordering::Acquire) {
                let mut page = desc.page.write().unwrap();
                page.update_checksum();
                desc.rel.write_block(desc.tag.block, page.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Drop cached pages at or beyond `from_block` without writing them;
    /// used before heap truncation.
    pub fn discard_tail(&self, rel: RelFileId, from_block: BlockNumber) {
        let mut map = self.map.lock().unwrap();
        map.retain(|tag, _| tag.rel != rel || tag.block < from_block);
    }

    #[cfg(test)]
    pub fn cached_count(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Properties;
    use crate::relation::Relation;
    use crate::storage::smgr::{DiskManager, Smgr};
    use crate::storage::vfd::VfdPool;
    use crate::types::{RelFileId, RelKind, BLCKSZ};
    use tempfile::TempDir;

    fn setup() -> (RelationRef, BufferPool, TempDir) {
        let dir = TempDir::new().unwrap();
        let vfs = Arc::new(VfdPool::new(&Properties::new()));
        let smgr: Arc<dyn Smgr> = Arc::new(DiskManager::new(vfs, dir.path()));
        let rel = Arc::new(Relation::new(
            smgr,
            RelFileId::new(1, 50),
            "db",
            "buffered",
            RelKind::Heap,
        ));
        rel.create_storage().unwrap();
        let page = Page::zeroed();
        rel.extend(page.as_bytes(), 4).unwrap();
        (rel, BufferPool::new(16), dir)
    }

    #[test]
    fn read_modify_flush_cycle() {
        let (rel, pool, _dir) = setup();
        let buf = pool.read_buffer(&rel, 0).unwrap();
        {
            let mut page = buf.page_mut();
            page.init(0);
            page.add_item(b"tuple", None).unwrap();
        }
        buf.mark_dirty();
        pool.flush_all(false).unwrap();

        // re-read through a second pool: the change hit disk
        let pool2 = BufferPool::new(16);
        let buf2 = pool2.read_buffer(&rel, 0).unwrap();
        assert_eq!(buf2.page().item(1).unwrap(), b"tuple");
    }

    #[test]
    fn same_block_shares_one_descriptor() {
        let (rel, pool, _dir) = setup();
        let a = pool.read_buffer(&rel, 1).unwrap();
        let b = pool.read_buffer(&rel, 1).unwrap();
        assert_eq!(pool.cached_count(), 1);
        a.mark_dirty();
        assert!(b.is_dirty());
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (rel, _big, _dir) = setup();
        let pool = BufferPool::new(16);
        {
            let buf = pool.read_buffer(&rel, 0).unwrap();
            let mut page = buf.page_mut();
            page.init(0);
            page.add_item(b"survivor", None).unwrap();
            drop(page);
            buf.mark_dirty();
        }
        // churn enough distinct blocks to force eviction of block 0
        let zero = Page::zeroed();
        rel.extend(zero.as_bytes(), 40).unwrap();
        for block in 1..40 {
            let _ = pool.read_buffer(&rel, block).unwrap();
        }
        let check = BufferPool::new(16);
        let buf = check.read_buffer(&rel, 0).unwrap();
        assert_eq!(buf.page().item(1).unwrap(), b"survivor");
    }

    #[test]
    fn hint_bits_apply_idempotently() {
        let (rel, pool, _dir) = setup();
        let buf = pool.read_buffer(&rel, 0).unwrap();
        {
            let mut page = buf.page_mut();
            page.init(0);
            let t = crate::tuple::Tuple::new(b"row");
            page.add_item(t.as_bytes(), None).unwrap();
        }
        buf.apply_hint_bits(1, crate::tuple::flags::XMIN_COMMITTED);
        buf.apply_hint_bits(1, crate::tuple::flags::XMIN_COMMITTED);
        let page = buf.page();
        assert!(crate::tuple::has_flag(
            page.item(1).unwrap(),
            crate::tuple::flags::XMIN_COMMITTED
        ));
    }
}
