//! Transaction log and id allocation.
//!
//! Two persistent relations cooperate. The variable relation stores the
//! allocator state: block 0 holds next-xid and next-oid, block 1 the
//! baseline (low-water xid below which status is assumed committed), the
//! recovery checkpoint, and per-database low-water records. The log
//! relation stores a dense 2-bit status per transaction id.
//!
//! Ids are handed out from a prefetched batch under one lock; each batch
//! persists by advancing the counter on disk, so a crash can only skip
//! ids, never reuse them. A zero status reads as in-progress, which is
//! what an id that never reached the log deserves.

use crate::config::{keys, Properties};
use crate::error::{Result, StorageError};
use crate::relation::{RelationCache, RelationRef};
use crate::storage::buffer::BufferPool;
use crate::types::{
    xid_is_valid, Oid, RelKind, TransactionId, XidStatus, AMI_XID, BLCKSZ, DEFAULT_DB_OID,
    FIRST_NORMAL_XID, INVALID_XID,
};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transaction ids per log block: 2 bits each.
pub const XIDS_PER_BLOCK: u64 = (BLCKSZ as u64) * 4;

const DEFAULT_XID_PREFETCH: u64 = 8;
const DEFAULT_OID_PREFETCH: u32 = 8;
/// First oid available to the generator; smaller oids are hand-assigned.
const FIRST_USER_OID: Oid = 16384;

/// Per-database low-water record in variable block 1:
/// init u8, pad[3], dbid u32, low-water u64.
const LOWWATER_BASE: usize = 16;
const LOWWATER_RECORD: usize = 16;
const LOWWATER_SLOTS: usize = (BLCKSZ - LOWWATER_BASE) / LOWWATER_RECORD;

pub const LOG_RELATION_NAME: &str = "pg_log";
pub const VARIABLE_RELATION_NAME: &str = "pg_variable";

/// Single-slot per-env status cache. Only final statuses are cached;
/// in-progress and soft-committed answers may still change.
#[derive(Default)]
pub struct StatusCache {
    slot: Cell<Option<(TransactionId, XidStatus)>>,
}

impl StatusCache {
    pub fn lookup(&self, xid: TransactionId) -> Option<XidStatus> {
        match self.slot.get() {
            Some((cached, status)) if cached == xid => Some(status),
            _ => None,
        }
    }

    pub fn remember(&self, xid: TransactionId, status: XidStatus) {
        self.slot.set(Some((xid, status)));
    }
}

struct VariableCache {
    next_xid: TransactionId,
    xid_count: u64,
    checkpoint: TransactionId,
    baseline: TransactionId,
}

struct OidCache {
    next: Oid,
    count: i64,
}

/// The transaction system.
pub struct Transam {
    log_rel: RelationRef,
    var_rel: RelationRef,
    buffers: std::sync::Arc<BufferPool>,
    var: Mutex<VariableCache>,
    oid: Mutex<OidCache>,
    oid_refill: Condvar,
    xid_prefetch: u64,
    oid_prefetch: u32,
    initialized: AtomicBool,
    /// Status transitions signal here; `wait_for` sleeps on it.
    settle: Mutex<()>,
    settled: Condvar,
    fsync_disabled: bool,
}

fn get_u64(page: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(page[off..off + 8].try_into().unwrap())
}

fn set_u64(page: &mut [u8], off: usize, v: u64) {
    page[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(page: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(page[off..off + 4].try_into().unwrap())
}

fn set_u32(page: &mut [u8], off: usize, v: u32) {
    page[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn status_block(xid: TransactionId) -> u32 {
    (xid / XIDS_PER_BLOCK) as u32
}

fn status_byte(xid: TransactionId) -> usize {
    ((xid % XIDS_PER_BLOCK) / 4) as usize
}

fn status_shift(xid: TransactionId) -> u32 {
    ((xid % 4) * 2) as u32
}

/// Extract a status from a raw log page.
pub fn status_from_page(page: &[u8], xid: TransactionId) -> XidStatus {
    let byte = page[status_byte(xid)];
    XidStatus::from_bits(byte >> status_shift(xid))
}

/// Store a status into a raw log page.
pub fn status_into_page(page: &mut [u8], xid: TransactionId, status: XidStatus) {
    let slot = status_byte(xid);
    let shift = status_shift(xid);
    let cleared = page[slot] & !(0b11 << shift);
    page[slot] = cleared | (status.bits() << shift);
}

impl Transam {
    /// Open (creating on bootstrap) the log and variable relations and
    /// prime the allocator caches from disk.
    pub fn init(
        relations: &RelationCache,
        buffers: std::sync::Arc<BufferPool>,
        props: &Properties,
        bootstrap: bool,
    ) -> Result<Self> {
        let multiuser = props.get_int(keys::MAX_BACKENDS, 32) > 1;
        let mut xid_prefetch = props.get_int(keys::TRANSACTION_PREFETCH, 0).max(0) as u64;
        if xid_prefetch == 0 {
            xid_prefetch = if multiuser {
                DEFAULT_XID_PREFETCH * 1024
            } else {
                DEFAULT_XID_PREFETCH
            };
        }
        let mut oid_prefetch = props.get_int(keys::OBJECTID_PREFETCH, 0).max(0) as u32;
        if oid_prefetch == 0 {
            oid_prefetch = if multiuser {
                DEFAULT_OID_PREFETCH * DEFAULT_OID_PREFETCH
            } else {
                DEFAULT_OID_PREFETCH
            };
        }

        let log_id = crate::types::RelFileId::new(DEFAULT_DB_OID, 2);
        let var_id = crate::types::RelFileId::new(DEFAULT_DB_OID, 3);
        let (log_rel, var_rel) = if bootstrap {
            let log_rel =
                relations.create(log_id, "global", LOG_RELATION_NAME, RelKind::Special)?;
            let var_rel =
                relations.create(var_id, "global", VARIABLE_RELATION_NAME, RelKind::Special)?;
            // seed both variable blocks
            let mut page = crate::page::Page::zeroed();
            set_u64(page.as_bytes_mut(), 0, FIRST_NORMAL_XID);
            set_u32(page.as_bytes_mut(), 8, FIRST_USER_OID);
            var_rel.extend(page.as_bytes(), 1)?;
            let mut header = crate::page::Page::zeroed();
            set_u64(header.as_bytes_mut(), 0, FIRST_NORMAL_XID); // baseline
            set_u64(header.as_bytes_mut(), 8, FIRST_NORMAL_XID); // checkpoint
            var_rel.extend(header.as_bytes(), 1)?;
            var_rel.sync()?;
            (log_rel, var_rel)
        } else {
            let log_rel = relations.open(log_id, "global", LOG_RELATION_NAME, RelKind::Special)?;
            let var_rel =
                relations.open(var_id, "global", VARIABLE_RELATION_NAME, RelKind::Special)?;
            (log_rel, var_rel)
        };

        // prime the variable cache; the checkpoint at startup is the
        // current next-xid, which separates old ids from this run's
        let (next_xid, baseline) = {
            let block0 = buffers.read_buffer(&var_rel, 0)?;
            let next_xid = get_u64(block0.page().as_bytes(), 0);
            let block1 = buffers.read_buffer(&var_rel, 1)?;
            let baseline = get_u64(block1.page().as_bytes(), 0);
            (next_xid, baseline)
        };
        if next_xid < FIRST_NORMAL_XID {
            return Err(StorageError::corrupt(
                "transam",
                format!("next-xid {next_xid} below first normal id"),
            ));
        }
        debug!(next_xid, baseline, "transaction system primed");

        let transam = Transam {
            log_rel,
            var_rel,
            buffers,
            var: Mutex::new(VariableCache {
                next_xid,
                xid_count: 0,
                checkpoint: next_xid,
                baseline,
            }),
            oid: Mutex::new(OidCache { next: 0, count: 0 }),
            oid_refill: Condvar::new(),
            xid_prefetch,
            oid_prefetch,
            initialized: AtomicBool::new(true),
            settle: Mutex::new(()),
            settled: Condvar::new(),
            fsync_disabled: props.get_bool(keys::NO_FSYNC, false),
        };
        Ok(transam)
    }

    pub fn log_relation(&self) -> &RelationRef {
        &self.log_rel
    }

    /// Advance the on-disk next-xid by one prefetch batch and return the
    /// batch start. Caller holds the variable cache lock.
    fn fetch_xid_batch(&self) -> Result<TransactionId> {
        let buf = self.buffers.read_buffer(&self.var_rel, 0)?;
        let start = {
            let mut page = buf.page_mut();
            let start = get_u64(page.as_bytes(), 0);
            set_u64(page.as_bytes_mut(), 0, start + self.xid_prefetch);
            start
        };
        buf.mark_dirty();
        buf.flush()?;
        Ok(start)
    }

    /// Allocate one transaction id from the shared prefetched batch.
    pub fn get_new_transaction_id(&self) -> Result<TransactionId> {
        let mut var = self.var.lock().unwrap();
        if var.xid_count == 0 {
            let start = self.fetch_xid_batch()?;
            var.next_xid = start;
            var.xid_count = self.xid_prefetch;
        }
        let xid = var.next_xid;
        var.next_xid += 1;
        var.xid_count -= 1;
        Ok(xid)
    }

    /// Read the next id without consuming it.
    pub fn read_new_transaction_id(&self) -> TransactionId {
        let var = self.var.lock().unwrap();
        var.next_xid
    }

    /// Allocate an object id. A refill sentinel (-1) makes competing
    /// allocators wait while one goes to disk.
    pub fn get_new_object_id(&self) -> Result<Oid> {
        let mut oid = self.oid.lock().unwrap();
        loop {
            if oid.count > 0 {
                let out = oid.next;
                oid.next += 1;
                oid.count -= 1;
                return Ok(out);
            }
            if oid.count == 0 {
                oid.count = -1;
                drop(oid);
                let start = self.fetch_oid_batch();
                oid = self.oid.lock().unwrap();
                match start {
                    Ok(start) => {
                        oid.next = start + 1;
                        oid.count = self.oid_prefetch as i64;
                        self.oid_refill.notify_all();
                    }
                    Err(err) => {
                        oid.count = 0;
                        self.oid_refill.notify_all();
                        return Err(err);
                    }
                }
            } else {
                oid = self.oid_refill.wait(oid).unwrap();
            }
        }
    }

    fn fetch_oid_batch(&self) -> Result<Oid> {
        let buf = self.buffers.read_buffer(&self.var_rel, 0)?;
        let start = {
            let mut page = buf.page_mut();
            let start = get_u32(page.as_bytes(), 8);
            set_u32(page.as_bytes_mut(), 8, start + self.oid_prefetch);
            start
        };
        buf.mark_dirty();
        buf.flush()?;
        Ok(start)
    }

    /// Recorded status of `xid`, consulting the caller's single-slot
    /// cache, the baseline short-circuit, then the packed log.
    pub fn status(&self, xid: TransactionId, cache: &StatusCache) -> Result<XidStatus> {
        if !self.initialized.load(Ordering::Acquire) {
            return Ok(XidStatus::Committed);
        }
        if !xid_is_valid(xid) {
            debug!("status query for the invalid transaction id");
            return Ok(XidStatus::Aborted);
        }
        if xid == AMI_XID {
            return Ok(XidStatus::Committed);
        }
        if let Some(status) = cache.lookup(xid) {
            return Ok(status);
        }
        {
            let var = self.var.lock().unwrap();
            if xid < var.baseline {
                // predates every surviving writer; vacuum already acted on it
                return Ok(XidStatus::Committed);
            }
        }
        let buf = self.buffers.read_buffer(&self.log_rel, status_block(xid))?;
        let status = status_from_page(buf.page().as_bytes(), xid);
        if status.is_final() {
            cache.remember(xid, status);
        }
        Ok(status)
    }

    /// Write a status bit pair. `force` pushes the log page to disk before
    /// returning (the hard-commit path).
    pub fn set_status(
        &self,
        xid: TransactionId,
        status: XidStatus,
        cache: &StatusCache,
        force: bool,
    ) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let buf = self.buffers.read_buffer(&self.log_rel, status_block(xid))?;
        {
            let mut page = buf.page_mut();
            status_into_page(page.as_bytes_mut(), xid, status);
        }
        buf.mark_dirty();
        if force && !self.fsync_disabled {
            buf.flush()?;
        }
        cache.remember(xid, status);

        let _settle = self.settle.lock().unwrap();
        self.settled.notify_all();
        Ok(())
    }

    pub fn did_commit(&self, xid: TransactionId, cache: &StatusCache) -> Result<bool> {
        Ok(self.status(xid, cache)?.is_committed())
    }

    pub fn did_abort(&self, xid: TransactionId, cache: &StatusCache) -> Result<bool> {
        Ok(self.status(xid, cache)? == XidStatus::Aborted)
    }

    pub fn is_in_progress(&self, xid: TransactionId, cache: &StatusCache) -> Result<bool> {
        Ok(self.status(xid, cache)? == XidStatus::InProgress)
    }

    pub fn did_soft_commit(&self, xid: TransactionId, cache: &StatusCache) -> Result<bool> {
        Ok(self.status(xid, cache)? == XidStatus::SoftCommit)
    }

    pub fn did_hard_commit(&self, xid: TransactionId, cache: &StatusCache) -> Result<bool> {
        Ok(self.status(xid, cache)? == XidStatus::Committed)
    }

    /// Block until `xid` leaves in-progress. Used when an update collides
    /// with a concurrent writer.
    pub fn wait_for(&self, xid: TransactionId, cache: &StatusCache) -> Result<XidStatus> {
        loop {
            let status = self.status(xid, cache)?;
            if status != XidStatus::InProgress {
                return Ok(status);
            }
            let guard = self.settle.lock().unwrap();
            let _ = self
                .settled
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
    }

    pub fn checkpoint(&self) -> TransactionId {
        self.var.lock().unwrap().checkpoint
    }

    pub fn before_checkpoint(&self, xid: TransactionId) -> Result<bool> {
        if !xid_is_valid(xid) {
            return Err(StorageError::corrupt(
                "transam",
                "checkpoint test on the invalid transaction id",
            ));
        }
        Ok(xid < self.checkpoint())
    }

    pub fn low_water(&self) -> TransactionId {
        self.var.lock().unwrap().baseline
    }

    /// Persisted recovery checkpoint from variable block 1.
    pub fn recovery_checkpoint(&self) -> Result<TransactionId> {
        let buf = self.buffers.read_buffer(&self.var_rel, 1)?;
        let page = buf.page();
        Ok(get_u64(page.as_bytes(), 8))
    }

    fn set_recovery_checkpoint(&self, xid: TransactionId) -> Result<()> {
        let buf = self.buffers.read_buffer(&self.var_rel, 1)?;
        {
            let mut page = buf.page_mut();
            set_u64(page.as_bytes_mut(), 8, xid);
        }
        buf.mark_dirty();
        buf.flush()?;
        self.var.lock().unwrap().checkpoint = xid;
        Ok(())
    }

    /// Record a per-database low-water mark; the minimum across databases
    /// becomes the new baseline.
    pub fn set_low_water(&self, db: Oid, xid: TransactionId) -> Result<()> {
        let buf = self.buffers.read_buffer(&self.var_rel, 1)?;
        let new_baseline = {
            let mut page = buf.page_mut();
            let bytes = page.as_bytes_mut();
            let mut slot = None;
            for idx in 0..LOWWATER_SLOTS {
                let base = LOWWATER_BASE + idx * LOWWATER_RECORD;
                let init = bytes[base] != 0;
                let rec_db = get_u32(bytes, base + 4);
                if init && rec_db == db {
                    slot = Some(base);
                    break;
                }
                if !init && slot.is_none() {
                    slot = Some(base);
                }
            }
            let Some(base) = slot else {
                warn!(db, "low-water table full, mark dropped");
                return Ok(());
            };
            bytes[base] = 1;
            set_u32(bytes, base + 4, db);
            set_u64(bytes, base + 8, xid);

            let mut min = u64::MAX;
            for idx in 0..LOWWATER_SLOTS {
                let base = LOWWATER_BASE + idx * LOWWATER_RECORD;
                if bytes[base] != 0 {
                    min = min.min(get_u64(bytes, base + 8));
                }
            }
            if min != u64::MAX {
                set_u64(bytes, 0, min);
            }
            get_u64(bytes, 0)
        };
        buf.mark_dirty();
        self.var.lock().unwrap().baseline = new_baseline;
        Ok(())
    }

    /// Recovery sweep: every id in `[checkpoint, next-xid)` that reads
    /// soft-committed or in-progress is rewritten aborted. Soft commits
    /// were never durably acknowledged; in-progress writers died with the
    /// old process. Hard commits and aborts stand.
    pub fn recover(&self) -> Result<()> {
        info!("scanning transaction log for recovery");
        let ceiling = self.get_new_transaction_id()?;
        let floor = self.recovery_checkpoint()?;
        debug!(floor, ceiling, "recovery bounds");

        let mut mark = floor;
        let mut current: Option<(u32, crate::storage::buffer::PinnedBuffer)> = None;
        while mark < ceiling {
            let block = status_block(mark);
            if current.as_ref().map(|(b, _)| *b) != Some(block) {
                let fresh = self.buffers.read_buffer(&self.log_rel, block)?;
                current = Some((block, fresh));
            }
            let buf = &current.as_ref().expect("block just loaded").1;
            let status = status_from_page(buf.page().as_bytes(), mark);
            match status {
                XidStatus::SoftCommit => {
                    debug!(xid = mark, "soft commit demoted to abort");
                    let mut page = buf.page_mut();
                    status_into_page(page.as_bytes_mut(), mark, XidStatus::Aborted);
                    drop(page);
                    buf.mark_dirty();
                }
                XidStatus::InProgress => {
                    let mut page = buf.page_mut();
                    status_into_page(page.as_bytes_mut(), mark, XidStatus::Aborted);
                    drop(page);
                    buf.mark_dirty();
                }
                XidStatus::Committed | XidStatus::Aborted => {}
            }
            mark += 1;
        }
        drop(current);

        self.buffers.flush_all(true)?;
        self.set_recovery_checkpoint(ceiling)?;
        info!(checkpoint = ceiling, "transaction recovery finished");
        Ok(())
    }

    /// Flush allocator state at shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.buffers.flush_all(true)?;
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::smgr::{DiskManager, Smgr};
    use crate::storage::vfd::VfdPool;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (Transam, Arc<BufferPool>, TempDir) {
        let dir = TempDir::new().unwrap();
        let vfs = Arc::new(VfdPool::new(&Properties::new()));
        let smgr: Arc<dyn Smgr> = Arc::new(DiskManager::new(vfs, dir.path()));
        let relations = RelationCache::new(smgr);
        let buffers = Arc::new(BufferPool::with_default_capacity());
        let transam = Transam::init(&relations, buffers.clone(), &Properties::new(), true).unwrap();
        (transam, buffers, dir)
    }

    #[test]
    fn ids_are_monotonic_and_start_normal() {
        let (transam, _buffers, _dir) = setup();
        let a = transam.get_new_transaction_id().unwrap();
        let b = transam.get_new_transaction_id().unwrap();
        assert_eq!(a, FIRST_NORMAL_XID);
        assert_eq!(b, a + 1);
        assert!(transam.read_new_transaction_id() > b);
    }

    #[test]
    fn status_defaults_to_in_progress() {
        let (transam, _buffers, _dir) = setup();
        let cache = StatusCache::default();
        let xid = transam.get_new_transaction_id().unwrap();
        assert!(transam.is_in_progress(xid, &cache).unwrap());
    }

    #[test]
    fn commit_statuses_read_back() {
        let (transam, _buffers, _dir) = setup();
        let cache = StatusCache::default();
        let a = transam.get_new_transaction_id().unwrap();
        let b = transam.get_new_transaction_id().unwrap();
        let c = transam.get_new_transaction_id().unwrap();

        transam.set_status(a, XidStatus::Committed, &cache, true).unwrap();
        transam.set_status(b, XidStatus::SoftCommit, &cache, false).unwrap();
        transam.set_status(c, XidStatus::Aborted, &cache, false).unwrap();

        assert!(transam.did_hard_commit(a, &cache).unwrap());
        assert!(transam.did_commit(b, &cache).unwrap(), "soft counts as committed");
        assert!(transam.did_soft_commit(b, &cache).unwrap());
        assert!(transam.did_abort(c, &cache).unwrap());
        assert!(transam.did_abort(INVALID_XID, &cache).unwrap());
    }

    #[test]
    fn recovery_demotes_soft_and_in_progress() {
        let (transam, _buffers, _dir) = setup();
        let cache = StatusCache::default();
        let soft = transam.get_new_transaction_id().unwrap();
        let hard = transam.get_new_transaction_id().unwrap();
        let open = transam.get_new_transaction_id().unwrap();

        transam.set_status(soft, XidStatus::SoftCommit, &cache, false).unwrap();
        transam.set_status(hard, XidStatus::Committed, &cache, true).unwrap();
        // `open` never reaches the log

        transam.recover().unwrap();

        let fresh = StatusCache::default();
        assert!(transam.did_abort(soft, &fresh).unwrap());
        assert!(transam.did_hard_commit(hard, &fresh).unwrap());
        assert!(transam.did_abort(open, &fresh).unwrap());
        // checkpoint moved past everything swept
        assert!(transam.checkpoint() > open);
    }

    #[test]
    fn oid_batches_do_not_repeat() {
        let (transam, _buffers, _dir) = setup();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(transam.get_new_object_id().unwrap()));
        }
        assert!(seen.iter().all(|&oid| oid > FIRST_USER_OID));
    }

    #[test]
    fn low_water_takes_minimum_across_databases() {
        let (transam, _buffers, _dir) = setup();
        transam.set_low_water(10, 900).unwrap();
        transam.set_low_water(11, 700).unwrap();
        assert_eq!(transam.low_water(), 700);
        transam.set_low_water(11, 950).unwrap();
        assert_eq!(transam.low_water(), 900);

        // below the baseline every id reads committed
        let cache = StatusCache::default();
        assert!(transam.did_commit(800, &cache).unwrap());
    }

    #[test]
    fn status_bit_packing_is_dense() {
        let mut page = vec![0u8; BLCKSZ];
        for xid in 0..16u64 {
            status_into_page(&mut page, xid, XidStatus::Committed);
        }
        status_into_page(&mut page, 5, XidStatus::Aborted);
        assert_eq!(status_from_page(&page, 5), XidStatus::Aborted);
        assert_eq!(status_from_page(&page, 4), XidStatus::Committed);
        assert_eq!(status_from_page(&page, 6), XidStatus::Committed);
        // four ids per byte
        assert_eq!(page[0], 0b11_11_11_11);
    }
}
