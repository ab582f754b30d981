//! Heap access: tuple-level operations over buffered pages.
//!
//! Writers stamp transaction bookkeeping into tuple headers in place
//! under the page's exclusive lock; placement goes through the freespace
//! engine. The moved-in dance matters: when vacuum relocated a tuple, the
//! relocation parked the original xmin in the vacuum-xid slot, and any
//! later delete or update must restore it before consuming the header's
//! union field for command ids.

pub mod scan;

pub use scan::{HeapScan, ScanKey};

use crate::env::Env;
use crate::error::{Result, StorageError};
use crate::page::max_align;
use crate::relation::RelationRef;
use crate::snapshot::Snapshot;
use crate::storage::buffer::PinnedBuffer;
use crate::tuple::{self, flags, Tuple};
use crate::types::{
    ItemPointer, Oid, GENERIC_OID, INVALID_OID, INVALID_XID, FIRST_COMMAND_ID,
};
use crate::visibility::{self, UpdateCheck};
use tracing::trace;

/// Outcome of delete/update/mark-for-update. `BeingUpdated` is resolved
/// internally by waiting, so callers only see settled verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Done(ItemPointer),
    /// A later version exists; its address is returned for chasing.
    Updated(ItemPointer),
    SelfUpdated(ItemPointer),
    Invisible,
}

/// Place a tuple on a specific pinned page if it fits. On success the
/// tuple's self address and ctid are set.
pub fn put_tuple_on_page(buf: &PinnedBuffer, tup: &mut Tuple) -> bool {
    let mut page = buf.page_mut();
    if page.is_new() {
        let special = buf.relation().special_size;
        page.init(special);
    }
    if page.free_space() < max_align(tup.len()) {
        return false;
    }
    let Some(offset) = page.add_item(tup.as_bytes(), None) else {
        return false;
    };
    let tid = ItemPointer::new(buf.block(), offset);
    tup.self_tid = tid;
    tup.set_ctid(tid);
    if let Ok(item) = page.item_mut(offset) {
        tuple::set_ctid(item, tid);
    }
    drop(page);
    buf.mark_dirty();
    true
}

/// Place a tuple wherever freespace suggests, never below block `limit`.
pub fn put_tuple_at_freespace(
    env: &Env,
    rel: &RelationRef,
    tup: &mut Tuple,
    mut limit: crate::types::BlockNumber,
) -> Result<ItemPointer> {
    let request = max_align(tup.len());
    for _ in 0..256 {
        let block = env.engine.freespace.get_freespace(rel, request, limit)?;
        let buf = env.engine.buffers.read_buffer(rel, block)?;
        if put_tuple_on_page(&buf, tup) {
            trace!(rel = %rel.id, tid = %tup.self_tid, "tuple placed");
            return Ok(tup.self_tid);
        }
        // the run promised more than the page could deliver; record
        // reality and look beyond it
        let real = buf.page().free_space();
        env.engine.freespace.deactivate(rel, block, real)?;
        limit = block + 1;
    }
    Err(StorageError::corrupt(
        "heap",
        format!("no page accepted a {request}-byte tuple in {}", rel.name),
    ))
}

/// Insert a tuple. System relations draw a real oid; user relations get
/// the generic sentinel.
pub fn heap_insert(env: &Env, rel: &RelationRef, tup: &mut Tuple) -> Result<(Oid, ItemPointer)> {
    if tup.oid() == INVALID_OID {
        let oid = if rel.is_system {
            env.engine.transam.get_new_object_id()?
        } else {
            GENERIC_OID
        };
        tup.set_oid(oid);
    }
    tup.stamp_insert(env.current_xid(), env.current_cid());

    let tid = put_tuple_at_freespace(env, rel, tup, 0)?;

    if rel.is_system {
        env.engine.catalog.mark_for_rollback(rel.id, tid);
    }
    Ok((tup.oid(), tid))
}

/// Stamp a locked tuple as deleted by the current transaction.
/// The caller holds the page's exclusive lock.
fn stamp_deleted(item: &mut [u8], env: &Env, self_tid: ItemPointer) {
    if tuple::has_flag(item, flags::MOVED_IN) {
        // restore the pre-move xmin before the union field changes hands
        let original = tuple::vacuum_xid(item);
        tuple::set_xmin(item, original);
        tuple::set_cmin(item, FIRST_COMMAND_ID);
    }
    tuple::set_xmax(item, env.current_xid());
    tuple::set_cmax(item, env.current_cid());
    tuple::clear_flags(
        item,
        flags::XMAX_COMMITTED | flags::XMAX_INVALID | flags::MARKED_FOR_UPDATE | flags::MOVED_IN,
    );
    tuple::set_ctid(item, self_tid);
}

/// Qualify `tid` for mutation, waiting out in-progress writers. Returns
/// the settled check, a copy of the tuple, and the pinned buffer with no
/// page lock held.
fn qualify_for_update(
    env: &Env,
    rel: &RelationRef,
    tid: ItemPointer,
) -> Result<(UpdateCheck, Tuple, PinnedBuffer)> {
    loop {
        let buf = env.engine.buffers.read_buffer(rel, tid.block)?;
        let (check, snapshot_copy, hints) = {
            let page = buf.page();
            let item = page.item(tid.offset)?;
            let ctx = env.visibility_ctx();
            let (check, hints) = visibility::satisfies_update(item, &ctx)?;
            (check, Tuple::from_item(item, tid), hints)
        };
        buf.apply_hint_bits(tid.offset, hints);
        match check {
            UpdateCheck::BeingUpdated(writer) => {
                trace!(%tid, writer, "waiting on concurrent writer");
                env.engine.transam.wait_for(writer, &env.status_cache)?;
            }
            settled => return Ok((settled, snapshot_copy, buf)),
        }
    }
}

/// Delete the tuple at `tid`.
pub fn heap_delete(env: &Env, rel: &RelationRef, tid: ItemPointer) -> Result<MutationOutcome> {
    let (check, old, buf) = qualify_for_update(env, rel, tid)?;
    match check {
        UpdateCheck::MayBeUpdated => {}
        UpdateCheck::SelfUpdated => return Ok(MutationOutcome::SelfUpdated(old.ctid())),
        UpdateCheck::Updated => return Ok(MutationOutcome::Updated(old.ctid())),
        UpdateCheck::Invisible => return Ok(MutationOutcome::Invisible),
        UpdateCheck::BeingUpdated(_) => unreachable!("resolved by qualify_for_update"),
    }

    {
        let mut page = buf.page_mut();
        let item = page.item_mut(tid.offset)?;
        // the writer may have changed between qualification and lock; the
        // exclusive page lock makes the recheck cheap
        let ctx = env.visibility_ctx();
        let (check, _) = visibility::satisfies_update(item, &ctx)?;
        if check != UpdateCheck::MayBeUpdated {
            drop(page);
            return heap_delete(env, rel, tid);
        }
        stamp_deleted(item, env, tid);
    }
    buf.mark_dirty();

    if old.has_flag(flags::HAS_BLOB) {
        crate::blob::delete_tuple_blob(env, rel, &old, false)?;
    }
    env.engine.catalog.invalidate_tuple(rel.id, tid);
    Ok(MutationOutcome::Done(tid))
}

/// Replace the tuple at `otid` with `newtup`. The new version lands on
/// the same page when it fits, otherwise wherever freespace points.
pub fn heap_update(
    env: &Env,
    rel: &RelationRef,
    otid: ItemPointer,
    newtup: &mut Tuple,
) -> Result<MutationOutcome> {
    let (check, old, buf) = qualify_for_update(env, rel, otid)?;
    match check {
        UpdateCheck::MayBeUpdated => {}
        UpdateCheck::SelfUpdated => return Ok(MutationOutcome::SelfUpdated(old.ctid())),
        UpdateCheck::Updated => return Ok(MutationOutcome::Updated(old.ctid())),
        UpdateCheck::Invisible => return Ok(MutationOutcome::Invisible),
        UpdateCheck::BeingUpdated(_) => unreachable!("resolved by qualify_for_update"),
    }

    newtup.set_oid(old.oid());
    newtup.stamp_insert(env.current_xid(), env.current_cid());
    newtup.set_flags(flags::UPDATED);

    let same_page = {
        let mut page = buf.page_mut();
        {
            let item = page.item_mut(otid.offset)?;
            let ctx = env.visibility_ctx();
            let (check, _) = visibility::satisfies_update(item, &ctx)?;
            if check != UpdateCheck::MayBeUpdated {
                drop(page);
                return heap_update(env, rel, otid, newtup);
            }
            stamp_deleted(item, env, otid);
        }
        // fast path: the replacement fits beside the old version
        if page.free_space() >= max_align(newtup.len()) {
            if let Some(offset) = page.add_item(newtup.as_bytes(), None) {
                let tid = ItemPointer::new(otid.block, offset);
                newtup.self_tid = tid;
                newtup.set_ctid(tid);
                if let Ok(item) = page.item_mut(offset) {
                    tuple::set_ctid(item, tid);
                }
                true
            } else {
                false
            }
        } else {
            false
        }
    };
    buf.mark_dirty();

    if !same_page {
        put_tuple_at_freespace(env, rel, newtup, 0)?;
    }

    // chain the old version to the new
    {
        let mut page = buf.page_mut();
        let item = page.item_mut(otid.offset)?;
        tuple::set_ctid(item, newtup.self_tid);
    }
    buf.mark_dirty();

    if rel.is_system {
        env.engine.catalog.mark_for_rollback(rel.id, newtup.self_tid);
    }
    if old.has_flag(flags::HAS_BLOB) {
        crate::blob::delete_tuple_blob(env, rel, &old, false)?;
    }
    env.engine.catalog.invalidate_tuple(rel.id, otid);
    Ok(MutationOutcome::Done(newtup.self_tid))
}

/// Lock a tuple for a later update: the same xmax bookkeeping as delete
/// but flagged as a mark, leaving the tuple alive.
pub fn heap_mark4update(env: &Env, rel: &RelationRef, tid: ItemPointer) -> Result<MutationOutcome> {
    let (check, old, buf) = qualify_for_update(env, rel, tid)?;
    match check {
        UpdateCheck::MayBeUpdated => {}
        UpdateCheck::SelfUpdated => return Ok(MutationOutcome::SelfUpdated(old.ctid())),
        UpdateCheck::Updated => return Ok(MutationOutcome::Updated(old.ctid())),
        UpdateCheck::Invisible => return Ok(MutationOutcome::Invisible),
        UpdateCheck::BeingUpdated(_) => unreachable!("resolved by qualify_for_update"),
    }

    {
        let mut page = buf.page_mut();
        let item = page.item_mut(tid.offset)?;
        let ctx = env.visibility_ctx();
        let (check, _) = visibility::satisfies_update(item, &ctx)?;
        if check != UpdateCheck::MayBeUpdated {
            drop(page);
            return heap_mark4update(env, rel, tid);
        }
        tuple::set_xmax(item, env.current_xid());
        tuple::set_cmax(item, env.current_cid());
        tuple::clear_flags(item, flags::XMAX_COMMITTED | flags::XMAX_INVALID);
        tuple::set_flags(item, flags::MARKED_FOR_UPDATE);
    }
    buf.mark_dirty();
    Ok(MutationOutcome::Done(tid))
}

/// Fetch the tuple at `tid` if it is visible under `snapshot`.
pub fn heap_fetch(
    env: &Env,
    rel: &RelationRef,
    tid: ItemPointer,
    snapshot: &Snapshot,
) -> Result<Option<Tuple>> {
    let buf = env.engine.buffers.read_buffer(rel, tid.block)?;
    let (verdict, copy) = {
        let page = buf.page();
        let item = match page.item(tid.offset) {
            Ok(item) => item,
            Err(_) => return Ok(None),
        };
        let ctx = env.visibility_ctx();
        let verdict = visibility::satisfies(item, snapshot, &ctx)?;
        (verdict, Tuple::from_item(item, tid))
    };
    buf.apply_hint_bits(tid.offset, verdict.hints);
    Ok(verdict.visible.then_some(copy))
}

/// Follow the update chain from `tid` and return the newest visible
/// version's address.
pub fn heap_get_latest_tid(
    env: &Env,
    rel: &RelationRef,
    tid: ItemPointer,
    snapshot: &Snapshot,
) -> Result<ItemPointer> {
    let mut cursor = tid;
    let mut latest = ItemPointer::INVALID;
    let mut hops = 0;
    loop {
        let buf = env.engine.buffers.read_buffer(rel, cursor.block)?;
        let (copy, verdict) = {
            let page = buf.page();
            let item = match page.item(cursor.offset) {
                Ok(item) => item,
                Err(_) => break,
            };
            let ctx = env.visibility_ctx();
            let verdict = visibility::satisfies(item, snapshot, &ctx)?;
            (Tuple::from_item(item, cursor), verdict)
        };
        buf.apply_hint_bits(cursor.offset, verdict.hints);
        if verdict.visible {
            latest = cursor;
        }
        let next = copy.ctid();
        if next == cursor || !next.is_valid() {
            break;
        }
        // the chain continues only across committed updates
        if copy.xmax() == INVALID_XID
            || !env
                .engine
                .transam
                .did_commit(copy.xmax(), &env.status_cache)?
        {
            break;
        }
        cursor = next;
        hops += 1;
        if hops > 1_000_000 {
            return Err(StorageError::corrupt("heap", "ctid chain does not terminate"));
        }
    }
    Ok(latest)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::env::Env;
    use crate::snapshot::SnapshotData;
    use crate::startup::{self, StartupOptions};
    use crate::types::{RelFileId, RelKind};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Bring up a full engine in a temp dir and hand back an env.
    pub(crate) fn test_env() -> (Env, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = startup::initialize(StartupOptions {
            data_dir: dir.path().to_path_buf(),
            bootstrap: true,
            recovery_check: false,
            props: crate::config::Properties::new(),
            catalog: Arc::new(crate::catalog::MemoryCatalog::new()),
        })
        .unwrap();
        let env = Env::new(engine, 1, "db");
        (env, dir)
    }

    pub(crate) fn test_relation(env: &Env, rel_oid: u32, name: &str) -> RelationRef {
        env.engine
            .relations
            .create(RelFileId::new(1, rel_oid), "db", name, RelKind::Heap)
            .unwrap()
    }

    #[test]
    fn insert_then_fetch() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7001, "points");
        env.begin_transaction().unwrap();
        let mut tup = Tuple::new(b"first row");
        let (oid, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
        assert_eq!(oid, GENERIC_OID);
        env.next_command();

        let fetched = heap_fetch(&env, &rel, tid, &Snapshot::Now).unwrap().unwrap();
        assert_eq!(fetched.payload(), b"first row");
        env.commit_transaction().unwrap();
    }

    #[test]
    fn delete_hides_tuple_from_now() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7002, "gone");
        env.begin_transaction().unwrap();
        let mut tup = Tuple::new(b"doomed");
        let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        let outcome = heap_delete(&env, &rel, tid).unwrap();
        assert_eq!(outcome, MutationOutcome::Done(tid));
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        assert!(heap_fetch(&env, &rel, tid, &Snapshot::Now).unwrap().is_none());
        env.commit_transaction().unwrap();
    }

    #[test]
    fn update_chains_ctid_and_latest_follows_it() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7003, "versions");
        env.begin_transaction().unwrap();
        let mut v1 = Tuple::new(b"v1");
        let (_, t1) = heap_insert(&env, &rel, &mut v1).unwrap();
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        let mut v2 = Tuple::new(b"v2 with longer payload");
        let outcome = heap_update(&env, &rel, t1, &mut v2).unwrap();
        let MutationOutcome::Done(t2) = outcome else {
            panic!("update must succeed, got {outcome:?}");
        };
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        // the old address now forwards to the new version
        let latest = heap_get_latest_tid(&env, &rel, t1, &Snapshot::Now).unwrap();
        assert_eq!(latest, t2);
        let cur = heap_fetch(&env, &rel, t2, &Snapshot::Now).unwrap().unwrap();
        assert_eq!(cur.payload(), b"v2 with longer payload");
        assert!(heap_fetch(&env, &rel, t1, &Snapshot::Now).unwrap().is_none());
        env.commit_transaction().unwrap();
    }

    #[test]
    fn double_delete_reports_self_updated() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7004, "twice");
        env.begin_transaction().unwrap();
        let mut tup = Tuple::new(b"x");
        let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
        env.next_command();
        assert_eq!(heap_delete(&env, &rel, tid).unwrap(), MutationOutcome::Done(tid));
        // within the same command the earlier delete reads as self-updated
        assert!(matches!(
            heap_delete(&env, &rel, tid).unwrap(),
            MutationOutcome::SelfUpdated(_)
        ));
        // a later command of the same transaction no longer sees it at all
        env.next_command();
        assert_eq!(heap_delete(&env, &rel, tid).unwrap(), MutationOutcome::Invisible);
        env.commit_transaction().unwrap();
    }

    #[test]
    fn mark_for_update_leaves_tuple_visible() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7005, "locked");
        env.begin_transaction().unwrap();
        let mut tup = Tuple::new(b"pinned");
        let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        assert_eq!(
            heap_mark4update(&env, &rel, tid).unwrap(),
            MutationOutcome::Done(tid)
        );
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        let snap = Snapshot::Mvcc(SnapshotData::new(
            env.engine.transam.read_new_transaction_id(),
            env.engine.transam.read_new_transaction_id(),
            vec![],
        ));
        assert!(heap_fetch(&env, &rel, tid, &snap).unwrap().is_some());
        env.commit_transaction().unwrap();
    }
}
