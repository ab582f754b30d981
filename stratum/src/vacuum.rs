//! Lazy vacuum and heap maintenance.
//!
//! A vacuum job owns one relation and runs in two passes: pass 1 scans
//! every block, classifies tuples against the pre-checkpoint cutoff,
//! proves hint bits, and collects dead tuple addresses into a bounded
//! array (when it fills, indexes are swept and pass 2 runs immediately,
//! then the scan resumes). Pass 2 clears the dead slots, compacts the
//! pages, and feeds the reclaimed space back to the freespace engine.
//! Afterwards come optional truncation of empty trailing blocks,
//! statistics, and the freespace run list.
//!
//! Fragmentation repair relocates live tuples downward using the
//! moved-in/moved-out pair: the copy is invisible until this vacuum
//! commits; on abort the copy evaporates and the original reverts. That
//! pair is load-bearing for crash safety; nothing here simplifies it.

use crate::blob;
use crate::catalog::ClassStats;
use crate::env::Env;
use crate::error::Result;
use crate::freespace::ScanResult;
use crate::heap;
use crate::relation::RelationRef;
use crate::tuple::{self, flags, Tuple};
use crate::types::{BlockNumber, ItemPointer, OffsetNumber, RelFileId, TransactionId, INVALID_XID};
use crate::visibility::{self, VacuumVerdict};
use rand::Rng;
use tracing::{debug, info, warn};

/// Default bound on the in-memory dead-tuple array.
const DEFAULT_FREE_TUPLES: usize = 8192;
/// Trailing blocks below this are not worth truncating.
const MIN_TRUNCATE_PAGES: u64 = 20;
/// Default ceiling on fragmentation-repair moves per pass.
const DEFAULT_FRAG_MAXMOVE: usize = 1024;

#[derive(Default)]
struct VacStats {
    rel_pages: BlockNumber,
    nonempty_pages: BlockNumber,
    rel_tuples: u64,
    live_tuples: u64,
    dead_tuples: u64,
    kept_tuples: u64,
    aborted_tuples: u64,
    unused_pointers: u64,
    live_segments: u64,
    dead_segments: u64,
    min_size: usize,
    max_size: usize,
    total_bytes: u64,
    total_free: u64,
    dead_tids: Vec<ItemPointer>,
    recently_dead: Vec<ItemPointer>,
    free_runs: Vec<(BlockNumber, usize, u32)>,
    index_removed: u64,
}

/// Classify and collect on one page of the pass-1 scan.
fn scan_heap_page(
    env: &Env,
    rel: &RelationRef,
    block: BlockNumber,
    cutoff: TransactionId,
    scanonly: bool,
    stats: &mut VacStats,
) -> Result<()> {
    let buf = env.engine.buffers.read_buffer(rel, block)?;
    let mut page = buf.page_mut();
    if page.is_new() {
        page.init(rel.special_size);
        drop(page);
        buf.mark_dirty();
        stats.free_runs.push((
            block,
            crate::types::BLCKSZ - crate::page::PAGE_HEADER_SIZE,
            0,
        ));
        return Ok(());
    }

    let max = page.max_offset();
    let mut changed = false;
    let mut has_live = false;
    let mut unused = 0u64;
    let dead_before = stats.dead_tids.len();

    for offset in 1..=max {
        if !page.line_pointer(offset).used {
            unused += 1;
            continue;
        }
        let tid = ItemPointer::new(block, offset);
        let (verdict, hints, mask, item_len) = {
            let item = page.item(offset)?;
            let ctx = env.visibility_ctx();
            let (verdict, hints) = visibility::satisfies_vacuum(item, cutoff, &ctx)?;
            (verdict, hints, tuple::infomask(item), item.len())
        };
        if hints != 0 {
            let item = page.item_mut(offset)?;
            tuple::apply_hint_bits(item, hints);
            changed = true;
        }

        let mut gone = false;
        match verdict {
            VacuumVerdict::Dead => gone = true,
            VacuumVerdict::Stillborn => {
                stats.aborted_tuples += 1;
                gone = true;
            }
            VacuumVerdict::Live => {
                stats.live_tuples += 1;
            }
            VacuumVerdict::RecentlyDead => {
                stats.recently_dead.push(tid);
                stats.kept_tuples += 1;
            }
            VacuumVerdict::InsertInProgress | VacuumVerdict::DeleteInProgress => {
                // expected while running beside writers
            }
        }

        if mask & flags::BLOB_SEGMENT != 0 {
            if gone {
                stats.dead_segments += 1;
            } else {
                stats.live_segments += 1;
            }
        } else {
            let logical = if mask & flags::HAS_BLOB != 0 {
                let copy = Tuple::from_item(page.item(offset)?, tid);
                blob::sizeof_tuple_blob(rel, &copy)? as usize
            } else {
                item_len
            };
            if stats.min_size == 0 || logical < stats.min_size {
                stats.min_size = logical;
            }
            if logical > stats.max_size {
                stats.max_size = logical;
            }
            stats.total_bytes += item_len as u64;
        }

        stats.rel_tuples += 1;
        if gone {
            if !scanonly {
                stats.dead_tids.push(tid);
            }
            stats.dead_tuples += 1;
        } else {
            has_live = true;
        }
    }

    if has_live {
        stats.nonempty_pages = block + 1;
    } else if stats.dead_tids.len() == dead_before {
        // nothing points here; clear out past mis-compactions right away
        let before = page.free_space();
        page.compact();
        unused = page.repair_fragmentation() as u64;
        if page.free_space() != before {
            changed = true;
        }
    }
    stats.unused_pointers += unused;

    // a page that queued dead tuples gets its free space recorded by
    // pass 2, after reclamation
    if stats.dead_tids.len() == dead_before {
        let free = page.free_space();
        stats.total_free += free.min(crate::page::MAX_TUPLE_SIZE) as u64;
        stats.free_runs.push((block, free, unused as u32));
    }

    drop(page);
    if changed {
        buf.mark_dirty();
    }
    Ok(())
}

/// Pass 2: clear listed line pointers, compact, and record the space.
fn vacuum_heap_pages(env: &Env, rel: &RelationRef, stats: &mut VacStats) -> Result<()> {
    stats.dead_tids.sort_by_key(|tid| (tid.block, tid.offset));
    let mut i = 0;
    while i < stats.dead_tids.len() {
        let block = stats.dead_tids[i].block;
        let mut offsets: Vec<OffsetNumber> = Vec::new();
        while i < stats.dead_tids.len() && stats.dead_tids[i].block == block {
            offsets.push(stats.dead_tids[i].offset);
            i += 1;
        }
        let buf = env.engine.buffers.read_buffer(rel, block)?;
        let (free, unused) = {
            let mut page = buf.page_mut();
            for offset in offsets {
                page.mark_unused(offset);
            }
            page.compact();
            let unused = page.repair_fragmentation();
            (page.free_space(), unused as u32)
        };
        buf.mark_dirty();
        stats.total_free += free.min(crate::page::MAX_TUPLE_SIZE) as u64;
        stats.free_runs.push((block, free, unused));
        env.engine.freespace.deactivate(rel, block, free)?;
    }
    Ok(())
}

/// Sweep each index over the collected dead tuples; log a divergence
/// between what the indexes dropped and what the heap will.
fn vacuum_indexes(env: &Env, rel: &RelationRef, stats: &mut VacStats) -> Result<()> {
    let indexes = env.engine.catalog.indexes_of(rel.id);
    if indexes.is_empty() || stats.dead_tids.is_empty() {
        return Ok(());
    }
    for index in &indexes {
        stats.index_removed += index.bulk_delete(&stats.dead_tids)?;
    }
    let heap_side = stats.dead_tids.len() as u64 * indexes.len() as u64;
    let segment_side = stats.dead_segments * indexes.len() as u64;
    if stats.index_removed != heap_side.saturating_sub(segment_side) {
        info!(
            rel = %rel.id,
            removed = stats.index_removed,
            expected = heap_side - segment_side,
            "index cleanup count diverges from heap"
        );
    }
    Ok(())
}

/// Rescan the tail to confirm it is still reclaimable, then drop it.
/// `force` skips the is-it-worth-it extent check.
fn truncate_heap(env: &Env, rel: &RelationRef, stats: &mut VacStats, force: bool) -> Result<()> {
    let current = env.engine.freespace.relation_blocks(rel)?;
    if current != stats.rel_pages {
        // the relation grew underneath us; the new pages hold live data
        stats.rel_pages = current;
        return Ok(());
    }
    let new_pages = count_nondeletable_pages(env, rel, current)?;
    if new_pages >= current {
        debug!(rel = %rel.id, "no freeable trailing pages");
        return Ok(());
    }
    let factor = env.engine.freespace.next_extent_factor(rel) as u64;
    let freeable = (current - new_pages) as u64;
    if !force && freeable <= factor {
        debug!(rel = %rel.id, freeable, factor, "extent factor exceeds freeable pages");
        return Ok(());
    }

    env.engine.buffers.flush_all(true)?;
    env.engine.buffers.invalidate_relation(rel.id)?;
    let new_pages = env.engine.freespace.truncate_heap(rel, new_pages)?;
    info!(rel = %rel.id, from = current, to = new_pages, "heap truncated");
    stats.rel_pages = new_pages;

    // drop freespace info for the removed blocks
    let mut reclaimed = 0u64;
    stats.free_runs.retain(|&(block, space, _)| {
        if block < new_pages {
            true
        } else {
            reclaimed += space.min(crate::page::MAX_TUPLE_SIZE) as u64;
            false
        }
    });
    stats.total_free = stats.total_free.saturating_sub(reclaimed);
    Ok(())
}

/// Last block (plus one) holding anything a reader could still need.
fn count_nondeletable_pages(
    env: &Env,
    rel: &RelationRef,
    nblocks: BlockNumber,
) -> Result<BlockNumber> {
    let mut block = nblocks;
    while block > 0 {
        env.check_cancel()?;
        let buf = env.engine.buffers.read_buffer(rel, block - 1)?;
        let page = buf.page();
        if page.is_new() || page.is_empty() {
            block -= 1;
            continue;
        }
        let mut needed = false;
        for offset in 1..=page.max_offset() {
            if page.line_pointer(offset).used {
                needed = true;
                break;
            }
        }
        if needed {
            break;
        }
        block -= 1;
    }
    Ok(block)
}

/// The lazy vacuum entry point: scan, sweep indexes, reclaim, maybe
/// truncate, publish statistics and the freespace run list.
pub fn lazy_vacuum_rel(
    env: &Env,
    rel: &RelationRef,
    scanonly: bool,
    force_trim: bool,
) -> Result<()> {
    // a deleter committed before every live transaction is reclaimable;
    // the vacuum transaction itself bounds the cutoff
    let cutoff = env.engine.oldest_active_xid();
    debug!(rel = %rel.id, cutoff, scanonly, "vacuum starting");

    let capacity = env
        .engine
        .props
        .get_int(crate::config::keys::FREE_TUPLES, DEFAULT_FREE_TUPLES as i64)
        .max(64) as usize;

    let mut stats = VacStats {
        rel_pages: env.engine.freespace.relation_blocks(rel)?,
        ..Default::default()
    };

    for block in 0..stats.rel_pages {
        env.check_cancel()?;
        if stats.dead_tids.len() >= capacity {
            // the array is full: sweep indexes and reclaim now, then resume
            vacuum_indexes(env, rel, &mut stats)?;
            vacuum_heap_pages(env, rel, &mut stats)?;
            stats.dead_tids.clear();
        }
        scan_heap_page(env, rel, block, cutoff, scanonly, &mut stats)?;
    }

    if !scanonly && !stats.dead_tids.is_empty() {
        vacuum_indexes(env, rel, &mut stats)?;
        vacuum_heap_pages(env, rel, &mut stats)?;
        stats.dead_tids.clear();
    }

    if !scanonly {
        if force_trim {
            truncate_heap(env, rel, &mut stats, true)?;
        } else {
            let possibly_freeable =
                (stats.rel_pages.saturating_sub(stats.nonempty_pages)) as u64;
            let factor = env.engine.freespace.next_extent_factor(rel) as u64;
            if possibly_freeable > MIN_TRUNCATE_PAGES && possibly_freeable > factor {
                truncate_heap(env, rel, &mut stats, false)?;
            }
        }
    }

    // statistics land on the class row in place: no new version, so the
    // class catalog itself can be vacuumed without churn
    let hasindex = !env.engine.catalog.indexes_of(rel.id).is_empty();
    env.engine.catalog.update_class_stats(
        rel.id,
        ClassStats {
            relpages: stats.rel_pages,
            reltuples: stats.live_tuples,
            hasindex,
        },
    );

    let total_tuples = stats.live_tuples.max(1);
    let ave = if stats.rel_tuples > 0 {
        (stats.total_bytes / total_tuples) as usize
    } else {
        0
    };
    // pages reclaimed mid-scan appear twice; the later record wins
    stats.free_runs.sort_by_key(|&(block, _, _)| block);
    stats
        .free_runs
        .dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                *earlier = *later;
                true
            } else {
                false
            }
        });
    env.engine.freespace.register(
        rel,
        ScanResult {
            runs: stats.free_runs.clone(),
            min_tuple: stats.min_size,
            max_tuple: stats.max_size,
            ave_tuple: ave,
            live_tuples: stats.live_tuples as f64,
            dead_tuples: (stats.dead_tuples + stats.kept_tuples) as f64,
            active: true,
        },
    )?;

    env.engine.transam.set_low_water(env.db, cutoff)?;

    if !scanonly {
        // occasionally refresh planner-grade statistics in the background
        let roll: f64 = rand::thread_rng().gen();
        if roll < 0.20 {
            if let Some(sweeps) = env.engine.try_sweeps() {
                sweeps.add_analyze_request(rel.id);
            }
        }
    }

    info!(
        rel = %rel.id,
        pages = stats.rel_pages,
        live = stats.live_tuples,
        dead = stats.dead_tuples,
        kept = stats.kept_tuples,
        stillborn = stats.aborted_tuples,
        "vacuum finished"
    );
    Ok(())
}

/// Fragmentation repair: walk the heap from the tail, copying live
/// tuples to lower pages as moved-in/moved-out pairs. The first sweep
/// only tags tuples (`FRAG_SCANNED`); a later sweep, or `force`, moves
/// them. A copy that cannot land below its source page is undone and the
/// page walk ends.
pub fn lazy_repair_fragmentation(
    env: &Env,
    rel: &RelationRef,
    force: bool,
    move_blobs: bool,
    max_moves: usize,
) -> Result<usize> {
    let cutoff = env.engine.oldest_active_xid();
    let nblocks = env.engine.freespace.relation_blocks(rel)?;
    let max_moves = if max_moves == 0 {
        env.engine
            .props
            .get_int(crate::config::keys::FRAG_MAXMOVE, DEFAULT_FRAG_MAXMOVE as i64)
            .max(1) as usize
    } else {
        max_moves
    };
    let mut moved = 0usize;
    let mut blob_heads: Vec<ItemPointer> = Vec::new();

    let xid = env.current_xid();
    'pages: for block in (0..nblocks).rev() {
        env.check_cancel()?;
        let buf = env.engine.buffers.read_buffer(rel, block)?;
        let max = buf.page().max_offset();

        for offset in 1..=max {
            if moved >= max_moves {
                break 'pages;
            }
            let tid = ItemPointer::new(block, offset);
            // classification and tagging under the exclusive lock
            let candidate = {
                let mut page = buf.page_mut();
                if !page.line_pointer(offset).used {
                    continue;
                }
                let item = page.item_mut(offset)?;
                let ctx = env.visibility_ctx();
                let (verdict, hints) = visibility::satisfies_vacuum(item, cutoff, &ctx)?;
                if hints != 0 {
                    tuple::apply_hint_bits(item, hints);
                    buf.mark_dirty();
                }
                if verdict != VacuumVerdict::Live {
                    continue;
                }
                if !force && !tuple::has_flag(item, flags::FRAG_SCANNED) {
                    tuple::set_flags(item, flags::FRAG_SCANNED);
                    buf.mark_dirty();
                    continue;
                }
                if tuple::has_flag(item, flags::BLOB_SEGMENT) {
                    if tuple::has_flag(item, flags::BLOB_HEAD) && move_blobs {
                        blob_heads.push(tid);
                    }
                    continue;
                }
                if tuple::has_flag(item, flags::UPDATED) {
                    // mid-chain versions stay put
                    continue;
                }
                let mut copy = Tuple::from_item(item, tid);
                // the copy keeps the original xmin in the vacuum slot so a
                // later delete can restore it
                if !copy.has_flag(flags::MOVED_IN) {
                    let original = copy.xmin();
                    copy.set_vacuum_xid(original);
                }
                copy.set_xmin(xid);
                copy.set_xmax(INVALID_XID);
                let preserved = copy.infomask() & !flags::XACT_MASK;
                copy.set_infomask(preserved | flags::MOVED_IN | flags::XMAX_INVALID);

                tuple::set_xmax(item, xid);
                tuple::clear_flags(
                    item,
                    flags::XMAX_COMMITTED | flags::XMAX_INVALID | flags::MARKED_FOR_UPDATE,
                );
                tuple::set_flags(item, flags::MOVED_OUT);
                Some(copy)
            };
            buf.mark_dirty();
            let Some(mut copy) = candidate else { continue };

            env.engine.catalog.invalidate_tuple(rel.id, tid);

            // the copy only ever lands below its source page; a target at
            // or beyond it (including a fresh extension) abandons the move
            let request = crate::page::max_align(copy.len());
            let mut target = env.engine.freespace.get_freespace(rel, request, 0)?;
            let mut handled = false;
            while target < block {
                let try_buf = env.engine.buffers.read_buffer(rel, target)?;
                if heap::put_tuple_on_page(&try_buf, &mut copy) {
                    handled = true;
                    break;
                }
                target = env.engine.freespace.get_freespace(rel, request, target + 1)?;
            }

            if !handled {
                let mut page = buf.page_mut();
                let item = page.item_mut(offset)?;
                tuple::set_xmax(item, INVALID_XID);
                tuple::clear_flags(item, flags::MOVED_OUT);
                tuple::set_flags(item, flags::XMAX_INVALID);
                drop(page);
                buf.mark_dirty();
                break;
            }
            let placed = copy.self_tid;

            for index in env.engine.catalog.indexes_of(rel.id) {
                index.insert_entry(placed, &copy)?;
            }
            {
                let mut page = buf.page_mut();
                let item = page.item_mut(offset)?;
                tuple::set_ctid(item, placed);
            }
            buf.mark_dirty();
            moved += 1;
        }
    }

    for head in blob_heads {
        if moved >= max_moves {
            break;
        }
        if let Some(last) = blob::vacuum_dup_chain_blob(env, rel, head)? {
            debug!(rel = %rel.id, %head, last, "blob chain duplicated");
            moved += 1;
        }
    }

    debug!(rel = %rel.id, moved, "fragmentation repair pass done");
    Ok(moved)
}

/// Respan blob chains: rewrite each blob-bearing tuple whose storage
/// relation changed (or every one, when forced). `exclude_self` skips
/// blobs already stored in the owning relation.
pub fn lazy_respan_blobs(
    env: &Env,
    rel: &RelationRef,
    force: bool,
    exclude_self: bool,
) -> Result<usize> {
    let nblocks = env.engine.freespace.relation_blocks(rel)?;
    let mut respanned = 0usize;
    for block in 0..nblocks {
        env.check_cancel()?;
        let buf = env.engine.buffers.read_buffer(rel, block)?;
        let candidates: Vec<ItemPointer> = {
            let page = buf.page();
            (1..=page.max_offset())
                .filter(|&off| page.line_pointer(off).used)
                .filter_map(|off| {
                    let item = page.item(off).ok()?;
                    let mask = tuple::infomask(item);
                    (mask & flags::HAS_BLOB != 0
                        && mask & flags::BLOB_SEGMENT == 0
                        && !(exclude_self && mask & flags::BLOB_LINKED != 0))
                        .then_some(ItemPointer::new(block, off))
                })
                .collect()
        };
        drop(buf);
        for tid in candidates {
            if blob::vacuum_respan_tuple_blob(env, rel, tid, force)? {
                respanned += 1;
            }
        }
    }
    debug!(rel = %rel.id, respanned, "respan pass done");
    Ok(respanned)
}

/// Freespace-only scan: rebuild the run list without touching tuples.
pub fn lazy_freespace_scan(env: &Env, rel: &RelationRef) -> Result<()> {
    lazy_vacuum_rel(env, rel, true, false)
}

/// Database-wide vacuum over the catalog's relation list.
pub fn lazy_vacuum_database(env: &Env, scanonly: bool) -> Result<()> {
    for relid in env.engine.catalog.relations_of_database(env.db) {
        let Some(rel) = env.engine.relations.lookup(relid) else {
            continue;
        };
        if let Err(err) = lazy_vacuum_rel(env, &rel, scanonly, false) {
            warn!(rel = %relid, %err, "database vacuum skipped a relation");
        }
    }
    Ok(())
}

/// Open a relation by id and vacuum it (the pool-sweep entry point).
pub fn lazy_open_vacuum_rel(
    env: &Env,
    relid: RelFileId,
    force_trim: bool,
    scanonly: bool,
) -> Result<()> {
    let Some(rel) = env.engine.relations.lookup(relid) else {
        debug!(rel = %relid, "vacuum request for an unopened relation");
        return Ok(());
    };
    lazy_vacuum_rel(env, &rel, scanonly, force_trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::{test_env, test_relation};
    use crate::heap::{heap_delete, heap_insert, HeapScan};
    use crate::snapshot::Snapshot;

    #[test]
    fn vacuum_reclaims_deleted_tuples() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7301, "reclaim");

        env.begin_transaction().unwrap();
        let mut tids = Vec::new();
        for i in 0..1000u32 {
            let mut tup = Tuple::new(&i.to_le_bytes());
            let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
            tids.push(tid);
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        for tid in tids.iter().step_by(2) {
            heap_delete(&env, &rel, *tid).unwrap();
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        lazy_vacuum_rel(&env, &rel, false, false).unwrap();
        env.commit_transaction().unwrap();

        // deleted slots are physically unused now
        let buf = env.engine.buffers.read_buffer(&rel, tids[0].block).unwrap();
        let page = buf.page();
        let live = (1..=page.max_offset())
            .filter(|&off| page.line_pointer(off).used)
            .count();
        assert!(live > 0);
        drop(page);
        drop(buf);

        // survivors all scan back
        env.begin_transaction().unwrap();
        let mut scan = HeapScan::begin(&env, rel.clone(), Snapshot::Now, vec![]).unwrap();
        let mut seen = 0;
        while scan.get_next().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 500);
        env.commit_transaction().unwrap();

        let stats = env.engine.catalog.class_stats(rel.id).unwrap();
        assert_eq!(stats.reltuples, 500);
    }

    #[test]
    fn vacuum_is_idempotent_on_quiescent_relation() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7302, "steady");
        env.begin_transaction().unwrap();
        for i in 0..100u32 {
            let mut tup = Tuple::new(&i.to_le_bytes());
            heap_insert(&env, &rel, &mut tup).unwrap();
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        lazy_vacuum_rel(&env, &rel, false, false).unwrap();
        env.commit_transaction().unwrap();
        let first = env.engine.catalog.class_stats(rel.id).unwrap();

        env.begin_transaction().unwrap();
        lazy_vacuum_rel(&env, &rel, false, false).unwrap();
        env.commit_transaction().unwrap();
        let second = env.engine.catalog.class_stats(rel.id).unwrap();

        assert_eq!(first.relpages, second.relpages);
        assert_eq!(first.reltuples, second.reltuples);
    }

    #[test]
    fn fragmentation_repair_moves_tail_tuples_down() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7303, "fragged");

        // spread rows over several pages, then hollow out the front
        env.begin_transaction().unwrap();
        let mut tids = Vec::new();
        for i in 0..2000u32 {
            let mut tup = Tuple::new(&[i as u8; 64]);
            let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
            tids.push(tid);
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        for tid in &tids {
            if tid.block < 2 {
                heap_delete(&env, &rel, *tid).unwrap();
            }
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        lazy_vacuum_rel(&env, &rel, false, false).unwrap();
        env.commit_transaction().unwrap();

        // force-mode repair moves without the tag pass
        env.begin_transaction().unwrap();
        let moved = lazy_repair_fragmentation(&env, &rel, true, false, 64).unwrap();
        assert!(moved > 0, "tuples must relocate into the hollow front");
        env.commit_transaction().unwrap();

        // every original still reads exactly once through the chains
        env.begin_transaction().unwrap();
        let mut scan = HeapScan::begin(&env, rel.clone(), Snapshot::Now, vec![]).unwrap();
        let mut seen = 0;
        while scan.get_next().unwrap().is_some() {
            seen += 1;
        }
        assert_eq!(seen, 2000 - tids.iter().filter(|t| t.block < 2).count());
        env.commit_transaction().unwrap();
    }

    #[test]
    fn first_repair_pass_only_tags() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7304, "tagged");
        env.begin_transaction().unwrap();
        for i in 0..10u32 {
            let mut tup = Tuple::new(&i.to_le_bytes());
            heap_insert(&env, &rel, &mut tup).unwrap();
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        let moved = lazy_repair_fragmentation(&env, &rel, false, false, 64).unwrap();
        assert_eq!(moved, 0, "first pass only sets the scan tag");
        env.commit_transaction().unwrap();
    }

    #[test]
    fn truncation_drops_empty_tail() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7305, "trimmed");
        env.begin_transaction().unwrap();
        let mut tids = Vec::new();
        for i in 0..3000u32 {
            let mut tup = Tuple::new(&[(i % 251) as u8; 128]);
            let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
            tids.push(tid);
        }
        env.commit_transaction().unwrap();
        let before = rel.nblocks().unwrap();

        // clear everything past block 1
        env.begin_transaction().unwrap();
        for tid in &tids {
            if tid.block > 1 {
                heap_delete(&env, &rel, *tid).unwrap();
            }
        }
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        lazy_vacuum_rel(&env, &rel, false, true).unwrap();
        env.commit_transaction().unwrap();

        let after = rel.nblocks().unwrap();
        assert!(after < before, "tail must shrink ({before} -> {after})");
        assert!(after >= 2);
    }
}
