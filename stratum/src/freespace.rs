//! Per-relation free-space accounting and extent management.
//!
//! Each relation carries an ordered run list of candidate pages with
//! their remaining bytes. Allocation scans the runs from a bucketed entry
//! point; when nothing satisfies a request, the caller claims the
//! *extender* role, grows the relation by the recommended extent, and
//! repopulates the run list while competitors wait on the entry's
//! condition variable. Run lists are rebuilt wholesale by freespace scans
//! (vacuum or the background scan job).

use crate::catalog::{CatalogBridge, ExtentPolicy};
use crate::config::keys;
use crate::error::{Result, StorageError};
use crate::page::{Page, LINE_POINTER_SIZE, MAX_TUPLE_SIZE};
use crate::relation::RelationRef;
use crate::storage::buffer::BufferPool;
use crate::types::{BlockNumber, RelFileId, RelKind, BLCKSZ};
use crate::tuple::TUPLE_HEADER_SIZE;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::debug;

/// Request-size buckets in the entry-point index.
const INDEX_SIZE: usize = 8;
/// Eligible-but-too-small probes tolerated before a run dies.
const MISS_LIMIT: u32 = 128;
/// Runs with less space than this are not worth tracking.
pub const MIN_LIVE_SPACE: usize = BLCKSZ / 10;

/// One candidate page.
#[derive(Debug, Clone, Copy)]
pub struct FreeRun {
    pub block: BlockNumber,
    pub avail: usize,
    pub unused_pointers: u32,
    pub misses: u32,
    pub live: bool,
}

/// Input to [`FreespaceMap::register`]: what a freespace scan observed.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub runs: Vec<(BlockNumber, usize, u32)>,
    pub min_tuple: usize,
    pub max_tuple: usize,
    pub ave_tuple: usize,
    pub live_tuples: f64,
    pub dead_tuples: f64,
    pub active: bool,
}

struct EntryState {
    runs: Vec<FreeRun>,
    pointer: usize,
    index: [usize; INDEX_SIZE],
    index_size: [usize; INDEX_SIZE],
    min_request: usize,
    max_request: usize,
    extent: u32,
    extent_percentage: bool,
    extent_cached: bool,
    relkind: RelKind,
    active: bool,
    end_scanned: bool,
    relsize: BlockNumber,
    last_live: f64,
    last_dead: f64,
    min_tuple: usize,
    max_tuple: usize,
    ave_tuple: usize,
    total_available: usize,
    extender: Option<ThreadId>,
}

impl EntryState {
    fn reset_index(&mut self, max_segment: usize) {
        self.pointer = 0;
        self.index = [0; INDEX_SIZE];
        self.index_size = [0; INDEX_SIZE];
        self.index_size[0] = max_segment;
    }
}

struct FreespaceEntry {
    state: Mutex<EntryState>,
    extender_done: Condvar,
}

impl FreespaceEntry {
    /// Wait out a concurrent extender, then return the guard.
    fn lock_settled(&self) -> MutexGuard<'_, EntryState> {
        let mut state = self.state.lock().unwrap();
        while state.extender.is_some() && state.extender != Some(thread::current().id()) {
            state = self.extender_done.wait(state).unwrap();
        }
        state
    }
}

type ScanHook = Box<dyn Fn(RelFileId) + Send + Sync>;

pub struct FreespaceMap {
    table: Mutex<HashMap<RelFileId, Arc<FreespaceEntry>>>,
    catalog: Arc<dyn CatalogBridge>,
    buffers: Arc<BufferPool>,
    nbuffers: usize,
    max_segment: usize,
    scan_hook: Mutex<Option<ScanHook>>,
}

impl FreespaceMap {
    pub fn new(
        catalog: Arc<dyn CatalogBridge>,
        buffers: Arc<BufferPool>,
        props: &crate::config::Properties,
    ) -> Self {
        let nbuffers = props.get_int(keys::BUFFER_COUNT, 256).max(16) as usize;
        FreespaceMap {
            table: Mutex::new(HashMap::new()),
            catalog,
            buffers,
            nbuffers,
            max_segment: crate::blob::max_segment_payload(props),
            scan_hook: Mutex::new(None),
        }
    }

    /// Install the background scan request hook (the pool-sweep enqueue).
    pub fn set_scan_hook(&self, hook: ScanHook) {
        *self.scan_hook.lock().unwrap() = Some(hook);
    }

    fn request_scan(&self, rel: RelFileId) {
        if let Some(hook) = self.scan_hook.lock().unwrap().as_ref() {
            hook(rel);
        }
    }

    fn find(&self, rel: &RelationRef, create: bool) -> Result<Option<Arc<FreespaceEntry>>> {
        {
            let table = self.table.lock().unwrap();
            if let Some(entry) = table.get(&rel.id) {
                return Ok(Some(entry.clone()));
            }
        }
        if !create {
            return Ok(None);
        }
        let relsize = rel.nblocks()?;
        let entry = {
            let mut table = self.table.lock().unwrap();
            if let Some(entry) = table.get(&rel.id) {
                return Ok(Some(entry.clone()));
            }
            let mut state = EntryState {
                runs: Vec::new(),
                pointer: 0,
                index: [0; INDEX_SIZE],
                index_size: [0; INDEX_SIZE],
                min_request: MAX_TUPLE_SIZE,
                max_request: TUPLE_HEADER_SIZE,
                extent: 0,
                extent_percentage: false,
                extent_cached: false,
                relkind: rel.kind,
                active: false,
                end_scanned: false,
                relsize,
                last_live: 0.0,
                last_dead: 0.0,
                min_tuple: 0,
                max_tuple: 0,
                ave_tuple: 0,
                total_available: 0,
                extender: None,
            };
            state.index_size[0] = self.max_segment;
            let entry = Arc::new(FreespaceEntry {
                state: Mutex::new(state),
                extender_done: Condvar::new(),
            });
            table.insert(rel.id, entry.clone());
            entry
        };
        if !rel.xact_only {
            self.request_scan(rel.id);
        }
        Ok(Some(entry))
    }

    /// Find a page with at least `request` free bytes, never below block
    /// `limit`. Extends the relation when the run list is dry.
    pub fn get_freespace(
        &self,
        rel: &RelationRef,
        request: usize,
        limit: BlockNumber,
    ) -> Result<BlockNumber> {
        if request > MAX_TUPLE_SIZE {
            return Err(StorageError::OversizedRequest(request));
        }
        let entry = self
            .find(rel, true)?
            .expect("create-mode find always yields an entry");

        let recommend;
        {
            let mut state = entry.lock_settled();

            // pick the scan entry point for this request size
            let mut idx = 0;
            while idx < INDEX_SIZE {
                if request <= state.index_size[idx] || state.index[idx] == 0 {
                    break;
                }
                idx += 1;
            }
            if idx == INDEX_SIZE {
                idx -= 1;
            }
            let mut start = state.index[idx];
            if start == 0 {
                start = state.pointer;
            }

            let mut found = None;
            for p in start..state.runs.len() {
                if !state.runs[p].live {
                    if state.pointer == p {
                        state.pointer += 1;
                    }
                    continue;
                }
                if state.runs[p].block >= limit {
                    if state.runs[p].avail > request {
                        found = Some(p);
                        break;
                    }
                    state.runs[p].misses += 1;
                    if state.runs[p].misses > MISS_LIMIT {
                        state.runs[p].live = false;
                    }
                }
                if state.runs[p].avail < state.min_request {
                    state.runs[p].live = false;
                }
            }

            if state.min_request > request {
                state.min_request = request;
            }
            if state.max_request < request {
                state.max_request = request;
            }

            match found {
                Some(p) => {
                    let min_request = state.min_request;
                    let run = &mut state.runs[p];
                    let check = run.block;
                    let mut remove = request;
                    if run.unused_pointers == 0 {
                        remove += LINE_POINTER_SIZE;
                    } else {
                        run.unused_pointers -= 1;
                    }
                    let remove = remove.min(run.avail);
                    run.misses = 0;
                    run.avail -= remove;
                    if request >= self.max_segment || run.avail < min_request {
                        run.live = false;
                    }
                    let run_avail = run.avail;
                    state.total_available = state.total_available.saturating_sub(remove);
                    // promote this position as the entry point for the bucket
                    state.index[idx] = p;
                    state.index_size[idx] = run_avail;
                    return Ok(check);
                }
                None => {
                    // claim the extender role; competitors wait on the condvar
                    state.extender = Some(thread::current().id());
                    recommend = self.recommend_allocation(rel, &mut state);
                }
            }
        }

        match self.perform_allocation(rel, &entry, recommend) {
            Ok(block) => Ok(block),
            Err(err) => {
                let mut state = entry.state.lock().unwrap();
                state.extender = None;
                entry.extender_done.notify_all();
                drop(state);
                Err(err)
            }
        }
    }

    /// Extent recommendation. Bootstrap and system relations grow one
    /// block at a time; everything else follows its extent row, with a
    /// 5 % percentage default, clamped to `[3, buffer count]`.
    fn recommend_allocation(&self, rel: &RelationRef, state: &mut EntryState) -> usize {
        if state.relkind == RelKind::Index && state.relsize == 0 {
            return 1;
        }
        if rel.is_system {
            return 1;
        }
        if state.extent == 0 && !state.extent_cached {
            match self.catalog.extent_policy(rel.id) {
                Some(policy) => {
                    state.extent = policy.amount;
                    state.extent_percentage = policy.percentage;
                }
                None => {
                    state.extent = 5;
                    state.extent_percentage = true;
                }
            }
            state.extent_cached = true;
        }
        if state.extent == 0 {
            return 1;
        }
        let mut create = if state.extent_percentage {
            ((state.relsize as f64) * (state.extent as f64 / 100.0)) as usize
        } else {
            state.extent as usize
        };
        if create < 3 {
            create = 3;
        }
        if create > self.nbuffers {
            create = self.nbuffers;
        }
        create
    }

    /// Trailing all-empty pages are reused as if newly allocated before
    /// the file physically grows; bounded so a huge empty tail does not
    /// stall the allocator.
    fn find_end_space(
        &self,
        rel: &RelationRef,
        nblocks: BlockNumber,
        next_extent: usize,
    ) -> Result<usize> {
        let mut free_pages = 0usize;
        let mut block = nblocks;
        while block > 0 {
            block -= 1;
            let buf = self.buffers.read_buffer(rel, block)?;
            let empty = {
                let page = buf.page();
                page.is_new() || page.is_empty()
            };
            if !empty {
                break;
            }
            free_pages += 1;
            if free_pages > next_extent * 10 {
                break;
            }
        }
        Ok(free_pages)
    }

    /// Grow the relation (the caller holds the extender role) and rebuild
    /// the run list from the fresh pages. Returns the first usable block.
    fn perform_allocation(
        &self,
        rel: &RelationRef,
        entry: &FreespaceEntry,
        mut count: usize,
    ) -> Result<BlockNumber> {
        let nblocks = rel.nblocks()?;
        let mut base = nblocks;
        let mut found = 0usize;

        let end_scanned = entry.state.lock().unwrap().end_scanned;
        if nblocks > 0 && !end_scanned {
            found = self.find_end_space(rel, nblocks, count)?;
            if found > 0 {
                base = nblocks - found as BlockNumber;
                count = 0;
            }
        }

        let mut allocated = 0usize;
        if count > 0 {
            let mut seed = Page::zeroed();
            seed.init(rel.special_size);
            rel.extend(seed.as_bytes(), count)?;
            allocated = count;
        }

        let total = found + allocated;
        let usable = BLCKSZ - crate::page::PAGE_HEADER_SIZE - crate::page::max_align(rel.special_size);
        let mut state = entry.state.lock().unwrap();
        state.end_scanned = true;
        state.relsize = base;
        if total > 0 {
            state.runs = (0..total)
                .map(|i| FreeRun {
                    block: base + i as BlockNumber,
                    avail: usable,
                    unused_pointers: 0,
                    misses: 0,
                    live: true,
                })
                .collect();
            state.reset_index(self.max_segment);
            state.total_available = usable * total;
            state.relsize = base + total as BlockNumber;
            state.active = true;
        }
        state.extender = None;
        entry.extender_done.notify_all();
        debug!(rel = %rel.id, base, found, allocated, "relation extended");
        Ok(base)
    }

    /// Index-relation allocation: hand out one pre-extended page at a
    /// time, extending when the run list runs dry.
    pub fn allocate_more_space(&self, rel: &RelationRef) -> Result<BlockNumber> {
        let entry = self
            .find(rel, true)?
            .expect("create-mode find always yields an entry");
        let recommend;
        {
            let mut state = entry.lock_settled();
            if state.pointer < state.runs.len() {
                let p = state.pointer;
                state.pointer += 1;
                let run = &mut state.runs[p];
                run.live = false;
                return Ok(run.block);
            }
            state.extender = Some(thread::current().id());
            recommend = self.recommend_allocation(rel, &mut state).max(1);
        }
        self.perform_allocation(rel, &entry, recommend)
    }

    /// Replace the run list with a scan's findings. Skipped outright when
    /// an extender is mid-flight. Runs under the live threshold are kept
    /// dead and never enter the accumulator.
    pub fn register(&self, rel: &RelationRef, scan: ScanResult) -> Result<()> {
        let Some(entry) = self.find(rel, true)? else {
            return Ok(());
        };
        let mut state = entry.state.lock().unwrap();
        if state.extender.is_some() {
            debug!(rel = %rel.id, "extension in flight, scan results dropped");
            return Ok(());
        }
        state.active = scan.active;
        state.min_request = MAX_TUPLE_SIZE;
        state.max_request = TUPLE_HEADER_SIZE;
        state.min_tuple = scan.min_tuple;
        state.max_tuple = scan.max_tuple;
        state.ave_tuple = scan.ave_tuple;
        state.last_live = scan.live_tuples;
        state.last_dead = scan.dead_tuples;
        state.reset_index(self.max_segment);

        let mut runs: Vec<FreeRun> = scan
            .runs
            .iter()
            .map(|&(block, avail, unused)| FreeRun {
                block,
                avail,
                unused_pointers: unused,
                misses: 0,
                live: avail >= MIN_LIVE_SPACE,
            })
            .collect();
        runs.sort_by_key(|r| r.block);
        state.total_available = runs
            .iter()
            .filter(|r| r.live)
            .map(|r| r.avail)
            .sum();
        state.runs = runs;
        Ok(())
    }

    /// Clamp a run's recorded space to observed reality (vacuum pass 2 and
    /// page compaction report through here).
    pub fn deactivate(&self, rel: &RelationRef, block: BlockNumber, realspace: usize) -> Result<()> {
        let Some(entry) = self.find(rel, false)? else {
            return Ok(());
        };
        let mut state = entry.state.lock().unwrap();
        let min_request = state.min_request;
        if let Ok(p) = state.runs.binary_search_by_key(&block, |r| r.block) {
            let run = &mut state.runs[p];
            if realspace < min_request {
                run.live = false;
            }
            let old = run.avail;
            run.avail = realspace;
            state.total_available = state.total_available.saturating_sub(old) + realspace;
        }
        Ok(())
    }

    /// Mark the entry inactive: statistics are stale until the next scan.
    pub fn set_pending(&self, rel: RelFileId) {
        let table = self.table.lock().unwrap();
        if let Some(entry) = table.get(&rel) {
            entry.state.lock().unwrap().active = false;
        }
    }

    /// Drop the entry. With `gone`, the relation is being removed for
    /// good and its extent row goes too.
    pub fn forget(&self, rel: &RelationRef, gone: bool) {
        self.table.lock().unwrap().remove(&rel.id);
        if gone {
            self.catalog.remove_extent_policy(rel.id);
        }
    }

    /// Serialize behind the extender role, truncate through smgr, and
    /// kill runs beyond the new end.
    pub fn truncate_heap(&self, rel: &RelationRef, new_pages: BlockNumber) -> Result<BlockNumber> {
        let entry = self
            .find(rel, true)?
            .expect("create-mode find always yields an entry");
        {
            let mut state = entry.lock_settled();
            state.extender = Some(thread::current().id());
        }

        self.buffers.discard_tail(rel.id, new_pages);
        let result = rel.truncate(new_pages);

        let mut state = entry.state.lock().unwrap();
        state.extender = None;
        let new_pages = match result {
            Ok(pages) => pages,
            Err(err) => {
                entry.extender_done.notify_all();
                return Err(err);
            }
        };
        state.relsize = new_pages;
        for run in &mut state.runs {
            if run.block >= new_pages {
                run.live = false;
                run.avail = 0;
            }
        }
        entry.extender_done.notify_all();
        Ok(new_pages)
    }

    /// Relation size as freespace tracks it; falls back to smgr.
    pub fn relation_blocks(&self, rel: &RelationRef) -> Result<BlockNumber> {
        if matches!(rel.kind, RelKind::Heap | RelKind::Index | RelKind::Uncataloged) {
            if let Some(entry) = self.find(rel, false)? {
                return Ok(entry.state.lock().unwrap().relsize);
            }
        }
        rel.nblocks()
    }

    pub fn total_available(&self, rel: &RelationRef) -> usize {
        match self.find(rel, false) {
            Ok(Some(entry)) => entry.state.lock().unwrap().total_available,
            _ => 0,
        }
    }

    pub fn tuple_sizes(&self, rel: &RelationRef) -> (usize, usize, usize) {
        match self.find(rel, false) {
            Ok(Some(entry)) => {
                let state = entry.state.lock().unwrap();
                (state.min_tuple, state.max_tuple, state.ave_tuple)
            }
            _ => (0, 0, 0),
        }
    }

    pub fn set_next_extent(&self, rel: &RelationRef, amount: u32, percentage: bool) -> Result<()> {
        if let Some(entry) = self.find(rel, true)? {
            let mut state = entry.state.lock().unwrap();
            state.extent = amount;
            state.extent_percentage = percentage;
            state.extent_cached = true;
        }
        self.catalog.set_extent_policy(
            rel.id,
            ExtentPolicy {
                amount,
                percentage,
            },
        );
        Ok(())
    }

    pub fn next_extent_factor(&self, rel: &RelationRef) -> usize {
        match self.find(rel, false) {
            Ok(Some(entry)) => {
                let mut state = entry.state.lock().unwrap();
                self.recommend_allocation(rel, &mut state)
            }
            _ => 1,
        }
    }

    /// Per-relation update frequency for maintenance scheduling. Raw
    /// estimate `(0.01·live + 0.1·dead + 100) / (live + 1)`, clamped to
    /// `[0.2, 3] × last_value` to damp swings.
    pub fn update_factor(&self, rel: RelFileId, last_value: f64) -> (f64, bool) {
        let entry = {
            let table = self.table.lock().unwrap();
            table.get(&rel).cloned()
        };
        let Some(entry) = entry else {
            return (100.0, false);
        };
        let state = entry.state.lock().unwrap();
        let trackable = state.relkind == RelKind::Heap;
        if !state.active {
            return (-10.0, trackable);
        }
        if !trackable {
            return (0.0, trackable);
        }
        let mut stats = state.last_live * 0.01;
        stats += state.last_dead * 0.1;
        stats += 100.0;
        stats /= state.last_live + 1.0;
        if last_value > 0.0 {
            let mellow = stats / last_value;
            if mellow > 3.0 {
                stats = last_value * 3.0;
            } else if mellow < 0.2 {
                stats = last_value * 0.2;
            }
        }
        if stats < 1e-8 {
            stats = 1.0;
        }
        (stats, trackable)
    }

    #[cfg(test)]
    fn run_count(&self, rel: &RelationRef) -> usize {
        match self.find(rel, false) {
            Ok(Some(entry)) => entry.state.lock().unwrap().runs.len(),
            _ => 0,
        }
    }
}

/// Total usable space invariant: the sum over live runs, each clamped to
/// the largest tuple a page can hold.
pub fn clamped_total(runs: &[FreeRun]) -> usize {
    runs.iter()
        .filter(|r| r.live)
        .map(|r| r.avail.min(MAX_TUPLE_SIZE))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::Properties;
    use crate::relation::{Relation, RelationCache};
    use crate::storage::smgr::{DiskManager, Smgr};
    use crate::storage::vfd::VfdPool;
    use tempfile::TempDir;

    struct Fixture {
        map: FreespaceMap,
        catalog: Arc<MemoryCatalog>,
        rel: RelationRef,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let vfs = Arc::new(VfdPool::new(&Properties::new()));
        let smgr: Arc<dyn Smgr> = Arc::new(DiskManager::new(vfs, dir.path()));
        let relations = RelationCache::new(smgr.clone());
        let rel = relations
            .create(RelFileId::new(1, 400), "db", "stock", RelKind::Heap)
            .unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let buffers = Arc::new(BufferPool::with_default_capacity());
        let map = FreespaceMap::new(catalog.clone(), buffers, &Properties::new());
        Fixture {
            map,
            catalog,
            rel,
            _dir: dir,
        }
    }

    #[test]
    fn empty_relation_extends_on_first_request() {
        let fx = fixture();
        let block = fx.map.get_freespace(&fx.rel, 128, 0).unwrap();
        assert_eq!(block, 0);
        // the default 5% policy on an empty relation clamps to 3 blocks
        assert_eq!(fx.rel.nblocks().unwrap(), 3);
        assert_eq!(fx.map.run_count(&fx.rel), 3);
    }

    #[test]
    fn percentage_extent_policy_is_honored() {
        let fx = fixture();
        fx.catalog.set_extent_policy(
            fx.rel.id,
            ExtentPolicy {
                amount: 10,
                percentage: true,
            },
        );
        // grow the relation to 100 blocks first
        let seed = {
            let mut page = Page::zeroed();
            page.init(0);
            page
        };
        fx.rel.extend(seed.as_bytes(), 100).unwrap();
        // register an exhausted run list so the request goes to allocation,
        // and mark the tail scanned so end-reuse doesn't absorb the request
        fx.map
            .register(
                &fx.rel,
                ScanResult {
                    runs: vec![],
                    active: true,
                    ..Default::default()
                },
            )
            .unwrap();
        {
            let entry = fx.map.find(&fx.rel, true).unwrap().unwrap();
            let mut state = entry.state.lock().unwrap();
            state.end_scanned = true;
            state.relsize = 100;
        }

        let block = fx.map.get_freespace(&fx.rel, 256, 0).unwrap();
        assert_eq!(block, 100);
        // 10% of 100 blocks
        assert_eq!(fx.rel.nblocks().unwrap(), 110);
    }

    #[test]
    fn registered_runs_satisfy_requests_in_block_order() {
        let fx = fixture();
        let seed = {
            let mut page = Page::zeroed();
            page.init(0);
            page
        };
        fx.rel.extend(seed.as_bytes(), 8).unwrap();
        fx.map
            .register(
                &fx.rel,
                ScanResult {
                    runs: vec![(5, 4000, 0), (2, 6000, 1), (7, 100, 0)],
                    active: true,
                    ..Default::default()
                },
            )
            .unwrap();

        // run at block 7 is under the live threshold and never used
        let b1 = fx.map.get_freespace(&fx.rel, 1000, 0).unwrap();
        assert_eq!(b1, 2);
        // limit skips earlier blocks
        let b2 = fx.map.get_freespace(&fx.rel, 1000, 3).unwrap();
        assert_eq!(b2, 5);
    }

    #[test]
    fn allocation_decrements_availability() {
        let fx = fixture();
        let seed = {
            let mut page = Page::zeroed();
            page.init(0);
            page
        };
        fx.rel.extend(seed.as_bytes(), 4).unwrap();
        fx.map
            .register(
                &fx.rel,
                ScanResult {
                    runs: vec![(1, 5000, 0)],
                    active: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let before = fx.map.total_available(&fx.rel);
        fx.map.get_freespace(&fx.rel, 1000, 0).unwrap();
        let after = fx.map.total_available(&fx.rel);
        assert_eq!(before - after, 1000 + LINE_POINTER_SIZE);
    }

    #[test]
    fn truncate_kills_runs_beyond_the_new_end() {
        let fx = fixture();
        let seed = {
            let mut page = Page::zeroed();
            page.init(0);
            page
        };
        fx.rel.extend(seed.as_bytes(), 10).unwrap();
        fx.map
            .register(
                &fx.rel,
                ScanResult {
                    runs: vec![(2, 4000, 0), (8, 4000, 0)],
                    active: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let new_end = fx.map.truncate_heap(&fx.rel, 5).unwrap();
        assert_eq!(new_end, 5);
        assert_eq!(fx.rel.nblocks().unwrap(), 5);
        // only the surviving run answers requests now
        let block = fx.map.get_freespace(&fx.rel, 1000, 0).unwrap();
        assert_eq!(block, 2);
    }

    #[test]
    fn update_factor_formula_and_clamps() {
        let fx = fixture();
        let seed = {
            let mut page = Page::zeroed();
            page.init(0);
            page
        };
        fx.rel.extend(seed.as_bytes(), 1).unwrap();
        fx.map
            .register(
                &fx.rel,
                ScanResult {
                    runs: vec![],
                    live_tuples: 1000.0,
                    dead_tuples: 100.0,
                    active: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let (raw, trackable) = fx.map.update_factor(fx.rel.id, 0.0);
        assert!(trackable);
        let expected = (1000.0 * 0.01 + 100.0 * 0.1 + 100.0) / 1001.0;
        assert!((raw - expected).abs() < 1e-9);

        // a huge previous value clamps the drop to 0.2x
        let (clamped, _) = fx.map.update_factor(fx.rel.id, 10.0);
        assert!((clamped - 2.0).abs() < 1e-9);

        // unknown relations are untrackable
        let (def, trackable) = fx.map.update_factor(RelFileId::new(1, 999), 1.0);
        assert!(!trackable);
        assert!((def - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let fx = fixture();
        let err = fx.map.get_freespace(&fx.rel, BLCKSZ, 0).unwrap_err();
        assert!(matches!(err, StorageError::OversizedRequest(_)));
    }

    #[test]
    fn clamped_total_invariant() {
        let runs = vec![
            FreeRun {
                block: 0,
                avail: 100,
                unused_pointers: 0,
                misses: 0,
                live: true,
            },
            FreeRun {
                block: 1,
                avail: MAX_TUPLE_SIZE + 500,
                unused_pointers: 0,
                misses: 0,
                live: true,
            },
            FreeRun {
                block: 2,
                avail: 900,
                unused_pointers: 0,
                misses: 0,
                live: false,
            },
        ];
        assert_eq!(clamped_total(&runs), 100 + MAX_TUPLE_SIZE);
    }
}
