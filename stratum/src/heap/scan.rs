//! Sequential heap scans with snapshot filtering and mark/restore.

use crate::env::Env;
use crate::error::Result;
use crate::relation::RelationRef;
use crate::snapshot::Snapshot;
use crate::tuple::{self, flags, Tuple};
use crate::types::{BlockNumber, ItemPointer, OffsetNumber};
use crate::visibility;

/// Payload filter applied after visibility: equality on a byte range of
/// the tuple payload.
#[derive(Debug, Clone)]
pub struct ScanKey {
    pub offset: usize,
    pub value: Vec<u8>,
}

impl ScanKey {
    pub fn matches(&self, payload: &[u8]) -> bool {
        payload
            .get(self.offset..self.offset + self.value.len())
            .map(|slice| slice == self.value)
            .unwrap_or(false)
    }
}

/// A sequential scan: (relation, snapshot, keys, current position).
pub struct HeapScan<'env> {
    env: &'env Env,
    rel: RelationRef,
    snapshot: Snapshot,
    keys: Vec<ScanKey>,
    nblocks: BlockNumber,
    block: BlockNumber,
    offset: OffsetNumber,
    marked: Option<(BlockNumber, OffsetNumber)>,
    finished: bool,
}

impl<'env> HeapScan<'env> {
    pub fn begin(
        env: &'env Env,
        rel: RelationRef,
        snapshot: Snapshot,
        keys: Vec<ScanKey>,
    ) -> Result<Self> {
        let nblocks = env.engine.freespace.relation_blocks(&rel)?;
        Ok(HeapScan {
            env,
            rel,
            snapshot,
            keys,
            nblocks,
            block: 0,
            offset: 0,
            marked: None,
            finished: nblocks == 0,
        })
    }

    /// Restart from the first block with fresh extent information.
    pub fn rescan(&mut self) -> Result<()> {
        self.nblocks = self.env.engine.freespace.relation_blocks(&self.rel)?;
        self.block = 0;
        self.offset = 0;
        self.finished = self.nblocks == 0;
        Ok(())
    }

    pub fn markpos(&mut self) {
        self.marked = Some((self.block, self.offset));
    }

    pub fn restrpos(&mut self) {
        if let Some((block, offset)) = self.marked {
            self.block = block;
            self.offset = offset;
            self.finished = false;
        }
    }

    pub fn current_tid(&self) -> ItemPointer {
        if self.offset == 0 {
            ItemPointer::INVALID
        } else {
            ItemPointer::new(self.block, self.offset)
        }
    }

    /// Advance to the next visible, key-matching tuple. Blob segments are
    /// storage, not rows, and never surface here.
    pub fn get_next(&mut self) -> Result<Option<Tuple>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            self.env.check_cancel()?;
            if self.block >= self.nblocks {
                self.finished = true;
                return Ok(None);
            }
            let buf = self.env.engine.buffers.read_buffer(&self.rel, self.block)?;
            let (found, pending, stopped_at) = {
                let page = buf.page();
                let max = page.max_offset();
                let mut pending: Vec<(OffsetNumber, u16)> = Vec::new();
                let mut found = None;
                let mut offset = self.offset;
                while offset < max {
                    offset += 1;
                    if !page.line_pointer(offset).used {
                        continue;
                    }
                    let item = page.item(offset)?;
                    if tuple::has_flag(item, flags::BLOB_SEGMENT) {
                        continue;
                    }
                    let ctx = self.env.visibility_ctx();
                    let verdict = visibility::satisfies(item, &self.snapshot, &ctx)?;
                    if verdict.hints != 0 {
                        pending.push((offset, verdict.hints));
                    }
                    if verdict.visible {
                        let tup = Tuple::from_item(item, ItemPointer::new(self.block, offset));
                        if self.keys.iter().all(|k| k.matches(tup.payload())) {
                            found = Some(tup);
                            break;
                        }
                    }
                }
                (found, pending, offset)
            };
            for (offset, hints) in pending {
                buf.apply_hint_bits(offset, hints);
            }
            if let Some(tup) = found {
                self.offset = stopped_at;
                return Ok(Some(tup));
            }
            self.block += 1;
            self.offset = 0;
        }
    }
}
