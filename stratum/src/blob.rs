//! Blob storage: out-of-line spill for oversized attributes.
//!
//! A large attribute's slot holds a 20-byte *blob header* (lengths, a
//! forward item pointer, the storage relation's oid). The body lives as a
//! singly linked chain of *blob segments*, each a heap tuple flagged
//! `BLOB_SEGMENT` (plus `BLOB_HEAD` on the first). Chains are stored
//! back-to-front so every forward pointer is final when written; the
//! owning tuple's header is only emitted once the whole chain exists.
//!
//! Streaming pipelines buffer up to one segment: the write side flushes
//! whole segments and keeps the trailing partial in cache; the read side
//! spills a segment into its cache when the caller's buffer is smaller
//! than the segment.

use crate::config::{keys, Properties};
use crate::env::Env;
use crate::error::{Result, StorageError};
use crate::heap;
use crate::page::{max_align, MAX_TUPLE_SIZE};
use crate::relation::{payload_cells, RelationRef};
use crate::tuple::{self, flags, Tuple, TUPLE_HEADER_SIZE};
use crate::types::{BlockNumber, ItemPointer, Oid, RelFileId, INVALID_XID};
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

/// Segment payload header: length u32, forward (block u32, offset u16),
/// padding to alignment.
pub const SEG_HEADER_SIZE: usize = 16;

pub const BLOB_HEADER_SIZE: usize = 20;
const INDIRECT_FLAG: u32 = 0x8000_0000;
/// Pointer-length arithmetic must strip the top flag byte first.
const POINTER_LENGTH_MASK: u32 = 0x00ff_ffff;
/// Declared blob length carries this bias over the content length.
const LENGTH_BIAS: u32 = 4;

/// Largest segment payload: one page minus page, tuple and segment
/// headers, optionally clamped by the `blobsegments` option.
pub fn max_segment_payload(props: &Properties) -> usize {
    let physical = MAX_TUPLE_SIZE - TUPLE_HEADER_SIZE - SEG_HEADER_SIZE - 64;
    let configured = props.get_int(keys::BLOB_SEGMENTS, 0);
    if configured > 0 && (configured as usize) < physical {
        configured as usize
    } else {
        physical
    }
}

/// The in-row form of an out-of-line attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Content length in bytes.
    pub length: u64,
    pub forward: ItemPointer,
    pub relid: Oid,
}

impl BlobHeader {
    pub fn encode(&self) -> [u8; BLOB_HEADER_SIZE] {
        let mut out = [0u8; BLOB_HEADER_SIZE];
        let ptr_len = (BLOB_HEADER_SIZE as u32) | INDIRECT_FLAG;
        out[0..4].copy_from_slice(&ptr_len.to_le_bytes());
        out[4..8].copy_from_slice(&((self.length as u32) + LENGTH_BIAS).to_le_bytes());
        out[8..12].copy_from_slice(&self.forward.block.to_le_bytes());
        out[12..14].copy_from_slice(&self.forward.offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.relid.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<BlobHeader> {
        if bytes.len() < BLOB_HEADER_SIZE || !is_indirect(bytes) {
            return Err(StorageError::BlobChain("not an indirect blob header".into()));
        }
        let declared = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Ok(BlobHeader {
            length: declared.saturating_sub(LENGTH_BIAS) as u64,
            forward: ItemPointer::new(
                u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
                u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
            ),
            relid: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}

/// Does this attribute cell hold an indirect blob header?
pub fn is_indirect(cell: &[u8]) -> bool {
    cell.len() >= BLOB_HEADER_SIZE
        && u32::from_le_bytes(cell[0..4].try_into().unwrap()) & INDIRECT_FLAG != 0
}

/// Logical size of an indirect blob from its header alone.
pub fn sizeof_indirect_blob(cell: &[u8]) -> Result<u64> {
    Ok(BlobHeader::decode(cell)?.length)
}

/// Logical tuple size with blob attributes counted at their full length
/// (less the masked header length) instead of the in-row 20 bytes.
pub fn sizeof_tuple_blob(rel: &RelationRef, tup: &Tuple) -> Result<u64> {
    let attrs = rel.attributes();
    if attrs.is_empty() || !tup.has_flag(flags::HAS_BLOB) {
        return Ok(tup.len() as u64);
    }
    let payload = tup.payload();
    let mut size = tup.len() as u64;
    for range in payload_cells(&attrs, payload)? {
        let cell = &payload[range];
        if is_indirect(cell) {
            let ptr_len =
                (u32::from_le_bytes(cell[0..4].try_into().unwrap()) & POINTER_LENGTH_MASK) as u64;
            size = size - ptr_len + sizeof_indirect_blob(cell)?;
        }
    }
    Ok(size)
}

fn seg_encode(data: &[u8], forward: ItemPointer) -> Vec<u8> {
    let mut out = vec![0u8; SEG_HEADER_SIZE + data.len()];
    out[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    out[4..8].copy_from_slice(&forward.block.to_le_bytes());
    out[8..10].copy_from_slice(&forward.offset.to_le_bytes());
    out[SEG_HEADER_SIZE..].copy_from_slice(data);
    out
}

fn seg_length(payload: &[u8]) -> usize {
    u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize
}

fn seg_forward(payload: &[u8]) -> ItemPointer {
    ItemPointer::new(
        u32::from_le_bytes(payload[4..8].try_into().unwrap()),
        u16::from_le_bytes(payload[8..10].try_into().unwrap()),
    )
}

fn seg_set_forward(payload: &mut [u8], forward: ItemPointer) {
    payload[4..8].copy_from_slice(&forward.block.to_le_bytes());
    payload[8..10].copy_from_slice(&forward.offset.to_le_bytes());
}

fn seg_data(payload: &[u8]) -> &[u8] {
    let len = seg_length(payload);
    &payload[SEG_HEADER_SIZE..SEG_HEADER_SIZE + len]
}

/// The relation that stores blob segments for (relation, attribute):
/// an external-store catalog entry if one exists, else the owner itself.
pub fn find_storage_relation(env: &Env, rel: &RelationRef, attnum: i16) -> Result<RelationRef> {
    match env.engine.catalog.blob_store_for(rel.id, attnum) {
        Some(store_id) => env
            .engine
            .relations
            .lookup(store_id)
            .ok_or(StorageError::RelationClosed(store_id)),
        None => Ok(rel.clone()),
    }
}

fn storage_relation_by_oid(env: &Env, relid: Oid) -> Result<RelationRef> {
    let id = RelFileId::new(env.db, relid);
    env.engine
        .relations
        .lookup(id)
        .ok_or(StorageError::RelationClosed(id))
}

/// Store one segment tuple, preferring the suggested block.
fn store_segment(
    env: &Env,
    rel: &RelationRef,
    data: &[u8],
    forward: ItemPointer,
    blob_head: bool,
    limit: BlockNumber,
) -> Result<ItemPointer> {
    let mut tup = Tuple::new(&seg_encode(data, forward));
    tup.stamp_insert(env.current_xid(), env.current_cid());
    tup.set_flags(flags::BLOB_SEGMENT);
    if blob_head {
        tup.set_flags(flags::BLOB_HEAD);
    }

    // try the suggested block before consulting freespace again
    let buf = env.engine.buffers.read_buffer(rel, limit)?;
    if heap::put_tuple_on_page(&buf, &mut tup) {
        return Ok(tup.self_tid);
    }
    drop(buf);
    heap::put_tuple_at_freespace(env, rel, &mut tup, limit)
}

/// Read one segment: copy its data into `target` (when it fits within
/// `limit` bytes) and advance `pointer` to the forward link. Returns the
/// bytes copied, 0 when the segment is larger than `limit`.
fn get_segment(
    env: &Env,
    rel: &RelationRef,
    pointer: &mut ItemPointer,
    target: &mut [u8],
    limit: usize,
) -> Result<usize> {
    debug_assert!(pointer.is_valid());
    let buf = env.engine.buffers.read_buffer(rel, pointer.block)?;
    let page = buf.page();
    let item = page.item(pointer.offset).map_err(|_| {
        StorageError::BlobChain(format!("bad forward pointer {pointer}"))
    })?;
    if !tuple::has_flag(item, flags::BLOB_SEGMENT) {
        return Err(StorageError::BlobChain(format!(
            "forward pointer {pointer} does not name a segment"
        )));
    }
    let payload = tuple::payload(item);
    let len = seg_length(payload);
    if len > MAX_TUPLE_SIZE {
        return Err(StorageError::BlobChain(format!(
            "segment at {pointer} declares {len} bytes"
        )));
    }
    if len > limit {
        return Ok(0);
    }
    target[..len].copy_from_slice(seg_data(payload));
    *pointer = seg_forward(payload);
    Ok(len)
}

/// Split `data` into segments and store them back-to-front. On entry
/// `*start` validity says whether this run begins a fresh blob (its first
/// segment earns `BLOB_HEAD`); on exit `*start`/`*end` frame the run.
fn store_blob_segments(
    env: &Env,
    rel: &RelationRef,
    data: &[u8],
    start: &mut ItemPointer,
    end: &mut ItemPointer,
    segment_size: usize,
) -> Result<bool> {
    if data.is_empty() {
        return Ok(false);
    }
    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let len = segment_size.min(data.len() - pos);
        bounds.push((pos, len));
        pos += len;
    }

    // reserve target blocks front-to-back so the chain reads forward
    let mut blocks: Vec<BlockNumber> = Vec::with_capacity(bounds.len());
    let mut limit = if start.is_valid() { start.block } else { 0 };
    for &(_, len) in &bounds {
        limit = env.engine.freespace.get_freespace(
            rel,
            max_align(TUPLE_HEADER_SIZE + SEG_HEADER_SIZE + len),
            limit,
        )?;
        blocks.push(limit);
    }

    let fresh_blob = !start.is_valid();

    // store back-to-front: each tuple's forward pointer is final at write
    let mut link = ItemPointer::INVALID;
    *end = ItemPointer::INVALID;
    for (idx, &(off, len)) in bounds.iter().enumerate().rev() {
        let head = fresh_blob && idx == 0;
        let tid = store_segment(env, rel, &data[off..off + len], link, head, blocks[idx])?;
        if !end.is_valid() {
            *end = tid;
        }
        link = tid;
    }
    *start = link;
    Ok(true)
}

/// Streaming write pipeline.
pub struct WritePipeline {
    rel: RelationRef,
    head: ItemPointer,
    tail: ItemPointer,
    length: u64,
    cache: BytesMut,
    segment_size: usize,
}

/// Open a write pipeline against the storage relation.
pub fn open_write_pipeline(env: &Env, rel: &RelationRef) -> WritePipeline {
    let segment_size = max_segment_payload(&env.engine.props);
    WritePipeline {
        rel: rel.clone(),
        head: ItemPointer::INVALID,
        tail: ItemPointer::INVALID,
        length: 0,
        cache: BytesMut::with_capacity(segment_size),
        segment_size,
    }
}

impl WritePipeline {
    /// Append bytes. Whole segments flush to disk; the trailing partial
    /// stays cached.
    pub fn write(&mut self, env: &Env, data: &[u8]) -> Result<()> {
        let total = self.cache.len() + data.len();
        if total <= self.segment_size {
            self.cache.put_slice(data);
            return Ok(());
        }
        let tail_len = total % self.segment_size;
        let mut send = Vec::with_capacity(total - tail_len);
        send.extend_from_slice(&self.cache);
        send.extend_from_slice(&data[..data.len() - tail_len]);
        self.cache.clear();
        self.cache.put_slice(&data[data.len() - tail_len..]);
        self.flush_run(env, &send)
    }

    fn flush_run(&mut self, env: &Env, data: &[u8]) -> Result<()> {
        let mut start = self.head;
        let mut end = ItemPointer::INVALID;
        if !store_blob_segments(env, &self.rel, data, &mut start, &mut end, self.segment_size)? {
            return Ok(());
        }
        if self.tail.is_valid() {
            // link the previous tail to the new run, now fully on disk
            let tail = self.tail;
            let buf = env.engine.buffers.read_buffer(&self.rel, tail.block)?;
            {
                let mut page = buf.page_mut();
                let item = page.item_mut(tail.offset)?;
                seg_set_forward(tuple::payload_mut(item), start);
            }
            buf.mark_dirty();
        } else {
            self.head = start;
        }
        self.tail = end;
        self.length += data.len() as u64;
        Ok(())
    }

    /// Flush the cached remainder and produce the header datum to embed
    /// in the owning tuple.
    pub fn close(mut self, env: &Env) -> Result<BlobHeader> {
        if !self.cache.is_empty() {
            let rest = self.cache.split().freeze();
            self.flush_run(env, &rest)?;
        }
        Ok(BlobHeader {
            length: self.length,
            forward: self.head,
            relid: self.rel.id.rel,
        })
    }
}

/// Streaming read pipeline.
pub struct ReadPipeline {
    relid: Oid,
    tail: ItemPointer,
    length: u64,
    read: u64,
    cache: Vec<u8>,
    cache_offset: usize,
    segment_size: usize,
}

pub fn open_read_pipeline(env: &Env, header: &BlobHeader) -> ReadPipeline {
    ReadPipeline {
        relid: header.relid,
        tail: header.forward,
        length: header.length,
        read: 0,
        cache: Vec::new(),
        cache_offset: 0,
        segment_size: max_segment_payload(&env.engine.props),
    }
}

impl ReadPipeline {
    pub fn remaining(&self) -> u64 {
        self.length - self.read
    }

    /// Copy up to `target.len()` bytes; 0 means end-of-stream.
    pub fn read(&mut self, env: &Env, target: &mut [u8]) -> Result<usize> {
        if self.read >= self.length {
            return Ok(0);
        }
        let rel = storage_relation_by_oid(env, self.relid)?;
        let mut count = 0usize;

        while count < target.len() {
            if !self.cache.is_empty() {
                let avail = self.cache.len() - self.cache_offset;
                let take = avail.min(target.len() - count);
                target[count..count + take]
                    .copy_from_slice(&self.cache[self.cache_offset..self.cache_offset + take]);
                count += take;
                self.cache_offset += take;
                if self.cache_offset == self.cache.len() {
                    self.cache.clear();
                    self.cache_offset = 0;
                }
                continue;
            }
            if !self.tail.is_valid() {
                break;
            }
            let space = target.len() - count;
            let got = get_segment(env, &rel, &mut self.tail, &mut target[count..], space)?;
            if got == 0 {
                // the segment is bigger than the caller's buffer: spill it
                // into the pipeline cache first
                let mut spill = vec![0u8; self.segment_size];
                let got = get_segment(env, &rel, &mut self.tail, &mut spill, self.segment_size)?;
                if got == 0 {
                    return Err(StorageError::BlobChain(
                        "segment exceeds the configured maximum".into(),
                    ));
                }
                spill.truncate(got);
                self.cache = spill;
                self.cache_offset = 0;
            } else {
                count += got;
            }
        }

        self.read += count as u64;
        if self.read > self.length {
            warn!(
                read = self.read,
                length = self.length,
                "inconsistent blob: more bytes than declared"
            );
            let over = (self.read - self.length) as usize;
            self.read = self.length;
            self.tail = ItemPointer::INVALID;
            return Ok(count.saturating_sub(over));
        }
        Ok(count)
    }
}

/// One-shot materialization of a whole blob.
pub fn rebuild_blob(env: &Env, header: &BlobHeader) -> Result<Vec<u8>> {
    let mut pipe = open_read_pipeline(env, header);
    let mut out = vec![0u8; header.length as usize];
    let mut pos = 0usize;
    while pos < out.len() {
        let got = pipe.read(env, &mut out[pos..])?;
        if got == 0 {
            break;
        }
        pos += got;
    }
    if pos != header.length as usize {
        return Err(StorageError::BlobChain(format!(
            "rebuild produced {pos} of {} declared bytes",
            header.length
        )));
    }
    Ok(out)
}

/// Walk a chain stamping each segment deleted. For a vacuum-move chain
/// (`moved`), originals get `MOVED_OUT` and the final non-forwarded
/// element stays alive.
pub fn delete_blob_chain(
    env: &Env,
    rel: &RelationRef,
    first: ItemPointer,
    moved: bool,
) -> Result<usize> {
    let mut count = 0usize;
    let mut target = first;
    let xid = env.current_xid();
    let cid = env.current_cid();

    while target.is_valid() {
        let buf = env.engine.buffers.read_buffer(rel, target.block)?;
        let mut delete = true;
        let next;
        {
            let mut page = buf.page_mut();
            let item = match page.item_mut(target.offset) {
                Ok(item) => item,
                Err(_) => {
                    warn!(%target, "blob chain walk hit an unused slot");
                    break;
                }
            };
            tuple::set_xmax(item, xid);
            if moved {
                tuple::set_flags(item, flags::MOVED_OUT);
            } else {
                tuple::set_cmax(item, cid);
            }
            tuple::clear_flags(
                item,
                flags::MARKED_FOR_UPDATE | flags::XMAX_COMMITTED | flags::XMAX_INVALID,
            );

            let ctid = tuple::ctid(item);
            let chain_continues = ctid.is_valid() && ctid != target;
            if chain_continues {
                // a relocated segment: chase the copy next
                next = ctid;
            } else {
                next = ItemPointer::INVALID;
                if moved {
                    // last element of a move chain stays in place
                    delete = false;
                    tuple::set_xmax(item, INVALID_XID);
                    tuple::clear_flags(item, flags::XMAX_COMMITTED | flags::MARKED_FOR_UPDATE);
                    tuple::set_flags(item, flags::XMAX_INVALID);
                }
            }
        }
        if delete {
            buf.mark_dirty();
            count += 1;
        }
        target = next;
    }
    Ok(count)
}

/// Delete every segment chain hanging off `tup`'s blob attributes.
pub fn delete_tuple_blob(env: &Env, rel: &RelationRef, tup: &Tuple, moved: bool) -> Result<usize> {
    let attrs = rel.attributes();
    if attrs.is_empty() {
        return Ok(0);
    }
    let payload = tup.payload();
    let mut removed = 0usize;
    for (attnum, range) in payload_cells(&attrs, payload)?.into_iter().enumerate() {
        let cell = &payload[range];
        if !is_indirect(cell) {
            continue;
        }
        let header = BlobHeader::decode(cell)?;
        let store = find_storage_relation(env, rel, attnum as i16)?;
        let mut link = header.forward;
        while link.is_valid() {
            let walked = delete_segment_step(env, &store, &mut link, moved)?;
            removed += walked;
        }
    }
    Ok(removed)
}

/// One chain-walk step of segment deletion; advances `pointer` to the
/// segment's forward link and returns deletions performed (the count
/// starts from zero each step).
fn delete_segment_step(
    env: &Env,
    rel: &RelationRef,
    pointer: &mut ItemPointer,
    moved: bool,
) -> Result<usize> {
    let first = *pointer;
    // forward link read before the stamp so the walk survives the edit
    let forward = {
        let buf = env.engine.buffers.read_buffer(rel, first.block)?;
        let page = buf.page();
        let item = page.item(first.offset).map_err(|_| {
            StorageError::BlobChain(format!("dangling segment pointer {first}"))
        })?;
        seg_forward(tuple::payload(item))
    };
    let count = delete_blob_chain(env, rel, first, moved)?;
    *pointer = forward;
    Ok(count)
}

/// Vacuum respanning: stream-copy a tuple's blob chains into the (new)
/// storage relation, substitute fresh headers, and replace the tuple
/// through a normal heap update tagged `BLOB_LINKED`.
pub fn vacuum_respan_tuple_blob(
    env: &Env,
    rel: &RelationRef,
    tid: ItemPointer,
    force: bool,
) -> Result<bool> {
    let Some(tup) = heap::heap_fetch(env, rel, tid, &crate::snapshot::Snapshot::Now)? else {
        return Ok(false);
    };
    if !tup.has_flag(flags::HAS_BLOB) {
        return Ok(false);
    }
    let attrs = rel.attributes();
    if attrs.is_empty() {
        return Ok(false);
    }

    let payload = tup.payload().to_vec();
    let cells = payload_cells(&attrs, &payload)?;
    let mut contents: Vec<Vec<u8>> = cells.iter().map(|r| payload[r.clone()].to_vec()).collect();
    let mut changed = false;

    for (attnum, content) in contents.iter_mut().enumerate() {
        if !is_indirect(content) {
            continue;
        }
        let header = BlobHeader::decode(content)?;
        let store = find_storage_relation(env, rel, attnum as i16)?;
        if !force && store.id.rel == header.relid {
            continue;
        }
        // stream-copy old chain to the new storage relation
        let mut reader = open_read_pipeline(env, &header);
        let mut writer = open_write_pipeline(env, &store);
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let got = reader.read(env, &mut chunk)?;
            if got == 0 {
                break;
            }
            writer.write(env, &chunk[..got])?;
        }
        let new_header = writer.close(env)?;
        *content = new_header.encode().to_vec();
        changed = true;
        debug!(rel = %rel.id, %tid, attnum, "blob respanned");
    }

    if !changed {
        return Ok(false);
    }
    let cell_refs: Vec<&[u8]> = contents.iter().map(|c| c.as_slice()).collect();
    let mut newtup = Tuple::new(&crate::relation::encode_payload(&attrs, &cell_refs));
    newtup.set_flags(flags::HAS_BLOB | flags::BLOB_LINKED);
    heap::heap_update(env, rel, tid, &mut newtup)?;
    Ok(true)
}

/// Vacuum chain relocation: duplicate a whole segment chain into
/// moved-in copies strictly below the head's page, retiring the
/// originals as moved-out. All-or-nothing: a copy that cannot be placed
/// below the source undoes the in-flight duplicates and leaves the
/// remaining originals in place.
pub fn vacuum_dup_chain_blob(
    env: &Env,
    rel: &RelationRef,
    front: ItemPointer,
) -> Result<Option<BlockNumber>> {
    // collect the chain first
    let mut chain: Vec<ItemPointer> = Vec::new();
    let mut cursor = front;
    while cursor.is_valid() {
        let buf = env.engine.buffers.read_buffer(rel, cursor.block)?;
        let page = buf.page();
        let Ok(item) = page.item(cursor.offset) else {
            return Err(StorageError::BlobChain(format!(
                "chain broke at {cursor} during duplication"
            )));
        };
        if !tuple::has_flag(item, flags::BLOB_SEGMENT) {
            return Err(StorageError::BlobChain(format!(
                "{cursor} is not a segment"
            )));
        }
        chain.push(cursor);
        cursor = seg_forward(tuple::payload(item));
    }
    if chain.is_empty() {
        return Ok(None);
    }

    let ceiling = front.block;
    let xid = env.current_xid();
    let mut copies: Vec<ItemPointer> = Vec::with_capacity(chain.len());
    let mut forward = ItemPointer::INVALID;
    let mut last_moved: BlockNumber = 0;

    // duplicate tail-first so each copy's forward pointer is final
    for &orig in chain.iter().rev() {
        let (data, original_xmin, head_flag) = {
            let buf = env.engine.buffers.read_buffer(rel, orig.block)?;
            let page = buf.page();
            let item = page.item(orig.offset)?;
            (
                seg_data(tuple::payload(item)).to_vec(),
                tuple::xmin(item),
                tuple::has_flag(item, flags::BLOB_HEAD),
            )
        };
        let mut copy = Tuple::new(&seg_encode(&data, forward));
        copy.set_vacuum_xid(original_xmin);
        copy.set_xmin(xid);
        copy.set_xmax(INVALID_XID);
        copy.set_infomask(flags::BLOB_SEGMENT | flags::MOVED_IN | flags::XMAX_INVALID);
        if head_flag {
            copy.set_flags(flags::BLOB_HEAD);
        }

        let placed = heap::put_tuple_at_freespace(env, rel, &mut copy, 0)?;
        if placed.block >= ceiling {
            // cannot improve locality: undo the in-flight copies
            warn!(rel = %rel.id, %front, "chain duplication undone, no low placement");
            delete_blob_chain(env, rel, placed, false)?;
            for done in copies.iter().rev() {
                delete_blob_chain(env, rel, *done, false)?;
            }
            return Ok(None);
        }
        last_moved = last_moved.max(placed.block);
        copies.push(placed);
        forward = placed;
    }

    // retire the originals: moved-out, chained to their copies
    for (orig, copy) in chain.iter().zip(copies.iter().rev()) {
        let buf = env.engine.buffers.read_buffer(rel, orig.block)?;
        {
            let mut page = buf.page_mut();
            let item = page.item_mut(orig.offset)?;
            tuple::set_xmax(item, xid);
            tuple::clear_flags(
                item,
                flags::XMAX_COMMITTED | flags::XMAX_INVALID | flags::MARKED_FOR_UPDATE,
            );
            tuple::set_flags(item, flags::MOVED_OUT);
            tuple::set_ctid(item, *copy);
        }
        buf.mark_dirty();
    }
    Ok(Some(last_moved))
}

/// Spill every variable attribute larger than `threshold` out of line,
/// rewriting the payload with blob headers. The inverse of the read
/// pipeline, used before insert/update of oversized rows.
pub fn store_tuple_blobs(
    env: &Env,
    rel: &RelationRef,
    tup: &mut Tuple,
    threshold: usize,
) -> Result<bool> {
    let attrs = rel.attributes();
    if attrs.is_empty() {
        return Ok(false);
    }
    let payload = tup.payload().to_vec();
    let cells = payload_cells(&attrs, &payload)?;
    let mut contents: Vec<Vec<u8>> = cells.iter().map(|r| payload[r.clone()].to_vec()).collect();
    let mut spilled = false;

    for (attnum, content) in contents.iter_mut().enumerate() {
        if content.len() <= threshold || is_indirect(content) {
            continue;
        }
        let store = find_storage_relation(env, rel, attnum as i16)?;
        let mut writer = open_write_pipeline(env, &store);
        writer.write(env, content)?;
        let header = writer.close(env)?;
        *content = header.encode().to_vec();
        spilled = true;
    }
    if spilled {
        let cell_refs: Vec<&[u8]> = contents.iter().map(|c| c.as_slice()).collect();
        let mut replacement = Tuple::new(&crate::relation::encode_payload(&attrs, &cell_refs));
        replacement.set_oid(tup.oid());
        replacement.set_infomask(tup.infomask());
        replacement.set_flags(flags::HAS_BLOB);
        *tup = replacement;
    }
    Ok(spilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::{test_env, test_relation};
    use crate::relation::Attribute;
    use crate::snapshot::Snapshot;

    #[test]
    fn header_round_trip_and_indirection() {
        let header = BlobHeader {
            length: 3000,
            forward: ItemPointer::new(4, 2),
            relid: 777,
        };
        let bytes = header.encode();
        assert!(is_indirect(&bytes));
        assert_eq!(BlobHeader::decode(&bytes).unwrap(), header);
        assert_eq!(sizeof_indirect_blob(&bytes).unwrap(), 3000);
        assert!(!is_indirect(b"plain short value bytes ...."));
    }

    #[test]
    fn pipeline_round_trip_multi_segment() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7201, "blobs");
        env.begin_transaction().unwrap();

        let content: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut writer = open_write_pipeline(&env, &rel);
        // write in awkward chunk sizes to exercise the cache carving
        for chunk in content.chunks(777) {
            writer.write(&env, chunk).unwrap();
        }
        let header = writer.close(&env).unwrap();
        assert_eq!(header.length, 20_000);
        assert!(header.forward.is_valid());

        let mut reader = open_read_pipeline(&env, &header);
        let mut out = Vec::new();
        let mut buf = [0u8; 500];
        loop {
            let got = reader.read(&env, &mut buf).unwrap();
            if got == 0 {
                break;
            }
            out.extend_from_slice(&buf[..got]);
        }
        assert_eq!(out, content);
        env.commit_transaction().unwrap();
    }

    #[test]
    fn small_read_buffer_spills_through_cache() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7202, "spill");
        env.begin_transaction().unwrap();

        let content = vec![b'A'; 3000];
        let mut writer = open_write_pipeline(&env, &rel);
        writer.write(&env, &content).unwrap();
        let header = writer.close(&env).unwrap();

        let mut reader = open_read_pipeline(&env, &header);
        let mut out = Vec::new();
        let mut tiny = [0u8; 17];
        loop {
            let got = reader.read(&env, &mut tiny).unwrap();
            if got == 0 {
                break;
            }
            out.extend_from_slice(&tiny[..got]);
        }
        assert_eq!(out.len(), 3000);
        assert!(out.iter().all(|&b| b == b'A'));
        env.commit_transaction().unwrap();
    }

    #[test]
    fn rebuild_matches_declared_length() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7203, "whole");
        env.begin_transaction().unwrap();

        let content: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        let mut writer = open_write_pipeline(&env, &rel);
        writer.write(&env, &content).unwrap();
        let header = writer.close(&env).unwrap();

        assert_eq!(rebuild_blob(&env, &header).unwrap(), content);
        env.commit_transaction().unwrap();
    }

    #[test]
    fn store_tuple_blobs_spills_and_restores() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7204, "rows");
        rel.set_attributes(vec![
            Attribute::fixed("id", 4),
            Attribute::variable("body"),
        ]);
        env.begin_transaction().unwrap();

        let body = vec![7u8; 4000];
        let payload = crate::relation::encode_payload(
            &rel.attributes(),
            &[&42u32.to_le_bytes(), &body],
        );
        let mut tup = Tuple::new(&payload);
        let spilled = store_tuple_blobs(&env, &rel, &mut tup, 1000).unwrap();
        assert!(spilled);
        assert!(tup.has_flag(flags::HAS_BLOB));
        assert!(tup.len() < 200, "body replaced by a 20-byte header");

        let (_, tid) = crate::heap::heap_insert(&env, &rel, &mut tup).unwrap();
        env.next_command();
        let fetched = crate::heap::heap_fetch(&env, &rel, tid, &Snapshot::Now)
            .unwrap()
            .unwrap();
        let cells = payload_cells(&rel.attributes(), fetched.payload()).unwrap();
        let header = BlobHeader::decode(&fetched.payload()[cells[1].clone()]).unwrap();
        assert_eq!(rebuild_blob(&env, &header).unwrap(), body);
        env.commit_transaction().unwrap();
    }

    #[test]
    fn delete_walks_the_whole_chain() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7205, "chained");
        env.begin_transaction().unwrap();

        let content = vec![1u8; 10_000];
        let mut writer = open_write_pipeline(&env, &rel);
        writer.write(&env, &content).unwrap();
        let header = writer.close(&env).unwrap();
        env.commit_transaction().unwrap();

        env.begin_transaction().unwrap();
        let mut link = header.forward;
        let mut removed = 0;
        while link.is_valid() {
            removed += delete_segment_step(&env, &rel, &mut link, false).unwrap();
        }
        assert!(removed >= 2, "10k bytes need at least two segments");
        env.commit_transaction().unwrap();

        // after commit the segments are no longer live
        env.begin_transaction().unwrap();
        let mut probe = header.forward;
        let mut spare = vec![0u8; max_segment_payload(&env.engine.props)];
        // the tuple is still physically there (vacuum reclaims it), but
        // stamped deleted by a committed transaction
        let spare_len = spare.len();
        let still_readable = get_segment(&env, &rel, &mut probe, &mut spare, spare_len);
        assert!(still_readable.is_ok());
        env.commit_transaction().unwrap();
    }

    #[test]
    fn sizeof_tuple_blob_uses_logical_lengths() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7206, "sized");
        rel.set_attributes(vec![Attribute::variable("body")]);
        env.begin_transaction().unwrap();

        let body = vec![9u8; 6000];
        let payload = crate::relation::encode_payload(&rel.attributes(), &[&body]);
        let mut tup = Tuple::new(&payload);
        store_tuple_blobs(&env, &rel, &mut tup, 100).unwrap();

        let logical = sizeof_tuple_blob(&rel, &tup).unwrap();
        assert_eq!(
            logical,
            tup.len() as u64 - BLOB_HEADER_SIZE as u64 + 6000
        );
        env.commit_transaction().unwrap();
    }
}
