//! Tuple header layout and infomask flags.
//!
//! A heap tuple is a fixed 48-byte header followed by attribute data.
//! Header fields at fixed offsets: oid u32 @0, xmin u64 @8, xmax u64 @16,
//! a union @24 holding either (cmin u32, cmax u32) or the vacuum
//! transaction id u64, ctid (block u32 @32, offset u16 @36), infomask u16
//! @38, hoff u16 @40.
//!
//! Tuples in pages are mutated in place through the byte-slice accessors
//! here; [`Tuple`] owns a detached copy used while forming or relocating a
//! row.

use crate::types::{
    BlockNumber, CommandId, ItemPointer, Oid, TransactionId, INVALID_BLOCK, INVALID_XID,
};

pub const TUPLE_HEADER_SIZE: usize = 48;

const OFF_OID: usize = 0;
const OFF_XMIN: usize = 8;
const OFF_XMAX: usize = 16;
const OFF_PROGRESS: usize = 24;
const OFF_CTID_BLOCK: usize = 32;
const OFF_CTID_OFFSET: usize = 36;
const OFF_INFOMASK: usize = 38;
const OFF_HOFF: usize = 40;

/// Infomask flags.
pub mod flags {
    pub const XMIN_COMMITTED: u16 = 1 << 0;
    pub const XMIN_INVALID: u16 = 1 << 1;
    pub const XMAX_COMMITTED: u16 = 1 << 2;
    pub const XMAX_INVALID: u16 = 1 << 3;
    pub const MARKED_FOR_UPDATE: u16 = 1 << 4;
    pub const UPDATED: u16 = 1 << 5;
    pub const MOVED_IN: u16 = 1 << 6;
    pub const MOVED_OUT: u16 = 1 << 7;
    pub const HAS_BLOB: u16 = 1 << 8;
    pub const BLOB_SEGMENT: u16 = 1 << 9;
    pub const BLOB_HEAD: u16 = 1 << 10;
    pub const BLOB_LINKED: u16 = 1 << 11;
    pub const FRAG_SCANNED: u16 = 1 << 12;

    /// Transaction-status bookkeeping bits cleared when a tuple is stamped
    /// by a new inserting transaction.
    pub const XACT_MASK: u16 = XMIN_COMMITTED
        | XMIN_INVALID
        | XMAX_COMMITTED
        | XMAX_INVALID
        | MARKED_FOR_UPDATE
        | UPDATED
        | MOVED_IN
        | MOVED_OUT;

    /// The only bits a reader may set lazily. Every such transition has a
    /// single producer value, so racing observers write the same bit.
    pub const HINT_MASK: u16 = XMIN_COMMITTED | XMIN_INVALID | XMAX_COMMITTED | XMAX_INVALID;
}

fn get_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn get_u64(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
}

fn set_u32(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn set_u64(bytes: &mut [u8], off: usize, value: u64) {
    bytes[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
}

fn set_u16(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn oid(t: &[u8]) -> Oid {
    get_u32(t, OFF_OID)
}

pub fn set_oid(t: &mut [u8], oid: Oid) {
    set_u32(t, OFF_OID, oid);
}

pub fn xmin(t: &[u8]) -> TransactionId {
    get_u64(t, OFF_XMIN)
}

pub fn set_xmin(t: &mut [u8], xid: TransactionId) {
    set_u64(t, OFF_XMIN, xid);
}

pub fn xmax(t: &[u8]) -> TransactionId {
    get_u64(t, OFF_XMAX)
}

pub fn set_xmax(t: &mut [u8], xid: TransactionId) {
    set_u64(t, OFF_XMAX, xid);
}

pub fn cmin(t: &[u8]) -> CommandId {
    get_u32(t, OFF_PROGRESS)
}

pub fn set_cmin(t: &mut [u8], cid: CommandId) {
    set_u32(t, OFF_PROGRESS, cid);
}

pub fn cmax(t: &[u8]) -> CommandId {
    get_u32(t, OFF_PROGRESS + 4)
}

pub fn set_cmax(t: &mut [u8], cid: CommandId) {
    set_u32(t, OFF_PROGRESS + 4, cid);
}

/// The union field read as the vacuum transaction id. Only meaningful on
/// tuples carrying `MOVED_IN`, where the original xmin is parked here.
pub fn vacuum_xid(t: &[u8]) -> TransactionId {
    get_u64(t, OFF_PROGRESS)
}

pub fn set_vacuum_xid(t: &mut [u8], xid: TransactionId) {
    set_u64(t, OFF_PROGRESS, xid);
}

pub fn ctid(t: &[u8]) -> ItemPointer {
    ItemPointer {
        block: get_u32(t, OFF_CTID_BLOCK) as BlockNumber,
        offset: get_u16(t, OFF_CTID_OFFSET),
    }
}

pub fn set_ctid(t: &mut [u8], tid: ItemPointer) {
    set_u32(t, OFF_CTID_BLOCK, tid.block);
    set_u16(t, OFF_CTID_OFFSET, tid.offset);
}

pub fn infomask(t: &[u8]) -> u16 {
    get_u16(t, OFF_INFOMASK)
}

pub fn set_infomask(t: &mut [u8], mask: u16) {
    set_u16(t, OFF_INFOMASK, mask);
}

pub fn set_flags(t: &mut [u8], set: u16) {
    let mask = infomask(t) | set;
    set_infomask(t, mask);
}

pub fn clear_flags(t: &mut [u8], clear: u16) {
    let mask = infomask(t) & !clear;
    set_infomask(t, mask);
}

pub fn has_flag(t: &[u8], flag: u16) -> bool {
    infomask(t) & flag != 0
}

/// Apply lazily-proven commit hints. Restricted to `HINT_MASK`; OR-only,
/// so concurrent appliers converge on the same value.
pub fn apply_hint_bits(t: &mut [u8], hints: u16) {
    let masked = hints & flags::HINT_MASK;
    if masked != 0 {
        set_flags(t, masked);
    }
}

pub fn hoff(t: &[u8]) -> usize {
    get_u16(t, OFF_HOFF) as usize
}

pub fn payload(t: &[u8]) -> &[u8] {
    &t[hoff(t)..]
}

pub fn payload_mut(t: &mut [u8]) -> &mut [u8] {
    let h = hoff(t);
    &mut t[h..]
}

/// An owned tuple image (header plus payload), used while forming a row or
/// relocating one between pages.
#[derive(Clone)]
pub struct Tuple {
    bytes: Vec<u8>,
    /// Physical address once placed; invalid until then.
    pub self_tid: ItemPointer,
}

impl Tuple {
    /// Build a tuple around `payload` with a cleared header.
    pub fn new(payload: &[u8]) -> Self {
        let mut bytes = vec![0u8; TUPLE_HEADER_SIZE + payload.len()];
        bytes[TUPLE_HEADER_SIZE..].copy_from_slice(payload);
        set_u16(&mut bytes, OFF_HOFF, TUPLE_HEADER_SIZE as u16);
        set_u32(&mut bytes, OFF_CTID_BLOCK, INVALID_BLOCK);
        let mut tuple = Tuple {
            bytes,
            self_tid: ItemPointer::INVALID,
        };
        tuple.set_xmax(INVALID_XID);
        tuple
    }

    /// Copy a tuple image out of a page item.
    pub fn from_item(item: &[u8], tid: ItemPointer) -> Self {
        Tuple {
            bytes: item.to_vec(),
            self_tid: tid,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn oid(&self) -> Oid {
        oid(&self.bytes)
    }

    pub fn set_oid(&mut self, v: Oid) {
        set_oid(&mut self.bytes, v);
    }

    pub fn xmin(&self) -> TransactionId {
        xmin(&self.bytes)
    }

    pub fn set_xmin(&mut self, v: TransactionId) {
        set_xmin(&mut self.bytes, v);
    }

    pub fn xmax(&self) -> TransactionId {
        xmax(&self.bytes)
    }

    pub fn set_xmax(&mut self, v: TransactionId) {
        set_xmax(&mut self.bytes, v);
    }

    pub fn set_cmin(&mut self, v: CommandId) {
        set_cmin(&mut self.bytes, v);
    }

    pub fn set_cmax(&mut self, v: CommandId) {
        set_cmax(&mut self.bytes, v);
    }

    pub fn vacuum_xid(&self) -> TransactionId {
        vacuum_xid(&self.bytes)
    }

    pub fn set_vacuum_xid(&mut self, v: TransactionId) {
        set_vacuum_xid(&mut self.bytes, v);
    }

    pub fn ctid(&self) -> ItemPointer {
        ctid(&self.bytes)
    }

    pub fn set_ctid(&mut self, tid: ItemPointer) {
        set_ctid(&mut self.bytes, tid);
    }

    pub fn infomask(&self) -> u16 {
        infomask(&self.bytes)
    }

    pub fn set_infomask(&mut self, v: u16) {
        set_infomask(&mut self.bytes, v);
    }

    pub fn set_flags(&mut self, set: u16) {
        set_flags(&mut self.bytes, set);
    }

    pub fn clear_flags(&mut self, clear: u16) {
        clear_flags(&mut self.bytes, clear);
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        has_flag(&self.bytes, flag)
    }

    pub fn payload(&self) -> &[u8] {
        payload(&self.bytes)
    }

    /// Stamp insertion bookkeeping: xmin/cmin from the caller, xmax
    /// invalid, status bits cleared except xmax-invalid.
    pub fn stamp_insert(&mut self, xid: TransactionId, cid: CommandId) {
        self.set_xmin(xid);
        self.set_cmin(cid);
        self.set_cmax(crate::types::FIRST_COMMAND_ID);
        self.set_xmax(INVALID_XID);
        self.clear_flags(flags::XACT_MASK);
        self.set_flags(flags::XMAX_INVALID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut t = Tuple::new(b"abc");
        t.set_oid(42);
        t.set_xmin(514);
        t.set_xmax(600);
        t.set_cmin(1);
        t.set_cmax(2);
        t.set_ctid(ItemPointer::new(7, 3));
        t.set_flags(flags::UPDATED | flags::XMAX_INVALID);

        assert_eq!(t.oid(), 42);
        assert_eq!(t.xmin(), 514);
        assert_eq!(t.xmax(), 600);
        assert_eq!(cmin(t.as_bytes()), 1);
        assert_eq!(cmax(t.as_bytes()), 2);
        assert_eq!(t.ctid(), ItemPointer::new(7, 3));
        assert!(t.has_flag(flags::UPDATED));
        assert_eq!(t.payload(), b"abc");
        assert_eq!(t.len(), TUPLE_HEADER_SIZE + 3);
    }

    #[test]
    fn union_field_aliases_command_pair() {
        let mut t = Tuple::new(&[]);
        t.set_vacuum_xid(0xDEAD_BEEF_0000_0001);
        // the vacuum xid occupies the same bytes as the command pair
        assert_eq!(t.vacuum_xid(), 0xDEAD_BEEF_0000_0001);
        t.set_cmin(5);
        assert_ne!(t.vacuum_xid(), 0xDEAD_BEEF_0000_0001);
    }

    #[test]
    fn hint_bits_are_mask_restricted() {
        let mut t = Tuple::new(&[]);
        apply_hint_bits(t.as_bytes_mut(), flags::XMIN_COMMITTED | flags::MOVED_IN);
        assert!(t.has_flag(flags::XMIN_COMMITTED));
        assert!(!t.has_flag(flags::MOVED_IN));
        // idempotent
        apply_hint_bits(t.as_bytes_mut(), flags::XMIN_COMMITTED);
        assert!(t.has_flag(flags::XMIN_COMMITTED));
    }

    #[test]
    fn stamp_insert_clears_status_bits() {
        let mut t = Tuple::new(b"x");
        t.set_flags(flags::MOVED_OUT | flags::XMAX_COMMITTED | flags::HAS_BLOB);
        t.stamp_insert(514, 0);
        assert!(t.has_flag(flags::XMAX_INVALID));
        assert!(t.has_flag(flags::HAS_BLOB));
        assert!(!t.has_flag(flags::MOVED_OUT));
        assert!(!t.has_flag(flags::XMAX_COMMITTED));
        assert_eq!(t.xmax(), INVALID_XID);
    }
}
