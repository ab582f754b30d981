//! Core identifier types shared across the engine.

use std::fmt;

/// Page size in bytes. Compile-time constant; the on-disk format depends
/// on it.
pub const BLCKSZ: usize = 8192;

/// Object identifier. Catalog keys and relation ids are oids.
pub type Oid = u32;

pub const INVALID_OID: Oid = 0;

/// Sentinel oid stamped on user-table tuples ("no oid assigned").
pub const GENERIC_OID: Oid = !0;

/// Default database oid for globally-shared relations.
pub const DEFAULT_DB_OID: Oid = 1;

/// Block number within one relation.
pub type BlockNumber = u32;

pub const INVALID_BLOCK: BlockNumber = u32::MAX;

/// 1-based slot index on a page.
pub type OffsetNumber = u16;

pub const INVALID_OFFSET: OffsetNumber = 0;
pub const FIRST_OFFSET: OffsetNumber = 1;

/// Command counter within one transaction.
pub type CommandId = u32;

pub const FIRST_COMMAND_ID: CommandId = 0;

/// Transaction identifier: 64-bit, monotonically allocated.
pub type TransactionId = u64;

pub const INVALID_XID: TransactionId = 0;
/// Bootstrap ("ami") transaction id.
pub const AMI_XID: TransactionId = 512;
/// First id handed to a normal transaction.
pub const FIRST_NORMAL_XID: TransactionId = 514;

pub fn xid_is_valid(xid: TransactionId) -> bool {
    xid != INVALID_XID
}

/// Identifies a relation: (database oid, relation oid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelFileId {
    pub db: Oid,
    pub rel: Oid,
}

impl RelFileId {
    pub fn new(db: Oid, rel: Oid) -> Self {
        Self { db, rel }
    }
}

impl fmt::Display for RelFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.db, self.rel)
    }
}

/// Physical tuple address: (block number, offset number).
///
/// The invalid pointer carries the invalid block number; offset zero alone
/// does not make a pointer invalid on-disk (a vacuum-move chain end stores
/// a self pointer, never offset zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemPointer {
    pub block: BlockNumber,
    pub offset: OffsetNumber,
}

impl ItemPointer {
    pub const INVALID: ItemPointer = ItemPointer {
        block: INVALID_BLOCK,
        offset: INVALID_OFFSET,
    };

    pub fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK && self.offset != INVALID_OFFSET
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// Two-bit transaction status as stored in the log relation.
///
/// The committed test is `status & 2 != 0`: soft and hard commits both
/// count as committed during normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XidStatus {
    InProgress = 0,
    Aborted = 1,
    SoftCommit = 2,
    Committed = 3,
}

impl XidStatus {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => XidStatus::InProgress,
            1 => XidStatus::Aborted,
            2 => XidStatus::SoftCommit,
            _ => XidStatus::Committed,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn is_committed(self) -> bool {
        (self as u8) & 0b10 != 0
    }

    /// A final status may be cached; in-progress and soft commits may still
    /// change.
    pub fn is_final(self) -> bool {
        matches!(self, XidStatus::Aborted | XidStatus::Committed)
    }
}

/// Relation kinds the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelKind {
    Heap,
    Index,
    Special,
    Uncataloged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_status_round_trip() {
        for status in [
            XidStatus::InProgress,
            XidStatus::Aborted,
            XidStatus::SoftCommit,
            XidStatus::Committed,
        ] {
            assert_eq!(XidStatus::from_bits(status.bits()), status);
        }
        assert!(XidStatus::SoftCommit.is_committed());
        assert!(XidStatus::Committed.is_committed());
        assert!(!XidStatus::Aborted.is_committed());
        assert!(!XidStatus::InProgress.is_committed());
    }

    #[test]
    fn item_pointer_validity() {
        assert!(!ItemPointer::INVALID.is_valid());
        assert!(ItemPointer::new(0, 1).is_valid());
        assert!(!ItemPointer::new(0, INVALID_OFFSET).is_valid());
    }
}
