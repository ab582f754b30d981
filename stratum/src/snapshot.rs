//! Snapshots: the time-qualification inputs for visibility checks.

use crate::types::{ItemPointer, TransactionId};

/// MVCC snapshot data: ids below `xmin` are settled for this snapshot,
/// ids at or above `xmax` started after it, and `in_progress` lists the
/// writers that were open when it was taken.
#[derive(Debug, Clone, Default)]
pub struct SnapshotData {
    pub xmin: TransactionId,
    pub xmax: TransactionId,
    pub in_progress: Vec<TransactionId>,
    /// Dirty reads record the tuple they decided on here.
    pub tid: Option<ItemPointer>,
}

impl SnapshotData {
    pub fn new(xmin: TransactionId, xmax: TransactionId, in_progress: Vec<TransactionId>) -> Self {
        SnapshotData {
            xmin,
            xmax,
            in_progress,
            tid: None,
        }
    }

    pub fn considers_in_progress(&self, xid: TransactionId) -> bool {
        self.in_progress.contains(&xid)
    }
}

/// Snapshot kinds. `Now` sees just-committed state, `Itself` includes the
/// current command's own writes, `Dirty` additionally surfaces in-progress
/// writers, `Any` sees everything.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Now,
    Itself,
    Any,
    Dirty,
    Mvcc(SnapshotData),
}

/// Writers observed by a dirty read; the caller may wait on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyWriters {
    pub inserting: Option<TransactionId>,
    pub deleting: Option<TransactionId>,
}
