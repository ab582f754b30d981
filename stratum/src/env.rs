//! Per-thread environment.
//!
//! Every thread that enters the engine owns an [`Env`]: transaction
//! state, snapshot holder, the single-slot status cache, the open
//! temporary file set, and a cancel flag checked at block boundaries by
//! long scans. The env is deliberately not `Send`; each thread builds its
//! own around the shared [`Engine`].

use crate::engine::Engine;
use crate::error::{Result, StorageError};
use crate::snapshot::{Snapshot, SnapshotData};
use crate::storage::vfd::FileId;
use crate::transam::StatusCache;
use crate::types::{CommandId, Oid, TransactionId, XidStatus, FIRST_COMMAND_ID, INVALID_XID};
use crate::visibility::VisibilityContext;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use tracing::warn;

const MAX_PRIVATE_FILES: usize = 32;

/// Commit durability: hard waits for the log and data pages to reach
/// disk; soft acknowledges first and lets the writer catch up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitType {
    Soft,
    Hard,
}

#[derive(Debug, Clone)]
pub struct XactState {
    pub xid: TransactionId,
    pub cid: CommandId,
    pub commit_type: CommitType,
}

pub struct Env {
    pub engine: Arc<Engine>,
    pub db: Oid,
    pub db_name: String,
    pub status_cache: StatusCache,
    xact: RefCell<Option<XactState>>,
    query_snapshot: RefCell<Option<SnapshotData>>,
    temps: RefCell<Vec<FileId>>,
    cancel: Cell<bool>,
    default_commit: CommitType,
}

impl Env {
    pub fn new(engine: Arc<Engine>, db: Oid, db_name: &str) -> Self {
        let default_commit = if engine.props.get_bool(crate::config::keys::TRANS_CAREFUL, true) {
            CommitType::Hard
        } else {
            CommitType::Soft
        };
        Env {
            engine,
            db,
            db_name: db_name.to_string(),
            status_cache: StatusCache::default(),
            xact: RefCell::new(None),
            query_snapshot: RefCell::new(None),
            temps: RefCell::new(Vec::new()),
            cancel: Cell::new(false),
            default_commit,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.xact.borrow().is_some()
    }

    pub fn begin_transaction(&self) -> Result<TransactionId> {
        if self.in_transaction() {
            return Ok(self.current_xid());
        }
        let xid = self.engine.transam.get_new_transaction_id()?;
        self.engine.register_xact(xid);
        *self.xact.borrow_mut() = Some(XactState {
            xid,
            cid: FIRST_COMMAND_ID,
            commit_type: self.default_commit,
        });
        Ok(xid)
    }

    pub fn set_commit_type(&self, commit_type: CommitType) {
        if let Some(xact) = self.xact.borrow_mut().as_mut() {
            xact.commit_type = commit_type;
        }
    }

    pub fn current_xid(&self) -> TransactionId {
        self.xact
            .borrow()
            .as_ref()
            .map(|x| x.xid)
            .unwrap_or(INVALID_XID)
    }

    pub fn current_cid(&self) -> CommandId {
        self.xact.borrow().as_ref().map(|x| x.cid).unwrap_or(0)
    }

    /// Advance the command counter; each statement of a transaction sees
    /// the writes of the ones before it.
    pub fn next_command(&self) {
        if let Some(xact) = self.xact.borrow_mut().as_mut() {
            xact.cid += 1;
        }
    }

    /// Commit with the transaction's durability setting. Hard commits
    /// force the status page and every dirty data page before returning.
    pub fn commit_transaction(&self) -> Result<()> {
        let Some(xact) = self.xact.borrow_mut().take() else {
            return Ok(());
        };
        let result = match xact.commit_type {
            CommitType::Hard => {
                self.engine.transam.set_status(
                    xact.xid,
                    XidStatus::Committed,
                    &self.status_cache,
                    true,
                )?;
                self.engine.buffers.flush_all(true)
            }
            CommitType::Soft => self.engine.transam.set_status(
                xact.xid,
                XidStatus::SoftCommit,
                &self.status_cache,
                false,
            ),
        };
        self.engine.deregister_xact(xact.xid);
        self.at_transaction_end();
        result
    }

    pub fn abort_transaction(&self) -> Result<()> {
        let Some(xact) = self.xact.borrow_mut().take() else {
            return Ok(());
        };
        let result = self.engine.transam.set_status(
            xact.xid,
            XidStatus::Aborted,
            &self.status_cache,
            false,
        );
        self.engine.deregister_xact(xact.xid);
        self.at_transaction_end();
        result
    }

    fn at_transaction_end(&self) {
        *self.query_snapshot.borrow_mut() = None;
        self.cancel.set(false);
        let temps: Vec<FileId> = self.temps.borrow_mut().drain(..).collect();
        for file in temps {
            if let Err(err) = self.engine.vfs.close(file) {
                warn!(%err, "closing temp file at transaction end");
            }
        }
    }

    /// Fix the query snapshot for the current transaction.
    pub fn set_query_snapshot(&self) {
        let data = self.engine.snapshot_data(self.current_xid());
        *self.query_snapshot.borrow_mut() = Some(data);
    }

    pub fn query_snapshot(&self) -> Snapshot {
        match self.query_snapshot.borrow().as_ref() {
            Some(data) => Snapshot::Mvcc(data.clone()),
            None => Snapshot::Now,
        }
    }

    pub fn visibility_ctx(&self) -> VisibilityContext<'_> {
        VisibilityContext {
            transam: &self.engine.transam,
            cache: &self.status_cache,
            xid: self.current_xid(),
            cid: self.current_cid(),
        }
    }

    /// Open a temporary file tracked by this env; it closes (and unlinks)
    /// at transaction end.
    pub fn open_temporary_file(&self) -> Result<FileId> {
        let mut temps = self.temps.borrow_mut();
        if temps.len() >= MAX_PRIVATE_FILES {
            return Err(StorageError::TempFileLimit);
        }
        let file = self.engine.vfs.open_temporary(&self.engine.data_dir)?;
        temps.push(file);
        Ok(file)
    }

    pub fn request_cancel(&self) {
        self.cancel.set(true);
    }

    /// Raise at block boundaries of long scans.
    pub fn check_cancel(&self) -> Result<()> {
        if self.cancel.get() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}
