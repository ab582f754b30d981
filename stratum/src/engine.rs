//! The process-wide engine: every shared subsystem hangs off one
//! [`Engine`] value, and each thread reaches it through its
//! [`crate::env::Env`]. There are no other globals.

use crate::catalog::CatalogBridge;
use crate::config::Properties;
use crate::error::Result;
use crate::freespace::FreespaceMap;
use crate::relation::RelationCache;
use crate::snapshot::SnapshotData;
use crate::storage::buffer::BufferPool;
use crate::storage::shadow::{RecoveredPage, ShadowLog};
use crate::storage::smgr::Smgr;
use crate::storage::vfd::VfdPool;
use crate::sweep::SweepTable;
use crate::transam::Transam;
use crate::types::{Oid, TransactionId};
use once_cell::sync::OnceCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct Engine {
    pub props: Properties,
    pub data_dir: PathBuf,
    pub vfs: Arc<VfdPool>,
    pub smgr: Arc<dyn Smgr>,
    pub relations: RelationCache,
    pub buffers: Arc<BufferPool>,
    pub transam: Transam,
    pub freespace: FreespaceMap,
    pub catalog: Arc<dyn CatalogBridge>,
    pub shadow: Mutex<ShadowLog>,
    /// Transactions currently in flight; the snapshot source.
    active: Mutex<BTreeSet<TransactionId>>,
    /// Index pages recovered by shadow replay, waiting for the per-db
    /// recover job.
    recovered: Mutex<HashMap<Oid, Vec<RecoveredPage>>>,
    sweeps: OnceCell<SweepTable>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        props: Properties,
        data_dir: PathBuf,
        vfs: Arc<VfdPool>,
        smgr: Arc<dyn Smgr>,
        relations: RelationCache,
        buffers: Arc<BufferPool>,
        transam: Transam,
        freespace: FreespaceMap,
        catalog: Arc<dyn CatalogBridge>,
        shadow: ShadowLog,
        recovered_pages: Vec<RecoveredPage>,
    ) -> Engine {
        let mut recovered: HashMap<Oid, Vec<RecoveredPage>> = HashMap::new();
        for page in recovered_pages {
            recovered.entry(page.db).or_default().push(page);
        }
        Engine {
            props,
            data_dir,
            vfs,
            smgr,
            relations,
            buffers,
            transam,
            freespace,
            catalog,
            shadow: Mutex::new(shadow),
            active: Mutex::new(BTreeSet::new()),
            recovered: Mutex::new(recovered),
            sweeps: OnceCell::new(),
        }
    }

    pub(crate) fn install_sweeps(&self, table: SweepTable) {
        let _ = self.sweeps.set(table);
    }

    pub fn sweeps(&self) -> &SweepTable {
        self.sweeps.get().expect("pool-sweep table installed at startup")
    }

    pub fn try_sweeps(&self) -> Option<&SweepTable> {
        self.sweeps.get()
    }

    pub(crate) fn register_xact(&self, xid: TransactionId) {
        self.active.lock().unwrap().insert(xid);
    }

    pub(crate) fn deregister_xact(&self, xid: TransactionId) {
        self.active.lock().unwrap().remove(&xid);
    }

    /// Build MVCC snapshot data for `me`: everything still running (other
    /// than the caller) is in-progress; ids at or beyond the allocator's
    /// next id are future.
    pub fn snapshot_data(&self, me: TransactionId) -> SnapshotData {
        let xmax = self.transam.read_new_transaction_id();
        let active = self.active.lock().unwrap();
        let in_progress: Vec<TransactionId> =
            active.iter().copied().filter(|&x| x != me).collect();
        let xmin = in_progress.first().copied().unwrap_or(xmax);
        SnapshotData::new(xmin, xmax, in_progress)
    }

    /// Oldest transaction id any live snapshot could still care about.
    pub fn oldest_active_xid(&self) -> TransactionId {
        let active = self.active.lock().unwrap();
        active
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.transam.read_new_transaction_id())
    }

    /// Flush dirty pages through the shadow log: page images land in the
    /// log first, then the data files, then the log expires. A crash
    /// between the two replays the images.
    pub fn shadow_checkpoint(&self) -> Result<()> {
        let dirty = self.buffers.dirty_pages();
        if dirty.is_empty() {
            return Ok(());
        }
        {
            let mut shadow = self.shadow.lock().unwrap();
            shadow.begin_log()?;
            for (rel, block, image) in &dirty {
                let info = rel.info_snapshot();
                shadow.log_block(&info, *block, image)?;
            }
            shadow.commit_log()?;
        }
        self.buffers.flush_all(true)?;
        self.shadow.lock().unwrap().expire_logs()?;
        Ok(())
    }

    /// Drain the recovered index pages for one database.
    pub fn take_recovered_pages(&self, db: Oid) -> Vec<RecoveredPage> {
        self.recovered.lock().unwrap().remove(&db).unwrap_or_default()
    }
}
