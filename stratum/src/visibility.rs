//! Tuple visibility: the MVCC decision procedures.
//!
//! Every predicate takes the tuple image and a [`VisibilityContext`] and
//! returns a verdict plus the commit hints it proved along the way. The
//! caller applies the hints through the buffer's mask-restricted hint op;
//! the predicates themselves never write.
//!
//! Status resolution goes through the transaction log; the infomask hint
//! bits short-circuit it once set.

use crate::snapshot::{DirtyWriters, Snapshot, SnapshotData};
use crate::transam::{StatusCache, Transam};
use crate::tuple::{self, flags};
use crate::types::{xid_is_valid, CommandId, TransactionId, XidStatus, AMI_XID};
use crate::error::Result;

/// Caller identity for visibility decisions.
pub struct VisibilityContext<'a> {
    pub transam: &'a Transam,
    pub cache: &'a StatusCache,
    /// Current transaction id, or invalid outside a transaction.
    pub xid: TransactionId,
    pub cid: CommandId,
}

/// Verdict plus hints proven while deciding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub visible: bool,
    pub hints: u16,
}

impl Verdict {
    fn no(hints: u16) -> Self {
        Verdict {
            visible: false,
            hints,
        }
    }

    fn yes(hints: u16) -> Self {
        Verdict {
            visible: true,
            hints,
        }
    }
}

/// Outcome of the update qualification used by delete/update/mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
    MayBeUpdated,
    Invisible,
    SelfUpdated,
    /// A committed later version exists; follow ctid.
    Updated,
    /// An in-progress writer owns the tuple; wait on it.
    BeingUpdated(TransactionId),
}

/// Vacuum classification of one tuple against the pre-checkpoint cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumVerdict {
    Live,
    /// Deleter committed but concurrent snapshots may still need it.
    RecentlyDead,
    /// Removable.
    Dead,
    /// The inserting transaction aborted; the tuple never existed.
    Stillborn,
    InsertInProgress,
    DeleteInProgress,
}

/// Resolve the inserting transaction. `Ok(Some(hints))` means xmin is
/// committed (hints carry what was proved); `Err`s bubble log failures.
fn resolve_xmin(t: &[u8], ctx: &VisibilityContext<'_>) -> Result<XminState> {
    let mask = tuple::infomask(t);
    if mask & flags::XMIN_COMMITTED != 0 {
        return Ok(XminState::Committed(0));
    }
    if mask & flags::XMIN_INVALID != 0 {
        return Ok(XminState::Aborted(0));
    }
    let xmin = tuple::xmin(t);
    if xmin == ctx.xid {
        return Ok(XminState::Mine);
    }
    match ctx.transam.status(xmin, ctx.cache)? {
        XidStatus::InProgress => Ok(XminState::InProgress(xmin)),
        XidStatus::Aborted => Ok(XminState::Aborted(flags::XMIN_INVALID)),
        XidStatus::SoftCommit | XidStatus::Committed => {
            Ok(XminState::Committed(flags::XMIN_COMMITTED))
        }
    }
}

enum XminState {
    Mine,
    Committed(u16),
    Aborted(u16),
    InProgress(TransactionId),
}

enum XmaxState {
    None,
    Mine,
    Committed(u16),
    Aborted(u16),
    InProgress(TransactionId),
}

fn resolve_xmax(t: &[u8], ctx: &VisibilityContext<'_>) -> Result<XmaxState> {
    let mask = tuple::infomask(t);
    if mask & flags::XMAX_INVALID != 0 || !xid_is_valid(tuple::xmax(t)) {
        return Ok(XmaxState::None);
    }
    if mask & flags::XMAX_COMMITTED != 0 {
        return Ok(XmaxState::Committed(0));
    }
    let xmax = tuple::xmax(t);
    if xmax == ctx.xid {
        return Ok(XmaxState::Mine);
    }
    match ctx.transam.status(xmax, ctx.cache)? {
        XidStatus::InProgress => Ok(XmaxState::InProgress(xmax)),
        XidStatus::Aborted => Ok(XmaxState::Aborted(flags::XMAX_INVALID)),
        XidStatus::SoftCommit | XidStatus::Committed => {
            Ok(XmaxState::Committed(flags::XMAX_COMMITTED))
        }
    }
}

/// `HeapTupleSatisfiesItself`: my own current state, command counter
/// ignored for my inserts.
pub fn satisfies_itself(t: &[u8], ctx: &VisibilityContext<'_>) -> Result<Verdict> {
    let mut hints = 0u16;
    match resolve_xmin(t, ctx)? {
        XminState::Aborted(h) => return Ok(Verdict::no(h)),
        XminState::InProgress(_) => return Ok(Verdict::no(0)),
        XminState::Committed(h) => hints |= h,
        XminState::Mine => {}
    }

    let marked = tuple::has_flag(t, flags::MARKED_FOR_UPDATE);
    match resolve_xmax(t, ctx)? {
        XmaxState::None => Ok(Verdict::yes(hints)),
        XmaxState::Mine => Ok(Verdict {
            visible: marked,
            hints,
        }),
        XmaxState::InProgress(_) => Ok(Verdict::yes(hints)),
        XmaxState::Aborted(h) => Ok(Verdict::yes(hints | h)),
        XmaxState::Committed(h) => Ok(Verdict {
            visible: marked,
            hints: hints | h,
        }),
    }
}

/// `HeapTupleSatisfiesNow`: just-committed visibility with command-id
/// rules for the caller's own writes.
pub fn satisfies_now(t: &[u8], ctx: &VisibilityContext<'_>) -> Result<Verdict> {
    let mut hints = 0u16;
    match resolve_xmin(t, ctx)? {
        XminState::Aborted(h) => return Ok(Verdict::no(h)),
        XminState::InProgress(_) => return Ok(Verdict::no(0)),
        XminState::Committed(h) => hints |= h,
        XminState::Mine => {
            // my insert: visible only to later commands
            if tuple::cmin(t) >= ctx.cid {
                return Ok(Verdict::no(hints));
            }
        }
    }

    let marked = tuple::has_flag(t, flags::MARKED_FOR_UPDATE);
    match resolve_xmax(t, ctx)? {
        XmaxState::None => Ok(Verdict::yes(hints)),
        XmaxState::Mine => {
            if marked {
                return Ok(Verdict::yes(hints));
            }
            // my delete hides the tuple from later commands only
            Ok(Verdict {
                visible: tuple::cmax(t) >= ctx.cid,
                hints,
            })
        }
        XmaxState::InProgress(_) => Ok(Verdict::yes(hints)),
        XmaxState::Aborted(h) => Ok(Verdict::yes(hints | h)),
        XmaxState::Committed(h) => Ok(Verdict {
            visible: marked,
            hints: hints | h,
        }),
    }
}

/// `HeapTupleSatisfiesDirty`: like `Now` but in-progress writers read as
/// present, and their ids are surfaced so the caller can wait.
pub fn satisfies_dirty(
    t: &[u8],
    ctx: &VisibilityContext<'_>,
) -> Result<(Verdict, DirtyWriters)> {
    let mut hints = 0u16;
    let mut writers = DirtyWriters::default();

    match resolve_xmin(t, ctx)? {
        XminState::Aborted(h) => return Ok((Verdict::no(h), writers)),
        XminState::InProgress(xid) => {
            writers.inserting = Some(xid);
        }
        XminState::Committed(h) => hints |= h,
        XminState::Mine => {
            if tuple::cmin(t) >= ctx.cid {
                return Ok((Verdict::no(hints), writers));
            }
        }
    }

    let marked = tuple::has_flag(t, flags::MARKED_FOR_UPDATE);
    let verdict = match resolve_xmax(t, ctx)? {
        XmaxState::None => Verdict::yes(hints),
        XmaxState::Mine => Verdict {
            visible: marked || tuple::cmax(t) >= ctx.cid,
            hints,
        },
        XmaxState::InProgress(xid) => {
            writers.deleting = Some(xid);
            Verdict::yes(hints)
        }
        XmaxState::Aborted(h) => Verdict::yes(hints | h),
        XmaxState::Committed(h) => Verdict {
            visible: marked,
            hints: hints | h,
        },
    };
    Ok((verdict, writers))
}

/// `HeapTupleSatisfiesSnapshot`: visibility under a fixed MVCC snapshot.
pub fn satisfies_snapshot(
    t: &[u8],
    snap: &SnapshotData,
    ctx: &VisibilityContext<'_>,
) -> Result<Verdict> {
    let mut hints = 0u16;
    let xmin = tuple::xmin(t);

    match resolve_xmin(t, ctx)? {
        XminState::Aborted(h) => return Ok(Verdict::no(h)),
        XminState::InProgress(_) => return Ok(Verdict::no(0)),
        XminState::Committed(h) => {
            hints |= h;
            // committed, but not necessarily before this snapshot
            if xmin >= snap.xmax || snap.considers_in_progress(xmin) {
                return Ok(Verdict::no(hints));
            }
        }
        XminState::Mine => {
            if tuple::cmin(t) >= ctx.cid {
                return Ok(Verdict::no(hints));
            }
        }
    }

    let marked = tuple::has_flag(t, flags::MARKED_FOR_UPDATE);
    let xmax = tuple::xmax(t);
    match resolve_xmax(t, ctx)? {
        XmaxState::None => Ok(Verdict::yes(hints)),
        XmaxState::Mine => Ok(Verdict {
            visible: marked || tuple::cmax(t) >= ctx.cid,
            hints,
        }),
        XmaxState::InProgress(_) => Ok(Verdict::yes(hints)),
        XmaxState::Aborted(h) => Ok(Verdict::yes(hints | h)),
        XmaxState::Committed(h) => {
            hints |= h;
            if marked {
                return Ok(Verdict::yes(hints));
            }
            // the deleter is invisible to this snapshot: tuple lives on
            let deleter_hidden = xmax >= snap.xmax || snap.considers_in_progress(xmax);
            Ok(Verdict {
                visible: deleter_hidden,
                hints,
            })
        }
    }
}

/// `HeapTupleSatisfiesUpdate`: decide whether a delete/update/mark may
/// proceed, must follow `ctid`, or must wait.
pub fn satisfies_update(
    t: &[u8],
    ctx: &VisibilityContext<'_>,
) -> Result<(UpdateCheck, u16)> {
    let mut hints = 0u16;
    match resolve_xmin(t, ctx)? {
        XminState::Aborted(h) => return Ok((UpdateCheck::Invisible, h)),
        XminState::InProgress(_) => return Ok((UpdateCheck::Invisible, 0)),
        XminState::Committed(h) => hints |= h,
        XminState::Mine => {
            if tuple::cmin(t) >= ctx.cid {
                return Ok((UpdateCheck::Invisible, hints));
            }
        }
    }

    let marked = tuple::has_flag(t, flags::MARKED_FOR_UPDATE);
    match resolve_xmax(t, ctx)? {
        XmaxState::None => Ok((UpdateCheck::MayBeUpdated, hints)),
        XmaxState::Mine => {
            if marked {
                return Ok((UpdateCheck::MayBeUpdated, hints));
            }
            if tuple::cmax(t) >= ctx.cid {
                Ok((UpdateCheck::SelfUpdated, hints))
            } else {
                Ok((UpdateCheck::Invisible, hints))
            }
        }
        XmaxState::InProgress(xid) => Ok((UpdateCheck::BeingUpdated(xid), hints)),
        XmaxState::Aborted(h) => Ok((UpdateCheck::MayBeUpdated, hints | h)),
        XmaxState::Committed(h) => {
            hints |= h;
            if marked {
                Ok((UpdateCheck::MayBeUpdated, hints))
            } else {
                Ok((UpdateCheck::Updated, hints))
            }
        }
    }
}

/// `HeapTupleSatisfiesVacuum`: classify against the old-xmin cutoff.
/// "Dead" means no surviving snapshot can see the tuple; "recently dead"
/// must be preserved for concurrent readers.
pub fn satisfies_vacuum(
    t: &[u8],
    cutoff: TransactionId,
    ctx: &VisibilityContext<'_>,
) -> Result<(VacuumVerdict, u16)> {
    let mut hints = 0u16;
    match resolve_xmin(t, ctx)? {
        XminState::Aborted(h) => return Ok((VacuumVerdict::Stillborn, h)),
        XminState::InProgress(_) => return Ok((VacuumVerdict::InsertInProgress, 0)),
        XminState::Committed(h) => hints |= h,
        XminState::Mine => return Ok((VacuumVerdict::InsertInProgress, hints)),
    }

    if tuple::has_flag(t, flags::MARKED_FOR_UPDATE) {
        // a locker is not a deleter
        return Ok((VacuumVerdict::Live, hints));
    }
    match resolve_xmax(t, ctx)? {
        XmaxState::None => Ok((VacuumVerdict::Live, hints)),
        XmaxState::Mine | XmaxState::InProgress(_) => {
            Ok((VacuumVerdict::DeleteInProgress, hints))
        }
        XmaxState::Aborted(h) => Ok((VacuumVerdict::Live, hints | h)),
        XmaxState::Committed(h) => {
            hints |= h;
            if tuple::xmax(t) >= cutoff {
                Ok((VacuumVerdict::RecentlyDead, hints))
            } else {
                Ok((VacuumVerdict::Dead, hints))
            }
        }
    }
}

/// Dispatch on snapshot kind. A tuple whose xmax is the bootstrap id is
/// never visible; `Any` sees everything else.
pub fn satisfies(
    t: &[u8],
    snapshot: &Snapshot,
    ctx: &VisibilityContext<'_>,
) -> Result<Verdict> {
    if tuple::xmax(t) == AMI_XID {
        return Ok(Verdict::no(0));
    }
    match snapshot {
        Snapshot::Any => Ok(Verdict::yes(0)),
        Snapshot::Itself => satisfies_itself(t, ctx),
        Snapshot::Now => satisfies_now(t, ctx),
        Snapshot::Dirty => satisfies_dirty(t, ctx).map(|(v, _)| v),
        Snapshot::Mvcc(data) => satisfies_snapshot(t, data, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Properties;
    use crate::relation::RelationCache;
    use crate::storage::buffer::BufferPool;
    use crate::storage::smgr::{DiskManager, Smgr};
    use crate::storage::vfd::VfdPool;
    use crate::tuple::Tuple;
    use crate::types::{ItemPointer, FIRST_NORMAL_XID, INVALID_XID};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        transam: Transam,
        cache: StatusCache,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let vfs = Arc::new(VfdPool::new(&Properties::new()));
            let smgr: Arc<dyn Smgr> = Arc::new(DiskManager::new(vfs, dir.path()));
            let relations = RelationCache::new(smgr);
            let buffers = Arc::new(BufferPool::with_default_capacity());
            let transam =
                Transam::init(&relations, buffers, &Properties::new(), true).unwrap();
            Fixture {
                transam,
                cache: StatusCache::default(),
                _dir: dir,
            }
        }

        fn ctx(&self, xid: TransactionId, cid: CommandId) -> VisibilityContext<'_> {
            VisibilityContext {
                transam: &self.transam,
                cache: &self.cache,
                xid,
                cid,
            }
        }

        fn begin(&self) -> TransactionId {
            self.transam.get_new_transaction_id().unwrap()
        }

        fn commit(&self, xid: TransactionId) {
            self.transam
                .set_status(xid, XidStatus::Committed, &self.cache, false)
                .unwrap();
        }

        fn abort(&self, xid: TransactionId) {
            self.transam
                .set_status(xid, XidStatus::Aborted, &self.cache, false)
                .unwrap();
        }
    }

    fn fresh_tuple(xid: TransactionId) -> Tuple {
        let mut t = Tuple::new(b"row");
        t.stamp_insert(xid, 0);
        t.set_ctid(ItemPointer::new(0, 1));
        t
    }

    #[test]
    fn committed_insert_is_visible_now_with_hint() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);
        fx.commit(writer);

        let reader = fx.begin();
        let verdict = satisfies_now(t.as_bytes(), &fx.ctx(reader, 1)).unwrap();
        assert!(verdict.visible);
        assert_eq!(verdict.hints & flags::XMIN_COMMITTED, flags::XMIN_COMMITTED);
    }

    #[test]
    fn in_progress_insert_is_invisible_to_now_but_not_self() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);

        let reader = fx.begin();
        assert!(!satisfies_now(t.as_bytes(), &fx.ctx(reader, 1)).unwrap().visible);
        // the writer itself sees it at a later command
        assert!(satisfies_now(t.as_bytes(), &fx.ctx(writer, 1)).unwrap().visible);
        // but not within the inserting command
        assert!(!satisfies_now(t.as_bytes(), &fx.ctx(writer, 0)).unwrap().visible);
        // itself-visibility ignores the command counter
        assert!(satisfies_itself(t.as_bytes(), &fx.ctx(writer, 0)).unwrap().visible);
    }

    #[test]
    fn aborted_insert_yields_invalid_hint() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);
        fx.abort(writer);

        let reader = fx.begin();
        let verdict = satisfies_now(t.as_bytes(), &fx.ctx(reader, 0)).unwrap();
        assert!(!verdict.visible);
        assert_eq!(verdict.hints & flags::XMIN_INVALID, flags::XMIN_INVALID);
    }

    #[test]
    fn snapshot_respects_in_progress_set() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);
        fx.commit(writer);

        let reader = fx.begin();
        // a snapshot that saw the writer still open
        let stale = SnapshotData::new(writer, reader, vec![writer]);
        assert!(
            !satisfies_snapshot(t.as_bytes(), &stale, &fx.ctx(reader, 0))
                .unwrap()
                .visible
        );
        // a snapshot taken after the commit
        let current = SnapshotData::new(reader, reader + 1, vec![]);
        assert!(
            satisfies_snapshot(t.as_bytes(), &current, &fx.ctx(reader, 0))
                .unwrap()
                .visible
        );
    }

    #[test]
    fn deleted_tuple_stays_visible_to_older_snapshot() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let mut t = fresh_tuple(writer);
        fx.commit(writer);

        let deleter = fx.begin();
        // old snapshot taken before the deleter started
        let old = SnapshotData::new(deleter, deleter, vec![]);
        t.set_xmax(deleter);
        t.clear_flags(flags::XMAX_INVALID);
        fx.commit(deleter);

        let reader = fx.begin();
        let verdict =
            satisfies_snapshot(t.as_bytes(), &old, &fx.ctx(reader, 0)).unwrap();
        assert!(verdict.visible, "deleter >= snapshot xmax keeps tuple alive");

        let new = SnapshotData::new(reader, reader + 1, vec![]);
        assert!(
            !satisfies_snapshot(t.as_bytes(), &new, &fx.ctx(reader, 0))
                .unwrap()
                .visible
        );
    }

    #[test]
    fn dirty_read_surfaces_writers() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);

        let reader = fx.begin();
        let (verdict, writers) =
            satisfies_dirty(t.as_bytes(), &fx.ctx(reader, 0)).unwrap();
        assert!(verdict.visible);
        assert_eq!(writers.inserting, Some(writer));
        assert_eq!(writers.deleting, None);
    }

    #[test]
    fn update_check_waits_on_in_progress_deleter() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let mut t = fresh_tuple(writer);
        fx.commit(writer);

        let deleter = fx.begin();
        t.set_xmax(deleter);
        t.set_cmax(0);
        t.clear_flags(flags::XMAX_INVALID);

        let contender = fx.begin();
        let (check, _) = satisfies_update(t.as_bytes(), &fx.ctx(contender, 0)).unwrap();
        assert_eq!(check, UpdateCheck::BeingUpdated(deleter));

        fx.commit(deleter);
        let (check, hints) =
            satisfies_update(t.as_bytes(), &fx.ctx(contender, 0)).unwrap();
        assert_eq!(check, UpdateCheck::Updated);
        assert_eq!(hints & flags::XMAX_COMMITTED, flags::XMAX_COMMITTED);
    }

    #[test]
    fn mark_for_update_does_not_block_updaters() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let mut t = fresh_tuple(writer);
        fx.commit(writer);

        let locker = fx.begin();
        t.set_xmax(locker);
        t.clear_flags(flags::XMAX_INVALID);
        t.set_flags(flags::MARKED_FOR_UPDATE);
        fx.commit(locker);

        let next = fx.begin();
        let (check, _) = satisfies_update(t.as_bytes(), &fx.ctx(next, 0)).unwrap();
        assert_eq!(check, UpdateCheck::MayBeUpdated);
    }

    #[test]
    fn vacuum_classification() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let mut t = fresh_tuple(writer);
        fx.commit(writer);

        let ctx_xid = fx.begin();
        let cutoff = fx.transam.read_new_transaction_id();

        let (verdict, _) =
            satisfies_vacuum(t.as_bytes(), cutoff, &fx.ctx(ctx_xid, 0)).unwrap();
        assert_eq!(verdict, VacuumVerdict::Live);

        // delete it with a committed transaction below the cutoff
        let deleter = fx.begin();
        t.set_xmax(deleter);
        t.clear_flags(flags::XMAX_INVALID);
        fx.commit(deleter);
        let high_cutoff = fx.transam.read_new_transaction_id();
        let (verdict, _) =
            satisfies_vacuum(t.as_bytes(), high_cutoff, &fx.ctx(ctx_xid, 0)).unwrap();
        assert_eq!(verdict, VacuumVerdict::Dead);

        // with a cutoff at or below the deleter it is only recently dead
        let (verdict, _) =
            satisfies_vacuum(t.as_bytes(), deleter, &fx.ctx(ctx_xid, 0)).unwrap();
        assert_eq!(verdict, VacuumVerdict::RecentlyDead);
    }

    #[test]
    fn stillborn_tuples_report_as_such() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);
        fx.abort(writer);

        let ctx_xid = fx.begin();
        let (verdict, hints) =
            satisfies_vacuum(t.as_bytes(), ctx_xid, &fx.ctx(ctx_xid, 0)).unwrap();
        assert_eq!(verdict, VacuumVerdict::Stillborn);
        assert_eq!(hints & flags::XMIN_INVALID, flags::XMIN_INVALID);
    }

    #[test]
    fn bootstrap_xmax_hides_tuple_from_every_snapshot() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let mut t = fresh_tuple(writer);
        t.set_xmax(AMI_XID);
        fx.commit(writer);

        let reader = fx.begin();
        let verdict = satisfies(t.as_bytes(), &Snapshot::Any, &fx.ctx(reader, 0)).unwrap();
        assert!(!verdict.visible);
    }

    #[test]
    fn invalid_xid_context_reads_like_plain_reader() {
        let fx = Fixture::new();
        let writer = fx.begin();
        let t = fresh_tuple(writer);
        fx.commit(writer);
        let verdict = satisfies_now(t.as_bytes(), &fx.ctx(INVALID_XID, 0)).unwrap();
        assert!(verdict.visible);
        assert!(FIRST_NORMAL_XID <= writer);
    }
}
