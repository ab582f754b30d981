//! Pool-sweep workers: background maintenance, one worker per database.
//!
//! Each worker owns a FIFO job queue under the table's mutex. Requests
//! are de-duplicated on enqueue (a queued job of the same kind for the
//! same relation subsumes the new one, and a queued vacuum subsumes scan
//! requests). The worker runs each job inside its own transaction;
//! errors abort that transaction and drop the job, never reaching
//! foreground threads. An idle worker retires after five empty waits.

use crate::engine::Engine;
use crate::env::{CommitType, Env};
use crate::error::Result;
use crate::types::{Oid, RelFileId};
use crate::vacuum;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const IDLE_WAIT: Duration = Duration::from_secs(60);
const IDLE_LIMIT: u32 = 5;

/// Synchronization handle for wait-notify jobs: the caller blocks on it
/// until the worker drains every job queued before it.
pub struct Waiter {
    done: Mutex<bool>,
    gate: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Waiter {
            done: Mutex::new(false),
            gate: Condvar::new(),
        })
    }

    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.gate.wait(done).unwrap();
        }
    }

    fn signal(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.gate.notify_all();
    }
}

#[derive(Clone)]
pub enum JobKind {
    Vacuum,
    /// Scan-only vacuum: statistics and hints, no reclamation.
    Scan,
    /// Vacuum with forced truncation.
    Trim,
    FreespaceScan,
    Defrag { use_blobs: bool, max: usize },
    Compact { use_blobs: bool, max: usize },
    Analyze,
    Reindex,
    Respan,
    Relink,
    Move,
    VacuumDatabase,
    Allocate,
    Recover,
    Wait(Arc<Waiter>),
}

impl JobKind {
    fn name(&self) -> &'static str {
        match self {
            JobKind::Vacuum => "vacuum",
            JobKind::Scan => "scan",
            JobKind::Trim => "trim",
            JobKind::FreespaceScan => "freespace-scan",
            JobKind::Defrag { .. } => "defrag",
            JobKind::Compact { .. } => "compact",
            JobKind::Analyze => "analyze",
            JobKind::Reindex => "reindex",
            JobKind::Respan => "respan",
            JobKind::Relink => "relink",
            JobKind::Move => "move",
            JobKind::VacuumDatabase => "vacuum-database",
            JobKind::Allocate => "allocate",
            JobKind::Recover => "recover",
            JobKind::Wait(_) => "wait-notify",
        }
    }

    fn same_kind(&self, other: &JobKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

struct Job {
    kind: JobKind,
    rel: RelFileId,
}

struct WorkerState {
    queue: VecDeque<Job>,
    active: bool,
    idle_count: u32,
}

struct WorkerShared {
    db: Oid,
    db_name: String,
    state: Mutex<WorkerState>,
    gate: Condvar,
}

struct WorkerHandle {
    db: Oid,
    shared: Arc<WorkerShared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

pub struct SweepTable {
    engine: Weak<Engine>,
    workers: Mutex<Vec<WorkerHandle>>,
    concurrent: usize,
    paused: AtomicBool,
}

impl SweepTable {
    pub fn new(engine: Weak<Engine>, concurrent: usize) -> Self {
        SweepTable {
            engine,
            workers: Mutex::new(Vec::new()),
            concurrent: concurrent.max(1),
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Enqueue a job for the relation's database, spawning the worker if
    /// needed. Duplicate and subsumed requests are dropped.
    pub fn add_job_request(&self, kind: JobKind, rel: RelFileId, db_name: &str) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|w| w.shared.state.lock().unwrap().active);

        let shared = match workers.iter().find(|w| w.db == rel.db) {
            Some(handle) => handle.shared.clone(),
            None => {
                if workers.len() >= self.concurrent {
                    debug!(db = rel.db, "sweep concurrency cap reached, request dropped");
                    return;
                }
                let shared = Arc::new(WorkerShared {
                    db: rel.db,
                    db_name: db_name.to_string(),
                    state: Mutex::new(WorkerState {
                        queue: VecDeque::new(),
                        active: true,
                        idle_count: 0,
                    }),
                    gate: Condvar::new(),
                });
                let thread = spawn_worker(engine.clone(), shared.clone());
                workers.push(WorkerHandle {
                    db: rel.db,
                    shared: shared.clone(),
                    thread: Some(thread),
                });
                shared
            }
        };
        drop(workers);

        let mut state = shared.state.lock().unwrap();
        let duplicate = state.queue.iter().any(|job| {
            job.rel == rel
                && (job.kind.same_kind(&kind)
                    // a queued vacuum already covers a scan request
                    || (matches!(kind, JobKind::Scan) && matches!(job.kind, JobKind::Vacuum)))
                && !matches!(kind, JobKind::Wait(_))
        });
        if duplicate {
            debug!(rel = %rel, kind = kind.name(), "redundant sweep request dropped");
            return;
        }
        state.queue.push_back(Job { kind, rel });
        shared.gate.notify_all();
    }

    pub fn add_vacuum_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Vacuum, rel, "");
    }

    pub fn add_scan_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Scan, rel, "");
    }

    pub fn add_trim_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Trim, rel, "");
    }

    pub fn add_freespace_scan_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::FreespaceScan, rel, "");
    }

    pub fn add_analyze_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Analyze, rel, "");
    }

    pub fn add_defrag_request(&self, rel: RelFileId, use_blobs: bool, max: usize) {
        self.add_job_request(JobKind::Defrag { use_blobs, max }, rel, "");
    }

    pub fn add_compact_request(&self, rel: RelFileId, use_blobs: bool, max: usize) {
        self.add_job_request(JobKind::Compact { use_blobs, max }, rel, "");
    }

    pub fn add_reindex_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Reindex, rel, "");
    }

    pub fn add_respan_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Respan, rel, "");
    }

    pub fn add_move_request(&self, rel: RelFileId) {
        self.add_job_request(JobKind::Move, rel, "");
    }

    pub fn add_vacuum_database_request(&self, db: Oid, db_name: &str) {
        self.add_job_request(JobKind::VacuumDatabase, RelFileId::new(db, 0), db_name);
    }

    pub fn add_recover_request(&self, db: Oid, db_name: &str) {
        self.add_job_request(JobKind::Recover, RelFileId::new(db, 0), db_name);
    }

    /// Queue a wait-notify marker and return its waiter: once signalled,
    /// every job queued for the database before it has finished.
    pub fn add_wait_request(&self, db: Oid, db_name: &str) -> Arc<Waiter> {
        let waiter = Waiter::new();
        self.add_job_request(
            JobKind::Wait(waiter.clone()),
            RelFileId::new(db, 0),
            db_name,
        );
        waiter
    }

    /// Drop queued vacuum-family jobs for a relation (before drop or
    /// truncate).
    pub fn drop_vacuum_requests(&self, rel: RelFileId) {
        let workers = self.workers.lock().unwrap();
        if let Some(handle) = workers.iter().find(|w| w.db == rel.db) {
            let mut state = handle.shared.state.lock().unwrap();
            state.queue.retain(|job| {
                job.rel != rel
                    || !matches!(
                        job.kind,
                        JobKind::Vacuum
                            | JobKind::Scan
                            | JobKind::Trim
                            | JobKind::Defrag { .. }
                            | JobKind::Compact { .. }
                    )
            });
        }
    }

    pub fn stop_for_db(&self, db: Oid) {
        let handle = {
            let mut workers = self.workers.lock().unwrap();
            let pos = workers.iter().position(|w| w.db == db);
            pos.map(|p| workers.remove(p))
        };
        if let Some(mut handle) = handle {
            {
                let mut state = handle.shared.state.lock().unwrap();
                state.active = false;
            }
            handle.shared.gate.notify_all();
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }

    /// Drain and join every worker.
    pub fn shutdown(&self) {
        loop {
            let handle = {
                let mut workers = self.workers.lock().unwrap();
                workers.pop()
            };
            let Some(mut handle) = handle else { break };
            {
                let mut state = handle.shared.state.lock().unwrap();
                state.active = false;
            }
            handle.shared.gate.notify_all();
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }
}

fn spawn_worker(engine: Arc<Engine>, shared: Arc<WorkerShared>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("poolsweep-{}", shared.db))
        .spawn(move || worker_main(engine, shared))
        .expect("spawning a pool-sweep worker")
}

fn worker_main(engine: Arc<Engine>, shared: Arc<WorkerShared>) {
    let env = Env::new(engine.clone(), shared.db, &shared.db_name);
    info!(db = shared.db, "pool-sweep worker started");

    loop {
        let paused = engine
            .try_sweeps()
            .map(|t| t.is_paused())
            .unwrap_or(false);
        if paused {
            if !shared.state.lock().unwrap().active {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }

        let job = {
            let mut state = shared.state.lock().unwrap();
            if !state.active {
                break;
            }
            if state.queue.is_empty() {
                let (next, timeout) = shared.gate.wait_timeout(state, IDLE_WAIT).unwrap();
                state = next;
                if timeout.timed_out() {
                    state.idle_count += 1;
                    if state.idle_count >= IDLE_LIMIT {
                        state.active = false;
                        break;
                    }
                } else {
                    state.idle_count = 0;
                }
                continue;
            }
            state.queue.pop_front().expect("queue checked non-empty")
        };

        let name = job.kind.name();
        debug!(db = shared.db, rel = %job.rel, job = name, "starting sweep job");
        if let Err(err) = run_job(&env, &job) {
            warn!(db = shared.db, rel = %job.rel, job = name, %err, "sweep job failed");
            let _ = env.abort_transaction();
        }
    }

    info!(db = shared.db, "pool-sweep worker retired");
}

fn run_job(env: &Env, job: &Job) -> Result<()> {
    // wait-notify carries no transaction of its own
    if let JobKind::Wait(waiter) = &job.kind {
        waiter.signal();
        return Ok(());
    }

    env.begin_transaction()?;
    env.set_commit_type(CommitType::Hard);
    env.set_query_snapshot();

    let result = (|| -> Result<()> {
        match &job.kind {
            JobKind::Vacuum => vacuum::lazy_open_vacuum_rel(env, job.rel, false, false)?,
            JobKind::Scan => vacuum::lazy_open_vacuum_rel(env, job.rel, false, true)?,
            JobKind::Trim => vacuum::lazy_open_vacuum_rel(env, job.rel, true, false)?,
            JobKind::FreespaceScan => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    vacuum::lazy_freespace_scan(env, &rel)?;
                }
            }
            JobKind::Defrag { use_blobs, max } => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    vacuum::lazy_repair_fragmentation(env, &rel, false, *use_blobs, *max)?;
                }
            }
            JobKind::Compact { use_blobs, max } => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    vacuum::lazy_repair_fragmentation(env, &rel, true, *use_blobs, *max)?;
                }
            }
            JobKind::Analyze => {
                // analysis reduces to a statistics-bearing scan here
                vacuum::lazy_open_vacuum_rel(env, job.rel, false, true)?;
            }
            JobKind::Reindex => {
                for index in env.engine.catalog.indexes_of(job.rel) {
                    index.reindex()?;
                }
            }
            JobKind::Respan => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    vacuum::lazy_respan_blobs(env, &rel, true, false)?;
                }
            }
            JobKind::Relink => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    vacuum::lazy_respan_blobs(env, &rel, false, false)?;
                }
            }
            JobKind::Move => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    vacuum::lazy_respan_blobs(env, &rel, true, true)?;
                }
            }
            JobKind::VacuumDatabase => vacuum::lazy_vacuum_database(env, false)?,
            JobKind::Allocate => {
                if let Some(rel) = env.engine.relations.lookup(job.rel) {
                    env.engine.freespace.allocate_more_space(&rel)?;
                }
            }
            JobKind::Recover => {
                let pages = env.engine.take_recovered_pages(env.db);
                let mut by_rel: std::collections::HashMap<RelFileId, Vec<_>> =
                    std::collections::HashMap::new();
                for page in pages {
                    by_rel
                        .entry(RelFileId::new(page.db, page.rel))
                        .or_default()
                        .push(page.block);
                }
                for (rel, blocks) in by_rel {
                    for index in env.engine.catalog.indexes_of(rel) {
                        index.recover_pages(&blocks)?;
                    }
                }
            }
            JobKind::Wait(_) => unreachable!("handled above"),
        }
        Ok(())
    })();

    match result {
        Ok(()) => env.commit_transaction(),
        Err(err) => {
            let _ = env.abort_transaction();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::{test_env, test_relation};
    use crate::heap::{heap_delete, heap_insert};
    use crate::tuple::Tuple;

    #[test]
    fn wait_request_flushes_the_queue() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7401, "swept");
        env.begin_transaction().unwrap();
        let mut tids = Vec::new();
        for i in 0..100u32 {
            let mut tup = Tuple::new(&i.to_le_bytes());
            let (_, tid) = heap_insert(&env, &rel, &mut tup).unwrap();
            tids.push(tid);
        }
        env.commit_transaction().unwrap();
        env.begin_transaction().unwrap();
        for tid in &tids {
            heap_delete(&env, &rel, *tid).unwrap();
        }
        env.commit_transaction().unwrap();

        let sweeps = env.engine.sweeps();
        sweeps.add_vacuum_request(rel.id);
        let waiter = sweeps.add_wait_request(rel.id.db, "db");
        waiter.wait();

        let stats = env.engine.catalog.class_stats(rel.id).unwrap();
        assert_eq!(stats.reltuples, 0);
    }

    #[test]
    fn duplicate_requests_are_subsumed() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7402, "dedup");
        let sweeps = env.engine.sweeps();
        sweeps.pause();
        sweeps.add_vacuum_request(rel.id);
        sweeps.add_vacuum_request(rel.id);
        sweeps.add_scan_request(rel.id);

        {
            let workers = sweeps.workers.lock().unwrap();
            let handle = workers.iter().find(|w| w.db == rel.id.db).unwrap();
            let state = handle.shared.state.lock().unwrap();
            assert_eq!(state.queue.len(), 1, "vacuum subsumes both extra requests");
        }
        sweeps.resume();
        let waiter = sweeps.add_wait_request(rel.id.db, "db");
        waiter.wait();
    }

    #[test]
    fn failed_jobs_do_not_kill_the_worker() {
        let (env, _dir) = test_env();
        let rel = test_relation(&env, 7403, "sturdy");
        let sweeps = env.engine.sweeps();
        // a request for a relation that was never opened is a no-op job;
        // follow it with a real one to prove the worker survived
        sweeps.add_vacuum_request(crate::types::RelFileId::new(rel.id.db, 999_999));
        sweeps.add_vacuum_request(rel.id);
        let waiter = sweeps.add_wait_request(rel.id.db, "db");
        waiter.wait();
        assert!(sweeps.worker_count() >= 1);
    }
}
