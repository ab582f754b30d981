//! Engine lifecycle: data directory checks, the exclusive lock file,
//! subsystem initialization order, and shutdown.
//!
//! Init order: properties → lock file → virtual file system → storage
//! manager and shadow-log replay → buffer pool → transaction system
//! (with recovery when requested) → freespace → pool-sweep workers.
//! Shutdown runs the reverse, draining the sweeps before the log closes.

use crate::catalog::CatalogBridge;
use crate::config::{keys, Properties};
use crate::engine::Engine;
use crate::error::{Result, StorageError};
use crate::freespace::FreespaceMap;
use crate::relation::RelationCache;
use crate::storage::buffer::BufferPool;
use crate::storage::shadow::ShadowLog;
use crate::storage::smgr::{DiskManager, Smgr};
use crate::storage::vfd::VfdPool;
use crate::sweep::SweepTable;
use crate::transam::Transam;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const VERSION_FILE: &str = "STRATUM_VERSION";
const VERSION: &str = "1\n";
const LOCK_FILE: &str = "LOCK";

pub struct StartupOptions {
    pub data_dir: PathBuf,
    /// Create a fresh data directory with seeded system relations.
    pub bootstrap: bool,
    /// Run the transaction-log recovery sweep before admitting work.
    pub recovery_check: bool,
    pub props: Properties,
    pub catalog: Arc<dyn CatalogBridge>,
}

/// Exit codes for lock-file contention, per the startup contract.
mod exit_codes {
    pub const LOCK_HELD: i32 = 2;
    pub const LOCK_LOOKUP_DENIED: i32 = 3;
    pub const LOCK_FOREIGN: i32 = 4;
}

fn probe_pid(pid: i32) -> std::io::Result<bool> {
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return Ok(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Err(std::io::Error::from_raw_os_error(libc::EPERM)),
        _ => Ok(false),
    }
}

/// Create `$DATADIR/LOCK` exclusively, retrying once over a stale file.
fn acquire_lock_file(data_dir: &Path) -> Result<()> {
    let path = data_dir.join(LOCK_FILE);
    for attempt in 0..2 {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                return Ok(());
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder: Option<i32> = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
                match holder {
                    Some(pid) => match probe_pid(pid) {
                        Ok(true) => {
                            return Err(StorageError::Startup {
                                code: if attempt == 0 {
                                    exit_codes::LOCK_HELD
                                } else {
                                    exit_codes::LOCK_FOREIGN
                                },
                                detail: format!("lock file held by live process {pid}"),
                            });
                        }
                        Ok(false) => {
                            warn!(pid, "removing stale lock file");
                            std::fs::remove_file(&path)?;
                        }
                        Err(_) => {
                            return Err(StorageError::Startup {
                                code: exit_codes::LOCK_LOOKUP_DENIED,
                                detail: format!(
                                    "lock file names process {pid} but the probe was denied"
                                ),
                            });
                        }
                    },
                    None => {
                        warn!("removing unreadable lock file");
                        std::fs::remove_file(&path)?;
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(StorageError::Startup {
        code: exit_codes::LOCK_FOREIGN,
        detail: "lock file could not be acquired".into(),
    })
}

fn check_data_dir(data_dir: &Path, bootstrap: bool) -> Result<()> {
    if bootstrap {
        std::fs::create_dir_all(data_dir)?;
        std::fs::create_dir_all(data_dir.join("global"))?;
        std::fs::create_dir_all(data_dir.join("base"))?;
        std::fs::write(data_dir.join(VERSION_FILE), VERSION)?;
        return Ok(());
    }
    if !data_dir.is_dir() {
        return Err(StorageError::Startup {
            code: 1,
            detail: format!("data directory {} does not exist", data_dir.display()),
        });
    }
    let version = std::fs::read_to_string(data_dir.join(VERSION_FILE)).map_err(|_| {
        StorageError::Startup {
            code: 1,
            detail: "data directory carries no version file".into(),
        }
    })?;
    if version != VERSION {
        return Err(StorageError::Startup {
            code: 1,
            detail: format!("data directory version {} is not {}", version.trim(), VERSION.trim()),
        });
    }
    Ok(())
}

/// Bring the engine up. On return every subsystem is ready and the
/// pool-sweep table is installed; recovered index pages (if any) are
/// queued as per-database recover jobs.
pub fn initialize(opts: StartupOptions) -> Result<Arc<Engine>> {
    let StartupOptions {
        data_dir,
        bootstrap,
        recovery_check,
        props,
        catalog,
    } = opts;

    check_data_dir(&data_dir, bootstrap)?;
    acquire_lock_file(&data_dir)?;

    let vfs = Arc::new(VfdPool::new(&props));
    let smgr: Arc<dyn Smgr> = Arc::new(DiskManager::new(vfs.clone(), data_dir.clone()));

    let mut shadow = ShadowLog::open(vfs.clone(), data_dir.clone(), &props)?;
    let recovered = if bootstrap {
        Vec::new()
    } else {
        shadow.replay_logs()?
    };
    if !recovered.is_empty() {
        info!(pages = recovered.len(), "index pages recovered from the shadow log");
    }

    let buffers = Arc::new(BufferPool::new(
        props.get_int(keys::BUFFER_COUNT, 256).max(16) as usize,
    ));
    let relations = RelationCache::new(smgr.clone());
    let transam = Transam::init(&relations, buffers.clone(), &props, bootstrap)?;
    if recovery_check && !bootstrap {
        transam.recover()?;
    }

    let freespace = FreespaceMap::new(catalog.clone(), buffers.clone(), &props);
    let sweeps_cap = props.get_int(keys::SWEEPS, 1).max(1) as usize;

    let recovered_dbs: Vec<(crate::types::Oid, String)> = {
        let mut seen = Vec::new();
        for page in &recovered {
            if !seen.iter().any(|(db, _)| *db == page.db) {
                seen.push((page.db, page.db_name.clone()));
            }
        }
        seen
    };

    let engine = Arc::new(Engine::assemble(
        props,
        data_dir,
        vfs,
        smgr,
        relations,
        buffers,
        transam,
        freespace,
        catalog,
        shadow,
        recovered,
    ));

    engine.install_sweeps(SweepTable::new(Arc::downgrade(&engine), sweeps_cap));

    // low-free-space and first-access events enqueue background scans
    {
        let weak = Arc::downgrade(&engine);
        engine.freespace.set_scan_hook(Box::new(move |rel| {
            if let Some(engine) = weak.upgrade() {
                if let Some(sweeps) = engine.try_sweeps() {
                    sweeps.add_freespace_scan_request(rel);
                }
            }
        }));
    }

    for (db, db_name) in recovered_dbs {
        engine.sweeps().add_recover_request(db, &db_name);
    }

    info!("storage engine ready");
    Ok(engine)
}

/// Tear the engine down in reverse order of initialization.
pub fn shutdown(engine: &Arc<Engine>) -> Result<()> {
    if let Some(sweeps) = engine.try_sweeps() {
        sweeps.shutdown();
    }
    // final writes go through the shadow log so a crash mid-shutdown
    // still replays to a consistent heap
    engine.shadow_checkpoint()?;
    engine.buffers.flush_all(true)?;
    engine.transam.shutdown()?;
    engine.relations.close_all()?;
    engine.shadow.lock().unwrap().shutdown()?;
    engine.vfs.close_all_descriptors();
    let lock = engine.data_dir.join(LOCK_FILE);
    if let Err(err) = std::fs::remove_file(&lock) {
        warn!(%err, "removing the lock file");
    }
    info!("storage engine stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use tempfile::TempDir;

    fn options(dir: &TempDir, bootstrap: bool) -> StartupOptions {
        StartupOptions {
            data_dir: dir.path().join("data"),
            bootstrap,
            recovery_check: false,
            props: Properties::new(),
            catalog: Arc::new(MemoryCatalog::new()),
        }
    }

    #[test]
    fn bootstrap_then_restart() {
        let dir = TempDir::new().unwrap();
        let engine = initialize(options(&dir, true)).unwrap();
        assert!(dir.path().join("data").join(VERSION_FILE).exists());
        assert!(dir.path().join("data").join(LOCK_FILE).exists());
        shutdown(&engine).unwrap();
        drop(engine);
        assert!(!dir.path().join("data").join(LOCK_FILE).exists());

        let engine = initialize(options(&dir, false)).unwrap();
        shutdown(&engine).unwrap();
    }

    #[test]
    fn live_lock_file_refuses_startup() {
        let dir = TempDir::new().unwrap();
        let engine = initialize(options(&dir, true)).unwrap();
        // our own pid is alive, so a second engine must refuse
        let err = initialize(options(&dir, false)).unwrap_err();
        match err {
            StorageError::Startup { code, .. } => assert_eq!(code, 2),
            other => panic!("expected startup failure, got {other}"),
        }
        shutdown(&engine).unwrap();
    }

    #[test]
    fn stale_lock_file_is_cleared() {
        let dir = TempDir::new().unwrap();
        let engine = initialize(options(&dir, true)).unwrap();
        shutdown(&engine).unwrap();
        drop(engine);
        // plant a lock naming a long-dead pid
        std::fs::write(dir.path().join("data").join(LOCK_FILE), "999999999\n").unwrap();
        let engine = initialize(options(&dir, false)).unwrap();
        shutdown(&engine).unwrap();
    }

    #[test]
    fn missing_data_dir_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = initialize(options(&dir, false)).unwrap_err();
        assert!(matches!(err, StorageError::Startup { code: 1, .. }));
    }
}
