//! Virtual file descriptor layer.
//!
//! Logical file handles are indexes into a growable pool of slots. The
//! pool owns at most `sysconf(OPEN_MAX) × vfdallocation` kernel
//! descriptors; when an open would exceed the budget the least-recently
//! accessed idle entry is retired first (seek position saved, fsync if
//! dirty). Retired entries reopen transparently on the next pinned
//! operation and re-seek to the saved position.
//!
//! Non-private opens share an existing entry when path, flags and mode all
//! match and its reference count is under the share cap. Private handles
//! (and any open carrying create/exclusive/truncate) never share.

use crate::config::{keys, Properties};
use crate::error::{Result, StorageError};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

/// Slots are allocated in blocks of this many entries; the pool doubles
/// until the block cap is reached.
const GROW_MULTIPLE: usize = 32;
const MAX_BLOCKS: usize = 32 * 1024;

/// Kernel descriptors reserved for the rest of the process.
const RESERVE_FOR_PROCESS: u64 = 64;
const FD_MIN_FREE: u64 = 50;
const DEFAULT_NOFILE: u64 = 512;

const DEFAULT_SHARE_MAX: u32 = 1;

/// Logical file handle. Slot zero is the pool sentinel and never a valid
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u32);

impl FileId {
    pub const INVALID: FileId = FileId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Open disposition, comparable so shared entries can be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenDisposition {
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub mode: u32,
}

impl OpenDisposition {
    pub fn read_write() -> Self {
        OpenDisposition {
            write: true,
            mode: 0o600,
            ..Default::default()
        }
    }

    pub fn create_exclusive() -> Self {
        OpenDisposition {
            write: true,
            create: true,
            create_new: true,
            mode: 0o600,
            ..Default::default()
        }
    }

    /// Shared entries must not re-run creation or truncation on reopen.
    fn shared(mut self) -> Self {
        self.create = false;
        self.create_new = false;
        self.truncate = false;
        self
    }

    fn is_private_by_nature(&self) -> bool {
        self.create || self.create_new || self.truncate
    }

    fn to_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(true);
        opts.write(self.write);
        opts.create(self.create && !self.create_new);
        opts.create_new(self.create_new);
        opts.truncate(self.truncate);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(self.mode);
        }
        opts
    }
}

struct VfdState {
    path: PathBuf,
    disposition: OpenDisposition,
    fd: Option<File>,
    seek_pos: u64,
    dirty: bool,
    temporary: bool,
    pooled: bool,
    private: bool,
    ref_count: u32,
    access_time: Instant,
    in_use: bool,
}

impl VfdState {
    fn vacant() -> Self {
        VfdState {
            path: PathBuf::new(),
            disposition: OpenDisposition::default(),
            fd: None,
            seek_pos: 0,
            dirty: false,
            temporary: false,
            pooled: false,
            private: false,
            ref_count: 0,
            access_time: Instant::now(),
            in_use: false,
        }
    }
}

struct VfdSlot {
    id: u32,
    state: Mutex<VfdState>,
}

struct PoolHeader {
    free: VecDeque<u32>,
    /// Next-oldest candidates remembered from the last LRU sweep.
    sweep_hints: VecDeque<u32>,
}

struct RealFiles {
    nfile: u64,
    allocated: u64,
    max_allocated: u64,
    max_files: u64,
    share_max: u32,
    checks: u64,
    autotune: bool,
}

/// The process-wide pool.
pub struct VfdPool {
    slots: RwLock<Vec<std::sync::Arc<VfdSlot>>>,
    header: Mutex<PoolHeader>,
    share: Mutex<HashMap<PathBuf, u32>>,
    real: Mutex<RealFiles>,
    fsync_disabled: bool,
    temp_counter: AtomicU64,
}

fn os_max_files(props: &Properties) -> u64 {
    let raw = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let mut limit = if raw <= 0 { DEFAULT_NOFILE } else { raw as u64 };
    if limit.saturating_sub(RESERVE_FOR_PROCESS) < FD_MIN_FREE {
        warn!(limit, "very few file descriptors available to the pool");
    }
    let fraction = props.get_float(keys::VFD_ALLOCATION, 0.0);
    if fraction > 0.0 {
        limit = ((limit as f64) * fraction) as u64;
    } else {
        limit /= 2;
    }
    limit.max(FD_MIN_FREE)
}

impl VfdPool {
    pub fn new(props: &Properties) -> Self {
        let max_backends = props.get_int(keys::MAX_BACKENDS, 32).max(1) as u64;
        let share_max = {
            let configured = props.get_int(keys::VFD_SHARE_MAX, 0);
            if configured > 0 {
                configured as u32
            } else {
                DEFAULT_SHARE_MAX
            }
        };
        let max_files = os_max_files(props);
        debug!(max_files, share_max, "virtual file pool initialized");

        let mut slots = Vec::with_capacity(GROW_MULTIPLE);
        for id in 0..GROW_MULTIPLE as u32 {
            slots.push(std::sync::Arc::new(VfdSlot {
                id,
                state: Mutex::new(VfdState::vacant()),
            }));
        }
        // slot 0 is the sentinel; 1.. are free
        let free = (1..GROW_MULTIPLE as u32).collect();

        VfdPool {
            slots: RwLock::new(slots),
            header: Mutex::new(PoolHeader {
                free,
                sweep_hints: VecDeque::new(),
            }),
            share: Mutex::new(HashMap::new()),
            real: Mutex::new(RealFiles {
                nfile: 0,
                allocated: 0,
                max_allocated: max_backends * 2,
                max_files,
                share_max,
                checks: 0,
                autotune: props.get_bool(keys::VFD_AUTOTUNE, false),
            }),
            fsync_disabled: props.get_bool(keys::NO_FSYNC, false),
            temp_counter: AtomicU64::new(0),
        }
    }

    fn slot(&self, id: u32) -> Result<std::sync::Arc<VfdSlot>> {
        let slots = self.slots.read().unwrap();
        slots
            .get(id as usize)
            .cloned()
            .ok_or(StorageError::InvalidFileHandle(id as usize))
    }

    fn pool_size(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    fn allocate_slot(&self) -> Result<std::sync::Arc<VfdSlot>> {
        let mut header = self.header.lock().unwrap();
        if header.free.is_empty() {
            // double the pool, one block row at a time
            let mut slots = self.slots.write().unwrap();
            let old = slots.len();
            let target = (old * 2).min(GROW_MULTIPLE * MAX_BLOCKS);
            if target == old {
                return Err(StorageError::VfdPoolExhausted);
            }
            for id in old..target {
                slots.push(std::sync::Arc::new(VfdSlot {
                    id: id as u32,
                    state: Mutex::new(VfdState::vacant()),
                }));
                header.free.push_back(id as u32);
            }
            debug!(size = target, "virtual file pool grown");
        }
        let id = header.free.pop_front().expect("free list refilled");
        drop(header);
        self.slot(id)
    }

    fn free_slot(&self, id: u32) {
        let mut header = self.header.lock().unwrap();
        header.free.push_back(id);
    }

    /// Retire the kernel descriptor of a locked slot: save the seek
    /// position, fsync if dirty, close, and drop it from the budget.
    fn retire_locked(&self, state: &mut VfdState) {
        let Some(fd) = state.fd.take() else {
            return;
        };
        if state.dirty && !self.fsync_disabled {
            if let Err(err) = fd.sync_data() {
                warn!(path = %state.path.display(), %err, "fsync while retiring file");
            }
        }
        state.dirty = false;
        drop(fd);
        let mut real = self.real.lock().unwrap();
        real.nfile -= 1;
    }

    /// Close the least-recently-accessed idle descriptors until the budget
    /// admits one more open.
    fn release_if_needed(&self) {
        loop {
            {
                let mut real = self.real.lock().unwrap();
                let used = real.nfile + real.allocated;
                if real.autotune {
                    // pressure-tune the share cap with hysteresis
                    if used * 10 >= real.max_files * 9 && real.share_max < 64 {
                        real.checks += 1;
                        if real.checks >= real.max_files {
                            real.checks = 0;
                            real.share_max += 1;
                        }
                    } else if used * 5 <= real.max_files && real.share_max > 1 {
                        real.checks += 1;
                        if real.checks >= real.max_files {
                            real.checks = 0;
                            real.share_max -= 1;
                        }
                    }
                }
                if used < real.max_files {
                    return;
                }
            }

            let candidate = {
                let mut header = self.header.lock().unwrap();
                header.sweep_hints.pop_front()
            };
            let candidate = match candidate {
                Some(id) => Some(id),
                None => self.sweep_for_oldest(),
            };
            let Some(id) = candidate else {
                // nothing idle to release; let the caller's open fail or retry
                return;
            };
            if let Ok(slot) = self.slot(id) {
                if let Ok(mut state) = slot.state.try_lock() {
                    if state.fd.is_some() {
                        debug!(id, path = %state.path.display(), "retiring idle file");
                        self.retire_locked(&mut state);
                    }
                }
            }
        }
    }

    /// One pass over the pool recording idle open entries from oldest to
    /// newer; the oldest is returned, the rest become sweep hints.
    fn sweep_for_oldest(&self) -> Option<u32> {
        let mut found: Vec<(Instant, u32)> = Vec::new();
        let size = self.pool_size();
        for id in 1..size as u32 {
            let Ok(slot) = self.slot(id) else { continue };
            let Ok(state) = slot.state.try_lock() else {
                continue;
            };
            if state.fd.is_some() && !state.in_use {
                found.push((state.access_time, id));
            }
        }
        found.sort_by_key(|(at, _)| *at);
        let mut header = self.header.lock().unwrap();
        header.sweep_hints.clear();
        let mut ids = found.into_iter().map(|(_, id)| id);
        let oldest = ids.next();
        header.sweep_hints.extend(ids.take(16));
        oldest
    }

    /// Open the kernel descriptor of a locked slot, retrying through
    /// EMFILE/ENFILE by releasing idle entries; re-seek to the saved
    /// logical position.
    fn activate_locked(&self, state: &mut VfdState) -> Result<()> {
        if state.fd.is_some() {
            return Ok(());
        }
        let mut attempts = 0;
        loop {
            self.release_if_needed();
            match state.disposition.to_options().open(&state.path) {
                Ok(fd) => {
                    state.fd = Some(fd);
                    // creation flags must not re-run on later reopens
                    state.disposition = state.disposition.shared();
                    let mut real = self.real.lock().unwrap();
                    real.nfile += 1;
                    break;
                }
                Err(err) => {
                    attempts += 1;
                    let retry = matches!(err.raw_os_error(), Some(libc::EMFILE | libc::ENFILE));
                    if !retry || attempts >= 5 {
                        return Err(err.into());
                    }
                }
            }
        }
        if state.seek_pos != 0 {
            let pos = state.seek_pos;
            let fd = state.fd.as_mut().expect("just opened");
            let got = fd.seek(SeekFrom::Start(pos))?;
            if got != pos {
                warn!(path = %state.path.display(), expected = pos, got, "bad re-seek on activation");
            }
        }
        Ok(())
    }

    /// Pin a slot for an operation: lock it, make sure the descriptor is
    /// open, and stamp the access time.
    fn with_pinned<T>(
        &self,
        id: FileId,
        f: impl FnOnce(&mut VfdState) -> Result<T>,
    ) -> Result<T> {
        if !id.is_valid() {
            return Err(StorageError::InvalidFileHandle(0));
        }
        let slot = self.slot(id.0)?;
        let mut state = slot.state.lock().unwrap();
        if state.ref_count == 0 {
            return Err(StorageError::InvalidFileHandle(id.0 as usize));
        }
        self.activate_locked(&mut state)?;
        state.access_time = Instant::now();
        state.in_use = true;
        let result = f(&mut state);
        state.in_use = false;
        result
    }

    /// Open `path`. Private handles bypass the sharing pool; shared opens
    /// return an existing matching entry when possible.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        disposition: OpenDisposition,
        private: bool,
    ) -> Result<FileId> {
        let path = path.as_ref().to_path_buf();
        let private = private || disposition.is_private_by_nature();
        let share_max = self.real.lock().unwrap().share_max;

        if !private && share_max > 1 {
            let mut share = self.share.lock().unwrap();
            if let Some(&id) = share.get(&path) {
                if let Ok(slot) = self.slot(id) {
                    let mut state = slot.state.lock().unwrap();
                    if state.pooled
                        && state.ref_count < share_max
                        && state.disposition == disposition.shared()
                    {
                        state.ref_count += 1;
                        return Ok(FileId(id));
                    }
                    // mismatched or saturated: displace the pool mapping
                    state.pooled = false;
                }
                share.remove(&path);
            }
            let slot = self.allocate_slot()?;
            {
                let mut state = slot.state.lock().unwrap();
                *state = VfdState::vacant();
                state.path = path.clone();
                state.disposition = disposition;
                state.ref_count = 1;
                state.pooled = true;
                state.in_use = true;
                if let Err(err) = self.activate_locked(&mut state) {
                    state.in_use = false;
                    state.ref_count = 0;
                    drop(state);
                    self.free_slot(slot.id);
                    return Err(err);
                }
                state.in_use = false;
            }
            share.insert(path, slot.id);
            return Ok(FileId(slot.id));
        }

        let slot = self.allocate_slot()?;
        {
            let mut state = slot.state.lock().unwrap();
            *state = VfdState::vacant();
            state.path = path;
            state.disposition = disposition;
            state.private = true;
            state.ref_count = 1;
            state.in_use = true;
            if let Err(err) = self.activate_locked(&mut state) {
                state.in_use = false;
                state.ref_count = 0;
                drop(state);
                self.free_slot(slot.id);
                return Err(err);
            }
            state.in_use = false;
        }
        Ok(FileId(slot.id))
    }

    /// Open an auto-deleting temporary file under `dir`. The caller's env
    /// records the handle for end-of-transaction cleanup.
    pub fn open_temporary(&self, dir: impl AsRef<Path>) -> Result<FileId> {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("strtemp{}.{}", std::process::id(), n);
        let path = dir.as_ref().join(name);
        let id = self.open(path, OpenDisposition::create_exclusive(), true)?;
        let slot = self.slot(id.0)?;
        slot.state.lock().unwrap().temporary = true;
        Ok(id)
    }

    /// Drop one reference; the entry returns to the pool at refcount zero.
    /// A dirty file is fsync'd before its descriptor closes; a temporary
    /// file is unlinked after.
    pub fn close(&self, id: FileId) -> Result<()> {
        let slot = self.slot(id.0)?;
        // lock order everywhere: share map before slot state
        let mut share = self.share.lock().unwrap();
        let mut state = slot.state.lock().unwrap();
        if state.ref_count == 0 {
            return Err(StorageError::InvalidFileHandle(id.0 as usize));
        }

        state.ref_count -= 1;
        let free = state.ref_count == 0;
        if free && state.pooled {
            share.remove(&state.path);
            state.pooled = false;
        }
        drop(share);

        if free {
            self.retire_locked(&mut state);
            if state.temporary {
                if let Err(err) = std::fs::remove_file(&state.path) {
                    warn!(path = %state.path.display(), %err, "removing temporary file");
                }
            }
            *state = VfdState::vacant();
            drop(state);
            self.free_slot(id.0);
        }
        Ok(())
    }

    /// Close and delete the underlying file.
    pub fn unlink(&self, id: FileId) -> Result<()> {
        let path = {
            let slot = self.slot(id.0)?;
            let mut state = slot.state.lock().unwrap();
            self.retire_locked(&mut state);
            state.path.clone()
        };
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        self.close(id)
    }

    /// Close and rename the underlying file.
    pub fn rename(&self, id: FileId, new_path: impl AsRef<Path>) -> Result<()> {
        {
            let slot = self.slot(id.0)?;
            let mut state = slot.state.lock().unwrap();
            self.retire_locked(&mut state);
            std::fs::rename(&state.path, new_path.as_ref())?;
        }
        self.close(id)
    }

    /// Read at the current logical position. Short reads at end-of-file
    /// return the bytes actually transferred; the logical position tracks
    /// what transferred.
    pub fn read(&self, id: FileId, buf: &mut [u8]) -> Result<usize> {
        self.with_pinned(id, |state| {
            let fd = state.fd.as_mut().expect("pinned file is open");
            let mut done = 0;
            while done < buf.len() {
                let n = fd.read(&mut buf[done..])?;
                if n == 0 {
                    break;
                }
                done += n;
            }
            state.seek_pos += done as u64;
            Ok(done)
        })
    }

    /// Write at the current logical position; marks the entry dirty.
    pub fn write(&self, id: FileId, buf: &[u8]) -> Result<usize> {
        self.with_pinned(id, |state| {
            let fd = state.fd.as_mut().expect("pinned file is open");
            fd.write_all(buf)?;
            state.seek_pos += buf.len() as u64;
            state.dirty = true;
            Ok(buf.len())
        })
    }

    pub fn seek(&self, id: FileId, pos: SeekFrom) -> Result<u64> {
        // an absolute or relative seek on a closed file only moves the
        // saved position; end-relative needs the descriptor
        let slot = self.slot(id.0)?;
        let mut state = slot.state.lock().unwrap();
        if state.ref_count == 0 {
            return Err(StorageError::InvalidFileHandle(id.0 as usize));
        }
        match pos {
            SeekFrom::Start(offset) if state.fd.is_none() => {
                state.seek_pos = offset;
                Ok(offset)
            }
            SeekFrom::Current(delta) if state.fd.is_none() => {
                let new = state.seek_pos.saturating_add_signed(delta);
                state.seek_pos = new;
                Ok(new)
            }
            other => {
                self.activate_locked(&mut state)?;
                state.access_time = Instant::now();
                let fd = state.fd.as_mut().expect("activated");
                let new = fd.seek(other)?;
                state.seek_pos = new;
                Ok(new)
            }
        }
    }

    pub fn truncate(&self, id: FileId, len: u64) -> Result<()> {
        self.sync(id)?;
        self.with_pinned(id, |state| {
            let fd = state.fd.as_mut().expect("pinned file is open");
            fd.set_len(len)?;
            if !self.fsync_disabled {
                fd.sync_data()?;
            }
            if state.seek_pos > len {
                state.seek_pos = len;
                fd.seek(SeekFrom::Start(len))?;
            }
            Ok(())
        })
    }

    /// Fsync if dirty. With fsync globally disabled the bit still clears.
    pub fn sync(&self, id: FileId) -> Result<()> {
        let slot = self.slot(id.0)?;
        let mut state = slot.state.lock().unwrap();
        if state.ref_count == 0 {
            return Err(StorageError::InvalidFileHandle(id.0 as usize));
        }
        if !state.dirty {
            return Ok(());
        }
        if self.fsync_disabled {
            state.dirty = false;
            return Ok(());
        }
        self.activate_locked(&mut state)?;
        state.fd.as_ref().expect("activated").sync_data()?;
        state.dirty = false;
        Ok(())
    }

    pub fn mark_dirty(&self, id: FileId) -> Result<()> {
        let slot = self.slot(id.0)?;
        let mut state = slot.state.lock().unwrap();
        state.dirty = true;
        Ok(())
    }

    pub fn is_dirty(&self, id: FileId) -> bool {
        self.slot(id.0)
            .map(|slot| slot.state.lock().unwrap().dirty)
            .unwrap_or(false)
    }

    pub fn path_of(&self, id: FileId) -> Result<PathBuf> {
        let slot = self.slot(id.0)?;
        let state = slot.state.lock().unwrap();
        Ok(state.path.clone())
    }

    pub fn file_size(&self, id: FileId) -> Result<u64> {
        self.with_pinned(id, |state| {
            let fd = state.fd.as_mut().expect("pinned file is open");
            let end = fd.seek(SeekFrom::End(0))?;
            fd.seek(SeekFrom::Start(state.seek_pos))?;
            Ok(end)
        })
    }

    /// Invalidate cached descriptors and clamp saved seek positions in
    /// every *other* handle naming the same file. Required before
    /// truncating a file other holders may have open.
    pub fn base_sync(&self, id: FileId, new_len: u64) -> Result<usize> {
        let base_path = self.path_of(id)?;
        let mut touched = 0;
        let size = self.pool_size();
        for other in 1..size as u32 {
            if other == id.0 {
                continue;
            }
            let Ok(slot) = self.slot(other) else { continue };
            let mut state = slot.state.lock().unwrap();
            if state.ref_count > 0 && state.path == base_path {
                self.retire_locked(&mut state);
                if state.seek_pos > new_len {
                    state.seek_pos = new_len;
                }
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Account a stdio-style allocated file against the descriptor budget.
    /// The returned guard releases the count on drop.
    pub fn allocate_file(&self, path: impl AsRef<Path>) -> Result<AllocatedFile<'_>> {
        self.release_if_needed();
        {
            let mut real = self.real.lock().unwrap();
            if real.allocated >= real.max_allocated {
                return Err(StorageError::AllocatedFileLimit);
            }
            real.allocated += 1;
        }
        match File::open(path.as_ref()) {
            Ok(file) => Ok(AllocatedFile { pool: self, file }),
            Err(err) => {
                self.real.lock().unwrap().allocated -= 1;
                Err(err.into())
            }
        }
    }

    /// Force every descriptor closed while keeping logical state. Used at
    /// shutdown.
    pub fn close_all_descriptors(&self) {
        let size = self.pool_size();
        for id in 1..size as u32 {
            let Ok(slot) = self.slot(id) else { continue };
            let mut state = slot.state.lock().unwrap();
            if state.ref_count > 0 {
                self.retire_locked(&mut state);
            }
        }
    }

    #[cfg(test)]
    fn open_descriptor_count(&self) -> u64 {
        self.real.lock().unwrap().nfile
    }
}

/// Guard for a stdio-parallel allocated file.
pub struct AllocatedFile<'a> {
    pool: &'a VfdPool,
    pub file: File,
}

impl Drop for AllocatedFile<'_> {
    fn drop(&mut self) {
        self.pool.real.lock().unwrap().allocated -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool() -> (VfdPool, TempDir) {
        let dir = TempDir::new().unwrap();
        let props = Properties::new();
        (VfdPool::new(&props), dir)
    }

    #[test]
    fn write_read_round_trip() {
        let (pool, dir) = pool();
        let path = dir.path().join("data");
        let id = pool
            .open(&path, OpenDisposition::create_exclusive(), true)
            .unwrap();
        pool.write(id, b"hello vfd").unwrap();
        pool.seek(id, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 9];
        assert_eq!(pool.read(id, &mut buf).unwrap(), 9);
        assert_eq!(&buf, b"hello vfd");
        pool.close(id).unwrap();
    }

    #[test]
    fn seek_position_survives_retirement() {
        let (pool, dir) = pool();
        let path = dir.path().join("data");
        let id = pool
            .open(&path, OpenDisposition::create_exclusive(), true)
            .unwrap();
        pool.write(id, b"0123456789").unwrap();
        pool.seek(id, SeekFrom::Start(4)).unwrap();

        // force the descriptor closed behind the handle's back
        {
            let slot = pool.slot(id.0).unwrap();
            let mut state = slot.state.lock().unwrap();
            pool.retire_locked(&mut state);
        }
        assert_eq!(pool.open_descriptor_count(), 0);

        let mut buf = [0u8; 3];
        assert_eq!(pool.read(id, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");
        pool.close(id).unwrap();
    }

    #[test]
    fn sharing_matches_path_and_disposition() {
        let dir = TempDir::new().unwrap();
        let mut props = Properties::new();
        props.set(keys::VFD_SHARE_MAX, "4");
        let pool = VfdPool::new(&props);
        let path = dir.path().join("shared");
        std::fs::write(&path, b"x").unwrap();

        let a = pool
            .open(&path, OpenDisposition::read_write(), false)
            .unwrap();
        let b = pool
            .open(&path, OpenDisposition::read_write(), false)
            .unwrap();
        assert_eq!(a, b);

        // a private open never joins the pool entry
        let c = pool
            .open(&path, OpenDisposition::read_write(), true)
            .unwrap();
        assert_ne!(a, c);

        pool.close(a).unwrap();
        pool.close(b).unwrap();
        pool.close(c).unwrap();
    }

    #[test]
    fn temporary_files_unlink_on_close() {
        let (pool, dir) = pool();
        let id = pool.open_temporary(dir.path()).unwrap();
        let path = pool.path_of(id).unwrap();
        pool.write(id, b"scratch").unwrap();
        assert!(path.exists());
        pool.close(id).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn base_sync_clamps_sibling_positions() {
        let dir = TempDir::new().unwrap();
        let mut props = Properties::new();
        props.set(keys::VFD_SHARE_MAX, "1");
        let pool = VfdPool::new(&props);
        let path = dir.path().join("f");
        std::fs::write(&path, vec![7u8; 4096]).unwrap();

        let a = pool
            .open(&path, OpenDisposition::read_write(), true)
            .unwrap();
        let b = pool
            .open(&path, OpenDisposition::read_write(), true)
            .unwrap();
        pool.seek(b, SeekFrom::Start(4000)).unwrap();

        pool.base_sync(a, 1024).unwrap();
        assert_eq!(pool.seek(b, SeekFrom::Current(0)).unwrap(), 1024);

        pool.close(a).unwrap();
        pool.close(b).unwrap();
    }

    #[test]
    fn truncate_then_size() {
        let (pool, dir) = pool();
        let path = dir.path().join("t");
        let id = pool
            .open(&path, OpenDisposition::create_exclusive(), true)
            .unwrap();
        pool.write(id, &vec![1u8; 8192]).unwrap();
        pool.truncate(id, 4096).unwrap();
        assert_eq!(pool.file_size(id).unwrap(), 4096);
        pool.close(id).unwrap();
    }
}
