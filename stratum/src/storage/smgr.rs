//! Storage manager: block-addressed access to relation files.
//!
//! One backend is provided: a single file per relation under
//! `$DATADIR/base/<dbname>/<relname>` (`$DATADIR/global/<relname>` for
//! shared relations), addressed through the virtual file descriptor pool.

use crate::error::{Result, StorageError};
use crate::storage::vfd::{FileId, OpenDisposition, VfdPool};
use crate::types::{BlockNumber, RelFileId, RelKind, BLCKSZ};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifies an on-disk object for the storage manager and the shadow
/// log. Names are carried so blind operations (replay before any catalog
/// is usable) can locate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmgrInfo {
    pub rel: RelFileId,
    pub db_name: String,
    pub rel_name: String,
    pub kind: RelKind,
    pub nblocks: BlockNumber,
    pub unlinked: bool,
    pub file: FileId,
}

impl SmgrInfo {
    pub fn new(rel: RelFileId, db_name: &str, rel_name: &str, kind: RelKind) -> Self {
        SmgrInfo {
            rel,
            db_name: db_name.to_string(),
            rel_name: rel_name.to_string(),
            kind,
            nblocks: 0,
            unlinked: false,
            file: FileId::INVALID,
        }
    }
}

/// Fixed-size serialized form of [`SmgrInfo`] used in shadow log records:
/// dbname[32] relname[32] dbid u32 relid u32 block u32 kind u8 pad[3].
pub const SMGR_INFO_WIRE_SIZE: usize = 80;

pub fn encode_info(info: &SmgrInfo, block: BlockNumber, out: &mut [u8]) {
    debug_assert!(out.len() >= SMGR_INFO_WIRE_SIZE);
    out[..SMGR_INFO_WIRE_SIZE].fill(0);
    let db = info.db_name.as_bytes();
    let rel = info.rel_name.as_bytes();
    out[..db.len().min(31)].copy_from_slice(&db[..db.len().min(31)]);
    out[32..32 + rel.len().min(31)].copy_from_slice(&rel[..rel.len().min(31)]);
    out[64..68].copy_from_slice(&info.rel.db.to_le_bytes());
    out[68..72].copy_from_slice(&info.rel.rel.to_le_bytes());
    out[72..76].copy_from_slice(&block.to_le_bytes());
    out[76] = match info.kind {
        RelKind::Heap => 0,
        RelKind::Index => 1,
        RelKind::Special => 2,
        RelKind::Uncataloged => 3,
    };
}

pub fn decode_info(bytes: &[u8]) -> (SmgrInfo, BlockNumber) {
    debug_assert!(bytes.len() >= SMGR_INFO_WIRE_SIZE);
    let name_of = |range: &[u8]| {
        let end = range.iter().position(|&b| b == 0).unwrap_or(range.len());
        String::from_utf8_lossy(&range[..end]).into_owned()
    };
    let db_name = name_of(&bytes[..32]);
    let rel_name = name_of(&bytes[32..64]);
    let db = u32::from_le_bytes(bytes[64..68].try_into().unwrap());
    let rel = u32::from_le_bytes(bytes[68..72].try_into().unwrap());
    let block = u32::from_le_bytes(bytes[72..76].try_into().unwrap());
    let kind = match bytes[76] {
        1 => RelKind::Index,
        2 => RelKind::Special,
        3 => RelKind::Uncataloged,
        _ => RelKind::Heap,
    };
    let mut info = SmgrInfo::new(RelFileId::new(db, rel), &db_name, &rel_name, kind);
    info.file = FileId::INVALID;
    (info, block)
}

/// Uniform interface over an on-disk backend.
pub trait Smgr: Send + Sync {
    fn create(&self, info: &mut SmgrInfo) -> Result<()>;
    fn open(&self, info: &mut SmgrInfo) -> Result<()>;
    fn close(&self, info: &mut SmgrInfo) -> Result<()>;
    fn unlink(&self, info: &mut SmgrInfo) -> Result<()>;
    /// Append `count` copies of `page` at end-of-file; returns the new
    /// block count.
    fn extend(&self, info: &mut SmgrInfo, page: &[u8], count: usize) -> Result<BlockNumber>;
    fn read(&self, info: &SmgrInfo, block: BlockNumber, page: &mut [u8]) -> Result<()>;
    fn write(&self, info: &SmgrInfo, block: BlockNumber, page: &[u8]) -> Result<()>;
    /// Write and force to disk.
    fn flush(&self, info: &SmgrInfo, block: BlockNumber, page: &[u8]) -> Result<()>;
    fn mark_dirty(&self, info: &SmgrInfo) -> Result<()>;
    fn nblocks(&self, info: &mut SmgrInfo) -> Result<BlockNumber>;
    fn truncate(&self, info: &mut SmgrInfo, nblocks: BlockNumber) -> Result<BlockNumber>;
    fn sync(&self, info: &SmgrInfo) -> Result<()>;

    /// Transaction end: commit forces dirty state down, abort drops the
    /// dirty bits without a sync.
    fn commit(&self, info: &SmgrInfo) -> Result<()> {
        self.sync(info)
    }

    fn abort(&self, _info: &SmgrInfo) -> Result<()> {
        Ok(())
    }
}

/// Single-file-per-relation backend.
pub struct DiskManager {
    vfs: Arc<VfdPool>,
    data_dir: PathBuf,
}

/// Path of a relation file, computable without a catalog.
pub fn relation_path(data_dir: &Path, db_name: &str, rel_name: &str) -> PathBuf {
    if db_name.is_empty() || db_name == "global" {
        data_dir.join("global").join(rel_name)
    } else {
        data_dir.join("base").join(db_name).join(rel_name)
    }
}

impl DiskManager {
    pub fn new(vfs: Arc<VfdPool>, data_dir: impl Into<PathBuf>) -> Self {
        DiskManager {
            vfs,
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path_for(&self, info: &SmgrInfo) -> PathBuf {
        relation_path(&self.data_dir, &info.db_name, &info.rel_name)
    }

    fn require_open(&self, info: &SmgrInfo) -> Result<FileId> {
        if info.file.is_valid() {
            Ok(info.file)
        } else {
            Err(StorageError::RelationClosed(info.rel))
        }
    }
}

impl Smgr for DiskManager {
    fn create(&self, info: &mut SmgrInfo) -> Result<()> {
        let path = self.path_for(info);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match self
            .vfs
            .open(&path, OpenDisposition::create_exclusive(), true)
        {
            Ok(file) => {
                info.file = file;
                info.unlinked = false;
                info.nblocks = 0;
                Ok(())
            }
            Err(StorageError::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // an empty leftover file may be reused
                let file = self.vfs.open(&path, OpenDisposition::read_write(), true)?;
                let len = self.vfs.file_size(file)?;
                if len != 0 {
                    self.vfs.close(file)?;
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("relation file {} already exists", path.display()),
                    )));
                }
                info.file = file;
                info.unlinked = false;
                info.nblocks = 0;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn open(&self, info: &mut SmgrInfo) -> Result<()> {
        let path = self.path_for(info);
        let file = self.vfs.open(&path, OpenDisposition::read_write(), false)?;
        info.file = file;
        info.unlinked = false;
        Ok(())
    }

    fn close(&self, info: &mut SmgrInfo) -> Result<()> {
        if info.file.is_valid() {
            self.vfs.close(info.file)?;
            info.file = FileId::INVALID;
        }
        Ok(())
    }

    fn unlink(&self, info: &mut SmgrInfo) -> Result<()> {
        if info.unlinked && !info.file.is_valid() {
            return Ok(());
        }
        let file = self.require_open(info)?;
        // Truncate before unlinking: other holders may keep the file open,
        // and a zero-length leftover beats a full-size one.
        self.vfs.base_sync(file, 0)?;
        self.vfs.truncate(file, 0)?;
        self.vfs.unlink(file)?;
        info.file = FileId::INVALID;
        info.unlinked = true;
        info.nblocks = 0;
        Ok(())
    }

    fn extend(&self, info: &mut SmgrInfo, page: &[u8], count: usize) -> Result<BlockNumber> {
        debug_assert_eq!(page.len(), BLCKSZ);
        let file = self.require_open(info)?;
        let mut pos = self.vfs.seek(file, SeekFrom::End(0))?;
        if pos % BLCKSZ as u64 != 0 {
            warn!(rel = %info.rel, pos, "partial trailing block before extension");
            pos -= pos % BLCKSZ as u64;
            self.vfs.truncate(file, pos)?;
            self.vfs.seek(file, SeekFrom::Start(pos))?;
        }
        for _ in 0..count {
            self.vfs.write(file, page)?;
        }
        info.nblocks = (pos / BLCKSZ as u64) as BlockNumber + count as BlockNumber;
        Ok(info.nblocks)
    }

    fn read(&self, info: &SmgrInfo, block: BlockNumber, page: &mut [u8]) -> Result<()> {
        debug_assert_eq!(page.len(), BLCKSZ);
        let file = self.require_open(info)?;
        let pos = block as u64 * BLCKSZ as u64;
        self.vfs.seek(file, SeekFrom::Start(pos))?;
        let got = self.vfs.read(file, page)?;
        if got < BLCKSZ {
            // reading past end-of-file yields a zero page without extending
            let end = self.vfs.file_size(file)?;
            if pos >= end {
                page.fill(0);
                return Ok(());
            }
            if got == 0 {
                return Err(StorageError::corrupt(
                    "smgr",
                    format!("short read of block {block} in {}", info.rel_name),
                ));
            }
            page[got..].fill(0);
        }
        Ok(())
    }

    fn write(&self, info: &SmgrInfo, block: BlockNumber, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), BLCKSZ);
        let file = self.require_open(info)?;
        let pos = block as u64 * BLCKSZ as u64;
        self.vfs.seek(file, SeekFrom::Start(pos))?;
        self.vfs.write(file, page)?;
        Ok(())
    }

    fn flush(&self, info: &SmgrInfo, block: BlockNumber, page: &[u8]) -> Result<()> {
        self.write(info, block, page)?;
        self.vfs.sync(info.file)?;
        Ok(())
    }

    fn mark_dirty(&self, info: &SmgrInfo) -> Result<()> {
        let file = self.require_open(info)?;
        self.vfs.mark_dirty(file)
    }

    fn nblocks(&self, info: &mut SmgrInfo) -> Result<BlockNumber> {
        let file = self.require_open(info)?;
        let len = self.vfs.file_size(file)?;
        info.nblocks = (len / BLCKSZ as u64) as BlockNumber;
        Ok(info.nblocks)
    }

    fn truncate(&self, info: &mut SmgrInfo, nblocks: BlockNumber) -> Result<BlockNumber> {
        let file = self.require_open(info)?;
        let new_len = nblocks as u64 * BLCKSZ as u64;
        // invalidate sibling descriptors before shrinking the file
        self.vfs.base_sync(file, new_len)?;
        let cur = {
            let len = self.vfs.file_size(file)?;
            (len / BLCKSZ as u64) as BlockNumber
        };
        if nblocks > cur {
            return Err(StorageError::BlockOutOfBounds {
                rel: info.rel,
                block: nblocks,
            });
        }
        if nblocks == cur {
            return Ok(cur);
        }
        self.vfs.truncate(file, new_len)?;
        info.nblocks = nblocks;
        debug!(rel = %info.rel, nblocks, "relation truncated");
        Ok(nblocks)
    }

    fn sync(&self, info: &SmgrInfo) -> Result<()> {
        let file = self.require_open(info)?;
        self.vfs.sync(file)
    }
}
