//! Shadow log: full-page-image crash recovery.
//!
//! A log transaction is a header block (magic, log id, segment count,
//! completed flag) followed by segments. Each segment is one metadata
//! block (magic, sequence number, block count, the per-block storage-info
//! records) followed by that many full page images. Replay applies page
//! images from completed, in-sequence log transactions only, stopping at
//! the first incomplete or out-of-order header.
//!
//! Index pages that appear in the log are mirrored into a side index log;
//! when no data log transaction could be replayed, the index log alone
//! yields the list of index pages whose pointers must be validated.
//!
//! Logging is single-writer: the database writer thread owns the log
//! between `begin_log` and `commit_log`.

use crate::config::{keys, Properties};
use crate::error::{Result, StorageError};
use crate::storage::smgr::{decode_info, encode_info, relation_path, SmgrInfo, SMGR_INFO_WIRE_SIZE};
use crate::storage::vfd::{FileId, OpenDisposition, VfdPool};
use crate::types::{BlockNumber, Oid, RelKind, BLCKSZ};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const HEADER_MAGIC: u64 = 0xCAFE08072006BABE;
const SEGMENT_MAGIC: u64 = 0xABCDEF0123456789;
const INDEX_MAGIC: u64 = 0x9876543210FEDCBA;

const SEG_HEADER_SIZE: usize = 24;
const IDX_HEADER_SIZE: usize = 16;

/// Storage-info records per segment metadata block.
const MAX_SEG_BLOCKS: usize = (BLCKSZ - SEG_HEADER_SIZE) / SMGR_INFO_WIRE_SIZE;
const MAX_IDX_BLOCKS: usize = (BLCKSZ - IDX_HEADER_SIZE) / SMGR_INFO_WIRE_SIZE;

/// An index page recovered from the log; its pointers must be validated
/// by the index machinery before reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPage {
    pub db: Oid,
    pub rel: Oid,
    pub db_name: String,
    pub block: BlockNumber,
}

struct SegmentBuffer {
    seg_id: u64,
    count: usize,
    meta: Vec<u8>,
    pages: Vec<u8>,
}

impl SegmentBuffer {
    fn new() -> Self {
        SegmentBuffer {
            seg_id: 0,
            count: 0,
            meta: vec![0u8; BLCKSZ],
            pages: vec![0u8; MAX_SEG_BLOCKS * BLCKSZ],
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.meta.fill(0);
    }
}

struct IndexBuffer {
    count: usize,
    block: Vec<u8>,
    /// Filled metadata blocks waiting for `expire_logs`.
    spilled: Vec<Vec<u8>>,
}

pub struct ShadowLog {
    vfs: Arc<VfdPool>,
    data_dir: PathBuf,
    log_file: FileId,
    index_file: FileId,
    log_count: u64,
    /// Offset of the current log transaction's header block.
    header_pos: u64,
    segments: u64,
    segment: SegmentBuffer,
    index: IndexBuffer,
}

fn write_header_block(block: &mut [u8], log_id: u64, segments: u64, completed: bool) {
    block.fill(0);
    block[..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
    block[8..16].copy_from_slice(&log_id.to_le_bytes());
    block[16..24].copy_from_slice(&segments.to_le_bytes());
    block[24] = completed as u8;
}

struct LogHeader {
    log_id: u64,
    segments: u64,
    completed: bool,
}

fn read_header_block(block: &[u8]) -> Option<LogHeader> {
    let magic = u64::from_le_bytes(block[..8].try_into().unwrap());
    if magic != HEADER_MAGIC {
        return None;
    }
    Some(LogHeader {
        log_id: u64::from_le_bytes(block[8..16].try_into().unwrap()),
        segments: u64::from_le_bytes(block[16..24].try_into().unwrap()),
        completed: block[24] != 0,
    })
}

impl ShadowLog {
    pub fn open(vfs: Arc<VfdPool>, data_dir: impl Into<PathBuf>, props: &Properties) -> Result<Self> {
        let data_dir = data_dir.into();
        let log_name = props.get(keys::VFD_LOGFILE).unwrap_or("pg_shadowlog");
        let idx_name = props.get(keys::VFD_INDEXLOG).unwrap_or("pg_indexlog");
        let log_path = data_dir.join(log_name);
        let idx_path = data_dir.join(idx_name);

        let log_file = vfs.open(
            &log_path,
            OpenDisposition {
                write: true,
                create: true,
                mode: 0o600,
                ..Default::default()
            },
            true,
        )?;
        let index_file = vfs.open(
            &idx_path,
            OpenDisposition {
                write: true,
                create: true,
                mode: 0o600,
                ..Default::default()
            },
            true,
        )?;

        // continue log ids from the last header on disk, if any
        let mut log_count = 0;
        let mut block = vec![0u8; BLCKSZ];
        vfs.seek(log_file, SeekFrom::Start(0))?;
        if vfs.read(log_file, &mut block)? == BLCKSZ {
            match read_header_block(&block) {
                Some(header) => log_count = header.log_id,
                None => {
                    return Err(StorageError::ShadowLog(format!(
                        "{} is not a shadow log",
                        log_path.display()
                    )))
                }
            }
        }

        Ok(ShadowLog {
            vfs,
            data_dir,
            log_file,
            index_file,
            log_count,
            header_pos: 0,
            segments: 0,
            segment: SegmentBuffer::new(),
            index: IndexBuffer {
                count: 0,
                block: vec![0u8; BLCKSZ],
                spilled: Vec::new(),
            },
        })
    }

    /// Reserve a header at the log tail with completed = false.
    pub fn begin_log(&mut self) -> Result<()> {
        let mut block = vec![0u8; BLCKSZ];
        write_header_block(&mut block, self.log_count, 0, false);
        self.log_count += 1;
        self.header_pos = self.vfs.seek(self.log_file, SeekFrom::End(0))?;
        self.vfs.write(self.log_file, &block)?;
        self.vfs.sync(self.log_file)?;
        self.segments = 0;
        self.segment.reset();
        self.index.count = 0;
        Ok(())
    }

    /// Buffer one page image. Index-relation blocks are mirrored into the
    /// index side-log.
    pub fn log_block(&mut self, info: &SmgrInfo, block: BlockNumber, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), BLCKSZ);
        if self.segment.count == MAX_SEG_BLOCKS {
            self.flush_segment()?;
        }
        let slot = self.segment.count;
        encode_info(
            info,
            block,
            &mut self.segment.meta[SEG_HEADER_SIZE + slot * SMGR_INFO_WIRE_SIZE..],
        );
        self.segment.pages[slot * BLCKSZ..(slot + 1) * BLCKSZ].copy_from_slice(page);
        self.segment.count += 1;

        if info.kind == RelKind::Index {
            if self.index.count + 1 >= MAX_IDX_BLOCKS {
                self.spill_index_block();
            }
            let slot = self.index.count;
            encode_info(
                info,
                block,
                &mut self.index.block[IDX_HEADER_SIZE + slot * SMGR_INFO_WIRE_SIZE..],
            );
            self.index.count += 1;
        }
        Ok(())
    }

    fn flush_segment(&mut self) -> Result<()> {
        if self.segment.count == 0 {
            return Ok(());
        }
        self.segment.meta[..8].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        self.segment.meta[8..16].copy_from_slice(&self.segments.to_le_bytes());
        self.segment.meta[16..18].copy_from_slice(&(self.segment.count as u16).to_le_bytes());
        self.segments += 1;

        self.vfs.seek(self.log_file, SeekFrom::End(0))?;
        self.vfs.write(self.log_file, &self.segment.meta)?;
        self.vfs
            .write(self.log_file, &self.segment.pages[..self.segment.count * BLCKSZ])?;
        self.segment.reset();
        Ok(())
    }

    fn spill_index_block(&mut self) {
        if self.index.count == 0 {
            return;
        }
        self.index.block[..8].copy_from_slice(&INDEX_MAGIC.to_le_bytes());
        self.index.block[8..12].copy_from_slice(&(self.index.count as u32).to_le_bytes());
        self.index.spilled.push(std::mem::replace(
            &mut self.index.block,
            vec![0u8; BLCKSZ],
        ));
        self.index.count = 0;
    }

    /// Flush the partial segment, fsync, rewrite the header completed.
    pub fn commit_log(&mut self) -> Result<()> {
        self.flush_segment()?;
        self.vfs.sync(self.log_file)?;

        let mut block = vec![0u8; BLCKSZ];
        write_header_block(&mut block, self.log_count - 1, self.segments, true);
        self.vfs
            .seek(self.log_file, SeekFrom::Start(self.header_pos))?;
        self.vfs.write(self.log_file, &block)?;
        self.vfs.sync(self.log_file)?;
        Ok(())
    }

    /// Persist the accumulated index log and truncate the main log to
    /// nothing: the logged changes are durably in the data files now.
    pub fn expire_logs(&mut self) -> Result<()> {
        self.spill_index_block();
        self.vfs.seek(self.index_file, SeekFrom::Start(0))?;
        let blocks = self.index.spilled.len();
        for block in self.index.spilled.drain(..) {
            self.vfs.write(self.index_file, &block)?;
        }
        self.vfs
            .truncate(self.index_file, (blocks * BLCKSZ) as u64)?;

        self.vfs.truncate(self.log_file, 0)?;
        self.vfs.seek(self.log_file, SeekFrom::Start(0))?;
        self.vfs.sync(self.log_file)?;
        self.header_pos = 0;
        Ok(())
    }

    /// Replay completed log transactions from offset zero; must run at
    /// startup before any client is admitted. Returns recovered index
    /// pages for pointer cleanup.
    pub fn replay_logs(&mut self) -> Result<Vec<RecoveredPage>> {
        info!("replaying shadow storage log");
        let mut recovered = Vec::new();
        let end = self.vfs.seek(self.log_file, SeekFrom::End(0))?;
        self.vfs.seek(self.log_file, SeekFrom::Start(0))?;

        let mut block = vec![0u8; BLCKSZ];
        let mut total: u64 = 0;
        let mut last_id: Option<u64> = None;
        let mut replayed_any = false;

        while total < end {
            if self.vfs.read(self.log_file, &mut block)? != BLCKSZ {
                warn!("shadow log ends mid-header");
                break;
            }
            total += BLCKSZ as u64;
            let Some(header) = read_header_block(&block) else {
                warn!("invalid shadow log header, stopping replay");
                break;
            };
            if !header.completed {
                debug!(log_id = header.log_id, "incomplete log transaction, stopping");
                last_id = Some(header.log_id);
                break;
            }
            if let Some(prev) = last_id {
                if prev + 1 != header.log_id {
                    warn!(log_id = header.log_id, "out-of-sequence log transaction, stopping");
                    break;
                }
            }
            last_id = Some(header.log_id);
            debug!(log_id = header.log_id, segments = header.segments, "replaying log transaction");

            for _ in 0..header.segments {
                total += self.replay_segment(&mut recovered)?;
            }
            replayed_any = true;
        }

        if let Some(id) = last_id {
            self.log_count = id + 1;
        }

        if !replayed_any {
            self.replay_index_log(&mut recovered)?;
        }
        Ok(recovered)
    }

    fn replay_segment(&mut self, recovered: &mut Vec<RecoveredPage>) -> Result<u64> {
        let mut meta = vec![0u8; BLCKSZ];
        if self.vfs.read(self.log_file, &mut meta)? != BLCKSZ {
            return Err(StorageError::ShadowLog("segment header truncated".into()));
        }
        let magic = u64::from_le_bytes(meta[..8].try_into().unwrap());
        if magic != SEGMENT_MAGIC {
            return Err(StorageError::ShadowLog("segment magic mismatch".into()));
        }
        let count = u16::from_le_bytes(meta[16..18].try_into().unwrap()) as usize;
        let mut consumed = BLCKSZ as u64;

        let mut page = vec![0u8; BLCKSZ];
        let mut current: Option<(Oid, Oid, FileId)> = None;
        for slot in 0..count.min(MAX_SEG_BLOCKS) {
            if self.vfs.read(self.log_file, &mut page)? != BLCKSZ {
                self.close_current(&mut current);
                return Err(StorageError::ShadowLog("segment image truncated".into()));
            }
            consumed += BLCKSZ as u64;
            let (info, block) =
                decode_info(&meta[SEG_HEADER_SIZE + slot * SMGR_INFO_WIRE_SIZE..]);
            debug!(rel = %info.rel, rel_name = %info.rel_name, block, "replay page image");

            let reopen = match current {
                Some((db, rel, _)) => db != info.rel.db || rel != info.rel.rel,
                None => true,
            };
            if reopen {
                self.close_current(&mut current);
                let path = relation_path(&self.data_dir, &info.db_name, &info.rel_name);
                match self.vfs.open(&path, OpenDisposition::read_write(), true) {
                    Ok(fd) => current = Some((info.rel.db, info.rel.rel, fd)),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "target missing, page image skipped");
                        current = None;
                    }
                }
            }
            if let Some((_, _, fd)) = current {
                self.vfs
                    .seek(fd, SeekFrom::Start(block as u64 * BLCKSZ as u64))?;
                self.vfs.write(fd, &page)?;
                if info.kind == RelKind::Index {
                    recovered.push(RecoveredPage {
                        db: info.rel.db,
                        rel: info.rel.rel,
                        db_name: info.db_name.clone(),
                        block,
                    });
                }
            }
        }
        self.close_current(&mut current);
        Ok(consumed)
    }

    fn close_current(&self, current: &mut Option<(Oid, Oid, FileId)>) {
        if let Some((_, _, fd)) = current.take() {
            if let Err(err) = self.vfs.sync(fd) {
                warn!(%err, "sync during shadow replay");
            }
            let _ = self.vfs.close(fd);
        }
    }

    fn replay_index_log(&mut self, recovered: &mut Vec<RecoveredPage>) -> Result<()> {
        let mut block = vec![0u8; BLCKSZ];
        self.vfs.seek(self.index_file, SeekFrom::Start(0))?;
        loop {
            if self.vfs.read(self.index_file, &mut block)? != BLCKSZ {
                break;
            }
            let magic = u64::from_le_bytes(block[..8].try_into().unwrap());
            if magic != INDEX_MAGIC {
                break;
            }
            let count = u32::from_le_bytes(block[8..12].try_into().unwrap()) as usize;
            for slot in 0..count.min(MAX_IDX_BLOCKS) {
                let (info, blk) =
                    decode_info(&block[IDX_HEADER_SIZE + slot * SMGR_INFO_WIRE_SIZE..]);
                recovered.push(RecoveredPage {
                    db: info.rel.db,
                    rel: info.rel.rel,
                    db_name: info.db_name,
                    block: blk,
                });
            }
        }
        Ok(())
    }

    /// Leave a terminating incomplete header and release the files.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut block = vec![0u8; BLCKSZ];
        write_header_block(&mut block, self.log_count, 0, false);
        self.vfs.seek(self.log_file, SeekFrom::End(0))?;
        self.vfs.write(self.log_file, &block)?;
        self.vfs.close(self.log_file)?;
        self.log_file = FileId::INVALID;

        self.spill_index_block();
        self.vfs.seek(self.index_file, SeekFrom::End(0))?;
        let spilled = std::mem::take(&mut self.index.spilled);
        for blk in spilled {
            self.vfs.write(self.index_file, &blk)?;
        }
        self.vfs.close(self.index_file)?;
        self.index_file = FileId::INVALID;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelFileId;
    use tempfile::TempDir;

    fn setup() -> (Arc<VfdPool>, TempDir) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("base/db")).unwrap();
        (Arc::new(VfdPool::new(&Properties::new())), dir)
    }

    fn heap_info(name: &str) -> SmgrInfo {
        SmgrInfo::new(RelFileId::new(1, 200), "db", name, RelKind::Heap)
    }

    #[test]
    fn committed_log_replays_page_images() {
        let (vfs, dir) = setup();
        let target = relation_path(dir.path(), "db", "t");
        std::fs::write(&target, vec![0u8; 2 * BLCKSZ]).unwrap();

        let mut shadow = ShadowLog::open(vfs.clone(), dir.path(), &Properties::new()).unwrap();
        shadow.begin_log().unwrap();
        let image = vec![0x5Au8; BLCKSZ];
        shadow.log_block(&heap_info("t"), 1, &image).unwrap();
        shadow.commit_log().unwrap();

        let recovered = shadow.replay_logs().unwrap();
        assert!(recovered.is_empty());

        let on_disk = std::fs::read(&target).unwrap();
        assert_eq!(&on_disk[BLCKSZ..2 * BLCKSZ], &image[..]);
        // block 0 untouched
        assert!(on_disk[..BLCKSZ].iter().all(|&b| b == 0));
    }

    #[test]
    fn replay_is_idempotent() {
        let (vfs, dir) = setup();
        let target = relation_path(dir.path(), "db", "t");
        std::fs::write(&target, vec![0u8; BLCKSZ]).unwrap();

        let mut shadow = ShadowLog::open(vfs.clone(), dir.path(), &Properties::new()).unwrap();
        shadow.begin_log().unwrap();
        shadow
            .log_block(&heap_info("t"), 0, &vec![7u8; BLCKSZ])
            .unwrap();
        shadow.commit_log().unwrap();

        shadow.replay_logs().unwrap();
        let first = std::fs::read(&target).unwrap();
        shadow.replay_logs().unwrap();
        let second = std::fs::read(&target).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn incomplete_log_is_not_replayed() {
        let (vfs, dir) = setup();
        let target = relation_path(dir.path(), "db", "t");
        std::fs::write(&target, vec![0u8; BLCKSZ]).unwrap();

        let mut shadow = ShadowLog::open(vfs.clone(), dir.path(), &Properties::new()).unwrap();
        shadow.begin_log().unwrap();
        shadow
            .log_block(&heap_info("t"), 0, &vec![9u8; BLCKSZ])
            .unwrap();
        // no commit: header still carries completed = false

        // flush buffered segment bytes so the file is nonempty either way
        shadow.flush_segment().unwrap();
        let recovered = shadow.replay_logs().unwrap();
        assert!(recovered.is_empty());

        let on_disk = std::fs::read(&target).unwrap();
        assert!(on_disk.iter().all(|&b| b == 0), "page must stay untouched");
    }

    #[test]
    fn index_pages_surface_in_recovered_list() {
        let (vfs, dir) = setup();
        let target = relation_path(dir.path(), "db", "idx");
        std::fs::write(&target, vec![0u8; BLCKSZ]).unwrap();

        let mut shadow = ShadowLog::open(vfs.clone(), dir.path(), &Properties::new()).unwrap();
        let mut info = heap_info("idx");
        info.kind = RelKind::Index;
        shadow.begin_log().unwrap();
        shadow.log_block(&info, 0, &vec![1u8; BLCKSZ]).unwrap();
        shadow.commit_log().unwrap();

        let recovered = shadow.replay_logs().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].block, 0);
        assert_eq!(recovered[0].rel, 200);
    }

    #[test]
    fn expire_truncates_the_log() {
        let (vfs, dir) = setup();
        let mut shadow = ShadowLog::open(vfs.clone(), dir.path(), &Properties::new()).unwrap();
        shadow.begin_log().unwrap();
        shadow
            .log_block(&heap_info("t"), 0, &vec![1u8; BLCKSZ])
            .unwrap();
        shadow.commit_log().unwrap();
        shadow.expire_logs().unwrap();

        let log_path = dir.path().join("pg_shadowlog");
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);
    }
}
