//! Relation descriptors and the shared relation lookup cache.
//!
//! A descriptor owns the storage-manager state for one on-disk relation.
//! Descriptors are shared: concurrent callers receive clones of one
//! `Arc<Relation>` from the cache and the smgr state is guarded by the
//! descriptor's mutex.

use crate::error::Result;
use crate::storage::smgr::{Smgr, SmgrInfo};
use crate::types::{BlockNumber, RelFileId, RelKind, BLCKSZ};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type RelationRef = Arc<Relation>;

/// Attribute widths: fixed-size attributes sit at computed offsets,
/// variable ones carry a u16 length prefix in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrLen {
    Fixed(usize),
    Variable,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub len: AttrLen,
}

impl Attribute {
    pub fn fixed(name: &str, len: usize) -> Self {
        Attribute {
            name: name.to_string(),
            len: AttrLen::Fixed(len),
        }
    }

    pub fn variable(name: &str) -> Self {
        Attribute {
            name: name.to_string(),
            len: AttrLen::Variable,
        }
    }
}

/// Walk a payload laid out per `attrs`, yielding each attribute's content
/// range. An empty descriptor means the payload is opaque.
pub fn payload_cells(
    attrs: &[Attribute],
    payload: &[u8],
) -> crate::error::Result<Vec<std::ops::Range<usize>>> {
    let mut cells = Vec::with_capacity(attrs.len());
    let mut pos = 0usize;
    for attr in attrs {
        match attr.len {
            AttrLen::Fixed(len) => {
                if pos + len > payload.len() {
                    return Err(crate::error::StorageError::corrupt(
                        "tuple",
                        format!("attribute {} overruns the payload", attr.name),
                    ));
                }
                cells.push(pos..pos + len);
                pos += len;
            }
            AttrLen::Variable => {
                if pos + 2 > payload.len() {
                    return Err(crate::error::StorageError::corrupt(
                        "tuple",
                        format!("attribute {} missing its length prefix", attr.name),
                    ));
                }
                let len =
                    u16::from_le_bytes(payload[pos..pos + 2].try_into().unwrap()) as usize;
                pos += 2;
                if pos + len > payload.len() {
                    return Err(crate::error::StorageError::corrupt(
                        "tuple",
                        format!("attribute {} overruns the payload", attr.name),
                    ));
                }
                cells.push(pos..pos + len);
                pos += len;
            }
        }
    }
    Ok(cells)
}

/// Build a payload from attribute contents per `attrs`.
pub fn encode_payload(attrs: &[Attribute], cells: &[&[u8]]) -> Vec<u8> {
    debug_assert_eq!(attrs.len(), cells.len());
    let mut out = Vec::new();
    for (attr, cell) in attrs.iter().zip(cells) {
        match attr.len {
            AttrLen::Fixed(len) => {
                debug_assert_eq!(cell.len(), len);
                out.extend_from_slice(cell);
            }
            AttrLen::Variable => {
                out.extend_from_slice(&(cell.len() as u16).to_le_bytes());
                out.extend_from_slice(cell);
            }
        }
    }
    out
}

pub struct Relation {
    pub id: RelFileId,
    pub name: String,
    pub db_name: String,
    pub kind: RelKind,
    /// System relations get conservative extent growth and oid stamping.
    pub is_system: bool,
    /// Created by this transaction only; skipped by background scans.
    pub xact_only: bool,
    /// Special-space bytes reserved when this relation's pages initialize.
    pub special_size: usize,
    attributes: Mutex<Vec<Attribute>>,
    smgr: Arc<dyn Smgr>,
    info: Mutex<SmgrInfo>,
}

impl Relation {
    pub fn new(
        smgr: Arc<dyn Smgr>,
        id: RelFileId,
        db_name: &str,
        name: &str,
        kind: RelKind,
    ) -> Self {
        Relation {
            id,
            name: name.to_string(),
            db_name: db_name.to_string(),
            kind,
            is_system: name.starts_with("pg_"),
            xact_only: false,
            special_size: 0,
            attributes: Mutex::new(Vec::new()),
            smgr,
            info: Mutex::new(SmgrInfo::new(id, db_name, name, kind)),
        }
    }

    pub fn smgr(&self) -> &Arc<dyn Smgr> {
        &self.smgr
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        self.attributes.lock().unwrap().clone()
    }

    pub fn set_attributes(&self, attrs: Vec<Attribute>) {
        *self.attributes.lock().unwrap() = attrs;
    }

    /// Snapshot of the storage info (names, block count) for logging.
    pub fn info_snapshot(&self) -> SmgrInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn create_storage(&self) -> Result<()> {
        let mut info = self.info.lock().unwrap();
        self.smgr.create(&mut info)
    }

    pub fn open_storage(&self) -> Result<()> {
        let mut info = self.info.lock().unwrap();
        if !info.file.is_valid() {
            self.smgr.open(&mut info)?;
        }
        Ok(())
    }

    pub fn close_storage(&self) -> Result<()> {
        let mut info = self.info.lock().unwrap();
        self.smgr.close(&mut info)
    }

    pub fn unlink_storage(&self) -> Result<()> {
        let mut info = self.info.lock().unwrap();
        self.smgr.unlink(&mut info)
    }

    pub fn read_block(&self, block: BlockNumber, page: &mut [u8]) -> Result<()> {
        debug_assert_eq!(page.len(), BLCKSZ);
        let info = self.info.lock().unwrap();
        self.smgr.read(&info, block, page)
    }

    pub fn write_block(&self, block: BlockNumber, page: &[u8]) -> Result<()> {
        let info = self.info.lock().unwrap();
        self.smgr.write(&info, block, page)
    }

    pub fn flush_block(&self, block: BlockNumber, page: &[u8]) -> Result<()> {
        let info = self.info.lock().unwrap();
        self.smgr.flush(&info, block, page)
    }

    /// Append `count` blocks seeded from `page`; returns the new count.
    pub fn extend(&self, page: &[u8], count: usize) -> Result<BlockNumber> {
        let mut info = self.info.lock().unwrap();
        self.smgr.extend(&mut info, page, count)
    }

    pub fn nblocks(&self) -> Result<BlockNumber> {
        let mut info = self.info.lock().unwrap();
        self.smgr.nblocks(&mut info)
    }

    pub fn truncate(&self, nblocks: BlockNumber) -> Result<BlockNumber> {
        let mut info = self.info.lock().unwrap();
        self.smgr.truncate(&mut info, nblocks)
    }

    pub fn sync(&self) -> Result<()> {
        let info = self.info.lock().unwrap();
        self.smgr.sync(&info)
    }

    pub fn mark_dirty(&self) -> Result<()> {
        let info = self.info.lock().unwrap();
        self.smgr.mark_dirty(&info)
    }
}

impl std::fmt::Debug for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Shared lookup cache: one descriptor per open relation.
pub struct RelationCache {
    smgr: Arc<dyn Smgr>,
    open: Mutex<HashMap<RelFileId, RelationRef>>,
}

impl RelationCache {
    pub fn new(smgr: Arc<dyn Smgr>) -> Self {
        RelationCache {
            smgr,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Create the on-disk storage for a new relation and cache its
    /// descriptor.
    pub fn create(
        &self,
        id: RelFileId,
        db_name: &str,
        name: &str,
        kind: RelKind,
    ) -> Result<RelationRef> {
        let rel = Arc::new(Relation::new(self.smgr.clone(), id, db_name, name, kind));
        rel.create_storage()?;
        self.open.lock().unwrap().insert(id, rel.clone());
        Ok(rel)
    }

    /// Open (or return the cached descriptor of) an existing relation.
    pub fn open(
        &self,
        id: RelFileId,
        db_name: &str,
        name: &str,
        kind: RelKind,
    ) -> Result<RelationRef> {
        if let Some(rel) = self.open.lock().unwrap().get(&id) {
            return Ok(rel.clone());
        }
        let rel = Arc::new(Relation::new(self.smgr.clone(), id, db_name, name, kind));
        rel.open_storage()?;
        self.open.lock().unwrap().insert(id, rel.clone());
        Ok(rel)
    }

    pub fn lookup(&self, id: RelFileId) -> Option<RelationRef> {
        self.open.lock().unwrap().get(&id).cloned()
    }

    /// Drop the cache entry; the descriptor dies with its last holder.
    pub fn forget(&self, id: RelFileId) {
        self.open.lock().unwrap().remove(&id);
    }

    pub fn all_open(&self) -> Vec<RelationRef> {
        self.open.lock().unwrap().values().cloned().collect()
    }

    pub fn close_all(&self) -> Result<()> {
        let all = {
            let mut open = self.open.lock().unwrap();
            let all: Vec<_> = open.values().cloned().collect();
            open.clear();
            all
        };
        for rel in all {
            rel.close_storage()?;
        }
        Ok(())
    }
}
