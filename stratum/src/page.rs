//! Fixed-size page layout.
//!
//! A page is `BLCKSZ` bytes: a 12-byte header, a line pointer array growing
//! up from the low end, and tuple bodies packed down from the high end.
//! Invariants: `lower <= upper`, every used line pointer references a
//! non-overlapping range inside `[upper, special)`, and the line pointer
//! array only shrinks during fragmentation repair.
//!
//! Header fields, in order: lower u16, upper u16, special u16, checksum
//! u16, flags u16, free-hint u16. A line pointer packs into a u32 as
//! offset (15 bits), used flag (1 bit), length (15 bits).

use crate::error::{Result, StorageError};
use crate::types::{OffsetNumber, BLCKSZ, FIRST_OFFSET};

pub const PAGE_HEADER_SIZE: usize = 12;
pub const LINE_POINTER_SIZE: usize = 4;

/// Largest tuple (header included) a page can hold.
pub const MAX_TUPLE_SIZE: usize = BLCKSZ - max_align(PAGE_HEADER_SIZE + LINE_POINTER_SIZE);

pub const fn max_align(len: usize) -> usize {
    (len + 7) & !7
}

const OFF_LOWER: usize = 0;
const OFF_UPPER: usize = 2;
const OFF_SPECIAL: usize = 4;
const OFF_CHECKSUM: usize = 6;
#[allow(dead_code)]
const OFF_FLAGS: usize = 8;
const OFF_FREE_HINT: usize = 10;

const LP_USED: u32 = 0x8000;
const LP_OFF_MASK: u32 = 0x7fff;
const LP_LEN_SHIFT: u32 = 16;
const LP_LEN_MASK: u32 = 0x7fff;

/// One slot of the line pointer array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePointer {
    pub offset: u16,
    pub length: u16,
    pub used: bool,
}

impl LinePointer {
    pub const UNUSED: LinePointer = LinePointer {
        offset: 0,
        length: 0,
        used: false,
    };

    fn pack(self) -> u32 {
        let mut word = (self.offset as u32) & LP_OFF_MASK;
        if self.used {
            word |= LP_USED;
        }
        word | (((self.length as u32) & LP_LEN_MASK) << LP_LEN_SHIFT)
    }

    fn unpack(word: u32) -> Self {
        LinePointer {
            offset: (word & LP_OFF_MASK) as u16,
            length: ((word >> LP_LEN_SHIFT) & LP_LEN_MASK) as u16,
            used: word & LP_USED != 0,
        }
    }
}

/// A page image. Always exactly `BLCKSZ` bytes.
pub struct Page {
    bytes: Box<[u8; BLCKSZ]>,
}

impl Page {
    /// An all-zero page, as produced by reading past end-of-file.
    pub fn zeroed() -> Self {
        Page {
            bytes: Box::new([0u8; BLCKSZ]),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), BLCKSZ);
        let mut page = Page::zeroed();
        page.bytes.copy_from_slice(bytes);
        page
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }

    /// Initialize the header for a fresh page reserving `special_size`
    /// bytes of special space at the high end.
    pub fn init(&mut self, special_size: usize) {
        let special = BLCKSZ - max_align(special_size);
        self.bytes.fill(0);
        self.set_u16(OFF_LOWER, PAGE_HEADER_SIZE as u16);
        self.set_u16(OFF_UPPER, special as u16);
        self.set_u16(OFF_SPECIAL, special as u16);
    }

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.bytes[off], self.bytes[off + 1]])
    }

    fn set_u16(&mut self, off: usize, value: u16) {
        self.bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn lower(&self) -> usize {
        self.get_u16(OFF_LOWER) as usize
    }

    pub fn upper(&self) -> usize {
        self.get_u16(OFF_UPPER) as usize
    }

    pub fn special(&self) -> usize {
        self.get_u16(OFF_SPECIAL) as usize
    }

    pub fn special_data(&self) -> &[u8] {
        &self.bytes[self.special()..]
    }

    pub fn special_data_mut(&mut self) -> &mut [u8] {
        let special = self.special();
        &mut self.bytes[special..]
    }

    /// A page never initialized: the upper bound is still zero.
    pub fn is_new(&self) -> bool {
        self.upper() == 0
    }

    /// No line pointers have ever been allocated.
    pub fn is_empty(&self) -> bool {
        self.lower() <= PAGE_HEADER_SIZE
    }

    /// Number of line pointer slots, used or not.
    pub fn max_offset(&self) -> OffsetNumber {
        if self.is_new() || self.lower() <= PAGE_HEADER_SIZE {
            return 0;
        }
        ((self.lower() - PAGE_HEADER_SIZE) / LINE_POINTER_SIZE) as OffsetNumber
    }

    /// Space available for a new item, net of the line pointer it would
    /// consume.
    pub fn free_space(&self) -> usize {
        let lower = self.lower();
        let upper = self.upper();
        if upper <= lower {
            return 0;
        }
        (upper - lower).saturating_sub(LINE_POINTER_SIZE)
    }

    fn lp_slot(offset: OffsetNumber) -> usize {
        PAGE_HEADER_SIZE + (offset as usize - 1) * LINE_POINTER_SIZE
    }

    pub fn line_pointer(&self, offset: OffsetNumber) -> LinePointer {
        debug_assert!(offset >= FIRST_OFFSET && offset <= self.max_offset());
        let slot = Self::lp_slot(offset);
        let word = u32::from_le_bytes([
            self.bytes[slot],
            self.bytes[slot + 1],
            self.bytes[slot + 2],
            self.bytes[slot + 3],
        ]);
        LinePointer::unpack(word)
    }

    pub fn set_line_pointer(&mut self, offset: OffsetNumber, lp: LinePointer) {
        let slot = Self::lp_slot(offset);
        self.bytes[slot..slot + 4].copy_from_slice(&lp.pack().to_le_bytes());
    }

    /// Mark one slot unused without reclaiming its body; compaction does
    /// that.
    pub fn mark_unused(&mut self, offset: OffsetNumber) {
        self.set_line_pointer(offset, LinePointer::UNUSED);
    }

    /// Item bytes for a used slot.
    pub fn item(&self, offset: OffsetNumber) -> Result<&[u8]> {
        let lp = self.line_pointer(offset);
        if !lp.used {
            return Err(StorageError::corrupt(
                "page",
                format!("item {offset} is not in use"),
            ));
        }
        let start = lp.offset as usize;
        let end = start + lp.length as usize;
        if start < self.upper() || end > BLCKSZ {
            return Err(StorageError::corrupt(
                "page",
                format!("item {offset} points outside the tuple area"),
            ));
        }
        Ok(&self.bytes[start..end])
    }

    pub fn item_mut(&mut self, offset: OffsetNumber) -> Result<&mut [u8]> {
        let lp = self.line_pointer(offset);
        if !lp.used {
            return Err(StorageError::corrupt(
                "page",
                format!("item {offset} is not in use"),
            ));
        }
        let start = lp.offset as usize;
        let end = start + lp.length as usize;
        if start < self.upper() || end > BLCKSZ {
            return Err(StorageError::corrupt(
                "page",
                format!("item {offset} points outside the tuple area"),
            ));
        }
        Ok(&mut self.bytes[start..end])
    }

    /// Add an item, returning its offset number, or `None` when the page
    /// has no room. When `at` names an existing unused slot it is recycled;
    /// otherwise the line pointer array grows by one.
    pub fn add_item(&mut self, data: &[u8], at: Option<OffsetNumber>) -> Option<OffsetNumber> {
        if data.len() > MAX_TUPLE_SIZE {
            return None;
        }
        let max_off = self.max_offset();
        let (offset, new_slot) = match at {
            Some(off) if off >= FIRST_OFFSET && off <= max_off => {
                if self.line_pointer(off).used {
                    return None;
                }
                (off, false)
            }
            _ => {
                // reuse the first unused slot before growing the array
                let mut recycled = None;
                for off in FIRST_OFFSET..=max_off {
                    if !self.line_pointer(off).used {
                        recycled = Some(off);
                        break;
                    }
                }
                match recycled {
                    Some(off) => (off, false),
                    None => (max_off + 1, true),
                }
            }
        };

        let body = max_align(data.len());
        let new_lower = self.lower() + if new_slot { LINE_POINTER_SIZE } else { 0 };
        let upper = self.upper();
        if upper < new_lower + body {
            return None;
        }

        let new_upper = upper - body;
        self.bytes[new_upper..new_upper + data.len()].copy_from_slice(data);
        self.set_u16(OFF_UPPER, new_upper as u16);
        if new_slot {
            self.set_u16(OFF_LOWER, new_lower as u16);
        }
        self.set_line_pointer(
            offset,
            LinePointer {
                offset: new_upper as u16,
                length: data.len() as u16,
                used: true,
            },
        );
        Some(offset)
    }

    /// Rewrite the tuple area so used bodies are packed against the special
    /// space, leaving line pointer indices stable.
    pub fn compact(&mut self) {
        let max_off = self.max_offset();
        let special = self.special();

        let mut live: Vec<(OffsetNumber, LinePointer)> = (FIRST_OFFSET..=max_off)
            .map(|off| (off, self.line_pointer(off)))
            .filter(|(_, lp)| lp.used)
            .collect();
        // pack highest current offset first so bodies keep their relative order
        live.sort_by(|a, b| b.1.offset.cmp(&a.1.offset));

        let mut scratch = [0u8; BLCKSZ];
        let mut new_upper = special;
        for (off, lp) in &mut live {
            let len = lp.length as usize;
            new_upper -= max_align(len);
            let src = lp.offset as usize;
            scratch[new_upper..new_upper + len].copy_from_slice(&self.bytes[src..src + len]);
            let moved = LinePointer {
                offset: new_upper as u16,
                length: lp.length,
                used: true,
            };
            self.set_line_pointer(*off, moved);
        }
        self.bytes[new_upper..special].copy_from_slice(&scratch[new_upper..special]);
        self.set_u16(OFF_UPPER, new_upper as u16);
        let hint = self.free_space().min(u16::MAX as usize) as u16;
        self.set_u16(OFF_FREE_HINT, hint);
    }

    /// Compact and additionally drop trailing unused line pointers.
    /// Returns the number of unused slots remaining afterwards.
    pub fn repair_fragmentation(&mut self) -> usize {
        self.compact();
        let mut max_off = self.max_offset();
        while max_off >= FIRST_OFFSET && !self.line_pointer(max_off).used {
            max_off -= 1;
        }
        let lower = PAGE_HEADER_SIZE + max_off as usize * LINE_POINTER_SIZE;
        self.set_u16(OFF_LOWER, lower as u16);

        (FIRST_OFFSET..=max_off)
            .filter(|&off| !self.line_pointer(off).used)
            .count()
    }

    /// Page image checksum over everything but the checksum field itself,
    /// folded to 16 bits. A hint: writers refresh it, readers may ignore it.
    pub fn compute_checksum(&self) -> u16 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.bytes[..OFF_CHECKSUM]);
        hasher.update(&[0, 0]);
        hasher.update(&self.bytes[OFF_CHECKSUM + 2..]);
        let crc = hasher.finalize();
        (crc ^ (crc >> 16)) as u16
    }

    pub fn update_checksum(&mut self) {
        let sum = self.compute_checksum();
        self.set_u16(OFF_CHECKSUM, sum);
    }

    pub fn checksum_ok(&self) -> bool {
        let stored = self.get_u16(OFF_CHECKSUM);
        stored == 0 || stored == self.compute_checksum()
    }

    /// Validate the structural invariants a reader depends on.
    pub fn check(&self) -> Result<()> {
        if self.is_new() {
            return Ok(());
        }
        let lower = self.lower();
        let upper = self.upper();
        let special = self.special();
        if lower < PAGE_HEADER_SIZE || lower > upper || upper > special || special > BLCKSZ {
            return Err(StorageError::corrupt(
                "page",
                format!("bounds out of order: lower {lower} upper {upper} special {special}"),
            ));
        }
        for off in FIRST_OFFSET..=self.max_offset() {
            let lp = self.line_pointer(off);
            if lp.used {
                let start = lp.offset as usize;
                let end = start + lp.length as usize;
                if start < upper || end > special {
                    return Err(StorageError::corrupt(
                        "page",
                        format!("item {off} range {start}..{end} outside tuple area"),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        Page::from_bytes(self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_add() {
        let mut page = Page::zeroed();
        assert!(page.is_new());
        page.init(0);
        assert!(!page.is_new());
        assert!(page.is_empty());

        let off = page.add_item(b"hello world", None).unwrap();
        assert_eq!(off, 1);
        assert_eq!(page.item(off).unwrap(), b"hello world");
        assert_eq!(page.max_offset(), 1);
        assert!(!page.is_empty());
        page.check().unwrap();
    }

    #[test]
    fn add_until_full_then_fail() {
        let mut page = Page::zeroed();
        page.init(0);
        let data = [0xABu8; 1024];
        let mut added = 0;
        while page.add_item(&data, None).is_some() {
            added += 1;
        }
        // 8 x 1032 (aligned body + line pointer) exceeds the usable area
        assert_eq!(added, 7);
        assert!(page.free_space() < max_align(data.len()) + LINE_POINTER_SIZE);
        page.check().unwrap();
    }

    #[test]
    fn compact_reclaims_dead_bodies() {
        let mut page = Page::zeroed();
        page.init(0);
        let a = page.add_item(&[1u8; 100], None).unwrap();
        let b = page.add_item(&[2u8; 100], None).unwrap();
        let c = page.add_item(&[3u8; 100], None).unwrap();
        let before = page.free_space();

        page.mark_unused(b);
        page.compact();

        assert!(page.free_space() >= before + max_align(100));
        assert_eq!(page.item(a).unwrap(), &[1u8; 100][..]);
        assert_eq!(page.item(c).unwrap(), &[3u8; 100][..]);
        assert!(!page.line_pointer(b).used);
        page.check().unwrap();
    }

    #[test]
    fn repair_truncates_trailing_slots() {
        let mut page = Page::zeroed();
        page.init(0);
        let a = page.add_item(&[1u8; 64], None).unwrap();
        let b = page.add_item(&[2u8; 64], None).unwrap();
        let c = page.add_item(&[3u8; 64], None).unwrap();
        page.mark_unused(b);
        page.mark_unused(c);

        let unused = page.repair_fragmentation();
        assert_eq!(unused, 0);
        assert_eq!(page.max_offset(), 1);
        assert_eq!(page.item(a).unwrap(), &[1u8; 64][..]);
        page.check().unwrap();
    }

    #[test]
    fn recycled_slot_is_reused() {
        let mut page = Page::zeroed();
        page.init(0);
        let a = page.add_item(&[1u8; 32], None).unwrap();
        page.mark_unused(a);
        let b = page.add_item(&[2u8; 32], None).unwrap();
        assert_eq!(a, b);
        assert_eq!(page.max_offset(), 1);
    }

    #[test]
    fn checksum_tracks_content() {
        let mut page = Page::zeroed();
        page.init(0);
        page.add_item(b"payload", None).unwrap();
        page.update_checksum();
        assert!(page.checksum_ok());

        let round = Page::from_bytes(page.as_bytes());
        assert!(round.checksum_ok());
    }
}
