//! Session scratch arena.
//!
//! A fixed byte region carved into variable-size entries, each prefixed by
//! a 4-byte header:
//!
//! ```text
//! [size u16][info u16][payload ...]
//! info = VALID (bit 15) | slot index (bits 0..15)
//! ```
//!
//! `size` covers header and payload and is a multiple of 4, so the entries
//! tile the arena exactly. An index table maps slot numbers to entry
//! offsets for O(1) lookup. Freeing only clears the valid bit; entries move
//! solely during defragmentation, which rebuilds the index table.

use thiserror::Error;
use tracing::debug;

const HEADER: usize = 4;
const ALIGN: usize = 4;
const VALID: u16 = 0x8000;
const INDEX_MASK: u16 = 0x7FFF;
/// Smallest remainder worth splitting off as a free entry.
const MIN_ENTRY: usize = HEADER + ALIGN;

/// Largest arena whose entry sizes fit the 16-bit header field.
pub const MAX_ARENA: usize = 0xFFFC;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("out of arena memory: need {need} bytes, {free} free")]
    OutOfMemory { need: usize, free: usize },

    #[error("slot {0} out of range")]
    BadSlot(usize),

    #[error("slot {0} already allocated")]
    InUse(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    offset: usize,
    size: usize,
    info: u16,
}

impl Entry {
    fn is_valid(&self) -> bool {
        self.info & VALID != 0
    }

    fn slot(&self) -> usize {
        (self.info & INDEX_MASK) as usize
    }
}

pub struct Arena {
    mem: Vec<u8>,
    index: Vec<Option<usize>>,
}

impl Arena {
    /// `size` is rounded down to a multiple of 4 and capped at [`MAX_ARENA`].
    pub fn new(size: usize, slots: usize) -> Self {
        let size = (size.min(MAX_ARENA) / ALIGN * ALIGN).max(MIN_ENTRY);
        let mut arena = Self {
            mem: vec![0u8; size],
            index: vec![None; slots.min(INDEX_MASK as usize + 1)],
        };
        arena.set_header(0, size, 0);
        arena
    }

    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    pub fn slots(&self) -> usize {
        self.index.len()
    }

    fn header(&self, offset: usize) -> Entry {
        let size = u16::from_le_bytes([self.mem[offset], self.mem[offset + 1]]) as usize;
        let info = u16::from_le_bytes([self.mem[offset + 2], self.mem[offset + 3]]);
        Entry { offset, size, info }
    }

    fn set_header(&mut self, offset: usize, size: usize, info: u16) {
        self.mem[offset..offset + 2].copy_from_slice(&(size as u16).to_le_bytes());
        self.mem[offset + 2..offset + 4].copy_from_slice(&info.to_le_bytes());
    }

    fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.mem.len() {
            let entry = self.header(offset);
            if entry.size < HEADER {
                break;
            }
            out.push(entry);
            offset += entry.size;
        }
        out
    }

    /// Total bytes (headers included) held by free entries.
    pub fn free_bytes(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| !e.is_valid())
            .map(|e| e.size)
            .sum()
    }

    fn find_free(&self, need: usize) -> Option<Entry> {
        self.entries()
            .into_iter()
            .find(|e| !e.is_valid() && e.size >= need)
    }

    fn take(&mut self, entry: Entry, need: usize, slot: usize) {
        let info = VALID | slot as u16;
        if entry.size - need >= MIN_ENTRY {
            self.set_header(entry.offset, need, info);
            self.set_header(entry.offset + need, entry.size - need, 0);
        } else {
            self.set_header(entry.offset, entry.size, info);
        }
        let size = self.header(entry.offset).size;
        self.mem[entry.offset + HEADER..entry.offset + size].fill(0);
        self.index[slot] = Some(entry.offset);
    }

    /// Allocate `len` payload bytes for `slot`, compacting and then
    /// defragmenting when no single free entry is large enough.
    pub fn alloc(&mut self, slot: usize, len: usize) -> Result<(), ArenaError> {
        match self.index.get(slot) {
            None => return Err(ArenaError::BadSlot(slot)),
            Some(Some(_)) => return Err(ArenaError::InUse(slot)),
            Some(None) => {}
        }
        let need = (HEADER + len).next_multiple_of(ALIGN);

        if let Some(entry) = self.find_free(need) {
            self.take(entry, need, slot);
            return Ok(());
        }
        let free = self.free_bytes();
        if free < need {
            return Err(ArenaError::OutOfMemory { need, free });
        }

        self.merge_free();
        if let Some(entry) = self.find_free(need) {
            self.take(entry, need, slot);
            return Ok(());
        }

        self.defragment();
        match self.find_free(need) {
            Some(entry) => {
                self.take(entry, need, slot);
                Ok(())
            }
            None => Err(ArenaError::OutOfMemory { need, free }),
        }
    }

    /// Release `slot`. Returns whether it was allocated.
    pub fn free(&mut self, slot: usize) -> bool {
        let Some(offset) = self.index.get_mut(slot).and_then(Option::take) else {
            return false;
        };
        let entry = self.header(offset);
        self.mem[offset + HEADER..offset + entry.size].fill(0);
        self.set_header(offset, entry.size, 0);
        true
    }

    /// Merge runs of adjacent free entries in place.
    pub fn merge_free(&mut self) {
        let mut offset = 0;
        while offset < self.mem.len() {
            let entry = self.header(offset);
            if !entry.is_valid() {
                let mut size = entry.size;
                while offset + size < self.mem.len() {
                    let next = self.header(offset + size);
                    if next.is_valid() {
                        break;
                    }
                    size += next.size;
                }
                if size != entry.size {
                    self.set_header(offset, size, 0);
                }
                offset += size;
            } else {
                offset += entry.size;
            }
        }
    }

    /// Slide every valid entry to the front, leave one free entry at the
    /// tail and rebuild the index table.
    pub fn defragment(&mut self) {
        let live: Vec<Entry> = self.entries().into_iter().filter(Entry::is_valid).collect();
        self.index.iter_mut().for_each(|slot| *slot = None);

        let mut cursor = 0;
        for entry in &live {
            self.mem.copy_within(entry.offset..entry.offset + entry.size, cursor);
            if let Some(slot) = self.index.get_mut(entry.slot()) {
                *slot = Some(cursor);
            }
            cursor += entry.size;
        }
        if cursor < self.mem.len() {
            self.mem[cursor..].fill(0);
            let tail = self.mem.len() - cursor;
            self.set_header(cursor, tail, 0);
        }
        debug!(live = live.len(), used = cursor, "arena defragmented");
    }

    pub fn get(&self, slot: usize) -> Option<&[u8]> {
        let offset = (*self.index.get(slot)?)?;
        let entry = self.header(offset);
        Some(&self.mem[offset + HEADER..offset + entry.size])
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        let offset = (*self.index.get(slot)?)?;
        let entry = self.header(offset);
        Some(&mut self.mem[offset + HEADER..offset + entry.size])
    }

    pub fn is_allocated(&self, slot: usize) -> bool {
        matches!(self.index.get(slot), Some(Some(_)))
    }

    /// Release every slot and reset to one free entry.
    pub fn clear(&mut self) {
        self.mem.fill(0);
        let size = self.mem.len();
        self.set_header(0, size, 0);
        self.index.iter_mut().for_each(|slot| *slot = None);
    }

    /// Check the layout rules: entries tile the arena exactly and
    /// the index table and valid entries point at each other.
    pub fn check(&self) -> Result<(), String> {
        let entries = self.entries();
        let total: usize = entries.iter().map(|e| e.size).sum();
        if total != self.mem.len() {
            return Err(format!("entries cover {total} of {} bytes", self.mem.len()));
        }
        for (slot, offset) in self.index.iter().enumerate() {
            if let Some(offset) = offset {
                let entry = entries
                    .iter()
                    .find(|e| e.offset == *offset)
                    .ok_or_else(|| format!("slot {slot} points inside an entry"))?;
                if !entry.is_valid() || entry.slot() != slot {
                    return Err(format!("slot {slot} points at a foreign entry"));
                }
            }
        }
        for entry in entries.iter().filter(|e| e.is_valid()) {
            if self.index.get(entry.slot()).copied().flatten() != Some(entry.offset) {
                return Err(format!("valid entry at {} is unindexed", entry.offset));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.mem.len())
            .field("allocated", &self.index.iter().flatten().count())
            .finish()
    }
}
