//! Append-only key log on (emulated) flash.
//!
//! ```text
//! [id u32][len u16][data len] [id u32][len u16][data len] ... [0xFF erased]
//! ```
//!
//! Lookup is a linear scan. Deleting a node overwrites its id with 0, which
//! on NOR flash only clears bits. The store does not enforce id uniqueness
//! or id ranges; the command handler does both before calling in.

use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Erased flash reads back as 0xFF.
const ERASED: u8 = 0xFF;
const NODE_HEADER: usize = 6;
/// Id of a deleted node.
const FREE_ID: u32 = 0;
const END_ID: u32 = 0xFFFF_FFFF;

/// Largest key the store accepts.
pub const KEY_MAX: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key flash is full")]
    Full,

    #[error("key length {0} outside 1..={KEY_MAX}")]
    BadLength(usize),
}

/// One stored key. The value is wiped when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: u32,
    pub data: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

pub struct FlashKeyStore {
    flash: Vec<u8>,
    /// Offset of the first erased byte
    end: usize,
}

impl FlashKeyStore {
    /// A freshly erased flash of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            flash: vec![ERASED; size],
            end: 0,
        }
    }

    /// Mount an existing flash image, finding the end of the log.
    pub fn from_image(flash: Vec<u8>) -> Self {
        let mut store = Self { flash, end: 0 };
        store.end = store
            .nodes()
            .last()
            .map(|(offset, _, len)| offset + NODE_HEADER + len)
            .unwrap_or(0);
        store
    }

    pub fn image(&self) -> &[u8] {
        &self.flash
    }

    pub fn capacity(&self) -> usize {
        self.flash.len()
    }

    pub fn used(&self) -> usize {
        self.end
    }

    /// (offset, id, len) of every node in the log, deleted ones included.
    fn nodes(&self) -> Vec<(usize, u32, usize)> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset + NODE_HEADER <= self.flash.len() {
            let id = u32::from_le_bytes([
                self.flash[offset],
                self.flash[offset + 1],
                self.flash[offset + 2],
                self.flash[offset + 3],
            ]);
            if id == END_ID {
                break;
            }
            let len = u16::from_le_bytes([self.flash[offset + 4], self.flash[offset + 5]]) as usize;
            if offset + NODE_HEADER + len > self.flash.len() {
                break;
            }
            out.push((offset, id, len));
            offset += NODE_HEADER + len;
        }
        out
    }

    fn live(&self) -> impl Iterator<Item = (usize, u32, usize)> {
        self.nodes().into_iter().filter(|(_, id, _)| *id != FREE_ID)
    }

    /// First live record with `id`.
    pub fn find(&self, id: u32) -> Option<KeyRecord> {
        let (offset, _, len) = self.live().find(|(_, node_id, _)| *node_id == id)?;
        let data = self.flash[offset + NODE_HEADER..offset + NODE_HEADER + len].to_vec();
        Some(KeyRecord {
            id,
            data: Zeroizing::new(data),
        })
    }

    pub fn contains(&self, id: u32) -> bool {
        self.live().any(|(_, node_id, _)| node_id == id)
    }

    /// Number of live nodes carrying `id`.
    pub fn count(&self, id: u32) -> usize {
        self.live().filter(|(_, node_id, _)| *node_id == id).count()
    }

    /// Append a record. Space held by deleted nodes is reclaimed when the
    /// log runs out of erased flash.
    pub fn insert(&mut self, id: u32, data: &[u8]) -> Result<(), StoreError> {
        if data.is_empty() || data.len() > KEY_MAX {
            return Err(StoreError::BadLength(data.len()));
        }
        let need = NODE_HEADER + data.len();
        if self.end + need > self.flash.len() {
            self.reclaim();
            if self.end + need > self.flash.len() {
                return Err(StoreError::Full);
            }
        }
        let at = self.end;
        self.flash[at..at + 4].copy_from_slice(&id.to_le_bytes());
        self.flash[at + 4..at + 6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        self.flash[at + NODE_HEADER..at + need].copy_from_slice(data);
        self.end += need;
        debug!(id, len = data.len(), "key stored");
        Ok(())
    }

    /// Mark the first live node with `id` deleted. Returns whether one existed.
    pub fn delete(&mut self, id: u32) -> bool {
        let Some((offset, _, len)) = self.live().find(|(_, node_id, _)| *node_id == id) else {
            return false;
        };
        self.flash[offset..offset + 4].copy_from_slice(&FREE_ID.to_le_bytes());
        self.flash[offset + NODE_HEADER..offset + NODE_HEADER + len].zeroize();
        debug!(id, "key deleted");
        true
    }

    /// `(id, len)` of live records, skipping `skip` and returning at most `max`.
    pub fn list(&self, skip: usize, max: usize) -> Vec<(u32, u16)> {
        self.live()
            .skip(skip)
            .take(max)
            .map(|(_, id, len)| (id, len as u16))
            .collect()
    }

    /// Erase-and-rewrite: copy live nodes into a fresh image.
    fn reclaim(&mut self) {
        let mut fresh = vec![ERASED; self.flash.len()];
        let mut end = 0;
        for (offset, _, len) in self.live() {
            let size = NODE_HEADER + len;
            fresh[end..end + size].copy_from_slice(&self.flash[offset..offset + size]);
            end += size;
        }
        let reclaimed = self.end - end;
        self.flash.zeroize();
        self.flash = fresh;
        self.end = end;
        debug!(reclaimed, "key flash reclaimed");
    }
}

impl std::fmt::Debug for FlashKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashKeyStore")
            .field("capacity", &self.flash.len())
            .field("used", &self.end)
            .finish()
    }
}
