//! Crypto session table.
//!
//! Session ids are `generation << 16 | index`. Each index carries a
//! generation counter that moves on every release, so an id that outlived
//! its session resolves to `Expired` rather than hitting a newer session
//! that reused the slot.

use tracing::{debug, trace};

use se3_core::Status;

use crate::arena::{Arena, ArenaError};
use crate::backend::CryptoContext;

/// Concurrent crypto sessions per device.
pub const MAX_SESSIONS: usize = 100;

pub struct SessionTable {
    arena: Arena,
    generations: Vec<u16>,
}

fn split_sid(sid: u32) -> (u16, usize) {
    ((sid >> 16) as u16, (sid & 0xFFFF) as usize)
}

impl SessionTable {
    pub fn new(arena_size: usize) -> Self {
        Self {
            arena: Arena::new(arena_size, MAX_SESSIONS),
            generations: vec![1; MAX_SESSIONS],
        }
    }

    pub fn active(&self) -> usize {
        (0..MAX_SESSIONS)
            .filter(|&i| self.arena.is_allocated(i))
            .count()
    }

    pub fn free_bytes(&self) -> usize {
        self.arena.free_bytes()
    }

    /// Store a new context and hand out its session id.
    pub fn open(&mut self, ctx: &CryptoContext) -> Result<u32, Status> {
        let index = (0..MAX_SESSIONS)
            .find(|&i| !self.arena.is_allocated(i))
            .ok_or(Status::Memory)?;
        let encoded = ctx.encode();
        self.arena
            .alloc(index, encoded.len())
            .map_err(|err| match err {
                ArenaError::OutOfMemory { .. } => Status::Memory,
                _ => Status::Hardware,
            })?;
        self.write(index, &encoded)?;
        let sid = u32::from(self.generations[index]) << 16 | index as u32;
        debug!(sid, algorithm = ?ctx.algorithm(), "crypto session opened");
        Ok(sid)
    }

    /// Map a session id to its arena slot.
    fn resolve(&self, sid: u32) -> Result<usize, Status> {
        let (generation, index) = split_sid(sid);
        if index >= MAX_SESSIONS {
            return Err(Status::Resource);
        }
        if generation != self.generations[index] {
            return Err(Status::Expired);
        }
        if !self.arena.is_allocated(index) {
            return Err(Status::Resource);
        }
        Ok(index)
    }

    pub fn load(&self, sid: u32) -> Result<CryptoContext, Status> {
        let index = self.resolve(sid)?;
        let bytes = self.arena.get(index).ok_or(Status::Resource)?;
        CryptoContext::decode(bytes)
    }

    /// Write back an updated context. The encoded size never changes after
    /// open, so this is always in place.
    pub fn store(&mut self, sid: u32, ctx: &CryptoContext) -> Result<(), Status> {
        let index = self.resolve(sid)?;
        self.write(index, &ctx.encode())
    }

    fn write(&mut self, index: usize, encoded: &[u8]) -> Result<(), Status> {
        let slot = self.arena.get_mut(index).ok_or(Status::Hardware)?;
        if slot.len() < encoded.len() {
            return Err(Status::Hardware);
        }
        slot[..encoded.len()].copy_from_slice(encoded);
        Ok(())
    }

    /// Release a session. Its id is dead from here on.
    pub fn close(&mut self, sid: u32) -> Result<(), Status> {
        let index = self.resolve(sid)?;
        self.release(index);
        trace!(sid, "crypto session closed");
        Ok(())
    }

    fn release(&mut self, index: usize) {
        self.arena.free(index);
        let next = self.generations[index].wrapping_add(1);
        self.generations[index] = if next == 0 { 1 } else { next };
    }

    /// Drop every session, as on logout.
    pub fn clear(&mut self) {
        for index in 0..MAX_SESSIONS {
            if self.arena.is_allocated(index) {
                self.release(index);
            }
        }
        self.arena.clear();
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("active", &self.active())
            .field("arena", &self.arena)
            .finish()
    }
}
