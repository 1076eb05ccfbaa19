//! A complete device: backing storage, the block tunnel in front of it and
//! the controller behind it. Frames are dispatched synchronously as soon as
//! their last block is written.

use tracing::trace;

use se3_core::config::DeviceConfig;
use se3_core::types::cmd_flags;
use se3_core::wire::{BLOCK_SIZE, DISCOVERY_SLOT};
use se3_core::{Se3Result, TransportError};

use crate::controller::DeviceController;
use crate::tunnel::{DeviceTunnel, TunnelWrite};

#[derive(Debug)]
pub struct Se3Device {
    storage: Vec<u8>,
    tunnel: DeviceTunnel,
    controller: DeviceController,
}

impl Se3Device {
    /// A device exposing `blocks` blocks of zeroed storage.
    pub fn new(config: &DeviceConfig, blocks: u64) -> Self {
        Self {
            storage: vec![0u8; blocks as usize * BLOCK_SIZE],
            tunnel: DeviceTunnel::new(config.busy_polls),
            controller: DeviceController::new(config),
        }
    }

    pub fn blocks(&self) -> u64 {
        (self.storage.len() / BLOCK_SIZE) as u64
    }

    pub fn controller(&self) -> &DeviceController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut DeviceController {
        &mut self.controller
    }

    pub fn tunnel(&self) -> &DeviceTunnel {
        &self.tunnel
    }

    fn storage_range(&self, addr: u64) -> Se3Result<std::ops::Range<usize>> {
        if addr >= self.blocks() {
            return Err(TransportError::Malformed(format!(
                "block {addr} beyond the end of a {}-block device",
                self.blocks()
            ))
            .into());
        }
        let start = addr as usize * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }

    /// Host write of one block at `addr`.
    pub fn write_block(&mut self, addr: u64, block: &[u8]) -> Se3Result<()> {
        if block.len() != BLOCK_SIZE {
            return Err(TransportError::Malformed(format!(
                "write of {} bytes is not one block",
                block.len()
            ))
            .into());
        }
        match self.tunnel.write(addr, block) {
            TunnelWrite::Store => {
                let range = self.storage_range(addr)?;
                self.storage[range].copy_from_slice(block);
            }
            TunnelWrite::Absorbed => {}
            TunnelWrite::Request(header, data) => {
                let (status, out) = self.controller.handle_frame(&header, &data);
                trace!(%status, len = out.len(), "response queued");
                let crc = header.word1 & cmd_flags::CRC != 0;
                self.tunnel.respond(header.token, status, &out, crc);
            }
            TunnelWrite::Rejected { token, crc, status } => {
                self.tunnel.respond(token, status, &[], crc);
            }
        }
        Ok(())
    }

    /// Host read of one block at `addr`.
    pub fn read_block(&mut self, addr: u64, out: &mut [u8]) -> Se3Result<()> {
        if out.len() != BLOCK_SIZE {
            return Err(TransportError::Malformed(format!(
                "read of {} bytes is not one block",
                out.len()
            ))
            .into());
        }
        match self.tunnel.slot_of(addr) {
            Some(DISCOVERY_SLOT) => out.copy_from_slice(&self.controller.discovery().encode()),
            Some(slot) => self.tunnel.read_slot(slot, out),
            None => {
                let range = self.storage_range(addr)?;
                out.copy_from_slice(&self.storage[range]);
            }
        }
        Ok(())
    }
}
