//! In-process emulated device.
//!
//! [`EmulatedDevice`] is a shared handle on one [`Se3Device`]; every
//! [`EmulatedDisk`] taken from it is a `BlockTransport` view starting at a
//! base block, standing in for a marker file on a mounted volume. Opening a
//! disk takes the device-wide lock, so two disks on one device behave like
//! two processes contending for the same marker file.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::debug;

use se3_core::config::DeviceConfig;
use se3_core::wire::{FrameHeader, BLOCK_SIZE};
use se3_core::{L0Command, Se3Result, TransportError};
use se3_transport::BlockTransport;

use crate::device::Se3Device;

/// Size of the emulated volume.
pub const EMULATED_BLOCKS: u64 = 4096;

struct Shared {
    device: Se3Device,
    locked: bool,
}

/// Cloneable handle on one emulated device.
#[derive(Clone)]
pub struct EmulatedDevice {
    inner: Arc<(Mutex<Shared>, Condvar)>,
}

/// Serial number field from config text: 64 hex digits, or text padded with zeros.
pub fn parse_serial(text: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    match hex::decode(text) {
        Ok(bytes) if bytes.len() == out.len() => out.copy_from_slice(&bytes),
        _ => {
            let n = text.len().min(out.len());
            out[..n].copy_from_slice(&text.as_bytes()[..n]);
        }
    }
    out
}

impl EmulatedDevice {
    /// A fresh device straight off the line: no serial, default PINs.
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            inner: Arc::new((
                Mutex::new(Shared {
                    device: Se3Device::new(config, EMULATED_BLOCKS),
                    locked: false,
                }),
                Condvar::new(),
            )),
        }
    }

    /// A device that has already been through factory init with the
    /// configured serial.
    pub fn provisioned(config: &DeviceConfig) -> Se3Result<Self> {
        let device = Self::new(config);
        let header = FrameHeader {
            word0: L0Command::FactoryInit as u16,
            ..FrameHeader::default()
        };
        let serial = parse_serial(&config.serial);
        let (status, _) = device.with_device(|d| d.controller_mut().handle_frame(&header, &serial));
        status.check()?;
        Ok(device)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the device with the state lock held.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut Se3Device) -> R) -> R {
        f(&mut self.lock().device)
    }

    /// A block view whose block 0 is device block `base`.
    pub fn disk(&self, base: u64) -> EmulatedDisk {
        EmulatedDisk {
            device: self.clone(),
            base,
            open: false,
        }
    }
}

impl std::fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock();
        f.debug_struct("EmulatedDevice")
            .field("locked", &shared.locked)
            .field("device", &shared.device)
            .finish()
    }
}

#[derive(Debug)]
pub struct EmulatedDisk {
    device: EmulatedDevice,
    base: u64,
    open: bool,
}

impl EmulatedDisk {
    pub fn device(&self) -> &EmulatedDevice {
        &self.device
    }

    fn check(&self, len: usize) -> Se3Result<()> {
        if !self.open {
            return Err(TransportError::Closed.into());
        }
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(TransportError::Malformed(format!(
                "buffer of {len} bytes is not a whole number of blocks"
            ))
            .into());
        }
        Ok(())
    }
}

impl BlockTransport for EmulatedDisk {
    fn open(&mut self, deadline: Instant) -> Se3Result<()> {
        if self.open {
            return Ok(());
        }
        let (mutex, cvar) = &*self.device.inner;
        let mut shared = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while shared.locked {
            let now = Instant::now();
            if now >= deadline {
                debug!(base = self.base, "emulated device is locked");
                return Err(TransportError::Locked.into());
            }
            shared = cvar
                .wait_timeout(shared, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        shared.locked = true;
        self.open = true;
        Ok(())
    }

    fn read(&mut self, block: usize, buf: &mut [u8]) -> Se3Result<()> {
        self.check(buf.len())?;
        let mut shared = self.device.lock();
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            shared
                .device
                .read_block(self.base + (block + i) as u64, chunk)?;
        }
        Ok(())
    }

    fn write(&mut self, block: usize, buf: &[u8]) -> Se3Result<()> {
        self.check(buf.len())?;
        let mut shared = self.device.lock();
        for (i, chunk) in buf.chunks(BLOCK_SIZE).enumerate() {
            shared
                .device
                .write_block(self.base + (block + i) as u64, chunk)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let (mutex, cvar) = &*self.device.inner;
        mutex.lock().unwrap_or_else(PoisonError::into_inner).locked = false;
        cvar.notify_all();
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for EmulatedDisk {
    fn drop(&mut self) {
        self.close();
    }
}
