//! se3-device: the device half of the secure channel.
//!
//! A [`Se3Device`] owns a block volume, the tunnel state machine that
//! recognises protocol traffic among ordinary writes, and the
//! [`DeviceController`] that runs commands. [`EmulatedDevice`] wraps one in
//! a shareable handle whose disks implement `BlockTransport`, so a host
//! client can be driven end to end without hardware.

pub mod arena;
pub mod backend;
pub mod controller;
pub mod device;
pub mod emulator;
pub mod keystore;
pub mod sessions;
pub mod tunnel;

pub use arena::{Arena, ArenaError};
pub use backend::{algorithm_table, CryptoContext};
pub use controller::{DeviceController, LoginState, VendorHandler};
pub use device::Se3Device;
pub use emulator::{parse_serial, EmulatedDevice, EmulatedDisk, EMULATED_BLOCKS};
pub use keystore::{FlashKeyStore, KeyRecord, StoreError, KEY_MAX};
pub use sessions::{SessionTable, MAX_SESSIONS};
pub use tunnel::{DeviceTunnel, TunnelState, TunnelWrite};
