//! se3-transport: host side of the block tunnel
//!
//! The device is reachable only through ordinary 512-byte block reads and
//! writes on a hidden marker file at the root of its mass-storage volume.
//!
//! - `block`: the `BlockTransport` capability and its file-backed implementation
//! - `discovery`: mount enumeration, marker creation, slot claiming, discovery block
//! - `tunnel`: request/response frames over a `BlockTransport` (the `Transport` trait)

pub mod block;
pub mod discovery;
pub mod tunnel;

pub use block::{BlockTransport, FileTransport};
pub use discovery::{discover, identify, DeviceDescriptor};
pub use tunnel::{Response, Transport, Tunnel};
