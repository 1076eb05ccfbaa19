//! se3-core: shared vocabulary for the host client and the device model
//!
//! - `types`: status codes, command codes, flags, access levels, algorithms, key-id ranges
//! - `wire`: fixed 512-byte block layout, frame encode/decode, typed byte reader/writer
//! - `crc`: CRC-16/CCITT-FALSE used by the optional frame checksum
//! - `config`: TOML configuration schema
//! - `error`: error taxonomy shared by every layer

pub mod config;
pub mod crc;
pub mod error;
pub mod types;
pub mod wire;

pub use error::{CryptoError, ErrorKind, Se3Error, Se3Result, TransportError};
pub use types::{AccessLevel, Algorithm, CipherMode, Direction, KeyRange, L0Command, L1Command, Status};
