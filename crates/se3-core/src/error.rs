use thiserror::Error;

use crate::types::Status;

pub type Se3Result<T> = Result<T, Se3Error>;

#[derive(Debug, Error)]
pub enum Se3Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("device returned {0}")]
    Protocol(Status),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures of the block tunnel itself. None of these are retried by the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("block device is locked by another process")]
    Locked,

    #[error("per-block token gap at block {block}: expected {expected:#010x}, got {got:#010x}")]
    TokenGap { block: usize, expected: u32, got: u32 },

    #[error("frame of {0} bytes does not fit in 15 usable slots")]
    Oversize(usize),

    #[error("device handle is closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authentication tag mismatch: the data was tampered with.
    #[error("data integrity check failed")]
    Integrity,

    #[error("malformed padding")]
    Padding,

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid length: {0}")]
    Length(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Coarse classification of failures, one per family of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    ProtocolState,
    Cryptographic,
    Resource,
    Config,
}

impl Se3Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Se3Error::Transport(_) | Se3Error::Io(_) | Se3Error::Other(_) => ErrorKind::Transport,
            Se3Error::Crypto(_) => ErrorKind::Cryptographic,
            Se3Error::Config(_) => ErrorKind::Config,
            Se3Error::Protocol(status) => status.kind(),
        }
    }

    /// The device status carried by this error, if it came from the device.
    pub fn status(&self) -> Option<Status> {
        match self {
            Se3Error::Protocol(status) => Some(*status),
            _ => None,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Se3Error::Crypto(CryptoError::Integrity))
    }
}

impl From<Status> for Se3Error {
    fn from(status: Status) -> Self {
        Se3Error::Protocol(status)
    }
}
