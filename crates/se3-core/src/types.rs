use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorKind;

// ── Status codes ──────────────────────────────────────────────────────────────

/// Exit/error code carried in the STATUS field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Ok = 0,
    Access = 100,
    Pin = 101,
    Resource = 200,
    Expired = 201,
    Opened = 300,
    Memory = 400,
    Authentication = 401,
    Hardware = 0xF001,
    Communication = 0xF002,
    Busy = 0xF003,
    InvalidState = 0xF004,
    UnknownCommand = 0xF005,
    InvalidParams = 0xF006,
}

impl Status {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Convert to a `Result`, mapping every non-OK status to an error.
    pub fn check(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            Status::Ok | Status::Hardware | Status::Communication | Status::Busy => {
                ErrorKind::Transport
            }
            Status::Access
            | Status::Opened
            | Status::Expired
            | Status::InvalidState
            | Status::UnknownCommand
            | Status::InvalidParams => ErrorKind::ProtocolState,
            Status::Pin | Status::Authentication => ErrorKind::Cryptographic,
            Status::Resource | Status::Memory => ErrorKind::Resource,
        }
    }
}

impl From<u16> for Status {
    /// Unknown wire values are treated as a communication error.
    fn from(code: u16) -> Self {
        match code {
            0 => Status::Ok,
            100 => Status::Access,
            101 => Status::Pin,
            200 => Status::Resource,
            201 => Status::Expired,
            300 => Status::Opened,
            400 => Status::Memory,
            401 => Status::Authentication,
            0xF001 => Status::Hardware,
            0xF003 => Status::Busy,
            0xF004 => Status::InvalidState,
            0xF005 => Status::UnknownCommand,
            0xF006 => Status::InvalidParams,
            _ => Status::Communication,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::Access => "insufficient access",
            Status::Pin => "wrong PIN",
            Status::Resource => "resource not found",
            Status::Expired => "resource expired",
            Status::Opened => "session already open",
            Status::Memory => "out of memory",
            Status::Authentication => "authentication failure",
            Status::Hardware => "hardware failure",
            Status::Communication => "communication error",
            Status::Busy => "busy",
            Status::InvalidState => "invalid state",
            Status::UnknownCommand => "unknown command",
            Status::InvalidParams => "invalid parameters",
        };
        write!(f, "{text} ({:#06x})", self.code())
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Outer (frame-level) command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum L0Command {
    /// Payload is echoed back unchanged.
    Echo = 1,
    /// Program the serial number. Accepted once per device lifetime.
    FactoryInit = 2,
    /// Secure-channel envelope carrying an [`L1Command`].
    L1 = 3,
}

impl TryFrom<u16> for L0Command {
    type Error = Status;

    fn try_from(code: u16) -> Result<Self, Status> {
        match code {
            1 => Ok(L0Command::Echo),
            2 => Ok(L0Command::FactoryInit),
            3 => Ok(L0Command::L1),
            _ => Err(Status::UnknownCommand),
        }
    }
}

/// Commands carried inside the secure-channel envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum L1Command {
    Challenge = 1,
    Login = 2,
    Logout = 3,
    Config = 4,
    KeyEdit = 5,
    KeyList = 6,
    CryptoInit = 7,
    CryptoUpdate = 8,
    CryptoList = 9,
    KeyFind = 10,
    ForcedLogout = 11,
    /// Multiplexed vendor extension used by the key-management layer.
    Vendor = 12,
}

impl L1Command {
    /// Commands accepted without ENCRYPT|SIGN protection.
    pub fn allows_plaintext(self) -> bool {
        matches!(self, L1Command::Challenge | L1Command::ForcedLogout)
    }

    /// Commands exempt from the session token comparison.
    pub fn skips_token_check(self) -> bool {
        matches!(
            self,
            L1Command::Challenge | L1Command::Login | L1Command::ForcedLogout
        )
    }

    /// Minimum access level needed to run the command once logged in.
    pub fn required_access(self) -> AccessLevel {
        match self {
            L1Command::Challenge | L1Command::Login | L1Command::ForcedLogout => {
                AccessLevel::None
            }
            L1Command::KeyEdit | L1Command::Config => AccessLevel::Admin,
            _ => AccessLevel::User,
        }
    }
}

impl TryFrom<u16> for L1Command {
    type Error = Status;

    fn try_from(code: u16) -> Result<Self, Status> {
        Ok(match code {
            1 => L1Command::Challenge,
            2 => L1Command::Login,
            3 => L1Command::Logout,
            4 => L1Command::Config,
            5 => L1Command::KeyEdit,
            6 => L1Command::KeyList,
            7 => L1Command::CryptoInit,
            8 => L1Command::CryptoUpdate,
            9 => L1Command::CryptoList,
            10 => L1Command::KeyFind,
            11 => L1Command::ForcedLogout,
            12 => L1Command::Vendor,
            _ => return Err(Status::UnknownCommand),
        })
    }
}

/// Flags in the outer request header.
pub mod cmd_flags {
    /// Header + payload carry a CRC-16.
    pub const CRC: u16 = 0x0001;
    /// The L1 envelope carries an HMAC in AUTH.
    pub const SIGN: u16 = 0x4000;
    /// The L1 envelope body is encrypted.
    pub const ENCRYPT: u16 = 0x8000;
    pub const SECURE: u16 = SIGN | ENCRYPT;
}

/// Flags of a CryptoUpdate call.
pub mod update_flags {
    /// Last chunk: finalize the cipher and, with AUTH, emit the tag.
    pub const FINIT: u16 = 0x8000;
    /// Re-arm IV/counter from data1 for this call, keeping MAC state.
    pub const RESET: u16 = 0x4000;
    /// Establish the IV from data1 before processing data2.
    pub const SET_IV: u16 = 0x2000;
    /// Derive the authentication key (and IV) from the nonce in data1.
    pub const SET_NONCE: u16 = 0x1000;
    /// Include the trailing authentication tag.
    pub const AUTH: u16 = 0x0800;
}

// ── Access levels ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum AccessLevel {
    #[default]
    None = 0,
    User = 1,
    Admin = 2,
}

impl AccessLevel {
    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            1 => Some(AccessLevel::User),
            2 => Some(AccessLevel::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessLevel::None => "none",
            AccessLevel::User => "user",
            AccessLevel::Admin => "admin",
        })
    }
}

// ── Algorithms ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u16)]
pub enum Algorithm {
    Aes = 0,
    Sha256 = 1,
    HmacSha256 = 2,
    AesHmacSha256 = 3,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::Aes,
        Algorithm::Sha256,
        Algorithm::HmacSha256,
        Algorithm::AesHmacSha256,
    ];

    pub fn from_wire(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|a| *a as u16 == code)
    }

    pub fn is_cipher(self) -> bool {
        matches!(self, Algorithm::Aes | Algorithm::AesHmacSha256)
    }

    pub fn needs_key(self) -> bool {
        self != Algorithm::Sha256
    }
}

/// Block-cipher feedback mode, low byte of the CryptoInit mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CipherMode {
    Ecb = 1,
    Cbc = 2,
    Cfb = 3,
    Ofb = 4,
    Ctr = 5,
}

impl CipherMode {
    pub const ALL: [CipherMode; 5] = [
        CipherMode::Ecb,
        CipherMode::Cbc,
        CipherMode::Cfb,
        CipherMode::Ofb,
        CipherMode::Ctr,
    ];

    pub fn from_wire(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| *m as u8 == code)
    }

    pub fn needs_iv(self) -> bool {
        self != CipherMode::Ecb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Encrypt,
    Decrypt,
}

pub const MODE_ENCRYPT: u16 = 0x0100;
pub const MODE_DECRYPT: u16 = 0x0200;

/// Pack mode and direction into the CryptoInit mode word.
pub fn mode_word(mode: CipherMode, direction: Direction) -> u16 {
    let dir = match direction {
        Direction::Encrypt => MODE_ENCRYPT,
        Direction::Decrypt => MODE_DECRYPT,
    };
    mode as u16 | dir
}

/// Inverse of [`mode_word`]. Exactly one direction bit must be set.
pub fn split_mode_word(word: u16) -> Option<(CipherMode, Direction)> {
    let mode = CipherMode::from_wire((word & 0xFF) as u8)?;
    let direction = match word & 0xFF00 {
        MODE_ENCRYPT => Direction::Encrypt,
        MODE_DECRYPT => Direction::Decrypt,
        _ => return None,
    };
    Some((mode, direction))
}

/// One row of the device's algorithm table (CryptoList).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmInfo {
    pub name: String,
    pub algorithm: Algorithm,
    pub block_size: u16,
    pub key_size: u16,
}

// ── Key ids ───────────────────────────────────────────────────────────────────

/// Sentinel key id for unkeyed algorithms.
pub const NO_KEY: u32 = 0xFFFF_FFFF;

/// Disjoint management ranges of the 32-bit key id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRange {
    Invalid,
    Manual,
    DeviceReserved,
    KmsManaged,
    KmsReserved,
    NoKey,
}

impl KeyRange {
    pub const MANUAL_FIRST: u32 = 1;
    pub const MANUAL_LAST: u32 = 99_999;
    pub const DEVICE_RESERVED_FIRST: u32 = 100_000;
    pub const DEVICE_RESERVED_LAST: u32 = 199_999;
    pub const KMS_MANAGED_FIRST: u32 = 200_000;
    pub const KMS_MANAGED_LAST: u32 = 0xEFFF_FFFF;
    pub const KMS_RESERVED_FIRST: u32 = 0xF000_0000;
    pub const KMS_RESERVED_LAST: u32 = 0xFFFF_FFFE;

    pub fn of(id: u32) -> Self {
        match id {
            0 => KeyRange::Invalid,
            Self::MANUAL_FIRST..=Self::MANUAL_LAST => KeyRange::Manual,
            Self::DEVICE_RESERVED_FIRST..=Self::DEVICE_RESERVED_LAST => KeyRange::DeviceReserved,
            Self::KMS_MANAGED_FIRST..=Self::KMS_MANAGED_LAST => KeyRange::KmsManaged,
            Self::KMS_RESERVED_FIRST..=Self::KMS_RESERVED_LAST => KeyRange::KmsReserved,
            _ => KeyRange::NoKey,
        }
    }
}

// ── Command operands ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyEditOp {
    Insert = 1,
    Delete = 2,
    /// Insert a key whose value the device draws from its RNG.
    InsertGenerated = 3,
}

impl KeyEditOp {
    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            1 => Some(KeyEditOp::Insert),
            2 => Some(KeyEditOp::Delete),
            3 => Some(KeyEditOp::InsertGenerated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConfigOp {
    Get = 1,
    Set = 2,
}

impl ConfigOp {
    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            1 => Some(ConfigOp::Get),
            2 => Some(ConfigOp::Set),
            _ => None,
        }
    }
}

/// Device configuration records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ConfigRecord {
    UserPin = 0,
    AdminPin = 1,
}

impl ConfigRecord {
    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            0 => Some(ConfigRecord::UserPin),
            1 => Some(ConfigRecord::AdminPin),
            _ => None,
        }
    }

    pub fn pin_for(access: AccessLevel) -> Option<Self> {
        match access {
            AccessLevel::User => Some(ConfigRecord::UserPin),
            AccessLevel::Admin => Some(ConfigRecord::AdminPin),
            AccessLevel::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_roundtrip() {
        for status in [
            Status::Ok,
            Status::Access,
            Status::Pin,
            Status::Resource,
            Status::Expired,
            Status::Opened,
            Status::Memory,
            Status::Authentication,
            Status::Hardware,
            Status::Communication,
            Status::Busy,
            Status::InvalidState,
            Status::UnknownCommand,
            Status::InvalidParams,
        ] {
            assert_eq!(Status::from(status.code()), status);
        }
        assert_eq!(Status::from(0x1234), Status::Communication);
    }

    #[test]
    fn test_mode_word() {
        for mode in CipherMode::ALL {
            for dir in [Direction::Encrypt, Direction::Decrypt] {
                assert_eq!(split_mode_word(mode_word(mode, dir)), Some((mode, dir)));
            }
        }
        assert_eq!(split_mode_word(CipherMode::Cbc as u16), None);
        assert_eq!(split_mode_word(0x0300 | CipherMode::Cbc as u16), None);
        assert_eq!(split_mode_word(MODE_ENCRYPT | 9), None);
    }

    #[test]
    fn test_key_range_boundaries() {
        assert_eq!(KeyRange::of(0), KeyRange::Invalid);
        assert_eq!(KeyRange::of(1), KeyRange::Manual);
        assert_eq!(KeyRange::of(99_999), KeyRange::Manual);
        assert_eq!(KeyRange::of(100_000), KeyRange::DeviceReserved);
        assert_eq!(KeyRange::of(199_999), KeyRange::DeviceReserved);
        assert_eq!(KeyRange::of(200_000), KeyRange::KmsManaged);
        assert_eq!(KeyRange::of(0xEFFF_FFFF), KeyRange::KmsManaged);
        assert_eq!(KeyRange::of(0xF000_0000), KeyRange::KmsReserved);
        assert_eq!(KeyRange::of(0xFFFF_FFFE), KeyRange::KmsReserved);
        assert_eq!(KeyRange::of(NO_KEY), KeyRange::NoKey);
    }

    #[test]
    fn test_l1_command_policy() {
        assert!(L1Command::Challenge.allows_plaintext());
        assert!(!L1Command::Login.allows_plaintext());
        assert!(L1Command::Login.skips_token_check());
        assert!(!L1Command::Logout.skips_token_check());
        assert_eq!(L1Command::KeyEdit.required_access(), AccessLevel::Admin);
        assert_eq!(L1Command::CryptoInit.required_access(), AccessLevel::User);
        assert_eq!(L1Command::try_from(99), Err(Status::UnknownCommand));
    }
}
