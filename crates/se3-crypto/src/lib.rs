//! se3-crypto: crypto primitives adapter for the se3 secure channel
//!
//! Architecture: the AES block cipher, SHA-256 compression, HMAC-SHA-256 and
//! PBKDF2 come from RustCrypto crates; everything stateful on top of them is
//! explicit and resumable so a device can park it between requests.
//!
//! ```text
//! PIN ──PBKDF2(challenge)──► login proofs / session key (32 B)
//!                               ├── envelope cipher: AES-256-CBC (key = session key)
//!                               └── envelope MAC key: HKDF-SHA256(session key, "se3-payload-auth")
//! ```
//!
//! - `primitives`: `BlockCipher` and `Kdf` capabilities, HKDF helper, one-shot HMAC
//! - `modes`: ECB/CBC/CFB/OFB/CTR over any `BlockCipher`, with a 16-byte carried state
//! - `digest`: SHA-256 and HMAC-SHA-256 running states serializable to bytes
//! - `padding`: PKCS#7
//! - `keys`: zeroizing key and PIN types, login derivations
//! - `envelope`: `AUTH | IV | TOKEN | LEN | CMD | DATA` sealing and opening

pub mod digest;
pub mod envelope;
pub mod keys;
pub mod modes;
pub mod padding;
pub mod primitives;

pub use digest::{HmacState, Sha256State};
pub use envelope::{Envelope, PayloadCrypto, L1_MAX_DATA};
pub use keys::{random_challenge, LoginProofs, Pin, SessionKey, Token};
pub use modes::ModeState;
pub use padding::{pkcs7_pad, pkcs7_unpad};
pub use primitives::{
    hkdf_derive, hmac_sha256, tags_equal, Aes256Cipher, BlockCipher, Kdf, Pbkdf2Sha256,
};

/// Size of an AES-256 / session key in bytes
pub const KEY_SIZE: usize = 32;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Size of an HMAC-SHA-256 tag / SHA-256 digest
pub const TAG_SIZE: usize = 32;

/// Size of the truncated tag carried in the envelope AUTH field
pub const AUTH_SIZE: usize = 16;

/// Size of login challenges and proofs
pub const CHALLENGE_SIZE: usize = 32;

/// Size of the session token
pub const TOKEN_SIZE: usize = 16;

/// PBKDF2 iterations used for the login proofs
pub const LOGIN_KDF_ITERATIONS: u32 = 32;
