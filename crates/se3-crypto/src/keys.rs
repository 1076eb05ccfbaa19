//! Session key material and the login challenge-response derivations.

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use se3_core::CryptoError;

use crate::primitives::{hkdf_derive, tags_equal, Kdf};
use crate::{CHALLENGE_SIZE, KEY_SIZE, LOGIN_KDF_ITERATIONS, TOKEN_SIZE};

/// HKDF info string separating the envelope MAC key from the cipher key.
const PAYLOAD_AUTH_INFO: &[u8] = b"se3-payload-auth";

/// A 256-bit session key. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; KEY_SIZE],
}

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Key for the envelope HMAC, derived so the cipher key never doubles as a MAC key.
    pub fn mac_key(&self) -> Result<[u8; KEY_SIZE], CryptoError> {
        hkdf_derive(&self.bytes, PAYLOAD_AUTH_INFO)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 32-byte PIN record. Shorter input is zero-padded; the unconfigured
/// PIN is all zeros.
#[derive(Clone, Default)]
pub struct Pin {
    bytes: [u8; KEY_SIZE],
}

impl Pin {
    pub fn new(input: &[u8]) -> Result<Self, CryptoError> {
        if input.len() > KEY_SIZE {
            return Err(CryptoError::Length(format!(
                "PIN is at most {KEY_SIZE} bytes, got {}",
                input.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes[..input.len()].copy_from_slice(input);
        Ok(Self { bytes })
    }

    pub fn from_secret(secret: &SecretString) -> Result<Self, CryptoError> {
        Self::new(secret.expose_secret().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pin").field("bytes", &"[REDACTED]").finish()
    }
}

/// 16-byte session token proving continuity of a login.
#[derive(Clone, Copy, Default)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    /// Constant-time comparison against a received token.
    pub fn matches(&self, other: &[u8]) -> bool {
        tags_equal(&self.0, other)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

/// Fresh random 32-byte challenge.
pub fn random_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut out = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// The three values both sides derive from the PIN during login.
///
/// - `cresp = KDF(pin, sc, 32)`: what the host must send to finish login
/// - `sresp = KDF(pin, cc1, 32)`: the device's proof that it knows the PIN
/// - `key = KDF(pin, cc2, 1)`: the session key
pub struct LoginProofs {
    pub cresp: [u8; CHALLENGE_SIZE],
    pub sresp: [u8; CHALLENGE_SIZE],
    pub key: SessionKey,
}

impl LoginProofs {
    pub fn derive<K: Kdf>(
        kdf: &K,
        pin: &Pin,
        sc: &[u8; CHALLENGE_SIZE],
        cc1: &[u8; CHALLENGE_SIZE],
        cc2: &[u8; CHALLENGE_SIZE],
    ) -> Self {
        let mut cresp = [0u8; CHALLENGE_SIZE];
        let mut sresp = [0u8; CHALLENGE_SIZE];
        let mut key = [0u8; KEY_SIZE];
        kdf.derive(pin.as_bytes(), sc, LOGIN_KDF_ITERATIONS, &mut cresp);
        kdf.derive(pin.as_bytes(), cc1, LOGIN_KDF_ITERATIONS, &mut sresp);
        kdf.derive(pin.as_bytes(), cc2, 1, &mut key);
        Self {
            cresp,
            sresp,
            key: SessionKey::from_bytes(key),
        }
    }
}

impl Drop for LoginProofs {
    fn drop(&mut self) {
        self.cresp.zeroize();
        self.sresp.zeroize();
    }
}

impl std::fmt::Debug for LoginProofs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginProofs")
            .field("cresp", &"[REDACTED]")
            .field("sresp", &"[REDACTED]")
            .field("key", &self.key)
            .finish()
    }
}
