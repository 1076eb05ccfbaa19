//! Software crypto backend: per-session algorithm contexts.
//!
//! A context lives serialized in the session arena between CryptoUpdate
//! calls, so every variant has a fixed encoded size chosen at init.

use zeroize::Zeroizing;

use se3_core::types::{split_mode_word, update_flags, AlgorithmInfo};
use se3_core::wire::{ByteReader, ByteWriter};
use se3_core::{Algorithm, CipherMode, Direction, Status};
use se3_crypto::{Aes256Cipher, HmacState, Kdf, ModeState, Pbkdf2Sha256, Sha256State};
use se3_crypto::{BLOCK_SIZE, CHALLENGE_SIZE, KEY_SIZE, TAG_SIZE};

const HAS_IV: u8 = 0x01;
const HAS_MAC: u8 = 0x02;

/// Bytes of PBKDF2 output behind a combined-mode nonce: MAC key then IV.
const NONCE_DERIVED: usize = KEY_SIZE + BLOCK_SIZE;

/// The algorithm table advertised by CryptoList.
pub fn algorithm_table() -> Vec<AlgorithmInfo> {
    vec![
        AlgorithmInfo {
            name: "AES".into(),
            algorithm: Algorithm::Aes,
            block_size: BLOCK_SIZE as u16,
            key_size: KEY_SIZE as u16,
        },
        AlgorithmInfo {
            name: "SHA256".into(),
            algorithm: Algorithm::Sha256,
            block_size: 64,
            key_size: 0,
        },
        AlgorithmInfo {
            name: "HMAC-SHA256".into(),
            algorithm: Algorithm::HmacSha256,
            block_size: 64,
            key_size: 0,
        },
        AlgorithmInfo {
            name: "AES-HMAC-SHA256".into(),
            algorithm: Algorithm::AesHmacSha256,
            block_size: BLOCK_SIZE as u16,
            key_size: KEY_SIZE as u16,
        },
    ]
}

/// Block cipher state, optionally with encrypt-then-MAC authentication.
#[derive(Clone)]
pub struct CipherContext {
    state: ModeState,
    key: Zeroizing<[u8; KEY_SIZE]>,
    iv_ready: bool,
    /// Present for AES-HMAC-SHA256 once the nonce has been set
    mac: Option<HmacState>,
    authenticated: bool,
}

#[derive(Clone)]
pub enum CryptoContext {
    Cipher(CipherContext),
    Digest(Sha256State),
    Hmac(HmacState),
}

impl CryptoContext {
    /// Set up a context for `algorithm`. `key` is the stored key for keyed algorithms.
    pub fn init(algorithm: Algorithm, mode: u16, key: Option<&[u8]>) -> Result<Self, Status> {
        match algorithm {
            Algorithm::Aes | Algorithm::AesHmacSha256 => {
                let (mode, direction) = split_mode_word(mode).ok_or(Status::InvalidParams)?;
                let key: [u8; KEY_SIZE] = key
                    .ok_or(Status::InvalidParams)?
                    .try_into()
                    .map_err(|_| Status::InvalidParams)?;
                Ok(CryptoContext::Cipher(CipherContext {
                    state: ModeState::new(mode, direction),
                    key: Zeroizing::new(key),
                    iv_ready: !mode.needs_iv(),
                    mac: None,
                    authenticated: algorithm == Algorithm::AesHmacSha256,
                }))
            }
            Algorithm::Sha256 => Ok(CryptoContext::Digest(Sha256State::new())),
            Algorithm::HmacSha256 => {
                let key = key.ok_or(Status::InvalidParams)?;
                Ok(CryptoContext::Hmac(HmacState::new(key)))
            }
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            CryptoContext::Cipher(c) if c.authenticated => Algorithm::AesHmacSha256,
            CryptoContext::Cipher(_) => Algorithm::Aes,
            CryptoContext::Digest(_) => Algorithm::Sha256,
            CryptoContext::Hmac(_) => Algorithm::HmacSha256,
        }
    }

    /// One CryptoUpdate step. Returns the output bytes (ciphertext,
    /// plaintext, digest or tag).
    pub fn update(&mut self, flags: u16, data1: &[u8], data2: &[u8]) -> Result<Vec<u8>, Status> {
        let finit = flags & update_flags::FINIT != 0;
        match self {
            CryptoContext::Cipher(cipher) => cipher.update(flags, data1, data2),
            CryptoContext::Digest(state) => {
                state.update(data2);
                Ok(if finit { state.finalize().to_vec() } else { Vec::new() })
            }
            CryptoContext::Hmac(state) => {
                state.update(data2);
                Ok(if finit { state.finalize().to_vec() } else { Vec::new() })
            }
        }
    }

    /// Fixed serialized size for contexts of `algorithm`.
    pub fn encoded_len(algorithm: Algorithm) -> usize {
        match algorithm {
            Algorithm::Aes => 4 + BLOCK_SIZE + KEY_SIZE,
            Algorithm::AesHmacSha256 => 4 + BLOCK_SIZE + KEY_SIZE + HmacState::SERIALIZED_SIZE,
            Algorithm::Sha256 => 1 + Sha256State::SERIALIZED_SIZE,
            Algorithm::HmacSha256 => 1 + HmacState::SERIALIZED_SIZE,
        }
    }

    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let algorithm = self.algorithm();
        let mut w = ByteWriter::with_capacity(Self::encoded_len(algorithm));
        w.bytes(&[algorithm as u8]);
        match self {
            CryptoContext::Cipher(c) => {
                let mut bits = 0;
                if c.iv_ready {
                    bits |= HAS_IV;
                }
                if c.mac.is_some() {
                    bits |= HAS_MAC;
                }
                let direction = match c.state.direction {
                    Direction::Encrypt => 0,
                    Direction::Decrypt => 1,
                };
                w.bytes(&[c.state.mode as u8, direction, bits])
                    .bytes(&c.state.register)
                    .bytes(c.key.as_ref());
                if c.authenticated {
                    match &c.mac {
                        Some(mac) => w.bytes(&mac.to_bytes()),
                        None => w.bytes(&[0u8; HmacState::SERIALIZED_SIZE]),
                    };
                }
            }
            CryptoContext::Digest(state) => {
                w.bytes(&state.to_bytes());
            }
            CryptoContext::Hmac(state) => {
                w.bytes(&state.to_bytes());
            }
        }
        Zeroizing::new(w.finish())
    }

    /// Decode from the front of an arena payload (trailing bytes ignored).
    pub fn decode(bytes: &[u8]) -> Result<Self, Status> {
        let mut r = ByteReader::new(bytes);
        let algorithm =
            Algorithm::from_wire(u16::from(r.array::<1>()?[0])).ok_or(Status::Hardware)?;
        match algorithm {
            Algorithm::Aes | Algorithm::AesHmacSha256 => {
                let [mode, direction, bits] = r.array::<3>()?;
                let mode = CipherMode::from_wire(mode).ok_or(Status::Hardware)?;
                let direction = match direction {
                    0 => Direction::Encrypt,
                    _ => Direction::Decrypt,
                };
                let mut state = ModeState::new(mode, direction);
                state.register = r.array::<BLOCK_SIZE>()?;
                let key = Zeroizing::new(r.array::<KEY_SIZE>()?);
                let authenticated = algorithm == Algorithm::AesHmacSha256;
                let mac = if authenticated {
                    let raw = r.bytes(HmacState::SERIALIZED_SIZE)?;
                    if bits & HAS_MAC != 0 {
                        Some(HmacState::from_bytes(raw).map_err(|_| Status::Hardware)?)
                    } else {
                        None
                    }
                } else {
                    None
                };
                Ok(CryptoContext::Cipher(CipherContext {
                    state,
                    key,
                    iv_ready: bits & HAS_IV != 0,
                    mac,
                    authenticated,
                }))
            }
            Algorithm::Sha256 => {
                let raw = r.bytes(Sha256State::SERIALIZED_SIZE)?;
                Ok(CryptoContext::Digest(
                    Sha256State::from_bytes(raw).map_err(|_| Status::Hardware)?,
                ))
            }
            Algorithm::HmacSha256 => {
                let raw = r.bytes(HmacState::SERIALIZED_SIZE)?;
                Ok(CryptoContext::Hmac(
                    HmacState::from_bytes(raw).map_err(|_| Status::Hardware)?,
                ))
            }
        }
    }
}

impl CipherContext {
    fn update(&mut self, flags: u16, data1: &[u8], data2: &[u8]) -> Result<Vec<u8>, Status> {
        if flags & update_flags::SET_NONCE != 0 {
            if !self.authenticated || data1.len() != CHALLENGE_SIZE {
                return Err(Status::InvalidParams);
            }
            let mut derived = Zeroizing::new([0u8; NONCE_DERIVED]);
            Pbkdf2Sha256.derive(self.key.as_ref(), data1, 1, derived.as_mut());
            self.mac = Some(HmacState::new(&derived[..KEY_SIZE]));
            self.state
                .set_iv(&derived[KEY_SIZE..])
                .map_err(|_| Status::InvalidParams)?;
            self.iv_ready = true;
        } else if flags & (update_flags::SET_IV | update_flags::RESET) != 0 {
            self.state.set_iv(data1).map_err(|_| Status::InvalidParams)?;
            self.iv_ready = true;
        }

        if data2.len() % BLOCK_SIZE != 0 {
            return Err(Status::InvalidParams);
        }
        if !self.iv_ready || (self.authenticated && self.mac.is_none()) {
            return Err(Status::InvalidState);
        }
        let wants_tag = flags & update_flags::AUTH != 0;
        if wants_tag && !self.authenticated {
            return Err(Status::InvalidParams);
        }

        let cipher = Aes256Cipher::new(self.key.as_ref()).map_err(|_| Status::Hardware)?;
        let mut out = data2.to_vec();
        if let (Some(mac), Direction::Decrypt) = (self.mac.as_mut(), self.state.direction) {
            mac.update(data2);
        }
        self.state
            .process(&cipher, &mut out)
            .map_err(|_| Status::InvalidParams)?;
        if let (Some(mac), Direction::Encrypt) = (self.mac.as_mut(), self.state.direction) {
            mac.update(&out);
        }

        if wants_tag && flags & update_flags::FINIT != 0 {
            if let Some(mac) = &self.mac {
                out.extend_from_slice(&mac.finalize()[..TAG_SIZE]);
            }
        }
        Ok(out)
    }
}
