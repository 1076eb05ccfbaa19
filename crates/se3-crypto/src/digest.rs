//! Streaming SHA-256 and HMAC-SHA-256 whose running state is plain data.
//!
//! The device parks an unfinished digest in its session arena between
//! CryptoUpdate calls, so the state must round-trip through bytes. The
//! compression function comes from `sha2`; only the buffering and the
//! final padding live here.

use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use se3_core::CryptoError;

use crate::TAG_SIZE;

const SHA256_BLOCK: usize = 64;

/// Serialized SHA-256 state: `h(32) buffer(64) buffered(1) total(8)`.
const SHA256_STATE_SIZE: usize = 32 + SHA256_BLOCK + 1 + 8;

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

#[derive(Clone, PartialEq, Eq)]
pub struct Sha256State {
    h: [u32; 8],
    buffer: [u8; SHA256_BLOCK],
    buffered: usize,
    total: u64,
}

impl Sha256State {
    pub const SERIALIZED_SIZE: usize = SHA256_STATE_SIZE;

    pub fn new() -> Self {
        Self {
            h: SHA256_IV,
            buffer: [0u8; SHA256_BLOCK],
            buffered: 0,
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total = self.total.wrapping_add(data.len() as u64);

        if self.buffered > 0 {
            let take = data.len().min(SHA256_BLOCK - self.buffered);
            self.buffer[self.buffered..self.buffered + take].copy_from_slice(&data[..take]);
            self.buffered += take;
            data = &data[take..];
            if self.buffered < SHA256_BLOCK {
                return;
            }
            let block = self.buffer;
            self.compress(&block);
            self.buffered = 0;
        }

        let mut blocks = data.chunks_exact(SHA256_BLOCK);
        for block in &mut blocks {
            self.compress(block);
        }
        let tail = blocks.remainder();
        self.buffer[..tail.len()].copy_from_slice(tail);
        self.buffered = tail.len();
    }

    pub fn finalize(&self) -> [u8; TAG_SIZE] {
        let mut state = self.clone();
        let bit_len = state.total.wrapping_mul(8);

        let mut tail = [0u8; 2 * SHA256_BLOCK];
        tail[..state.buffered].copy_from_slice(&state.buffer[..state.buffered]);
        tail[state.buffered] = 0x80;
        let used = if state.buffered + 1 + 8 <= SHA256_BLOCK {
            SHA256_BLOCK
        } else {
            2 * SHA256_BLOCK
        };
        tail[used - 8..used].copy_from_slice(&bit_len.to_be_bytes());
        for block in tail[..used].chunks_exact(SHA256_BLOCK) {
            state.compress(block);
        }

        let mut out = [0u8; TAG_SIZE];
        for (dst, word) in out.chunks_exact_mut(4).zip(state.h) {
            dst.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    fn compress(&mut self, block: &[u8]) {
        sha2::compress256(&mut self.h, &[GenericArray::clone_from_slice(block)]);
    }

    pub fn to_bytes(&self) -> [u8; SHA256_STATE_SIZE] {
        let mut out = [0u8; SHA256_STATE_SIZE];
        for (dst, word) in out[..32].chunks_exact_mut(4).zip(self.h) {
            dst.copy_from_slice(&word.to_le_bytes());
        }
        out[32..96].copy_from_slice(&self.buffer);
        out[96] = self.buffered as u8;
        out[97..105].copy_from_slice(&self.total.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SERIALIZED_SIZE {
            return Err(CryptoError::Length(format!(
                "SHA-256 state is {} bytes, got {}",
                Self::SERIALIZED_SIZE,
                bytes.len()
            )));
        }
        let buffered = bytes[96] as usize;
        if buffered >= SHA256_BLOCK {
            return Err(CryptoError::Length(format!(
                "buffered count {buffered} exceeds block size"
            )));
        }
        let mut h = [0u32; 8];
        for (word, src) in h.iter_mut().zip(bytes[..32].chunks_exact(4)) {
            *word = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        }
        let mut buffer = [0u8; SHA256_BLOCK];
        buffer.copy_from_slice(&bytes[32..96]);
        let mut total = [0u8; 8];
        total.copy_from_slice(&bytes[97..105]);
        Ok(Self {
            h,
            buffer,
            buffered,
            total: u64::from_le_bytes(total),
        })
    }
}

impl Default for Sha256State {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Sha256State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256State")
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// HMAC-SHA-256 as an inner running hash plus the outer padded key.
#[derive(Clone)]
pub struct HmacState {
    inner: Sha256State,
    outer_key: [u8; SHA256_BLOCK],
}

impl HmacState {
    pub const SERIALIZED_SIZE: usize = Sha256State::SERIALIZED_SIZE + SHA256_BLOCK;

    pub fn new(key: &[u8]) -> Self {
        let mut block = [0u8; SHA256_BLOCK];
        if key.len() > SHA256_BLOCK {
            block[..TAG_SIZE].copy_from_slice(&Sha256::digest(key));
        } else {
            block[..key.len()].copy_from_slice(key);
        }

        let mut ipad = block;
        let mut outer_key = block;
        for (i, o) in ipad.iter_mut().zip(outer_key.iter_mut()) {
            *i ^= 0x36;
            *o ^= 0x5c;
        }
        let mut inner = Sha256State::new();
        inner.update(&ipad);
        ipad.zeroize();
        block.zeroize();

        Self { inner, outer_key }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(&self) -> [u8; TAG_SIZE] {
        let inner = self.inner.finalize();
        let mut outer = Sha256State::new();
        outer.update(&self.outer_key);
        outer.update(&inner);
        outer.finalize()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SERIALIZED_SIZE);
        out.extend_from_slice(&self.inner.to_bytes());
        out.extend_from_slice(&self.outer_key);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != Self::SERIALIZED_SIZE {
            return Err(CryptoError::Length(format!(
                "HMAC state is {} bytes, got {}",
                Self::SERIALIZED_SIZE,
                bytes.len()
            )));
        }
        let (inner, outer) = bytes.split_at(Sha256State::SERIALIZED_SIZE);
        let mut outer_key = [0u8; SHA256_BLOCK];
        outer_key.copy_from_slice(outer);
        Ok(Self {
            inner: Sha256State::from_bytes(inner)?,
            outer_key,
        })
    }
}

impl Drop for HmacState {
    fn drop(&mut self) {
        self.outer_key.zeroize();
        self.inner.h.zeroize();
        self.inner.buffer.zeroize();
    }
}

impl std::fmt::Debug for HmacState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacState")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
