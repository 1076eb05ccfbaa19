//! Device-side crypto sessions and the chunked operations built on them.
//!
//! A logical operation is one CryptoInit followed by as many CryptoUpdate
//! calls as it takes to stream the input in [`CHUNK_SIZE`] pieces; the last
//! one carries FINIT and closes the device session. Cipher input is padded
//! with PKCS#7 over the whole stream, so every chunk is block aligned.
//!
//! Ciphertext layout produced by [`CryptoSession::encrypt`]:
//!
//! ```text
//! AES ECB            [ciphertext]
//! AES CBC/CFB/OFB    [IV 16][ciphertext]
//! AES CTR            [counter block 16][ciphertext]
//! AES+HMAC (any)     [nonce 32][ciphertext][tag 32]
//! ```

use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use se3_core::types::{mode_word, update_flags, AlgorithmInfo, NO_KEY};
use se3_core::wire::{ByteReader, ByteWriter};
use se3_core::{Algorithm, CipherMode, CryptoError, Direction, L1Command, Se3Result};
use se3_crypto::{
    pkcs7_pad, pkcs7_unpad, tags_equal, BLOCK_SIZE, CHALLENGE_SIZE, L1_MAX_DATA, TAG_SIZE,
};

use crate::channel::SecureChannel;

/// `sid flags len1 len2` padded to one block.
const UPDATE_HEADER: usize = 16;

/// Room for the widest data1 (the combined-mode nonce).
const MAX_DATA1: usize = CHALLENGE_SIZE;

/// Bulk bytes per CryptoUpdate: the request must hold the header, data1 and
/// the chunk, and the response the chunk plus a trailing tag.
pub const CHUNK_SIZE: usize =
    (L1_MAX_DATA - UPDATE_HEADER - MAX_DATA1 - TAG_SIZE) / BLOCK_SIZE * BLOCK_SIZE;

const ALGO_NAME_SIZE: usize = 16;
const ALGO_PAGE: u16 = 64;

/// Which cipher to run and under which stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    pub algorithm: Algorithm,
    pub mode: CipherMode,
    pub key_id: u32,
}

impl CipherSpec {
    pub fn new(algorithm: Algorithm, mode: CipherMode, key_id: u32) -> Self {
        Self {
            algorithm,
            mode,
            key_id,
        }
    }

    fn authenticated(&self) -> bool {
        self.algorithm == Algorithm::AesHmacSha256
    }

    /// Bytes in front of the ciphertext.
    fn prefix_len(&self) -> usize {
        if self.authenticated() {
            CHALLENGE_SIZE
        } else if self.mode.needs_iv() {
            BLOCK_SIZE
        } else {
            0
        }
    }

    fn suffix_len(&self) -> usize {
        if self.authenticated() {
            TAG_SIZE
        } else {
            0
        }
    }
}

/// Fresh prefix for an encryption: a nonce, an IV or a CTR counter block
/// whose low 8 bytes (the counter) start at zero.
fn fresh_prefix(spec: &CipherSpec) -> Vec<u8> {
    let mut prefix = vec![0u8; spec.prefix_len()];
    let random = if !spec.authenticated() && spec.mode == CipherMode::Ctr {
        &mut prefix[..8]
    } else {
        &mut prefix[..]
    };
    rand::thread_rng().fill_bytes(random);
    prefix
}

/// Counter block `blocks` AES blocks past `start`.
fn counter_at(start: &[u8], blocks: u64) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(start);
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&out[8..]);
    let next = u64::from_be_bytes(counter).wrapping_add(blocks);
    out[8..].copy_from_slice(&next.to_be_bytes());
    out
}

fn check_cipher(spec: &CipherSpec) -> Se3Result<()> {
    if !spec.algorithm.is_cipher() {
        return Err(CryptoError::InvalidKey(format!(
            "{:?} is not a cipher algorithm",
            spec.algorithm
        ))
        .into());
    }
    Ok(())
}

/// Device crypto sessions over any authenticated channel.
pub trait CryptoSession: SecureChannel {
    /// Open a device session; returns its id.
    fn crypto_init(&mut self, algorithm: Algorithm, mode: u16, key_id: u32) -> Se3Result<u32> {
        let mut w = ByteWriter::with_capacity(8);
        w.u16(algorithm as u16).u16(mode).u32(key_id);
        let body = self.call(L1Command::CryptoInit, &w.finish())?;
        let sid = ByteReader::new(&body).u32()?;
        debug!(?algorithm, mode, key_id, sid, "crypto session opened");
        Ok(sid)
    }

    /// One CryptoUpdate call; returns the device output.
    fn crypto_update(&mut self, sid: u32, flags: u16, data1: &[u8], data2: &[u8]) -> Se3Result<Vec<u8>> {
        if data1.len() > MAX_DATA1 || data2.len() > CHUNK_SIZE {
            return Err(CryptoError::Length(format!(
                "update of {}+{} bytes does not fit one exchange",
                data1.len(),
                data2.len()
            ))
            .into());
        }
        let mut w = ByteWriter::with_capacity(UPDATE_HEADER + MAX_DATA1 + data2.len());
        w.u32(sid)
            .u16(flags)
            .u16(data1.len() as u16)
            .u16(data2.len() as u16)
            .align(BLOCK_SIZE)
            .bytes(data1)
            .align(BLOCK_SIZE)
            .bytes(data2);
        let body = self.call(L1Command::CryptoUpdate, &w.finish())?;
        let mut r = ByteReader::new(&body);
        let len = r.u16()? as usize;
        r.align(BLOCK_SIZE)?;
        Ok(r.bytes(len)?.to_vec())
    }

    /// The device's algorithm table.
    fn crypto_list(&mut self) -> Se3Result<Vec<AlgorithmInfo>> {
        let mut out = Vec::new();
        loop {
            let mut w = ByteWriter::with_capacity(4);
            w.u16(out.len() as u16).u16(ALGO_PAGE);
            let body = self.call(L1Command::CryptoList, &w.finish())?;
            let mut r = ByteReader::new(&body);
            let count = r.u16()?;
            for _ in 0..count {
                let name = r.bytes(ALGO_NAME_SIZE)?;
                let code = r.u16()?;
                let block_size = r.u16()?;
                let key_size = r.u16()?;
                let Some(algorithm) = Algorithm::from_wire(code) else {
                    debug!(code, "skipping unknown algorithm");
                    continue;
                };
                let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                out.push(AlgorithmInfo {
                    name: String::from_utf8_lossy(&name[..end]).into_owned(),
                    algorithm,
                    block_size,
                    key_size,
                });
            }
            if count < ALGO_PAGE {
                return Ok(out);
            }
        }
    }

    fn encrypt(&mut self, spec: CipherSpec, plain: &[u8]) -> Se3Result<Vec<u8>> {
        self.encrypt_with(spec, plain, &mut |_| {})
    }

    /// Encrypt on the device, reporting each processed chunk's input size.
    fn encrypt_with(
        &mut self,
        spec: CipherSpec,
        plain: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Se3Result<Vec<u8>> {
        check_cipher(&spec)?;
        let padded = Zeroizing::new(pkcs7_pad(plain));
        let prefix = fresh_prefix(&spec);
        let sid = self.crypto_init(spec.algorithm, mode_word(spec.mode, Direction::Encrypt), spec.key_id)?;

        let mut out = Vec::with_capacity(prefix.len() + padded.len() + spec.suffix_len());
        out.extend_from_slice(&prefix);
        let body = stream_cipher(self, sid, &spec, &prefix, &padded, progress)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&mut self, spec: CipherSpec, cipher: &[u8]) -> Se3Result<Vec<u8>> {
        self.decrypt_with(spec, cipher, &mut |_| {})
    }

    /// Decrypt on the device. With the combined algorithm the tag is checked
    /// before the padding is looked at; a mismatch is an integrity error.
    fn decrypt_with(
        &mut self,
        spec: CipherSpec,
        cipher: &[u8],
        progress: &mut dyn FnMut(usize),
    ) -> Se3Result<Vec<u8>> {
        check_cipher(&spec)?;
        let (prefix_len, suffix_len) = (spec.prefix_len(), spec.suffix_len());
        if cipher.len() < prefix_len + BLOCK_SIZE + suffix_len
            || (cipher.len() - prefix_len - suffix_len) % BLOCK_SIZE != 0
        {
            return Err(CryptoError::Length(format!(
                "{} bytes is not a valid {:?}/{:?} ciphertext",
                cipher.len(),
                spec.algorithm,
                spec.mode
            ))
            .into());
        }
        let prefix = &cipher[..prefix_len];
        let body = &cipher[prefix_len..cipher.len() - suffix_len];
        let tag = &cipher[cipher.len() - suffix_len..];

        let sid = self.crypto_init(spec.algorithm, mode_word(spec.mode, Direction::Decrypt), spec.key_id)?;
        let mut plain = Zeroizing::new(stream_cipher(self, sid, &spec, prefix, body, progress)?);
        if spec.authenticated() {
            let split = plain.len().saturating_sub(TAG_SIZE);
            if plain.len() != body.len() + TAG_SIZE || !tags_equal(&plain[split..], tag) {
                return Err(CryptoError::Integrity.into());
            }
            plain.truncate(split);
        }
        let len = pkcs7_unpad(&plain)?;
        Ok(plain[..len].to_vec())
    }

    /// SHA-256 (`key_id` ignored) or HMAC-SHA-256 of `data`.
    fn digest(&mut self, algorithm: Algorithm, key_id: u32, data: &[u8]) -> Se3Result<[u8; TAG_SIZE]> {
        let key_id = match algorithm {
            Algorithm::Sha256 => NO_KEY,
            Algorithm::HmacSha256 => key_id,
            other => {
                return Err(CryptoError::InvalidKey(format!("{other:?} is not a digest")).into())
            }
        };
        let sid = self.crypto_init(algorithm, 0, key_id)?;
        let mut chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;
        let mut out = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let flags = if i == last { update_flags::FINIT } else { 0 };
            out = self.crypto_update(sid, flags, &[], chunk)?;
        }
        let digest: [u8; TAG_SIZE] = out
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Length(format!("digest of {} bytes", out.len())))?;
        Ok(digest)
    }
}

impl<C: SecureChannel + ?Sized> CryptoSession for C {}

/// Push `body` (block aligned, non-empty) through an open cipher session.
fn stream_cipher<C: CryptoSession + ?Sized>(
    channel: &mut C,
    sid: u32,
    spec: &CipherSpec,
    prefix: &[u8],
    body: &[u8],
    progress: &mut dyn FnMut(usize),
) -> Se3Result<Vec<u8>> {
    let chunks: Vec<&[u8]> = body.chunks(CHUNK_SIZE).collect();
    let last = chunks.len().saturating_sub(1);
    let mut out = Vec::with_capacity(body.len() + spec.suffix_len());
    let mut offset = 0usize;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut flags = 0;
        let mut counter = [0u8; BLOCK_SIZE];
        let data1: &[u8] = if spec.authenticated() {
            if i == 0 {
                flags |= update_flags::SET_NONCE;
                prefix
            } else {
                &[]
            }
        } else if spec.mode == CipherMode::Ctr {
            flags |= update_flags::RESET;
            counter = counter_at(prefix, (offset / BLOCK_SIZE) as u64);
            &counter
        } else if spec.mode.needs_iv() && i == 0 {
            flags |= update_flags::SET_IV;
            prefix
        } else {
            &[]
        };
        if i == last {
            flags |= update_flags::FINIT;
            if spec.authenticated() {
                flags |= update_flags::AUTH;
            }
        }
        let piece = channel.crypto_update(sid, flags, data1, chunk)?;
        out.extend_from_slice(&piece);
        offset += chunk.len();
        progress(chunk.len());
    }
    Ok(out)
}
