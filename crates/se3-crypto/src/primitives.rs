//! External primitives behind small capability traits.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use se3_core::CryptoError;

use crate::{BLOCK_SIZE, KEY_SIZE, TAG_SIZE};

pub type HmacSha256 = Hmac<Sha256>;

/// A 128-bit block cipher keyed at construction.
pub trait BlockCipher {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]);
    fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]);
}

/// Password-based key derivation.
pub trait Kdf {
    fn derive(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]);
}

/// AES-256 from the `aes` crate.
#[derive(Clone)]
pub struct Aes256Cipher {
    inner: Aes256,
}

impl Aes256Cipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "AES-256 needs {KEY_SIZE} key bytes, got {}",
                key.len()
            )));
        }
        let inner = Aes256::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(format!("AES key setup failed: {e}")))?;
        Ok(Self { inner })
    }
}

impl BlockCipher for Aes256Cipher {
    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.inner
            .encrypt_block(aes::Block::from_mut_slice(&mut block[..]));
    }

    fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        self.inner
            .decrypt_block(aes::Block::from_mut_slice(&mut block[..]));
    }
}

impl std::fmt::Debug for Aes256Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes256Cipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2-HMAC-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbkdf2Sha256;

impl Kdf for Pbkdf2Sha256 {
    fn derive(&self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), out);
    }
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub fn hkdf_derive(ikm: &[u8], info: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// One-shot HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; TAG_SIZE], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(format!("HMAC key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time equality of two tags.
pub fn tags_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex<const N: usize>(s: &str) -> [u8; N] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_aes256_known_answer() {
        // FIPS-197 C.3
        let key: [u8; 32] =
            unhex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f");
        let cipher = Aes256Cipher::new(&key).unwrap();
        let mut block: [u8; 16] = unhex("00112233445566778899aabbccddeeff");
        cipher.encrypt_block(&mut block);
        assert_eq!(block, unhex::<16>("8ea2b7ca516745bfeafc49904b496089"));
        cipher.decrypt_block(&mut block);
        assert_eq!(block, unhex::<16>("00112233445566778899aabbccddeeff"));
    }

    #[test]
    fn test_aes_rejects_short_key() {
        assert!(matches!(
            Aes256Cipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_pbkdf2_deterministic_and_salted() {
        let kdf = Pbkdf2Sha256;
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        let mut c = [0u8; 32];
        kdf.derive(b"pin", b"salt-1", 4, &mut a);
        kdf.derive(b"pin", b"salt-1", 4, &mut b);
        kdf.derive(b"pin", b"salt-2", 4, &mut c);
        assert_eq!(a, b, "KDF must be deterministic");
        assert_ne!(a, c, "different salts must produce different keys");
    }

    #[test]
    fn test_pbkdf2_rfc7914_vector() {
        // RFC 7914 section 11: PBKDF2-HMAC-SHA256, P="passwd", S="salt", c=1
        let mut out = [0u8; 64];
        Pbkdf2Sha256.derive(b"passwd", b"salt", 1, &mut out);
        assert_eq!(
            hex::encode(&out[..16]),
            "55ac046e56e3089fec1691c22544b605"
        );
    }

    #[test]
    fn test_hkdf_different_domains() {
        let ikm = [42u8; 32];
        assert_ne!(
            hkdf_derive(&ikm, b"a").unwrap(),
            hkdf_derive(&ikm, b"b").unwrap()
        );
    }

    #[test]
    fn test_hmac_parts_equal_concatenation() {
        let key = [9u8; 32];
        assert_eq!(
            hmac_sha256(&key, &[b"hello ", b"world"]).unwrap(),
            hmac_sha256(&key, &[b"hello world"]).unwrap()
        );
    }

    #[test]
    fn test_tags_equal() {
        assert!(tags_equal(b"abcd", b"abcd"));
        assert!(!tags_equal(b"abcd", b"abce"));
        assert!(!tags_equal(b"abcd", b"abc"));
    }
}
