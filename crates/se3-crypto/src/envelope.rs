//! Secure-channel envelope carried in the frame payload of an L1 request.
//!
//! ```text
//! [AUTH 16][IV 16][TOKEN 16][LEN u16][CMD/STATUS u16][DATA ...][zero pad to 16]
//!                 └──────────────────── body ─────────────────────────────────┘
//! ```
//!
//! With ENCRYPT the body is AES-256-CBC under the session key with a fresh
//! IV; with SIGN, AUTH is HMAC-SHA-256(mac key, IV || body as sent) cut to 16 bytes.
//! Without flags the body travels in clear and IV/AUTH are zero.

use rand::RngCore;
use tracing::debug;
use zeroize::Zeroize;

use se3_core::types::{cmd_flags, CipherMode, Direction};
use se3_core::wire::{ByteReader, ByteWriter, Truncated, MAX_FRAME_DATA};
use se3_core::CryptoError;

use crate::keys::SessionKey;
use crate::modes::ModeState;
use crate::primitives::{hmac_sha256, tags_equal, Aes256Cipher};
use crate::{AUTH_SIZE, BLOCK_SIZE, KEY_SIZE, TOKEN_SIZE};

/// AUTH + IV
const PREFIX_SIZE: usize = AUTH_SIZE + BLOCK_SIZE;

/// TOKEN + LEN + CMD/STATUS
const BODY_HEADER_SIZE: usize = TOKEN_SIZE + 2 + 2;

/// Largest DATA whose padded envelope still fits one frame.
pub const L1_MAX_DATA: usize =
    (MAX_FRAME_DATA - PREFIX_SIZE) / BLOCK_SIZE * BLOCK_SIZE - BODY_HEADER_SIZE;

/// Decoded contents of an envelope. `word` is the command on requests and
/// the status on responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub token: [u8; TOKEN_SIZE],
    pub word: u16,
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(token: [u8; TOKEN_SIZE], word: u16, data: Vec<u8>) -> Self {
        Self { token, word, data }
    }

    /// Size of the sealed envelope carrying `data_len` bytes of DATA.
    pub fn sealed_len(data_len: usize) -> usize {
        PREFIX_SIZE + (BODY_HEADER_SIZE + data_len).next_multiple_of(BLOCK_SIZE)
    }

    /// Unprotected encoding (no ENCRYPT, no SIGN).
    pub fn seal_plain(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; PREFIX_SIZE];
        out.extend_from_slice(&self.body()?);
        Ok(out)
    }

    pub fn open_plain(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (_, body) = split_envelope(bytes)?;
        Self::parse_body(body)
    }

    /// The AUTH field of a sealed envelope.
    pub fn auth_of(bytes: &[u8]) -> Option<[u8; AUTH_SIZE]> {
        bytes.get(..AUTH_SIZE)?.try_into().ok()
    }

    fn body(&self) -> Result<Vec<u8>, CryptoError> {
        if self.data.len() > L1_MAX_DATA {
            return Err(CryptoError::Length(format!(
                "envelope data of {} bytes exceeds {L1_MAX_DATA}",
                self.data.len()
            )));
        }
        let mut w = ByteWriter::with_capacity(BODY_HEADER_SIZE + self.data.len() + BLOCK_SIZE);
        w.bytes(&self.token)
            .u16(self.data.len() as u16)
            .u16(self.word)
            .bytes(&self.data)
            .align(BLOCK_SIZE);
        Ok(w.finish())
    }

    fn parse_body(body: &[u8]) -> Result<Self, CryptoError> {
        let mut r = ByteReader::new(body);
        let truncated = |e: Truncated| CryptoError::Length(e.to_string());
        let token = r.array::<TOKEN_SIZE>().map_err(truncated)?;
        let len = r.u16().map_err(truncated)? as usize;
        let word = r.u16().map_err(truncated)?;
        let data = r.bytes(len).map_err(truncated)?.to_vec();
        Ok(Self { token, word, data })
    }
}

/// Split into (IV, body), checking the envelope is block aligned.
fn split_envelope(bytes: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    if bytes.len() < PREFIX_SIZE + BODY_HEADER_SIZE.next_multiple_of(BLOCK_SIZE)
        || (bytes.len() - PREFIX_SIZE) % BLOCK_SIZE != 0
    {
        return Err(CryptoError::Length(format!(
            "{} bytes is not a valid envelope",
            bytes.len()
        )));
    }
    Ok((&bytes[AUTH_SIZE..PREFIX_SIZE], &bytes[PREFIX_SIZE..]))
}

/// Per-login payload protection: the envelope cipher and its MAC key.
pub struct PayloadCrypto {
    cipher: Aes256Cipher,
    mac_key: [u8; KEY_SIZE],
}

impl PayloadCrypto {
    pub fn new(key: &SessionKey) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: Aes256Cipher::new(key.as_bytes())?,
            mac_key: key.mac_key()?,
        })
    }

    pub fn seal(&self, envelope: &Envelope, flags: u16) -> Result<Vec<u8>, CryptoError> {
        let mut body = envelope.body()?;
        let mut iv = [0u8; BLOCK_SIZE];

        if flags & cmd_flags::ENCRYPT != 0 {
            rand::thread_rng().fill_bytes(&mut iv);
            let mut cbc = ModeState::new(CipherMode::Cbc, Direction::Encrypt);
            cbc.set_iv(&iv)?;
            cbc.process(&self.cipher, &mut body)?;
        }

        let mut out = Vec::with_capacity(PREFIX_SIZE + body.len());
        if flags & cmd_flags::SIGN != 0 {
            let tag = hmac_sha256(&self.mac_key, &[&iv, &body])?;
            out.extend_from_slice(&tag[..AUTH_SIZE]);
        } else {
            out.extend_from_slice(&[0u8; AUTH_SIZE]);
        }
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Verify (SIGN) and decrypt (ENCRYPT) an envelope. A bad AUTH is an
    /// integrity failure and is checked before any decryption.
    pub fn open(&self, bytes: &[u8], flags: u16) -> Result<Envelope, CryptoError> {
        let (iv, body) = split_envelope(bytes)?;

        if flags & cmd_flags::SIGN != 0 {
            let tag = hmac_sha256(&self.mac_key, &[iv, body])?;
            if !tags_equal(&tag[..AUTH_SIZE], &bytes[..AUTH_SIZE]) {
                debug!(len = bytes.len(), flags, "envelope AUTH mismatch");
                return Err(CryptoError::Integrity);
            }
        }

        if flags & cmd_flags::ENCRYPT != 0 {
            let mut plain = body.to_vec();
            let mut cbc = ModeState::new(CipherMode::Cbc, Direction::Decrypt);
            cbc.set_iv(iv)?;
            cbc.process(&self.cipher, &mut plain)?;
            let envelope = Envelope::parse_body(&plain)
                .map_err(|e| CryptoError::Decrypt(format!("envelope body: {e}")));
            plain.zeroize();
            envelope
        } else {
            Envelope::parse_body(body)
        }
    }
}

impl Drop for PayloadCrypto {
    fn drop(&mut self) {
        self.mac_key.zeroize();
    }
}

impl std::fmt::Debug for PayloadCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCrypto")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto(seed: u8) -> PayloadCrypto {
        PayloadCrypto::new(&SessionKey::from_bytes([seed; 32])).unwrap()
    }

    #[test]
    fn test_max_data_fits_one_frame() {
        assert_eq!(L1_MAX_DATA, 7548);
        assert!(Envelope::sealed_len(L1_MAX_DATA) <= MAX_FRAME_DATA);
        assert!(Envelope::sealed_len(L1_MAX_DATA + 1) > MAX_FRAME_DATA);
    }

    #[test]
    fn test_seal_open_secure() {
        let pc = crypto(1);
        let env = Envelope::new([9u8; 16], 7, b"payload bytes".to_vec());
        let sealed = pc.seal(&env, cmd_flags::SECURE).unwrap();
        assert_eq!(sealed.len(), Envelope::sealed_len(13));
        // Body must not be visible in clear
        assert!(!sealed.windows(13).any(|w| w == b"payload bytes"));
        assert_eq!(pc.open(&sealed, cmd_flags::SECURE).unwrap(), env);
    }

    #[test]
    fn test_fresh_iv_per_seal() {
        let pc = crypto(1);
        let env = Envelope::new([0u8; 16], 1, vec![]);
        let a = pc.seal(&env, cmd_flags::SECURE).unwrap();
        let b = pc.seal(&env, cmd_flags::SECURE).unwrap();
        assert_ne!(a[AUTH_SIZE..PREFIX_SIZE], b[AUTH_SIZE..PREFIX_SIZE]);
        assert_ne!(Envelope::auth_of(&a), Envelope::auth_of(&b));
    }

    #[test]
    fn test_tamper_is_integrity_error() {
        let pc = crypto(2);
        let env = Envelope::new([1u8; 16], 3, vec![0xAA; 40]);
        let sealed = pc.seal(&env, cmd_flags::SECURE).unwrap();
        for i in [0usize, 16, 32, 50, sealed.len() - 1] {
            let mut bad = sealed.clone();
            bad[i] ^= 0x01;
            assert_eq!(
                pc.open(&bad, cmd_flags::SECURE),
                Err(CryptoError::Integrity),
                "byte {i}"
            );
        }
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let sealed = crypto(3)
            .seal(&Envelope::new([0; 16], 2, vec![1, 2, 3]), cmd_flags::SECURE)
            .unwrap();
        assert_eq!(
            crypto(4).open(&sealed, cmd_flags::SECURE),
            Err(CryptoError::Integrity)
        );
    }

    #[test]
    fn test_plain_roundtrip() {
        let env = Envelope::new([0u8; 16], 1, vec![5u8; 66]);
        let sealed = env.seal_plain().unwrap();
        assert_eq!(Envelope::auth_of(&sealed), Some([0u8; 16]));
        assert_eq!(Envelope::open_plain(&sealed).unwrap(), env);
    }

    #[test]
    fn test_oversize_and_truncated() {
        let env = Envelope::new([0u8; 16], 1, vec![0u8; L1_MAX_DATA + 1]);
        assert!(matches!(env.seal_plain(), Err(CryptoError::Length(_))));
        assert!(matches!(
            Envelope::open_plain(&[0u8; 40]),
            Err(CryptoError::Length(_))
        ));

        // LEN field claiming more data than the body holds
        let mut sealed = Envelope::new([0u8; 16], 1, vec![1]).seal_plain().unwrap();
        sealed[PREFIX_SIZE + TOKEN_SIZE] = 0xFF;
        assert!(matches!(
            Envelope::open_plain(&sealed),
            Err(CryptoError::Length(_))
        ));
    }
}
