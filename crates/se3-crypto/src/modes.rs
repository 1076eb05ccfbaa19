//! Block-cipher feedback modes with an explicit carried state.
//!
//! Every mode keeps exactly one 16-byte register between calls (the
//! chaining value for CBC/CFB, the keystream feedback for OFB, the counter
//! block for CTR), so a stream may be split across any number of calls
//! as long as each call processes whole blocks.

use se3_core::types::{CipherMode, Direction};
use se3_core::CryptoError;

use crate::primitives::BlockCipher;
use crate::BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeState {
    pub mode: CipherMode,
    pub direction: Direction,
    pub register: [u8; BLOCK_SIZE],
}

impl ModeState {
    pub fn new(mode: CipherMode, direction: Direction) -> Self {
        Self {
            mode,
            direction,
            register: [0u8; BLOCK_SIZE],
        }
    }

    /// Load the IV (or initial counter block for CTR).
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<(), CryptoError> {
        if iv.len() != BLOCK_SIZE {
            return Err(CryptoError::Length(format!(
                "IV must be {BLOCK_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        self.register.copy_from_slice(iv);
        Ok(())
    }

    /// Encrypt or decrypt `data` in place. `data.len()` must be a multiple of 16.
    pub fn process<C: BlockCipher>(&mut self, cipher: &C, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Length(format!(
                "{} bytes is not a multiple of the {BLOCK_SIZE}-byte block",
                data.len()
            )));
        }
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            self.process_block(cipher, &mut block);
            chunk.copy_from_slice(&block);
        }
        Ok(())
    }

    fn process_block<C: BlockCipher>(&mut self, cipher: &C, block: &mut [u8; BLOCK_SIZE]) {
        match (self.mode, self.direction) {
            (CipherMode::Ecb, Direction::Encrypt) => cipher.encrypt_block(block),
            (CipherMode::Ecb, Direction::Decrypt) => cipher.decrypt_block(block),
            (CipherMode::Cbc, Direction::Encrypt) => {
                xor_into(block, &self.register);
                cipher.encrypt_block(block);
                self.register = *block;
            }
            (CipherMode::Cbc, Direction::Decrypt) => {
                let ciphertext = *block;
                cipher.decrypt_block(block);
                xor_into(block, &self.register);
                self.register = ciphertext;
            }
            (CipherMode::Cfb, direction) => {
                let mut keystream = self.register;
                cipher.encrypt_block(&mut keystream);
                let ciphertext_in = *block;
                xor_into(block, &keystream);
                self.register = match direction {
                    Direction::Encrypt => *block,
                    Direction::Decrypt => ciphertext_in,
                };
            }
            (CipherMode::Ofb, _) => {
                cipher.encrypt_block(&mut self.register);
                xor_into(block, &self.register);
            }
            (CipherMode::Ctr, _) => {
                let mut keystream = self.register;
                cipher.encrypt_block(&mut keystream);
                xor_into(block, &keystream);
                increment_be(&mut self.register);
            }
        }
    }
}

fn xor_into(dst: &mut [u8; BLOCK_SIZE], src: &[u8; BLOCK_SIZE]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// 128-bit big-endian increment of a counter block.
pub fn increment_be(counter: &mut [u8; BLOCK_SIZE]) {
    for byte in counter.iter_mut().rev() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Aes256Cipher;

    // NIST SP 800-38A, AES-256 vectors (first block)
    const KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";
    const PLAIN: &str = "6bc1bee22e409f96e93d7e117393172a";

    fn cipher() -> Aes256Cipher {
        Aes256Cipher::new(&hex::decode(KEY).unwrap()).unwrap()
    }

    fn run(mode: CipherMode, dir: Direction, iv: &str, data: &str) -> String {
        let mut state = ModeState::new(mode, dir);
        if !iv.is_empty() {
            state.set_iv(&hex::decode(iv).unwrap()).unwrap();
        }
        let mut buf = hex::decode(data).unwrap();
        state.process(&cipher(), &mut buf).unwrap();
        hex::encode(buf)
    }

    #[test]
    fn test_ecb_vector() {
        assert_eq!(
            run(CipherMode::Ecb, Direction::Encrypt, "", PLAIN),
            "f3eed1bdb5d2a03c064b5a7e3db181f8"
        );
    }

    #[test]
    fn test_cbc_vector() {
        assert_eq!(
            run(
                CipherMode::Cbc,
                Direction::Encrypt,
                "000102030405060708090a0b0c0d0e0f",
                PLAIN
            ),
            "f58c4c04d6e5f1ba779eabfb5f7bfbd6"
        );
    }

    #[test]
    fn test_ctr_vector() {
        assert_eq!(
            run(
                CipherMode::Ctr,
                Direction::Encrypt,
                "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff",
                PLAIN
            ),
            "601ec313775789a5b7a7f504bbf3d228"
        );
    }

    #[test]
    fn test_all_modes_roundtrip_split_across_calls() {
        let plain: Vec<u8> = (0..160u32).map(|i| (i * 7) as u8).collect();
        let iv = [0x5Au8; 16];
        for mode in CipherMode::ALL {
            let mut enc = ModeState::new(mode, Direction::Encrypt);
            enc.set_iv(&iv).unwrap();
            let mut ct = plain.clone();
            // Split 3 + 7 blocks: state must carry across calls
            let (a, b) = ct.split_at_mut(48);
            enc.process(&cipher(), a).unwrap();
            enc.process(&cipher(), b).unwrap();
            assert_ne!(ct, plain, "{mode:?} must change the data");

            let mut dec = ModeState::new(mode, Direction::Decrypt);
            dec.set_iv(&iv).unwrap();
            dec.process(&cipher(), &mut ct).unwrap();
            assert_eq!(ct, plain, "{mode:?} roundtrip");
        }
    }

    #[test]
    fn test_partial_block_rejected() {
        let mut state = ModeState::new(CipherMode::Cbc, Direction::Encrypt);
        let mut buf = [0u8; 17];
        assert!(matches!(
            state.process(&cipher(), &mut buf),
            Err(CryptoError::Length(_))
        ));
    }

    #[test]
    fn test_increment_carries() {
        let mut counter = [0u8; 16];
        counter[15] = 0xFF;
        counter[14] = 0xFF;
        increment_be(&mut counter);
        assert_eq!(counter[13..], [1, 0, 0]);

        let mut max = [0xFFu8; 16];
        increment_be(&mut max);
        assert_eq!(max, [0u8; 16]);
    }
}
