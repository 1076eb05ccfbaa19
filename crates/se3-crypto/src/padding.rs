//! PKCS#7 padding to the AES block size.

use se3_core::CryptoError;

use crate::BLOCK_SIZE;

/// Append 1..=16 bytes of padding. Empty input yields one full padding block.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Length of the unpadded data, validating every padding byte.
pub fn pkcs7_unpad(data: &[u8]) -> Result<usize, CryptoError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::Padding);
    }
    let pad = data[data.len() - 1] as usize;
    if pad == 0 || pad > BLOCK_SIZE {
        return Err(CryptoError::Padding);
    }
    let tail = &data[data.len() - pad..];
    // Fold the whole tail so timing does not reveal the first bad byte.
    let bad = tail.iter().fold(0u8, |acc, &b| acc | (b ^ pad as u8));
    if bad != 0 {
        return Err(CryptoError::Padding);
    }
    Ok(data.len() - pad)
}
