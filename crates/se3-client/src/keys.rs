//! Key records and PIN management over the secure channel.

use tracing::{debug, info};

use se3_core::types::{ConfigOp, ConfigRecord, KeyEditOp};
use se3_core::wire::{ByteReader, ByteWriter};
use se3_core::{AccessLevel, CryptoError, KeyRange, L1Command, Se3Result, Status};
use se3_crypto::{Pin, KEY_SIZE};

use crate::channel::SecureChannel;

/// Rows asked for per KeyList page.
const KEY_PAGE: u16 = 256;

/// Largest key value the device stores.
pub const KEY_MAX: usize = 256;

/// One row of a key listing. Values never leave the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub id: u32,
    pub len: u16,
}

/// Only manual ids can be edited; the device answers anything else with
/// `InvalidParams`, so refuse it here with the same status.
fn check_manual(id: u32) -> Se3Result<()> {
    match KeyRange::of(id) {
        KeyRange::Manual => Ok(()),
        range => {
            debug!(id, ?range, "key id outside the manual range");
            Err(Status::InvalidParams.into())
        }
    }
}

fn key_edit(op: KeyEditOp, id: u32, len: u16, value: &[u8]) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(8 + value.len());
    w.u16(op as u16).u32(id).u16(len).bytes(value);
    w.finish()
}

/// Key store and PIN records on the device.
pub trait KeyStore: SecureChannel {
    fn key_find(&mut self, id: u32) -> Se3Result<bool> {
        let body = self.call(L1Command::KeyFind, &id.to_le_bytes())?;
        Ok(ByteReader::new(&body).u16()? != 0)
    }

    /// Every stored key, following the device's pages to the end.
    fn key_list(&mut self) -> Se3Result<Vec<KeyInfo>> {
        let mut keys = Vec::new();
        loop {
            let skip = u16::try_from(keys.len()).map_err(|_| {
                CryptoError::Length(format!("{} keys exceed the listing range", keys.len()))
            })?;
            let mut w = ByteWriter::with_capacity(4);
            w.u16(skip).u16(KEY_PAGE);
            let body = self.call(L1Command::KeyList, &w.finish())?;
            let mut r = ByteReader::new(&body);
            let count = r.u16()?;
            for _ in 0..count {
                let id = r.u32()?;
                let len = r.u16()?;
                keys.push(KeyInfo { id, len });
            }
            debug!(skip, count, "key page");
            if count < KEY_PAGE {
                return Ok(keys);
            }
        }
    }

    /// Store `value` under a manual id. An id already in use is refused.
    fn key_add(&mut self, id: u32, value: &[u8]) -> Se3Result<()> {
        check_manual(id)?;
        if value.is_empty() || value.len() > KEY_MAX {
            return Err(CryptoError::Length(format!(
                "key of {} bytes, expected 1..={KEY_MAX}",
                value.len()
            ))
            .into());
        }
        self.call(
            L1Command::KeyEdit,
            &key_edit(KeyEditOp::Insert, id, value.len() as u16, value),
        )?;
        info!(id, len = value.len(), "key stored");
        Ok(())
    }

    /// Have the device draw a `len`-byte key from its own RNG.
    fn key_generate(&mut self, id: u32, len: u16) -> Se3Result<()> {
        check_manual(id)?;
        self.call(
            L1Command::KeyEdit,
            &key_edit(KeyEditOp::InsertGenerated, id, len, &[]),
        )?;
        info!(id, len, "key generated on device");
        Ok(())
    }

    fn key_delete(&mut self, id: u32) -> Se3Result<()> {
        check_manual(id)?;
        self.call(L1Command::KeyEdit, &key_edit(KeyEditOp::Delete, id, 0, &[]))?;
        info!(id, "key deleted");
        Ok(())
    }

    /// Replace the PIN record for `access`. Needs an admin session.
    fn set_pin(&mut self, access: AccessLevel, pin: &Pin) -> Se3Result<()> {
        let record = ConfigRecord::pin_for(access)
            .ok_or_else(|| CryptoError::InvalidKey("no PIN record for access level none".into()))?;
        let mut w = ByteWriter::with_capacity(4 + KEY_SIZE);
        w.u16(record as u16)
            .u16(ConfigOp::Set as u16)
            .bytes(pin.as_bytes());
        self.call(L1Command::Config, &w.finish())?;
        info!(%access, "PIN changed");
        Ok(())
    }
}

impl<C: SecureChannel + ?Sized> KeyStore for C {}
