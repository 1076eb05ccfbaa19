//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no xorout)

const POLY: u16 = 0x1021;

/// Running CRC state, so header and payload can be fed separately.
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Default for Crc16 {
    fn default() -> Self {
        Crc16(0xFFFF)
    }
}

impl Crc16 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ POLY
                } else {
                    crc << 1
                };
            }
        }
        self.0 = crc;
    }

    pub fn finish(self) -> u16 {
        self.0
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // Standard check value for CRC-16/CCITT-FALSE
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut crc = Crc16::new();
        crc.update(b"12345");
        crc.update(b"6789");
        assert_eq!(crc.finish(), crc16(b"123456789"));
    }

    #[test]
    fn test_empty() {
        assert_eq!(crc16(b""), 0xFFFF);
    }
}
