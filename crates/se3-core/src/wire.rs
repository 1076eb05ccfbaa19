//! Fixed 512-byte block wire format.
//!
//! Request block 0:
//! ```text
//! [CMD u16][FLAGS u16][LEN u16][TOKEN u32][pad 4][CRC u16][DATA 496]
//! ```
//! Response block 0:
//! ```text
//! [READY u16][STATUS u16][LEN u16][TOKEN u32][pad 4][CRC u16][DATA 496]
//! ```
//! Blocks 1..=14 (both directions):
//! ```text
//! [TOKEN u32 = token0 + i][DATA 508]
//! ```
//! Slot 15 is never part of a frame; on read it carries the discovery block.
//!
//! All integers are little-endian. Request and response headers share one
//! shape, so a single [`FrameHeader`] describes both: `word0`/`word1` are
//! CMD/FLAGS on the way in and READY/STATUS on the way out.

use thiserror::Error;

use crate::crc::Crc16;
use crate::error::TransportError;
use crate::types::Status;

pub const BLOCK_SIZE: usize = 512;
pub const SLOT_COUNT: usize = 16;
pub const DISCOVERY_SLOT: usize = 15;
/// Slots usable by a frame: header block + 14 data blocks.
pub const FRAME_SLOTS: usize = 15;
pub const DATA_SLOTS: usize = 14;

pub const HEADER_SIZE: usize = 16;
pub const BLOCK0_DATA: usize = BLOCK_SIZE - HEADER_SIZE;
pub const DATA_BLOCK_TOKEN: usize = 4;
pub const DATA_BLOCK_DATA: usize = BLOCK_SIZE - DATA_BLOCK_TOKEN;
pub const MAX_FRAME_DATA: usize = BLOCK0_DATA + DATA_SLOTS * DATA_BLOCK_DATA;

const OFF_WORD0: usize = 0;
const OFF_WORD1: usize = 2;
const OFF_LEN: usize = 4;
const OFF_TOKEN: usize = 6;
const OFF_CRC: usize = 14;

/// READY value of a response whose payload is available.
pub const RESPONSE_READY: u16 = 1;

/// 32-byte signature repeated through every magic block.
pub const MAGIC: [u8; 32] = [
    0x3c, 0xab, 0x78, 0xb6, 0x02, 0x64, 0x47, 0xe9, 0x30, 0x26, 0xd3, 0x6b, 0xe1, 0x7f, 0x2a,
    0x5b, 0x91, 0xf5, 0x1c, 0x80, 0xb3, 0x6d, 0x42, 0xc8, 0x0e, 0x9a, 0x57, 0x25, 0xd4, 0x1f,
    0x88, 0x6e,
];

// ── Magic blocks ──────────────────────────────────────────────────────────────

/// Build the magic block announcing slot `index` (0..16).
pub fn magic_block(index: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    for chunk in block.chunks_exact_mut(MAGIC.len()) {
        chunk.copy_from_slice(&MAGIC);
    }
    block[BLOCK_SIZE - 1] = index;
    block
}

/// Returns the slot index if `block` is a magic block.
pub fn parse_magic_block(block: &[u8]) -> Option<u8> {
    if block.len() != BLOCK_SIZE {
        return None;
    }
    let index = block[BLOCK_SIZE - 1];
    if index as usize >= SLOT_COUNT {
        return None;
    }
    let (body, tail) = block.split_at(BLOCK_SIZE - MAGIC.len());
    let is_magic = body.chunks_exact(MAGIC.len()).all(|c| c == MAGIC)
        && tail[..MAGIC.len() - 1] == MAGIC[..MAGIC.len() - 1];
    is_magic.then_some(index)
}

/// MAGIC with its two 16-byte halves swapped, so the discovery block can
/// never be mistaken for a magic write.
pub fn swapped_magic() -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&MAGIC[16..]);
    out[16..].copy_from_slice(&MAGIC[..16]);
    out
}

// ── Discovery block ───────────────────────────────────────────────────────────

pub mod discovery_status {
    pub const FACTORY_INITIALIZED: u16 = 0x0001;
    pub const LOGGED_IN: u16 = 0x0002;
}

/// Contents of slot 15: `[swapped MAGIC 32][SERIAL 32][HELLO 32][STATUS u16]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryInfo {
    pub serial: [u8; 32],
    pub hello: [u8; 32],
    pub status: u16,
}

impl DiscoveryInfo {
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..32].copy_from_slice(&swapped_magic());
        block[32..64].copy_from_slice(&self.serial);
        block[64..96].copy_from_slice(&self.hello);
        block[96..98].copy_from_slice(&self.status.to_le_bytes());
        block
    }

    pub fn decode(block: &[u8]) -> Option<Self> {
        if block.len() < 98 || block[..32] != swapped_magic() {
            return None;
        }
        let mut serial = [0u8; 32];
        let mut hello = [0u8; 32];
        serial.copy_from_slice(&block[32..64]);
        hello.copy_from_slice(&block[64..96]);
        Some(Self {
            serial,
            hello,
            status: u16::from_le_bytes([block[96], block[97]]),
        })
    }

    pub fn hello_text(&self) -> String {
        text_field(&self.hello)
    }

    pub fn serial_text(&self) -> String {
        text_field(&self.serial)
    }
}

/// Render a fixed-size field as text: printable ASCII up to the first NUL, hex otherwise.
fn text_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let head = &bytes[..end];
    if head.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        String::from_utf8_lossy(head).into_owned()
    } else {
        hex::encode(bytes)
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub word0: u16,
    pub word1: u16,
    pub len: u16,
    pub token: u32,
    pub crc: u16,
}

impl FrameHeader {
    pub fn parse(block0: &[u8]) -> Result<Self, TransportError> {
        if block0.len() < HEADER_SIZE {
            return Err(TransportError::Malformed("short header block".into()));
        }
        let u16_at = |off: usize| u16::from_le_bytes([block0[off], block0[off + 1]]);
        Ok(Self {
            word0: u16_at(OFF_WORD0),
            word1: u16_at(OFF_WORD1),
            len: u16_at(OFF_LEN),
            token: u32::from_le_bytes([
                block0[OFF_TOKEN],
                block0[OFF_TOKEN + 1],
                block0[OFF_TOKEN + 2],
                block0[OFF_TOKEN + 3],
            ]),
            crc: u16_at(OFF_CRC),
        })
    }

    pub fn write(&self, block0: &mut [u8]) {
        block0[OFF_WORD0..OFF_WORD0 + 2].copy_from_slice(&self.word0.to_le_bytes());
        block0[OFF_WORD1..OFF_WORD1 + 2].copy_from_slice(&self.word1.to_le_bytes());
        block0[OFF_LEN..OFF_LEN + 2].copy_from_slice(&self.len.to_le_bytes());
        block0[OFF_TOKEN..OFF_TOKEN + 4].copy_from_slice(&self.token.to_le_bytes());
        block0[OFF_CRC..OFF_CRC + 2].copy_from_slice(&self.crc.to_le_bytes());
    }

    /// Number of blocks (header included) the declared length occupies.
    pub fn blocks(&self) -> usize {
        blocks_for(self.len as usize)
    }
}

/// Number of blocks needed to carry `len` payload bytes.
pub fn blocks_for(len: usize) -> usize {
    if len <= BLOCK0_DATA {
        1
    } else {
        1 + (len - BLOCK0_DATA).div_ceil(DATA_BLOCK_DATA)
    }
}

/// Bitmap of data slots (bit i-1 for slot i) a frame of `len` bytes occupies.
pub fn data_slot_mask(len: usize) -> u16 {
    let data_blocks = blocks_for(len) - 1;
    ((1u32 << data_blocks) - 1) as u16
}

fn frame_crc(block0: &[u8], data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(&block0[..OFF_CRC]);
    crc.update(data);
    crc.finish()
}

/// Single header block carrying no payload. Unlike [`encode_frame`] this
/// cannot fail, so it is the last resort for status-only answers.
pub fn empty_frame(word0: u16, word1: u16, token: u32, with_crc: bool) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    let mut header = FrameHeader {
        word0,
        word1,
        len: 0,
        token,
        crc: 0,
    };
    header.write(&mut block);
    if with_crc {
        header.crc = frame_crc(&block, &[]);
        header.write(&mut block);
    }
    block
}

/// Lay out `data` as a contiguous run of blocks starting with a header block.
pub fn encode_frame(
    word0: u16,
    word1: u16,
    token: u32,
    data: &[u8],
    with_crc: bool,
) -> Result<Vec<u8>, TransportError> {
    if data.len() > MAX_FRAME_DATA {
        return Err(TransportError::Oversize(data.len()));
    }
    let nblocks = blocks_for(data.len());
    let mut out = vec![0u8; nblocks * BLOCK_SIZE];

    let header = FrameHeader {
        word0,
        word1,
        len: data.len() as u16,
        token,
        crc: 0,
    };
    header.write(&mut out[..BLOCK_SIZE]);

    let (head, rest) = data.split_at(data.len().min(BLOCK0_DATA));
    out[HEADER_SIZE..HEADER_SIZE + head.len()].copy_from_slice(head);
    for (i, chunk) in rest.chunks(DATA_BLOCK_DATA).enumerate() {
        let block = &mut out[(i + 1) * BLOCK_SIZE..(i + 2) * BLOCK_SIZE];
        block[..DATA_BLOCK_TOKEN].copy_from_slice(&token.wrapping_add(i as u32 + 1).to_le_bytes());
        block[DATA_BLOCK_TOKEN..DATA_BLOCK_TOKEN + chunk.len()].copy_from_slice(chunk);
    }

    if with_crc {
        let crc = frame_crc(&out[..BLOCK_SIZE], data);
        out[OFF_CRC..OFF_CRC + 2].copy_from_slice(&crc.to_le_bytes());
    }
    Ok(out)
}

/// Verify that data blocks 1..nblocks carry `token0 + i`.
pub fn check_tokens(blocks: &[u8], token0: u32, nblocks: usize) -> Result<(), TransportError> {
    for i in 1..nblocks {
        let block = &blocks[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE];
        let got = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        let expected = token0.wrapping_add(i as u32);
        if got != expected {
            return Err(TransportError::TokenGap {
                block: i,
                expected,
                got,
            });
        }
    }
    Ok(())
}

/// Reassemble a frame from contiguous blocks, validating length, token
/// contiguity and (optionally) the CRC.
pub fn decode_frame(blocks: &[u8], with_crc: bool) -> Result<(FrameHeader, Vec<u8>), TransportError> {
    if blocks.is_empty() || blocks.len() % BLOCK_SIZE != 0 {
        return Err(TransportError::Malformed(format!(
            "{} bytes is not a whole number of blocks",
            blocks.len()
        )));
    }
    let header = FrameHeader::parse(&blocks[..BLOCK_SIZE])?;
    let len = header.len as usize;
    if len > MAX_FRAME_DATA {
        return Err(TransportError::Oversize(len));
    }
    let nblocks = header.blocks();
    if blocks.len() < nblocks * BLOCK_SIZE {
        return Err(TransportError::Malformed(format!(
            "frame declares {nblocks} blocks, only {} present",
            blocks.len() / BLOCK_SIZE
        )));
    }
    check_tokens(blocks, header.token, nblocks)?;

    let mut data = Vec::with_capacity(len);
    let head = len.min(BLOCK0_DATA);
    data.extend_from_slice(&blocks[HEADER_SIZE..HEADER_SIZE + head]);
    let mut remaining = len - head;
    for i in 1..nblocks {
        let take = remaining.min(DATA_BLOCK_DATA);
        let start = i * BLOCK_SIZE + DATA_BLOCK_TOKEN;
        data.extend_from_slice(&blocks[start..start + take]);
        remaining -= take;
    }

    if with_crc && frame_crc(&blocks[..BLOCK_SIZE], &data) != header.crc {
        return Err(TransportError::Malformed("CRC mismatch".into()));
    }
    Ok((header, data))
}

// ── Typed field access ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("truncated field: need {need} bytes at offset {at}, {have} available")]
pub struct Truncated {
    pub at: usize,
    pub need: usize,
    pub have: usize,
}

impl From<Truncated> for TransportError {
    fn from(e: Truncated) -> Self {
        TransportError::Malformed(e.to_string())
    }
}

impl From<Truncated> for Status {
    fn from(_: Truncated) -> Self {
        Status::InvalidParams
    }
}

impl From<Truncated> for crate::Se3Error {
    fn from(e: Truncated) -> Self {
        crate::Se3Error::Transport(e.into())
    }
}

/// Bounds-checked little-endian cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], Truncated> {
        let have = self.buf.len() - self.pos;
        if n > have {
            return Err(Truncated {
                at: self.pos,
                need: n,
                have,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], Truncated> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u16(&mut self) -> Result<u16, Truncated> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, Truncated> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Skip forward to the next multiple of `align` (relative to the start).
    pub fn align(&mut self, align: usize) -> Result<(), Truncated> {
        let pad = self.pos.next_multiple_of(align) - self.pos;
        self.bytes(pad).map(|_| ())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Growable little-endian writer, the counterpart of [`ByteReader`].
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Zero-pad up to the next multiple of `align`.
    pub fn align(&mut self, align: usize) -> &mut Self {
        let target = self.buf.len().next_multiple_of(align);
        self.buf.resize(target, 0);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_max_frame_data() {
        assert_eq!(MAX_FRAME_DATA, 7608);
        assert_eq!(blocks_for(MAX_FRAME_DATA), FRAME_SLOTS);
        assert_eq!(blocks_for(0), 1);
        assert_eq!(blocks_for(BLOCK0_DATA), 1);
        assert_eq!(blocks_for(BLOCK0_DATA + 1), 2);
    }

    #[test]
    fn test_data_slot_mask() {
        assert_eq!(data_slot_mask(10), 0);
        assert_eq!(data_slot_mask(BLOCK0_DATA + 1), 0b1);
        assert_eq!(data_slot_mask(MAX_FRAME_DATA), 0x3FFF);
    }

    #[test]
    fn test_magic_block_detection() {
        for i in 0..16u8 {
            assert_eq!(parse_magic_block(&magic_block(i)), Some(i));
        }
        let mut bad = magic_block(3);
        bad[100] ^= 1;
        assert_eq!(parse_magic_block(&bad), None);

        let mut out_of_range = magic_block(0);
        out_of_range[BLOCK_SIZE - 1] = 16;
        assert_eq!(parse_magic_block(&out_of_range), None);
        assert_eq!(parse_magic_block(&[0u8; BLOCK_SIZE]), None);
    }

    #[test]
    fn test_discovery_block_is_not_magic() {
        let info = DiscoveryInfo {
            serial: [7u8; 32],
            hello: *b"SE3 device emulator\0\0\0\0\0\0\0\0\0\0\0\0\0",
            status: discovery_status::FACTORY_INITIALIZED,
        };
        let block = info.encode();
        assert_eq!(parse_magic_block(&block), None);
        let decoded = DiscoveryInfo::decode(&block).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(decoded.hello_text(), "SE3 device emulator");
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let data = vec![0u8; MAX_FRAME_DATA + 1];
        assert_eq!(
            encode_frame(1, 0, 0, &data, false),
            Err(TransportError::Oversize(MAX_FRAME_DATA + 1))
        );
    }

    #[test]
    fn test_crc_detects_corruption() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut blocks = encode_frame(3, 0x0001, 42, &data, true).unwrap();
        assert!(decode_frame(&blocks, true).is_ok());
        blocks[BLOCK_SIZE + 10] ^= 0x80;
        assert!(matches!(
            decode_frame(&blocks, true),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_empty_frame_matches_encoder() {
        for crc in [false, true] {
            let block = empty_frame(RESPONSE_READY, 0x0C, 99, crc);
            assert_eq!(
                block.to_vec(),
                encode_frame(RESPONSE_READY, 0x0C, 99, &[], crc).unwrap()
            );
            assert!(decode_frame(&block, crc).unwrap().1.is_empty());
        }
    }

    #[test]
    fn test_binary_serial_renders_as_hex() {
        let mut serial = [0u8; 32];
        serial[..3].copy_from_slice(&[0x01, 0xAB, 0xFF]);
        let text = text_field(&serial);
        assert_eq!(text.len(), 64);
        assert!(text.starts_with("01abff00"));
        assert_eq!(text_field(b"SE3\0\0"), "SE3");
    }

    #[test]
    fn test_token_wraps() {
        let data = vec![1u8; 2000];
        let blocks = encode_frame(3, 0, u32::MAX, &data, false).unwrap();
        let (header, decoded) = decode_frame(&blocks, false).unwrap();
        assert_eq!(header.token, u32::MAX);
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_reader_truncation() {
        let mut r = ByteReader::new(&[1, 0, 2]);
        assert_eq!(r.u16().unwrap(), 1);
        assert!(r.u16().is_err());
    }

    #[test]
    fn test_writer_align() {
        let mut w = ByteWriter::new();
        w.u32(1).u16(2).align(16);
        assert_eq!(w.len(), 16);
        let buf = w.finish();
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.u32().unwrap(), 1);
        r.align(16).unwrap();
        assert_eq!(r.remaining(), 0);
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(len in 0usize..=MAX_FRAME_DATA, token in any::<u32>()) {
            let data: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
            let blocks = encode_frame(3, 0, token, &data, true).unwrap();
            prop_assert_eq!(blocks.len(), blocks_for(len) * BLOCK_SIZE);
            let (header, decoded) = decode_frame(&blocks, true).unwrap();
            prop_assert_eq!(header.token, token);
            prop_assert_eq!(decoded, data);
        }

        #[test]
        fn prop_any_token_gap_rejected(nblocks in 2usize..=FRAME_SLOTS, victim in 1usize..FRAME_SLOTS, delta in 1u32..1000) {
            let victim = 1 + (victim - 1) % (nblocks - 1);
            let len = BLOCK0_DATA + (nblocks - 1) * DATA_BLOCK_DATA;
            let mut blocks = encode_frame(3, 0, 1000, &vec![0xAA; len], false).unwrap();
            let off = victim * BLOCK_SIZE;
            let token = u32::from_le_bytes(blocks[off..off + 4].try_into().unwrap());
            blocks[off..off + 4].copy_from_slice(&token.wrapping_add(delta).to_le_bytes());
            let gap = matches!(decode_frame(&blocks, false), Err(TransportError::TokenGap { .. }));
            prop_assert!(gap);
        }
    }
}
