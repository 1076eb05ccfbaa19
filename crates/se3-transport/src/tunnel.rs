//! Request/response exchanges over the claimed slots.
//!
//! The whole request frame is written starting at slot 0, then slot 0 is
//! polled until the device flags the response ready (or the deadline
//! passes). Remaining response blocks are read in one go and the frame is
//! validated for token contiguity and, when requested, CRC. Nothing here
//! retries a failed exchange.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use se3_core::config::TransportConfig;
use se3_core::types::cmd_flags;
use se3_core::wire::{
    decode_frame, encode_frame, FrameHeader, BLOCK_SIZE, MAX_FRAME_DATA, RESPONSE_READY,
};
use se3_core::{L0Command, Se3Result, Status, TransportError};

use crate::block::BlockTransport;

/// Decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub data: Vec<u8>,
}

/// A request/response channel to one device.
pub trait Transport {
    /// Send one frame and wait at most `timeout` for its response.
    fn exchange(
        &mut self,
        cmd: L0Command,
        flags: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Se3Result<Response>;

    fn is_open(&self) -> bool;

    fn close(&mut self);
}

/// `Transport` over any `BlockTransport`.
#[derive(Debug)]
pub struct Tunnel<B: BlockTransport> {
    blocks: B,
    token: u32,
    poll_interval: Duration,
    lock_timeout: Duration,
}

impl<B: BlockTransport> Tunnel<B> {
    pub fn new(blocks: B, config: &TransportConfig) -> Self {
        Self {
            blocks,
            token: rand::random(),
            poll_interval: config.poll_interval(),
            lock_timeout: config.lock_timeout(),
        }
    }

    /// Acquire the device, waiting up to the configured lock timeout.
    pub fn open(&mut self) -> Se3Result<()> {
        self.blocks.open(Instant::now() + self.lock_timeout)
    }

    pub fn blocks(&self) -> &B {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut B {
        &mut self.blocks
    }

    pub fn into_inner(self) -> B {
        self.blocks
    }

    /// Poll slot 0 until the response for `token` is ready.
    fn wait_ready(&mut self, token: u32, deadline: Instant, timeout: Duration) -> Se3Result<Vec<u8>> {
        let mut block0 = vec![0u8; BLOCK_SIZE];
        let mut polls = 0u32;
        loop {
            self.blocks.read(0, &mut block0)?;
            let header = FrameHeader::parse(&block0)?;
            if header.word0 == RESPONSE_READY {
                if header.token != token {
                    return Err(TransportError::TokenGap {
                        block: 0,
                        expected: token,
                        got: header.token,
                    }
                    .into());
                }
                trace!(polls, "response ready");
                return Ok(block0);
            }
            polls += 1;
            if Instant::now() >= deadline {
                debug!(polls, "device did not answer before the deadline");
                return Err(TransportError::Timeout(timeout.as_millis() as u64).into());
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

impl<B: BlockTransport> Transport for Tunnel<B> {
    fn exchange(
        &mut self,
        cmd: L0Command,
        flags: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Se3Result<Response> {
        if !self.blocks.is_open() {
            return Err(TransportError::Closed.into());
        }
        if data.len() > MAX_FRAME_DATA {
            return Err(TransportError::Oversize(data.len()).into());
        }
        let deadline = Instant::now() + timeout;
        let with_crc = flags & cmd_flags::CRC != 0;
        let token = self.token;

        let request = encode_frame(cmd as u16, flags, token, data, with_crc)?;
        let request_blocks = request.len() / BLOCK_SIZE;
        debug!(?cmd, flags, len = data.len(), token, blocks = request_blocks, "sending frame");
        self.blocks.write(0, &request)?;

        let block0 = self.wait_ready(token, deadline, timeout)?;
        let header = FrameHeader::parse(&block0)?;
        if header.len as usize > MAX_FRAME_DATA {
            return Err(TransportError::Oversize(header.len as usize).into());
        }
        let response_blocks = header.blocks();
        let mut frame = block0;
        if response_blocks > 1 {
            frame.resize(response_blocks * BLOCK_SIZE, 0);
            self.blocks.read(1, &mut frame[BLOCK_SIZE..])?;
        }
        let (header, payload) = decode_frame(&frame, with_crc)?;

        self.token = token.wrapping_add((request_blocks + response_blocks) as u32);
        let status = Status::from(header.word1);
        debug!(%status, len = payload.len(), blocks = response_blocks, "frame received");
        Ok(Response {
            status,
            data: payload,
        })
    }

    fn is_open(&self) -> bool {
        self.blocks.is_open()
    }

    fn close(&mut self) {
        self.blocks.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use se3_core::wire::{blocks_for, SLOT_COUNT};
    use se3_core::Se3Error;

    /// Loopback device: answers every request by echoing its payload,
    /// optionally after some busy polls, optionally corrupting a token.
    #[derive(Default)]
    struct Loopback {
        slots: Vec<u8>,
        open: bool,
        busy_polls: u32,
        pending: Option<Vec<u8>>,
        break_token_at: Option<usize>,
        reads: u32,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                slots: vec![0u8; SLOT_COUNT * BLOCK_SIZE],
                ..Default::default()
            }
        }
    }

    impl BlockTransport for Loopback {
        fn open(&mut self, _deadline: Instant) -> Se3Result<()> {
            self.open = true;
            Ok(())
        }

        fn read(&mut self, block: usize, buf: &mut [u8]) -> Se3Result<()> {
            if block == 0 {
                self.reads += 1;
                if self.reads > self.busy_polls {
                    if let Some(resp) = self.pending.take() {
                        self.slots[..resp.len()].copy_from_slice(&resp);
                    }
                }
            }
            let start = block * BLOCK_SIZE;
            buf.copy_from_slice(&self.slots[start..start + buf.len()]);
            Ok(())
        }

        fn write(&mut self, block: usize, buf: &[u8]) -> Se3Result<()> {
            assert_eq!(block, 0);
            let (header, data) = decode_frame(buf, false).unwrap();
            let mut resp = encode_frame(RESPONSE_READY, 0, header.token, &data, false).unwrap();
            if let Some(i) = self.break_token_at {
                resp[i * BLOCK_SIZE] ^= 0xFF;
            }
            // Busy until processed
            self.slots[..2].copy_from_slice(&0u16.to_le_bytes());
            self.reads = 0;
            self.pending = Some(resp);
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn tunnel(device: Loopback) -> Tunnel<Loopback> {
        let config = TransportConfig {
            poll_interval_ms: 0,
            ..TransportConfig::default()
        };
        let mut t = Tunnel::new(device, &config);
        t.open().unwrap();
        t
    }

    #[test]
    fn test_exchange_single_and_multi_block() {
        let mut t = tunnel(Loopback::new());
        for len in [0usize, 10, 496, 497, 3000, MAX_FRAME_DATA] {
            let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let resp = t
                .exchange(L0Command::Echo, 0, &data, Duration::from_secs(1))
                .unwrap();
            assert_eq!(resp.status, Status::Ok);
            assert_eq!(resp.data, data, "len {len}");
        }
    }

    #[test]
    fn test_token_advances_by_blocks_used() {
        let mut t = tunnel(Loopback::new());
        let before = t.token;
        t.exchange(L0Command::Echo, 0, &[0u8; 1000], Duration::from_secs(1))
            .unwrap();
        let used = 2 * blocks_for(1000) as u32;
        assert_eq!(t.token, before.wrapping_add(used));
    }

    #[test]
    fn test_busy_polls_then_ready() {
        let mut device = Loopback::new();
        device.busy_polls = 5;
        let mut t = tunnel(device);
        let resp = t
            .exchange(L0Command::Echo, 0, b"hi", Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.data, b"hi");
        assert!(t.blocks().reads > 5);
    }

    #[test]
    fn test_timeout_when_never_ready() {
        let mut device = Loopback::new();
        device.busy_polls = u32::MAX;
        let mut t = tunnel(device);
        let err = t
            .exchange(L0Command::Echo, 0, b"hi", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Se3Error::Transport(TransportError::Timeout(20))));
    }

    #[test]
    fn test_response_token_gap_rejected() {
        let mut device = Loopback::new();
        device.break_token_at = Some(2);
        let mut t = tunnel(device);
        let err = t
            .exchange(L0Command::Echo, 0, &[1u8; 1200], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err,
            Se3Error::Transport(TransportError::TokenGap { block: 2, .. })
        ));
    }

    #[test]
    fn test_closed_and_oversize() {
        let mut t = Tunnel::new(Loopback::new(), &TransportConfig::default());
        assert!(matches!(
            t.exchange(L0Command::Echo, 0, b"x", Duration::from_millis(1)),
            Err(Se3Error::Transport(TransportError::Closed))
        ));
        t.open().unwrap();
        assert!(matches!(
            t.exchange(
                L0Command::Echo,
                0,
                &vec![0u8; MAX_FRAME_DATA + 1],
                Duration::from_millis(1)
            ),
            Err(Se3Error::Transport(TransportError::Oversize(_)))
        ));
    }
}
