//! Device side of the block tunnel.
//!
//! Every block the host writes is classified here. Magic blocks claim
//! physical addresses for the 16 protocol slots; once all 16 are seen the
//! slot map freezes and writes to those addresses become protocol blocks.
//! Anything else passes through to storage.
//!
//! ```text
//! PassThrough ──magic──▶ Claiming(seen) ──all 16──▶ Ready(slot map)
//!                           ▲    │ collision            │
//!                           └────┘◀───────magic─────────┘
//! ```

use tracing::{debug, trace, warn};

use se3_core::types::cmd_flags;
use se3_core::wire::{
    blocks_for, data_slot_mask, decode_frame, empty_frame, encode_frame, parse_magic_block,
    FrameHeader, BLOCK_SIZE, DATA_BLOCK_TOKEN, DISCOVERY_SLOT, FRAME_SLOTS, MAX_FRAME_DATA,
    RESPONSE_READY, SLOT_COUNT,
};
use se3_core::Status;

const ALL_SLOTS: u16 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    PassThrough,
    Claiming {
        seen: u16,
        addrs: [Option<u64>; SLOT_COUNT],
    },
    Ready {
        slots: [u64; SLOT_COUNT],
    },
}

/// What the device should do with a written block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelWrite {
    /// Ordinary data (or a magic block): write it to storage.
    Store,
    /// Consumed by the tunnel; nothing to store or run yet.
    Absorbed,
    /// A request frame is complete.
    Request(FrameHeader, Vec<u8>),
    /// A frame completed but failed validation; answer it with `status`.
    Rejected { token: u32, crc: bool, status: Status },
}

/// Blocks of the frame currently being received.
#[derive(Debug)]
struct Reassembly {
    blocks: Vec<u8>,
    /// Bit i set once slot i has been written
    received: u16,
}

impl Reassembly {
    fn new() -> Self {
        Self {
            blocks: vec![0u8; FRAME_SLOTS * BLOCK_SIZE],
            received: 0,
        }
    }

    fn header(&self) -> Option<FrameHeader> {
        if self.received & 1 == 0 {
            return None;
        }
        FrameHeader::parse(&self.blocks[..BLOCK_SIZE]).ok()
    }

    /// Forget data slots left over from an earlier frame: a slot belongs to
    /// the frame in slot 0 only if it carries `token + slot`.
    fn drop_stale(&mut self, header: &FrameHeader) {
        for slot in 1..FRAME_SLOTS {
            if self.received & (1 << slot) == 0 {
                continue;
            }
            let at = slot * BLOCK_SIZE;
            let mut token = [0u8; DATA_BLOCK_TOKEN];
            token.copy_from_slice(&self.blocks[at..at + DATA_BLOCK_TOKEN]);
            if u32::from_le_bytes(token) != header.token.wrapping_add(slot as u32) {
                trace!(slot, "dropping stale data slot");
                self.received &= !(1 << slot);
            }
        }
    }

    /// Bits still missing for the frame announced in slot 0.
    fn outstanding(&self, header: &FrameHeader) -> u16 {
        let len = (header.len as usize).min(MAX_FRAME_DATA);
        let expected = 1 | (data_slot_mask(len) << 1);
        expected & !self.received
    }
}

/// Pending response and how many more polls to answer "busy".
#[derive(Debug)]
struct Pending {
    token: u32,
    frame: Vec<u8>,
    busy_left: u32,
}

#[derive(Debug)]
pub struct DeviceTunnel {
    state: TunnelState,
    rx: Reassembly,
    response: Option<Pending>,
    busy_polls: u32,
}

impl DeviceTunnel {
    /// `busy_polls` reads of slot 0 answer "busy" before each response.
    pub fn new(busy_polls: u32) -> Self {
        Self {
            state: TunnelState::PassThrough,
            rx: Reassembly::new(),
            response: None,
            busy_polls,
        }
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, TunnelState::Ready { .. })
    }

    /// Protocol slot mapped to `addr`, if the tunnel is ready.
    pub fn slot_of(&self, addr: u64) -> Option<usize> {
        match &self.state {
            TunnelState::Ready { slots } => slots.iter().position(|&a| a == addr),
            _ => None,
        }
    }

    fn claim(&mut self, index: usize, addr: u64) {
        let restart = |index: usize, addr: u64| {
            let mut addrs = [None; SLOT_COUNT];
            addrs[index] = Some(addr);
            TunnelState::Claiming {
                seen: 1 << index,
                addrs,
            }
        };
        let next = match &self.state {
            TunnelState::PassThrough => restart(index, addr),
            TunnelState::Ready { .. } => {
                debug!(index, addr, "magic write while ready, reclaiming slots");
                restart(index, addr)
            }
            TunnelState::Claiming { seen, addrs } => {
                let collision = addrs
                    .iter()
                    .enumerate()
                    .any(|(i, a)| i != index && *a == Some(addr));
                if collision {
                    warn!(index, addr, "slot address collision, restarting claim");
                    restart(index, addr)
                } else {
                    let mut addrs = *addrs;
                    addrs[index] = Some(addr);
                    let seen = seen | 1 << index;
                    if seen == ALL_SLOTS {
                        let mut slots = [0u64; SLOT_COUNT];
                        for (slot, a) in slots.iter_mut().zip(addrs) {
                            *slot = a.unwrap_or_default();
                        }
                        debug!(?slots, "protocol slots claimed");
                        TunnelState::Ready { slots }
                    } else {
                        TunnelState::Claiming { seen, addrs }
                    }
                }
            }
        };
        self.rx = Reassembly::new();
        self.response = None;
        self.state = next;
    }

    /// Classify one block written at physical address `addr`.
    pub fn write(&mut self, addr: u64, block: &[u8]) -> TunnelWrite {
        if let Some(index) = parse_magic_block(block) {
            self.claim(index as usize, addr);
            return TunnelWrite::Store;
        }
        match self.slot_of(addr) {
            None => TunnelWrite::Store,
            Some(DISCOVERY_SLOT) => TunnelWrite::Absorbed,
            Some(slot) => self.receive(slot, block),
        }
    }

    fn receive(&mut self, slot: usize, block: &[u8]) -> TunnelWrite {
        if block.len() != BLOCK_SIZE {
            return TunnelWrite::Absorbed;
        }
        if slot == 0 {
            self.response = None;
        }
        self.rx.blocks[slot * BLOCK_SIZE..(slot + 1) * BLOCK_SIZE].copy_from_slice(block);
        self.rx.received |= 1 << slot;

        let Some(header) = self.rx.header() else {
            return TunnelWrite::Absorbed;
        };
        if slot == 0 {
            self.rx.drop_stale(&header);
        }
        let crc = header.word1 & cmd_flags::CRC != 0;
        if header.len as usize > MAX_FRAME_DATA {
            self.rx.received = 0;
            warn!(len = header.len, "oversize request frame");
            return TunnelWrite::Rejected {
                token: header.token,
                crc,
                status: Status::Communication,
            };
        }
        if self.rx.outstanding(&header) != 0 {
            return TunnelWrite::Absorbed;
        }

        let nblocks = blocks_for(header.len as usize);
        self.rx.received = 0;
        match decode_frame(&self.rx.blocks[..nblocks * BLOCK_SIZE], crc) {
            Ok((header, data)) => {
                trace!(cmd = header.word0, len = data.len(), blocks = nblocks, "request frame complete");
                TunnelWrite::Request(header, data)
            }
            Err(err) => {
                warn!(%err, "request frame rejected");
                TunnelWrite::Rejected {
                    token: header.token,
                    crc,
                    status: Status::Communication,
                }
            }
        }
    }

    /// Publish the response to the frame that started with `token`.
    pub fn respond(&mut self, token: u32, status: Status, data: &[u8], crc: bool) {
        let frame = match encode_frame(RESPONSE_READY, status.code(), token, data, crc) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "response does not fit a frame");
                empty_frame(RESPONSE_READY, Status::Hardware.code(), token, crc).to_vec()
            }
        };
        self.response = Some(Pending {
            token,
            frame,
            busy_left: self.busy_polls,
        });
    }

    /// Fill `out` with the content of protocol slot `slot` (0..15).
    pub fn read_slot(&mut self, slot: usize, out: &mut [u8]) {
        out.fill(0);
        let Some(pending) = self.response.as_mut() else {
            return;
        };
        if pending.busy_left > 0 {
            if slot == 0 {
                pending.busy_left -= 1;
                let busy = FrameHeader {
                    word0: 0,
                    word1: Status::Busy.code(),
                    len: 0,
                    token: pending.token,
                    crc: 0,
                };
                busy.write(out);
            }
            return;
        }
        let start = slot * BLOCK_SIZE;
        if start < pending.frame.len() {
            let end = (start + out.len()).min(pending.frame.len());
            out[..end - start].copy_from_slice(&pending.frame[start..end]);
        }
    }
}
