//! Integration test: host tunnel against the emulated device.
//!
//! Frames travel through the real slot claim, block splitting and
//! reassembly. Corrupted token runs must be refused before anything
//! reaches the controller, for every multi-block frame size.

use std::time::{Duration, Instant};

use proptest::prelude::*;

use se3_core::config::{DeviceConfig, TransportConfig};
use se3_core::types::cmd_flags;
use se3_core::wire::{
    blocks_for, encode_frame, magic_block, FrameHeader, BLOCK0_DATA, BLOCK_SIZE,
    DATA_BLOCK_DATA, FRAME_SLOTS, MAX_FRAME_DATA, SLOT_COUNT,
};
use se3_core::{L0Command, Status};
use se3_device::{EmulatedDevice, Se3Device, TunnelWrite};
use se3_transport::{identify, BlockTransport, Transport, Tunnel};

fn transport_config() -> TransportConfig {
    TransportConfig {
        poll_interval_ms: 0,
        direct_io: false,
        ..TransportConfig::default()
    }
}

fn claimed_device() -> Se3Device {
    let mut device = Se3Device::new(&DeviceConfig::default(), 64);
    for i in 0..SLOT_COUNT {
        device.write_block(i as u64, &magic_block(i as u8)).unwrap();
    }
    assert!(device.tunnel().is_ready());
    device
}

/// Payload length that occupies exactly `blocks` blocks.
fn len_for_blocks(blocks: usize) -> usize {
    BLOCK0_DATA + (blocks - 1) * DATA_BLOCK_DATA
}

#[test]
fn echo_over_emulated_disk() {
    let config = transport_config();
    let device = EmulatedDevice::provisioned(&DeviceConfig::default()).unwrap();
    let mut tunnel = Tunnel::new(device.disk(100), &config);
    tunnel.open().unwrap();

    let info = identify(tunnel.blocks_mut(), &config).unwrap().unwrap();
    assert_eq!(info.serial_text(), DeviceConfig::default().serial);

    for len in [0, 1, BLOCK0_DATA, BLOCK0_DATA + 1, 5000, MAX_FRAME_DATA] {
        let data: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
        for flags in [0, cmd_flags::CRC] {
            let resp = tunnel
                .exchange(L0Command::Echo, flags, &data, Duration::from_secs(2))
                .unwrap();
            assert_eq!(resp.status, Status::Ok);
            assert_eq!(resp.data, data, "len {len} flags {flags}");
        }
    }
}

#[test]
fn busy_polls_are_waited_out() {
    let config = transport_config();
    let device = EmulatedDevice::new(&DeviceConfig {
        busy_polls: 3,
        ..DeviceConfig::default()
    });
    let mut tunnel = Tunnel::new(device.disk(0), &config);
    tunnel.open().unwrap();
    identify(tunnel.blocks_mut(), &config).unwrap().unwrap();
    let resp = tunnel
        .exchange(L0Command::Echo, 0, b"slow", Duration::from_secs(2))
        .unwrap();
    assert_eq!(resp.data, b"slow");
}

#[test]
fn files_outside_the_slots_keep_working() {
    let config = transport_config();
    let device = EmulatedDevice::new(&DeviceConfig::default());
    let mut tunnel = Tunnel::new(device.disk(200), &config);
    tunnel.open().unwrap();
    identify(tunnel.blocks_mut(), &config).unwrap().unwrap();

    let file_block = [0x5Au8; BLOCK_SIZE];
    tunnel.blocks_mut().write(40, &file_block).unwrap();
    tunnel
        .exchange(L0Command::Echo, 0, &[1u8; 3000], Duration::from_secs(2))
        .unwrap();
    let mut back = [0u8; BLOCK_SIZE];
    tunnel.blocks_mut().read(40, &mut back).unwrap();
    assert_eq!(back, file_block);
}

#[test]
fn unknown_frame_command_is_reported() {
    let mut device = claimed_device();
    let frame = encode_frame(0x77, 0, 1, b"?", false).unwrap();
    device.write_block(0, &frame).unwrap();
    let mut block0 = [0u8; BLOCK_SIZE];
    device.read_block(0, &mut block0).unwrap();
    let header = FrameHeader::parse(&block0).unwrap();
    assert_eq!(Status::from(header.word1), Status::UnknownCommand);
}

#[test]
fn second_host_is_locked_out() {
    let config = transport_config();
    let device = EmulatedDevice::new(&DeviceConfig::default());
    let mut first = device.disk(0);
    first.open(Instant::now()).unwrap();
    let mut second = Tunnel::new(
        device.disk(0),
        &TransportConfig {
            lock_timeout_ms: 20,
            ..config
        },
    );
    assert!(second.open().is_err());
    first.close();
    second.open().unwrap();
}

proptest! {
    #[test]
    fn contiguous_tokens_reassemble(blocks in 2usize..=FRAME_SLOTS, token in any::<u32>()) {
        let mut device = claimed_device();
        let len = len_for_blocks(blocks);
        prop_assert_eq!(blocks_for(len), blocks);
        let data = vec![0xA5u8; len];
        let frame = encode_frame(L0Command::Echo as u16, 0, token, &data, false).unwrap();
        device.write_block(0, &frame[..BLOCK_SIZE]).unwrap();
        for i in 1..blocks {
            device.write_block(i as u64, &frame[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]).unwrap();
        }
        let mut block0 = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut block0).unwrap();
        let header = FrameHeader::parse(&block0).unwrap();
        prop_assert_eq!(Status::from(header.word1), Status::Ok);
        prop_assert_eq!(header.len as usize, len);
        prop_assert_eq!(header.token, token);
    }

    #[test]
    fn token_gap_never_reaches_dispatch(
        blocks in 2usize..=FRAME_SLOTS,
        bad in any::<prop::sample::Index>(),
        delta in 1u32..u32::MAX,
    ) {
        let mut device = claimed_device();
        let len = len_for_blocks(blocks);
        let mut frame = encode_frame(L0Command::Echo as u16, 0, 1000, &vec![1u8; len], false).unwrap();
        let victim = 1 + bad.index(blocks - 1);
        let at = victim * BLOCK_SIZE;
        let token = u32::from_le_bytes(frame[at..at + 4].try_into().unwrap());
        frame[at..at + 4].copy_from_slice(&token.wrapping_add(delta).to_le_bytes());

        let mut tunnel = se3_device::DeviceTunnel::new(0);
        for i in 0..SLOT_COUNT {
            tunnel.write(i as u64, &magic_block(i as u8));
        }
        let mut last = TunnelWrite::Absorbed;
        for i in 0..blocks {
            last = tunnel.write(i as u64, &frame[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]);
        }
        prop_assert_eq!(last, TunnelWrite::Rejected { token: 1000, crc: false, status: Status::Communication });

        for i in 0..blocks {
            device.write_block(i as u64, &frame[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]).unwrap();
        }
        let mut block0 = [0u8; BLOCK_SIZE];
        device.read_block(0, &mut block0).unwrap();
        let header = FrameHeader::parse(&block0).unwrap();
        prop_assert_eq!(Status::from(header.word1), Status::Communication);
        prop_assert_eq!(header.len, 0);
    }
}
