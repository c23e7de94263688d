//! Firmware streaming end to end: open, blocks, close, the failure modes,
//! the idle timeout, and post-restart download recovery.

use ember_core::wire::{Direction, MsgType, StreamMode};
use ember_device::nvconfig::map;
use ember_device::{NvStore, SessionState, Tick, FIRMWARE_WRITE_STREAM_ID};

use crate::infra::*;

fn open_stream(bench: &mut Bench) -> u8 {
    bench.send_request(MsgType::StreamOpen, |out| {
        out.add_u8(StreamMode::Write as u8) && out.add_string("firmware")
    });
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    let resp = expect_one(&responses, MsgType::StreamOpen, Direction::Response);
    let (mode, name, id) = parse_stream_open(resp);
    assert_eq!(mode, StreamMode::Write as u8);
    assert_eq!(name, "firmware");
    id
}

fn send_block(bench: &mut Bench, stream_id: u8, block_id: u8, data: &[u8]) {
    bench.send_request(MsgType::StreamBlock, |out| {
        out.add_u8(stream_id) && out.add_u8(block_id) && out.add_bytes(data)
    });
}

#[test]
fn full_update_flow_erases_once_writes_and_restarts() {
    let mut bench = Bench::new();
    let id = open_stream(&mut bench);
    assert_eq!(id, FIRMWARE_WRITE_STREAM_ID);

    let mut sender = FirmwareSender::new(&bench.device_keys());
    let body: Vec<u8> = (0..100).map(|i| i as u8).collect();
    let flushes_before = bench.nv.flushes();

    // First block: header + 100 image bytes.
    let block = sender.first_block(100, 0xC0DE, &body);
    send_block(&mut bench, id, 0, &block);
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    let resp = expect_one(&responses, MsgType::StreamBlock, Direction::Response);
    assert_eq!(parse_stream_block(resp), (id, 0, 108));

    assert_eq!(bench.flash.erases(), 1);
    assert!(bench.flash.locked(), "flash relocked between blocks");
    assert_eq!(bench.nv.read_u32(map::FIRMWARE_SIZE), 100);
    assert_eq!(bench.nv.read_u16(map::FIRMWARE_CRC), 0xC0DE);
    assert_eq!(bench.flash.read(REGION_START, 100), body);
    assert!(
        bench.nv.flushes() > flushes_before,
        "metadata force-flushed after the first block"
    );
    assert_eq!(
        bench.device.stream_session().unwrap().state,
        SessionState::Active
    );

    // Second block continues the cipher stream, no second erase.
    let more: Vec<u8> = (0..32).map(|i| 0x80 | i as u8).collect();
    let block = sender.next_block(&more);
    send_block(&mut bench, id, 1, &block);
    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::StreamBlock, Direction::Response);
    assert_eq!(parse_stream_block(resp), (id, 1, 32));
    assert_eq!(bench.flash.erases(), 1);
    assert_eq!(bench.flash.read(REGION_START + 100, 32), more);

    // Close: no response on the wire, exactly one restart obligation.
    bench.send_request(MsgType::StreamClose, |out| out.add_u8(id));
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Restart);
    assert!(responses.is_empty(), "close is answered by the restart");
    assert!(bench.device.stream_session().is_none());
}

#[test]
fn open_while_active_returns_zero() {
    let mut bench = Bench::new();
    let first = open_stream(&mut bench);
    assert_ne!(first, 0);
    let second = open_stream(&mut bench);
    assert_eq!(second, 0, "zero id is the rejection signal");
    assert!(bench.device.stream_session().is_some());
}

#[test]
fn wrong_name_or_read_mode_is_rejected_with_zero() {
    let mut bench = Bench::new();

    bench.send_request(MsgType::StreamOpen, |out| {
        out.add_u8(StreamMode::Write as u8) && out.add_string("telemetry")
    });
    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::StreamOpen, Direction::Response);
    assert_eq!(parse_stream_open(resp).2, 0);

    bench.send_request(MsgType::StreamOpen, |out| {
        out.add_u8(StreamMode::Read as u8) && out.add_string("firmware")
    });
    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::StreamOpen, Direction::Response);
    assert_eq!(parse_stream_open(resp).2, 0);

    assert!(bench.device.stream_session().is_none());
}

#[test]
fn mismatched_stream_id_gets_no_response() {
    let mut bench = Bench::new();
    let id = open_stream(&mut bench);
    send_block(&mut bench, id + 1, 0, &[0u8; 32]);
    let (_, responses) = bench.tick_and_collect();
    assert!(responses.is_empty());
}

#[test]
fn bad_marker_consumes_nothing_skips_erase_and_times_out() {
    let mut bench = Bench::new();
    let id = open_stream(&mut bench);

    // Sender keyed with something else entirely.
    let mut rogue = FirmwareSender::new(&ember_device::KeyMaterial {
        key: [0x5A; 32],
        iv: [0x11; 16],
    });
    let block = rogue.first_block(100, 0xC0DE, &[0u8; 100]);
    send_block(&mut bench, id, 0, &block);

    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    let resp = expect_one(&responses, MsgType::StreamBlock, Direction::Response);
    assert_eq!(parse_stream_block(resp), (id, 0, 0), "zero bytes consumed");
    assert_eq!(bench.flash.erases(), 0, "no erase without a valid header");

    // Deadline collapsed to "now": the very next tick tears down.
    bench.advance(1);
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Restart);
    let close = expect_one(&responses, MsgType::StreamClose, Direction::Request);
    assert_eq!(close.header.dst, HOST_ADDR);
    assert_eq!(close.payload, [id]);
}

#[test]
fn idle_session_times_out_notifies_once_and_restarts() {
    let mut bench = Bench::new();
    let id = open_stream(&mut bench);

    // Inside the window: nothing happens.
    bench.advance(WAIT_MS);
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    assert!(responses.is_empty());

    // Past the window: one close notification, one restart.
    bench.advance(1);
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Restart);
    let close = expect_one(&responses, MsgType::StreamClose, Direction::Request);
    assert_eq!(close.payload, [id]);
    assert!(bench.device.stream_session().is_none());
    assert_eq!(
        bench.nv.read_u8(map::MODE),
        ember_device::Mode::Run as u8,
        "safe mode persisted before restart"
    );

    // The notification is not repeated on later ticks.
    bench.advance(WAIT_MS);
    let (_, responses) = bench.tick_and_collect();
    assert!(responses.is_empty());
}

#[test]
fn accepted_blocks_refresh_the_deadline() {
    let mut bench = Bench::new();
    let id = open_stream(&mut bench);
    let mut sender = FirmwareSender::new(&bench.device_keys());

    bench.advance(WAIT_MS - 1);
    let block = sender.first_block(100, 0x1111, &[0x33; 100]);
    send_block(&mut bench, id, 0, &block);
    let (tick, _) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);

    // Would have expired under the original deadline.
    bench.advance(WAIT_MS - 1);
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    assert!(responses.is_empty());
}

#[test]
fn download_mode_resumes_the_stream_after_restart() {
    let mut bench = Bench::build(|nv| {
        nv.write_u8(map::LOCAL_ADDRESS, DEVICE_ADDR);
        nv.write_u8(map::MODE, ember_device::Mode::Download as u8);
        nv.write_u8(map::FIRMWARE_SOURCE, HOST_ADDR);
        nv.write_u16(map::FIRMWARE_TID, 0x0A0B);
    });

    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    let resp = expect_one(&responses, MsgType::StreamOpen, Direction::Response);
    assert_eq!(resp.header.dst, HOST_ADDR);
    assert_eq!(resp.mh.tid, Some(0x0A0B), "stored transaction id reused");
    let (mode, name, id) = parse_stream_open(resp);
    assert_eq!(mode, StreamMode::Write as u8);
    assert_eq!(name, "firmware");
    assert_eq!(id, FIRMWARE_WRITE_STREAM_ID);

    assert!(bench.device.stream_session().is_some());
    assert_eq!(
        bench.nv.read_u8(map::MODE),
        ember_device::Mode::Run as u8,
        "mode rewritten so a crash loops back to Run"
    );

    // The reopened stream accepts blocks as usual.
    let mut sender = FirmwareSender::new(&bench.device_keys());
    let block = sender.first_block(64, 0x7777, &[0x44; 64]);
    send_block(&mut bench, id, 0, &block);
    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::StreamBlock, Direction::Response);
    assert_eq!(parse_stream_block(resp).2, 72);
    assert_eq!(bench.flash.erases(), 1);
}
