//! Discovery: boot announcement, search, device info, noise recovery.

use ember_core::wire::{Direction, MsgType};
use ember_device::Tick;

use crate::infra::*;

#[test]
fn device_announces_itself_at_startup() {
    let bench = Bench::new();
    let announce = expect_one(&bench.boot_traffic, MsgType::Search, Direction::Response);
    assert!(!announce.header.addressed, "announcement is broadcast");
    let (_, hwid) = parse_search(announce);
    assert_eq!(hwid, bench.device.hardware_id());
}

#[test]
fn search_request_returns_group_and_hardware_id() {
    let mut bench = Bench::new();
    let tid = bench.send_request(MsgType::Search, |_| true);
    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);

    let resp = expect_one(&responses, MsgType::Search, Direction::Response);
    assert_eq!(resp.mh.tid, Some(tid), "response echoes the request tid");
    assert_eq!(resp.header.dst, HOST_ADDR);
    let (group, hwid) = parse_search(resp);
    assert_eq!(group, 0x02);
    assert_eq!(hwid, bench.device.hardware_id());
    assert_eq!(hwid.len(), 32);
}

#[test]
fn device_info_reports_the_full_identity() {
    let mut bench = Bench::new();
    bench.send_request(MsgType::DeviceInfo, |_| true);
    let (_, responses) = bench.tick_and_collect();

    let resp = expect_one(&responses, MsgType::DeviceInfo, Direction::Response);
    let payload = &resp.payload;
    assert_eq!(payload[0], 0x02, "group");
    let (name, at) = read_string_at(payload, 1);
    let (producer, at) = read_string_at(payload, at);
    let (model, at) = read_string_at(payload, at);
    let (hwid, at) = read_string_at(payload, at);
    assert_eq!(name, "ember-node");
    assert_eq!(producer, "ember");
    assert_eq!(model, "template-1.0");
    assert_eq!(hwid, bench.device.hardware_id());
    // device flags, version, channel count, tag count
    assert_eq!(payload.len() - at, 16);
}

#[test]
fn leading_noise_is_skipped_and_the_packet_still_parses() {
    let mut bench = Bench::new();

    // Build a valid search request, then prepend garbage the transport
    // might deliver after losing sync.
    use ember_core::codec::OutBuffer;
    use ember_core::wire::{MessageHeader, PacketHeader, BUS_MAX_HEADER};
    let mut out = OutBuffer::new(BUS_MAX_HEADER, 128);
    assert!(out.add_message_header(&MessageHeader::request(MsgType::Search, 7)));
    let ph = PacketHeader::addressed(HOST_ADDR, DEVICE_ADDR);
    let mut bytes = vec![0x00, 0xFF, 0x13, 0x7A, 0x55];
    bytes.extend_from_slice(out.finalize(&ph));
    bench.inject_packet(&bytes);

    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::Search, Direction::Response);
    assert_eq!(resp.mh.tid, Some(7));
}

#[test]
fn responses_on_the_bus_are_not_answered() {
    let mut bench = Bench::new();

    use ember_core::codec::OutBuffer;
    use ember_core::wire::{MessageHeader, PacketHeader, BUS_MAX_HEADER};
    let mut out = OutBuffer::new(BUS_MAX_HEADER, 128);
    assert!(out.add_message_header(&MessageHeader::response(MsgType::Search, Some(9))));
    assert!(out.add_u8(0x02));
    assert!(out.add_string("CAFE"));
    let ph = PacketHeader::addressed(HOST_ADDR, DEVICE_ADDR);
    let packet = out.finalize(&ph).to_vec();
    bench.inject_packet(&packet);

    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    assert!(responses.is_empty(), "a response must never trigger a reply");
}

#[test]
fn corrupted_crc_is_dropped_silently() {
    let mut bench = Bench::new();

    use ember_core::codec::OutBuffer;
    use ember_core::wire::{MessageHeader, PacketHeader, BUS_MAX_HEADER};
    let mut out = OutBuffer::new(BUS_MAX_HEADER, 128);
    assert!(out.add_message_header(&MessageHeader::request(MsgType::Search, 3)));
    let ph = PacketHeader::addressed(HOST_ADDR, DEVICE_ADDR);
    let mut packet = out.finalize(&ph).to_vec();
    let last = packet.len() - 1;
    packet[last] ^= 0x01;
    bench.inject_packet(&packet);

    let (tick, responses) = bench.tick_and_collect();
    assert_eq!(tick, Tick::Idle);
    assert!(responses.is_empty());
}
