//! Administration over the bus: address assignment, naming, PIN changes,
//! and the PIN gate itself. There is no separate admin channel — these
//! ride the same message set as everything else.

use ember_core::wire::{Direction, MsgType};
use ember_device::{AccessOp, NvStore};

use crate::infra::*;

#[test]
fn set_address_assigns_persists_and_retunes_the_filter() {
    let mut bench = Bench::new();
    let hwid = bench.device.hardware_id().to_owned();

    bench.send_request(MsgType::SetAddress, |out| {
        out.add_u32_le(0) && out.add_u8(0x2A) && out.add_string(&hwid)
    });
    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::SetAddress, Direction::Response);
    assert_eq!(resp.payload, [0x2A]);

    assert_eq!(bench.device.address(), 0x2A);
    assert_eq!(
        bench.nv.read_u8(ember_device::nvconfig::map::LOCAL_ADDRESS),
        0x2A
    );

    // The device now answers on the new address only.
    bench.send_request(MsgType::Search, |_| true);
    let (_, responses) = bench.tick_and_collect();
    expect_one(&responses, MsgType::Search, Direction::Response);
}

#[test]
fn set_address_with_foreign_hardware_id_is_silent() {
    let mut bench = Bench::new();
    bench.send_request(MsgType::SetAddress, |out| {
        out.add_u32_le(0) && out.add_u8(0x2A) && out.add_string("00FF00FF00FF00FF00FF00FF00FF00FF")
    });
    let (_, responses) = bench.tick_and_collect();
    assert!(responses.is_empty(), "foreign hwid must be ignored");
    assert_eq!(bench.device.address(), DEVICE_ADDR);
}

#[test]
fn pin_gate_permits_everything_while_unprovisioned() {
    let bench = Bench::new();
    assert!(bench.device.test_pin(AccessOp::WriteAddress, 0));
    assert!(bench.device.test_pin(AccessOp::WriteAddress, 999_999));
}

#[test]
fn pin_gate_requires_exact_match_once_provisioned() {
    let mut bench = Bench::new();
    bench.send_request(MsgType::SetPin, |out| {
        out.add_u32_le(0) && out.add_u32_le(1234)
    });
    let (_, responses) = bench.tick_and_collect();
    expect_one(&responses, MsgType::SetPin, Direction::Response);

    assert!(bench.device.test_pin(AccessOp::WriteAddress, 1234));
    assert!(!bench.device.test_pin(AccessOp::WriteAddress, 1233));
    assert!(!bench.device.test_pin(AccessOp::WriteAddress, 0));
    assert!(
        bench.device.test_pin(AccessOp::WriteStream, 0),
        "stream writes bypass the pin gate"
    );
}

#[test]
fn wrong_pin_refuses_address_change_silently() {
    let mut bench = Bench::new();
    let hwid = bench.device.hardware_id().to_owned();

    bench.send_request(MsgType::SetPin, |out| {
        out.add_u32_le(0) && out.add_u32_le(4321)
    });
    let (_, responses) = bench.tick_and_collect();
    expect_one(&responses, MsgType::SetPin, Direction::Response);

    bench.send_request(MsgType::SetAddress, |out| {
        out.add_u32_le(1111) && out.add_u8(0x30) && out.add_string(&hwid)
    });
    let (_, responses) = bench.tick_and_collect();
    assert!(responses.is_empty());
    assert_eq!(bench.device.address(), DEVICE_ADDR);

    bench.send_request(MsgType::SetAddress, |out| {
        out.add_u32_le(4321) && out.add_u8(0x30) && out.add_string(&hwid)
    });
    let (_, responses) = bench.tick_and_collect();
    expect_one(&responses, MsgType::SetAddress, Direction::Response);
    assert_eq!(bench.device.address(), 0x30);
}

#[test]
fn set_name_persists_and_shows_in_device_info() {
    let mut bench = Bench::new();
    bench.send_request(MsgType::SetName, |out| {
        out.add_u32_le(0) && out.add_string("boiler room 3")
    });
    let (_, responses) = bench.tick_and_collect();
    expect_one(&responses, MsgType::SetName, Direction::Response);

    bench.send_request(MsgType::DeviceInfo, |_| true);
    let (_, responses) = bench.tick_and_collect();
    let resp = expect_one(&responses, MsgType::DeviceInfo, Direction::Response);
    let (name, _) = read_string_at(&resp.payload, 1);
    assert_eq!(name, "boiler room 3");

    // Survives a simulated restart: same NV, fresh device.
    let nv = bench.nv.clone();
    drop(bench);
    let mut reborn = Bench::build(move |fresh| {
        *fresh = nv;
    });
    reborn.send_request(MsgType::DeviceInfo, |_| true);
    let (_, responses) = reborn.tick_and_collect();
    let resp = expect_one(&responses, MsgType::DeviceInfo, Direction::Response);
    let (name, _) = read_string_at(&resp.payload, 1);
    assert_eq!(name, "boiler room 3");
}
