//! Protocol session — message-level dispatch and handlers.
//!
//! Requests come in, responses go out; everything else is a silent no-op.
//! A peer whose request was refused (bad PIN, wrong hardware id, stream id
//! mismatch) observes only a missing response and applies its own timeout —
//! the device never explains a rejection on the bus.

use ember_core::wire::{MessageHeader, MsgType, StreamMode};

use crate::device::Device;
use crate::hal::{Cipher, Flash, FrameTx, NvStore};
use crate::nvconfig::Mode;

/// Operation classes consulting the PIN gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOp {
    WriteAddress,
    WriteName,
    WritePin,
    WriteStream,
}

impl<F: Flash, N: NvStore, C: Cipher> Device<F, N, C> {
    /// PIN gate: a stored PIN of zero is the unprovisioned state and
    /// permits everything; otherwise the supplied value must match
    /// exactly. Stream writes are exempt — the image cipher is their
    /// gate. Allow or deny only; there is no lockout.
    pub fn test_pin(&self, op: AccessOp, pin: u32) -> bool {
        let stored = self.config.pin();
        if stored == 0 {
            return true;
        }
        match op {
            AccessOp::WriteStream => true,
            _ => pin == stored,
        }
    }

    pub(crate) fn dispatch(
        &mut self,
        now: u64,
        tx: &mut dyn FrameTx,
        peer: u8,
        mh: &MessageHeader,
    ) {
        match MsgType::from_u8(mh.msg_type) {
            Some(MsgType::Search) => self.send_search_response(tx, Some(peer), mh.tid),
            Some(MsgType::DeviceInfo) => self.handle_device_info(tx, peer, mh.tid),
            Some(MsgType::SetAddress) => self.handle_set_address(tx, peer, mh.tid),
            Some(MsgType::SetName) => self.handle_set_name(tx, peer, mh.tid),
            Some(MsgType::SetPin) => self.handle_set_pin(tx, peer, mh.tid),
            Some(MsgType::StreamOpen) => self.handle_stream_open(now, tx, peer, mh.tid),
            Some(MsgType::StreamBlock) => self.handle_stream_block(now, tx, peer, mh.tid),
            Some(MsgType::StreamClose) => self.handle_stream_close(),
            None => tracing::debug!(msg_type = mh.msg_type, "unknown message type"),
        }
    }

    /// Identity reply: group and hardware id. Also sent unsolicited at
    /// startup (broadcast, `dst` = None).
    pub(crate) fn send_search_response(
        &mut self,
        tx: &mut dyn FrameTx,
        dst: Option<u8>,
        tid: Option<u16>,
    ) {
        self.out.clear();
        let mh = MessageHeader::response(MsgType::Search, tid);
        let ok = self.out.add_message_header(&mh)
            && self.out.add_u8(self.profile.identity.group)
            && self.out.add_string(&self.hwid);
        if ok {
            self.send_packet(tx, dst);
        } else {
            self.out.clear();
        }
    }

    fn handle_device_info(&mut self, tx: &mut dyn FrameTx, peer: u8, tid: Option<u16>) {
        self.out.clear();
        let mh = MessageHeader::response(MsgType::DeviceInfo, tid);
        let ok = self.out.add_message_header(&mh)
            && self.out.add_u8(self.profile.identity.group)
            && self.out.add_string(&self.name)
            && self.out.add_string(&self.profile.identity.producer)
            && self.out.add_string(&self.profile.identity.model)
            && self.out.add_string(&self.hwid)
            && self.out.add_u32_le(self.profile.identity.device_flags)
            && self.out.add_u32_le(self.profile.identity.version)
            && self.out.add_u32_le(0) // control channels: none in the bootloader
            && self.out.add_u32_le(0); // feedback tags: none
        if ok {
            self.send_packet(tx, Some(peer));
        } else {
            tracing::warn!("device info does not fit the out buffer");
            self.out.clear();
        }
    }

    /// Address assignment, targeted by hardware id: every device on the
    /// bus hears the request, only the one whose hwid matches acts.
    fn handle_set_address(&mut self, tx: &mut dyn FrameTx, peer: u8, tid: Option<u16>) {
        let (Ok(pin), Ok(address), Ok(hwid)) = (
            self.inb.read_u32_le(),
            self.inb.read_u8(),
            self.inb.read_string(),
        ) else {
            return;
        };
        if hwid != self.hwid {
            return;
        }
        if !self.test_pin(AccessOp::WriteAddress, pin) {
            tracing::debug!(peer, "address change refused, pin mismatch");
            return;
        }

        self.address = address;
        self.config.set_address(address);
        self.port.set_address(address);
        tracing::info!(address, "bus address assigned");

        self.out.clear();
        let mh = MessageHeader::response(MsgType::SetAddress, tid);
        if self.out.add_message_header(&mh) && self.out.add_u8(address) {
            self.send_packet(tx, Some(peer));
        } else {
            self.out.clear();
        }
    }

    fn handle_set_name(&mut self, tx: &mut dyn FrameTx, peer: u8, tid: Option<u16>) {
        let (Ok(pin), Ok(name)) = (self.inb.read_u32_le(), self.inb.read_string()) else {
            return;
        };
        if !self.test_pin(AccessOp::WriteName, pin) {
            tracing::debug!(peer, "rename refused, pin mismatch");
            return;
        }
        self.config.set_name(&name);
        self.name = name;

        self.out.clear();
        let mh = MessageHeader::response(MsgType::SetName, tid);
        if self.out.add_message_header(&mh) {
            self.send_packet(tx, Some(peer));
        }
    }

    fn handle_set_pin(&mut self, tx: &mut dyn FrameTx, peer: u8, tid: Option<u16>) {
        let (Ok(old), Ok(new)) = (self.inb.read_u32_le(), self.inb.read_u32_le()) else {
            return;
        };
        if !self.test_pin(AccessOp::WritePin, old) {
            tracing::debug!(peer, "pin change refused");
            return;
        }
        self.config.set_pin(new);

        self.out.clear();
        let mh = MessageHeader::response(MsgType::SetPin, tid);
        if self.out.add_message_header(&mh) {
            self.send_packet(tx, Some(peer));
        }
    }

    /// Stream open. The response always goes out; a zero stream id is the
    /// rejection signal, not an error.
    fn handle_stream_open(&mut self, now: u64, tx: &mut dyn FrameTx, peer: u8, tid: Option<u16>) {
        let (Ok(mode_raw), Ok(name)) = (self.inb.read_u8(), self.inb.read_string()) else {
            return;
        };
        if !self.test_pin(AccessOp::WriteStream, 0) {
            return;
        }

        let id = match StreamMode::from_u8(mode_raw) {
            Some(mode) => self.updater.open(&name, mode, peer, now),
            None => 0,
        };
        if id != 0 {
            // Recovery bookkeeping: after a restart the stream is reopened
            // toward this peer with this transaction id.
            self.config.set_firmware_origin(peer, tid.unwrap_or(0));
        }
        self.send_stream_open_response(tx, peer, tid, mode_raw, &name, id);
    }

    pub(crate) fn send_stream_open_response(
        &mut self,
        tx: &mut dyn FrameTx,
        peer: u8,
        tid: Option<u16>,
        mode_raw: u8,
        name: &str,
        id: u8,
    ) {
        self.out.clear();
        let mh = MessageHeader::response(MsgType::StreamOpen, tid);
        let ok = self.out.add_message_header(&mh)
            && self.out.add_u8(mode_raw)
            && self.out.add_string(name)
            && self.out.add_u8(id);
        if ok {
            self.send_packet(tx, Some(peer));
        } else {
            self.out.clear();
        }
    }

    fn handle_stream_block(&mut self, now: u64, tx: &mut dyn FrameTx, peer: u8, tid: Option<u16>) {
        let (Ok(stream_id), Ok(block_id)) = (self.inb.read_u8(), self.inb.read_u8()) else {
            return;
        };

        let Device {
            inb,
            updater,
            config,
            keys,
            ..
        } = self;
        let data = inb.take_rest_mut();
        let Some(consumed) = updater.block(config, keys, stream_id, block_id, data, now) else {
            return;
        };

        self.out.clear();
        let mh = MessageHeader::response(MsgType::StreamBlock, tid);
        let ok = self.out.add_message_header(&mh)
            && self.out.add_u8(stream_id)
            && self.out.add_u8(block_id)
            && self.out.add_u16_le(consumed as u16);
        if ok {
            self.send_packet(tx, Some(peer));
        } else {
            self.out.clear();
        }
    }

    /// Stream close: no response on the wire — the restart is the answer.
    fn handle_stream_close(&mut self) {
        let Ok(stream_id) = self.inb.read_u8() else {
            return;
        };
        if self.updater.close(stream_id) {
            self.config.set_mode(Mode::Run);
            self.config.flush();
            self.restart_pending = true;
        }
    }

    /// Unsolicited close notification for an abandoned session.
    pub(crate) fn send_stream_close_request(
        &mut self,
        tx: &mut dyn FrameTx,
        peer: u8,
        stream_id: u8,
    ) {
        self.out.clear();
        let tid = self.next_tid();
        let mh = MessageHeader::request(MsgType::StreamClose, tid);
        if self.out.add_message_header(&mh) && self.out.add_u8(stream_id) {
            self.send_packet(tx, Some(peer));
        } else {
            self.out.clear();
        }
    }
}
