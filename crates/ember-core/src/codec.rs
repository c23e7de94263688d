//! Packet buffers: outbound assembly and inbound parsing.
//!
//! Both buffers are allocated once and reused for the life of the device;
//! nothing here allocates per packet. Outbound appends report capacity
//! exhaustion as `false` — the caller flushes and retries, it is never a
//! fatal condition. Inbound reads are bounds-checked against the currently
//! open message and return typed errors the dispatcher logs and drops.

use bytes::BytesMut;

use crate::crc::{crc16, CRC_INIT};
use crate::wire::{MessageHeader, PacketHeader, WireError, BUS_CRC_SIZE, PROTOCOL_ID};

/// Error from a bounds-checked inbound read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("read of {wanted} bytes overruns the message ({available} left)")]
    OutOfBounds { wanted: usize, available: usize },

    #[error("string payload is not valid utf-8")]
    BadString,
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// Handle for a reserved byte whose value is patched after later content
/// is written (a count of entries, a flags summary). Single use: `patch_u8`
/// consumes it, and a handle from before the last `clear` is rejected.
#[derive(Debug)]
#[must_use = "an unredeemed anchor leaves a placeholder byte on the wire"]
pub struct AnchorU8 {
    pos: usize,
    epoch: u32,
}

/// Outbound packet buffer.
///
/// Layout of the backing store: a reserved header region at the front
/// (the packet header is written last, right-aligned against the message),
/// the message body, and a reserved CRC trailer at the back.
pub struct OutBuffer {
    buf: Box<[u8]>,
    header: usize,
    ptr: usize,
    open_anchors: u16,
    epoch: u32,
}

impl OutBuffer {
    /// `capacity` is the full backing size including the `header` reserve
    /// and the CRC trailer.
    pub fn new(header: usize, capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            header,
            ptr: header,
            open_anchors: 0,
            epoch: 0,
        }
    }

    /// Drop the message under construction and invalidate open anchors.
    pub fn clear(&mut self) {
        self.ptr = self.header;
        self.open_anchors = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn space_left(&self) -> usize {
        self.buf.len() - BUS_CRC_SIZE - self.ptr
    }

    fn put(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.space_left() {
            return false;
        }
        self.buf[self.ptr..self.ptr + bytes.len()].copy_from_slice(bytes);
        self.ptr += bytes.len();
        true
    }

    pub fn add_u8(&mut self, value: u8) -> bool {
        self.put(&[value])
    }

    pub fn add_u16_le(&mut self, value: u16) -> bool {
        self.put(&value.to_le_bytes())
    }

    pub fn add_u32_le(&mut self, value: u32) -> bool {
        self.put(&value.to_le_bytes())
    }

    pub fn add_f32_le(&mut self, value: f32) -> bool {
        self.put(&value.to_le_bytes())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> bool {
        self.put(bytes)
    }

    /// Length-prefixed string: one length byte, then the bytes. Strings
    /// longer than 255 bytes do not fit the prefix and are refused whole.
    pub fn add_string(&mut self, value: &str) -> bool {
        let bytes = value.as_bytes();
        if bytes.len() > u8::MAX as usize || 1 + bytes.len() > self.space_left() {
            return false;
        }
        self.put(&[bytes.len() as u8]) && self.put(bytes)
    }

    /// Message header: flags, type, and the transaction id iff present.
    /// Checked as a unit so a capacity failure never leaves half a header.
    pub fn add_message_header(&mut self, mh: &MessageHeader) -> bool {
        if mh.encoded_len() > self.space_left() {
            return false;
        }
        self.put(&[mh.flags_byte(), mh.msg_type]);
        if let Some(tid) = mh.tid {
            self.put(&tid.to_le_bytes());
        }
        true
    }

    /// Reserve one byte now, patch it once the value is known.
    pub fn reserve_u8(&mut self) -> Option<AnchorU8> {
        let pos = self.ptr;
        if !self.put(&[0]) {
            return None;
        }
        self.open_anchors += 1;
        Some(AnchorU8 {
            pos,
            epoch: self.epoch,
        })
    }

    /// Redeem an anchor. Returns false for a handle that predates the last
    /// `clear` — patching through it would corrupt an unrelated message.
    pub fn patch_u8(&mut self, anchor: AnchorU8, value: u8) -> bool {
        if anchor.epoch != self.epoch || anchor.pos >= self.ptr {
            return false;
        }
        self.buf[anchor.pos] = value;
        self.open_anchors -= 1;
        true
    }

    pub fn open_anchors(&self) -> u16 {
        self.open_anchors
    }

    /// Message body written so far, without header or CRC.
    pub fn message(&self) -> &[u8] {
        &self.buf[self.header..self.ptr]
    }

    pub fn message_len(&self) -> usize {
        self.ptr - self.header
    }

    /// Pack the header right-aligned against the message, append the CRC
    /// over header+message, and return the complete packet image.
    ///
    /// The buffer stays intact; call `clear` once the packet is queued.
    pub fn finalize(&mut self, ph: &PacketHeader) -> &[u8] {
        let hlen = ph.encoded_len();
        debug_assert!(hlen <= self.header, "header reserve too small");
        let start = self.header - hlen;
        ph.write(&mut self.buf[start..self.header]);

        let crc = crc16(CRC_INIT, &self.buf[start..self.ptr]);
        self.buf[self.ptr..self.ptr + BUS_CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        &self.buf[start..self.ptr + BUS_CRC_SIZE]
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Inbound packet buffer: a rebindable window over one received packet.
///
/// Lifetime of a binding is one packet: `bind`, `filter_noise`,
/// `open_packet`, reads, `close_packet`. Rebinding clears all state first.
#[derive(Default)]
pub struct InBuffer {
    data: BytesMut,
    cursor: usize,
    msg_end: usize,
}

impl InBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebind to a newly received packet, dropping any previous state.
    pub fn bind(&mut self, data: BytesMut) {
        self.clear();
        self.data = data;
    }

    pub fn clear(&mut self) {
        self.data = BytesMut::new();
        self.cursor = 0;
        self.msg_end = 0;
    }

    /// Scan forward from the cursor, discarding bytes until a sequence
    /// consistent with a packet header for us (or for everyone) is found.
    /// Transport corruption therefore costs the damaged prefix, not a
    /// stalled parser. Returns whether a candidate start was found.
    pub fn filter_noise(&mut self, local: u8) -> bool {
        let data = &self.data[..];
        let mut i = self.cursor;
        while i + 1 < data.len() {
            if data[i + 1] == PROTOCOL_ID {
                if let Ok((header, _)) = PacketHeader::parse(&data[i..]) {
                    if header.accepts(local) {
                        self.cursor = i;
                        return true;
                    }
                }
            }
            i += 1;
        }
        self.cursor = data.len();
        false
    }

    /// Validate the packet at the cursor and expose its message view.
    ///
    /// Checks, in order: header fields (version, protocol id, crypt mode),
    /// the destination filter, and the trailing CRC over header+message.
    /// Only then is the payload reachable through the read methods.
    pub fn open_packet(&mut self, local: u8) -> Result<PacketHeader, WireError> {
        let data = &self.data[..];
        let (header, hlen) = PacketHeader::parse(&data[self.cursor..])?;
        if !header.accepts(local) {
            return Err(WireError::ForeignDestination(header.dst));
        }
        if data.len() < self.cursor + hlen + BUS_CRC_SIZE {
            return Err(WireError::Truncated);
        }

        let crc_at = data.len() - BUS_CRC_SIZE;
        let carried = u16::from_le_bytes([data[crc_at], data[crc_at + 1]]);
        let computed = crc16(CRC_INIT, &data[self.cursor..crc_at]);
        if carried != computed {
            return Err(WireError::CrcMismatch { carried, computed });
        }

        self.cursor += hlen;
        self.msg_end = crc_at;
        Ok(header)
    }

    /// Finish with the current packet. One packet per binding: nothing
    /// further can be read until the next `bind`.
    pub fn close_packet(&mut self) {
        self.cursor = self.data.len();
        self.msg_end = 0;
    }

    pub fn remaining(&self) -> usize {
        self.msg_end.saturating_sub(self.cursor)
    }

    fn take(&mut self, wanted: usize) -> Result<usize, CodecError> {
        let available = self.remaining();
        if wanted > available {
            return Err(CodecError::OutOfBounds { wanted, available });
        }
        let at = self.cursor;
        self.cursor += wanted;
        Ok(at)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let at = self.take(1)?;
        Ok(self.data[at])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        let at = self.take(2)?;
        Ok(u16::from_le_bytes([self.data[at], self.data[at + 1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        let at = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[at..at + 4]);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32_le()?))
    }

    pub fn read_bytes(&mut self, wanted: usize) -> Result<&[u8], CodecError> {
        let at = self.take(wanted)?;
        Ok(&self.data[at..at + wanted])
    }

    /// Length-prefixed string, mirroring `OutBuffer::add_string`.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u8()? as usize;
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::BadString)
    }

    pub fn read_message_header(&mut self) -> Result<MessageHeader, CodecError> {
        let (direction, error, no_tid, end, version) =
            MessageHeader::split_flags(self.read_u8()?);
        let msg_type = self.read_u8()?;
        let tid = if no_tid {
            None
        } else {
            Some(self.read_u16_le()?)
        };
        Ok(MessageHeader {
            direction,
            error,
            end,
            version,
            msg_type,
            tid,
        })
    }

    /// Hand out the unread remainder of the message for in-place work
    /// (firmware block decryption), consuming it from the read cursor.
    pub fn take_rest_mut(&mut self) -> &mut [u8] {
        let start = self.cursor;
        let end = self.msg_end;
        self.cursor = end;
        &mut self.data[start..end]
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
