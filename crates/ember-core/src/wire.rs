//! ember wire format — the on-bus layout of every ember packet.
//!
//! These types ARE the protocol. Every bit position documented here is part
//! of the wire format and shared with every device already in the field;
//! changing anything is a breaking change. Headers are bit-packed, so they
//! are expressed as explicit pack/unpack code over a documented layout
//! rather than derived struct serialization.
//!
//! Bus packet layout, bytes in order:
//!
//! ```text
//! PacketHeader : 1B flags | 1B type (= PROTOCOL_ID) | 1B srcAddr
//!                | 1B dstAddr (present iff the addressed flag is set)
//! MessageHeader: 1B flags | 1B msgType | 2B TID LE (present iff !noTID)
//! Payload      : variable
//! CRC16        : 2B LE, CRC16-MODBUS over header+payload
//! ```

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Fixed protocol id carried in the packet header's type byte.
/// A packet whose type byte differs is bus noise, not an ember packet.
pub const PROTOCOL_ID: u8 = 0xB4;

/// Bus packet format version (2-bit field).
pub const BUS_VERSION: u8 = 0x01;

/// Message format version (4-bit field), currently shared by all types.
pub const MESSAGE_VERSION: u8 = 0x01;

/// Largest logical packet the transport framer will assemble.
pub const MAX_PACKET: usize = 2048;

/// Reserved header region in outbound buffers: flags + type + src + dst.
pub const BUS_MAX_HEADER: usize = 4;

/// Trailing CRC16 size.
pub const BUS_CRC_SIZE: usize = 2;

// ── Packet header ────────────────────────────────────────────────────────────

/// Crypt mode field of the packet header (3 bits).
///
/// The mode must be recognized before any decrypt is attempted; an unknown
/// value drops the packet during open, before the payload is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CryptMode {
    /// Plaintext message.
    Plain = 0x00,
    /// Message body ciphered with the device block cipher.
    Block = 0x01,
}

impl TryFrom<u8> for CryptMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(CryptMode::Plain),
            0x01 => Ok(CryptMode::Block),
            other => Err(WireError::UnknownCryptMode(other)),
        }
    }
}

/// Parsed bus packet header.
///
/// Flags byte, MSB→LSB: version(2) | crypt(3) | addressed(1) | segmented(1)
/// | priority(1). The source address byte is always present; the destination
/// byte only when `addressed` is set (a clear flag means broadcast).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub priority: bool,
    pub segmented: bool,
    pub addressed: bool,
    pub version: u8,
    pub crypt: CryptMode,
    pub src: u8,
    pub dst: u8,
}

impl PacketHeader {
    /// Addressed header with the common bootloader defaults.
    pub fn addressed(src: u8, dst: u8) -> Self {
        Self {
            priority: false,
            segmented: false,
            addressed: true,
            version: BUS_VERSION,
            crypt: CryptMode::Plain,
            src,
            dst,
        }
    }

    /// Broadcast header (no destination byte on the wire).
    pub fn broadcast(src: u8) -> Self {
        Self {
            addressed: false,
            dst: 0,
            ..Self::addressed(src, 0)
        }
    }

    pub fn flags_byte(&self) -> u8 {
        (self.version & 0x03) << 6
            | (self.crypt as u8 & 0x07) << 3
            | (self.addressed as u8) << 2
            | (self.segmented as u8) << 1
            | self.priority as u8
    }

    /// Encoded size: 3 bytes broadcast, 4 bytes addressed.
    pub fn encoded_len(&self) -> usize {
        if self.addressed {
            4
        } else {
            3
        }
    }

    /// Write the header into `out`, which must hold `encoded_len()` bytes.
    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.flags_byte();
        out[1] = PROTOCOL_ID;
        out[2] = self.src;
        if self.addressed {
            out[3] = self.dst;
        }
    }

    /// Parse a header from the front of `buf`, returning it together with
    /// the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < 3 {
            return Err(WireError::Truncated);
        }
        let flags = buf[0];
        let version = flags >> 6;
        if version != BUS_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        let crypt = CryptMode::try_from((flags >> 3) & 0x07)?;
        if buf[1] != PROTOCOL_ID {
            return Err(WireError::UnknownProtocol(buf[1]));
        }
        let addressed = flags & 0x04 != 0;
        let mut header = Self {
            priority: flags & 0x01 != 0,
            segmented: flags & 0x02 != 0,
            addressed,
            version,
            crypt,
            src: buf[2],
            dst: 0,
        };
        if addressed {
            if buf.len() < 4 {
                return Err(WireError::Truncated);
            }
            header.dst = buf[3];
        }
        Ok((header, header.encoded_len()))
    }

    /// Whether a packet with this header is deliverable to `local`.
    pub fn accepts(&self, local: u8) -> bool {
        !self.addressed || self.dst == local
    }
}

// ── Message header ───────────────────────────────────────────────────────────

/// Direction bit of the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Parsed message header.
///
/// Flags byte, MSB→LSB: direction(1) | error(1) | noTID(1) | end(1) |
/// version(4). The 16-bit little-endian transaction id follows the type
/// byte iff noTID is clear; `tid: None` encodes noTID set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub direction: Direction,
    pub error: bool,
    pub end: bool,
    pub version: u8,
    pub msg_type: u8,
    pub tid: Option<u16>,
}

impl MessageHeader {
    pub fn request(msg_type: MsgType, tid: u16) -> Self {
        Self {
            direction: Direction::Request,
            error: false,
            end: true,
            version: MESSAGE_VERSION,
            msg_type: msg_type as u8,
            tid: Some(tid),
        }
    }

    pub fn response(msg_type: MsgType, tid: Option<u16>) -> Self {
        Self {
            direction: Direction::Response,
            error: false,
            end: true,
            version: MESSAGE_VERSION,
            msg_type: msg_type as u8,
            tid,
        }
    }

    pub fn flags_byte(&self) -> u8 {
        (matches!(self.direction, Direction::Response) as u8) << 7
            | (self.error as u8) << 6
            | (self.tid.is_none() as u8) << 5
            | (self.end as u8) << 4
            | self.version & 0x0F
    }

    /// Split a flags byte into (direction, error, noTID, end, version).
    pub fn split_flags(flags: u8) -> (Direction, bool, bool, bool, u8) {
        let direction = if flags & 0x80 != 0 {
            Direction::Response
        } else {
            Direction::Request
        };
        (
            direction,
            flags & 0x40 != 0,
            flags & 0x20 != 0,
            flags & 0x10 != 0,
            flags & 0x0F,
        )
    }

    pub fn encoded_len(&self) -> usize {
        if self.tid.is_some() {
            4
        } else {
            2
        }
    }
}

// ── Message types ────────────────────────────────────────────────────────────

/// Message type registry. The numeric values are the wire contract;
/// administrative operations share the bus with streaming, there is no
/// separate channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Search = 0x01,
    DeviceInfo = 0x02,
    SetAddress = 0x03,
    SetName = 0x04,
    SetPin = 0x05,
    StreamOpen = 0x20,
    StreamBlock = 0x21,
    StreamClose = 0x22,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Search),
            0x02 => Some(Self::DeviceInfo),
            0x03 => Some(Self::SetAddress),
            0x04 => Some(Self::SetName),
            0x05 => Some(Self::SetPin),
            0x20 => Some(Self::StreamOpen),
            0x21 => Some(Self::StreamBlock),
            0x22 => Some(Self::StreamClose),
            _ => None,
        }
    }
}

/// Stream open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamMode {
    Read = 0x01,
    Write = 0x02,
}

impl StreamMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Read),
            0x02 => Some(Self::Write),
            _ => None,
        }
    }
}

// ── Firmware image header ────────────────────────────────────────────────────

/// Marker byte every firmware image starts with, after decryption.
pub const IMAGE_MARKER: u8 = 0x77;

/// Minimum accepted stream block: image header plus padding the sender
/// always supplies.
pub const MIN_STREAM_BLOCK: usize = 16;

/// First eight bytes of a decrypted firmware stream.
///
/// The receiver reads this before a single flash word is erased: a bad
/// marker means the cipher key does not match the sender's, and the stored
/// image must not be disturbed.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ImageHeader {
    /// Random pad byte, ignored.
    pub reserved: u8,
    /// Must equal IMAGE_MARKER.
    pub marker: u8,
    /// Image size in bytes, not counting this header.
    pub size: U32<LittleEndian>,
    /// CRC16-MODBUS of the image, checked by the boot path after programming.
    pub crc: U16<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ImageHeader, [u8; 8]);

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("type byte 0x{0:02x} is not the protocol id")]
    UnknownProtocol(u8),

    #[error("unknown bus version: {0}")]
    UnknownVersion(u8),

    #[error("unknown crypt mode: 0x{0:02x}")]
    UnknownCryptMode(u8),

    #[error("packet truncated")]
    Truncated,

    #[error("packet addressed to 0x{0:02x}, not us")]
    ForeignDestination(u8),

    #[error("crc mismatch: packet carries 0x{carried:04x}, computed 0x{computed:04x}")]
    CrcMismatch { carried: u16, computed: u16 },
}

// ── Tests ────────────────────────────────────────────────────────────────────
