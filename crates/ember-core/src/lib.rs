//! ember-core — wire format, packet buffers, transport frames, CRC.
//! Everything that IS the bus contract lives here; state lives above.

pub mod codec;
pub mod crc;
pub mod frame;
pub mod wire;

pub use codec::{AnchorU8, CodecError, InBuffer, OutBuffer};
pub use frame::{Frame, FrameId, FRAME_PAYLOAD_MAX};
pub use wire::{MessageHeader, MsgType, PacketHeader, StreamMode, WireError};
