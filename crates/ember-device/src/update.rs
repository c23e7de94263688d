//! Firmware update controller — gates and performs flash programming for
//! the active stream.
//!
//! The contract that keeps an interrupted update recoverable:
//!   - the region is erased exactly once per stream, and only after the
//!     decrypted first block carries a valid image header;
//!   - size, CRC, and run mode are persisted (and force-flushed)
//!     immediately after that first block, so a crash mid-transfer still
//!     leaves enough bookkeeping to know what was in flight;
//!   - flash access is bracketed by unlock/lock on every path, including
//!     the validation-failure one.

use zerocopy::FromBytes;

use ember_core::wire::{ImageHeader, StreamMode, IMAGE_MARKER, MIN_STREAM_BLOCK};

use crate::hal::{Cipher, Flash, KeyMaterial, NvStore};
use crate::nvconfig::{ConfigStore, Mode};

/// The one stream name the bootloader serves.
pub const FIRMWARE_STREAM_NAME: &str = "firmware";

/// Stream id handed out for a write stream.
pub const FIRMWARE_WRITE_STREAM_ID: u8 = 2;

const IMAGE_HEADER_LEN: usize = 8;

/// Lifecycle of the single stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, no block accepted yet.
    OpenPending,
    /// At least one block written.
    Active,
    /// Torn down; the close notification is on its way out.
    Closing,
}

/// The active stream session. At most one exists; it is created by a
/// stream open and destroyed by close, deadline expiry, or restart.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: u8,
    /// Bus address of the sender, used for unsolicited notifications.
    pub peer: u8,
    /// Last accepted block id.
    pub block: u8,
    /// Next flash address to program.
    pub cursor: u32,
    pub start: u32,
    pub end: u32,
    /// Instant (engine milliseconds) past which the session is abandoned.
    pub deadline: u64,
    pub state: SessionState,
}

pub struct UpdateController<F: Flash, C: Cipher> {
    flash: F,
    cipher: C,
    region_start: u32,
    region_end: u32,
    wait_window_ms: u64,
    session: Option<StreamSession>,
}

impl<F: Flash, C: Cipher> UpdateController<F, C> {
    pub fn new(flash: F, cipher: C, region_start: u32, region_end: u32, wait_window_ms: u64) -> Self {
        Self {
            flash,
            cipher,
            region_start,
            region_end,
            wait_window_ms,
            session: None,
        }
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Open a stream. Returns the stream id, zero being the rejection
    /// signal: wrong name, wrong mode, or a session already active.
    pub fn open(&mut self, name: &str, mode: StreamMode, peer: u8, now: u64) -> u8 {
        if self.session.is_some() {
            tracing::debug!(name, "stream open refused, session already active");
            return 0;
        }
        if name != FIRMWARE_STREAM_NAME || mode != StreamMode::Write {
            tracing::debug!(name, ?mode, "stream open refused");
            return 0;
        }
        self.session = Some(StreamSession {
            id: FIRMWARE_WRITE_STREAM_ID,
            peer,
            block: 0,
            cursor: self.region_start,
            start: self.region_start,
            end: self.region_end,
            deadline: now + self.wait_window_ms,
            state: SessionState::OpenPending,
        });
        tracing::info!(peer, "firmware stream opened");
        FIRMWARE_WRITE_STREAM_ID
    }

    /// Process one stream block.
    ///
    /// `None` means silent rejection (no session, id mismatch, runt block)
    /// — the peer gets no response at all. `Some(n)` is the consumed count
    /// to report; zero consumed is the marker-failure abort, which also
    /// collapses the deadline so the idle timeout fires promptly.
    pub fn block<N: NvStore>(
        &mut self,
        config: &mut ConfigStore<N>,
        keys: &KeyMaterial,
        stream_id: u8,
        block_id: u8,
        data: &mut [u8],
        now: u64,
    ) -> Option<usize> {
        let session = self.session.as_mut()?;
        if session.id != stream_id {
            tracing::debug!(stream_id, "block for unknown stream, ignoring");
            return None;
        }
        if data.len() < MIN_STREAM_BLOCK {
            tracing::debug!(len = data.len(), "runt stream block, ignoring");
            return None;
        }

        // First-block detection doubles as the erase-once gate.
        let first = session.cursor == session.start;
        if first {
            self.cipher.set_iv_chaining(true);
            self.cipher.init(keys);
        }
        self.cipher.decode(data);

        self.flash.unlock();

        let mut consumed = data.len();
        let mut payload: &[u8] = data;
        if first {
            match ImageHeader::read_from_prefix(payload) {
                Some(header) if header.marker == IMAGE_MARKER && header.size.get() != 0 => {
                    config.set_mode(Mode::Run);
                    config.set_firmware_meta(header.size.get(), header.crc.get());
                    tracing::info!(
                        size = header.size.get(),
                        crc = header.crc.get(),
                        "image header accepted, erasing region"
                    );
                    self.flash.erase(session.start, session.end);
                    payload = &payload[IMAGE_HEADER_LEN..];
                }
                _ => {
                    tracing::warn!("image marker mismatch, aborting stream");
                    consumed = 0;
                }
            }
        }

        if consumed != 0 {
            let room = (session.end - session.cursor) as usize;
            let writable = payload.len().min(room);
            if writable < payload.len() {
                tracing::warn!(overflow = payload.len() - writable, "image exceeds region");
            }
            self.flash.write(session.cursor, &payload[..writable]);
            session.cursor += writable as u32;
            session.block = block_id;
            session.deadline = now + self.wait_window_ms;
            session.state = SessionState::Active;
        } else {
            session.deadline = now;
        }

        self.flash.lock();

        if first && consumed != 0 {
            config.flush();
        }
        Some(consumed)
    }

    /// Close the stream if the id matches. The caller persists the run
    /// mode and performs the restart; this only tears the session down.
    pub fn close(&mut self, stream_id: u8) -> bool {
        match &self.session {
            Some(session) if session.id == stream_id => {
                tracing::info!(
                    written = session.cursor - session.start,
                    "firmware stream closed"
                );
                self.session = None;
                true
            }
            _ => false,
        }
    }

    /// Tear down and return the session once its deadline has passed.
    pub fn take_expired(&mut self, now: u64) -> Option<StreamSession> {
        let expired = matches!(&self.session, Some(s) if now > s.deadline);
        if !expired {
            return None;
        }
        let mut session = self.session.take()?;
        session.state = SessionState::Closing;
        tracing::info!(peer = session.peer, "firmware stream timed out");
        Some(session)
    }
}
