//! The device context — one explicitly constructed object owning config,
//! buffers, transport port, and the update controller. There are no
//! globals; collaborators are injected and time is passed in, so the whole
//! engine runs under simulated hardware and simulated clocks.
//!
//! Execution model: the reception driver pushes frames through the shared
//! port handle from its own context; everything else happens inside
//! `poll`, called from the single cooperative main loop.

use std::sync::Arc;

use ember_core::codec::{InBuffer, OutBuffer};
use ember_core::wire::{CryptMode, Direction, PacketHeader, StreamMode, BUS_MAX_HEADER};

use crate::config::EngineConfig;
use crate::hal::{Cipher, Flash, FrameTx, KeyMaterial, NvStore};
use crate::identity::{derive_device_id, derive_hardware_id};
use crate::nvconfig::{ConfigStore, Mode};
use crate::port::FramePort;
use crate::update::{StreamSession, UpdateController, FIRMWARE_STREAM_NAME};

/// Outcome of one main-loop pass.
#[must_use = "a Restart outcome obligates the embedder to reset the device"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    /// The engine is done; the embedder must reset the device now.
    /// Restart is both the uniform recovery action and the completion
    /// action of a successful update.
    Restart,
}

pub struct Device<F: Flash, N: NvStore, C: Cipher> {
    pub(crate) profile: EngineConfig,
    pub(crate) config: ConfigStore<N>,
    pub(crate) updater: UpdateController<F, C>,
    pub(crate) port: Arc<FramePort>,
    pub(crate) inb: InBuffer,
    pub(crate) out: OutBuffer,
    pub(crate) keys: KeyMaterial,
    pub(crate) hwid: String,
    pub(crate) name: String,
    pub(crate) address: u8,
    pub(crate) tid: u16,
    pub(crate) restart_pending: bool,
}

impl<F: Flash, N: NvStore, C: Cipher> Device<F, N, C> {
    /// Build the context. `unique` is the chip-unique byte string the
    /// hardware id is derived from.
    pub fn new(profile: EngineConfig, unique: &[u8], nv: N, flash: F, cipher: C) -> Self {
        let hwid = derive_hardware_id(unique);
        let port = Arc::new(FramePort::new(
            profile.buffers.rx_ring_frames,
            profile.buffers.tx_fifo_frames,
        ));
        let out = OutBuffer::new(BUS_MAX_HEADER, profile.buffers.out_buffer_bytes);
        let updater = UpdateController::new(
            flash,
            cipher,
            profile.firmware.region_start,
            profile.region_end(),
            profile.firmware.wait_window_ms,
        );
        Self {
            profile,
            config: ConfigStore::new(nv),
            updater,
            port,
            inb: InBuffer::new(),
            out,
            keys: KeyMaterial::factory_default(),
            hwid,
            name: String::new(),
            address: 0,
            tid: 0,
            restart_pending: false,
        }
    }

    /// Handle for the reception/transmission driver context.
    pub fn port(&self) -> Arc<FramePort> {
        Arc::clone(&self.port)
    }

    pub fn hardware_id(&self) -> &str {
        &self.hwid
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn stream_session(&self) -> Option<&StreamSession> {
        self.updater.session()
    }

    /// One-time startup: load persisted identity, tune the port filter,
    /// announce ourselves, and normalize the persisted mode.
    pub fn setup(&mut self, tx: &mut dyn FrameTx) {
        self.address = self.config.address();
        self.keys = self.config.key_material();
        let stored = self.config.name();
        self.name = if stored.is_empty() {
            self.profile.identity.name.clone()
        } else {
            stored
        };

        let device_id = derive_device_id(&self.hwid);
        self.port.set_identity(device_id, self.address);
        tracing::info!(
            hwid = %self.hwid,
            device_id,
            address = self.address,
            "device online"
        );

        // Announce on the bus so a host scanning for devices sees us
        // without asking.
        self.send_search_response(tx, None, None);

        // Anything but a pending download normalizes to Run before the
        // bus gets a chance to change it.
        if self.config.mode() != Mode::Download {
            self.config.set_mode(Mode::Run);
            self.config.flush();
        }
    }

    /// One cooperative main-loop pass.
    pub fn poll(&mut self, now: u64, tx: &mut dyn FrameTx) -> Tick {
        // Persist any dirty NV shadow, drain one queued frame, then parse.
        self.config.work();
        self.port.pump_tx(tx);
        self.process_inbound(now, tx);

        if self.config.mode() == Mode::Download {
            self.resume_download(now, tx);
        }

        if let Some(session) = self.updater.take_expired(now) {
            self.send_stream_close_request(tx, session.peer, session.id);
            self.config.set_mode(Mode::Run);
            self.config.flush();
            self.restart_pending = true;
        }

        if self.restart_pending {
            Tick::Restart
        } else {
            Tick::Idle
        }
    }

    fn process_inbound(&mut self, now: u64, tx: &mut dyn FrameTx) {
        while let Some(packet) = self.port.take_packet() {
            self.inb.bind(packet);
            if !self.inb.filter_noise(self.address) {
                continue;
            }
            let header = match self.inb.open_packet(self.address) {
                Ok(header) => header,
                Err(error) => {
                    tracing::debug!(%error, "dropping packet");
                    continue;
                }
            };
            // Crypt mode was validated during open; a ciphered packet on
            // an unprovisioned bootloader session is dropped untouched.
            if header.crypt != CryptMode::Plain {
                tracing::debug!(crypt = ?header.crypt, "ciphered packet, dropping");
                continue;
            }
            let mh = match self.inb.read_message_header() {
                Ok(mh) => mh,
                Err(error) => {
                    tracing::debug!(%error, "bad message header, dropping");
                    continue;
                }
            };
            if mh.direction == Direction::Response {
                tracing::trace!(msg_type = mh.msg_type, "ignoring response");
                continue;
            }
            self.dispatch(now, tx, header.src, &mh);
            self.inb.close_packet();
        }
    }

    /// The application left a transfer pending before rebooting into the
    /// bootloader: reopen the stream and tell the stored peer, using the
    /// transaction id of its original request.
    fn resume_download(&mut self, now: u64, tx: &mut dyn FrameTx) {
        self.config.set_mode(Mode::Run);
        self.config.flush();

        let peer = self.config.firmware_source();
        let tid = self.config.firmware_tid();
        let id = self
            .updater
            .open(FIRMWARE_STREAM_NAME, StreamMode::Write, peer, now);
        tracing::info!(peer, id, "resuming firmware download after restart");
        self.send_stream_open_response(
            tx,
            peer,
            Some(tid),
            StreamMode::Write as u8,
            FIRMWARE_STREAM_NAME,
            id,
        );
    }

    pub(crate) fn next_tid(&mut self) -> u16 {
        self.tid = self.tid.wrapping_add(1);
        self.tid
    }

    /// Queue the finalized outbound message, fragmenting into frames.
    ///
    /// A full FIFO is not fatal: the loop flushes queued frames while
    /// retrying, so waiting on the transport stays useful work. If the
    /// transmitter itself is wedged there is nothing left to do but drop
    /// the response and let the peer's timeout handle it.
    pub(crate) fn send_packet(&mut self, tx: &mut dyn FrameTx, dst: Option<u8>) {
        let ph = match dst {
            Some(dst) => PacketHeader::addressed(self.address, dst),
            None => PacketHeader::broadcast(self.address),
        };
        loop {
            let packet = self.out.finalize(&ph);
            if self.port.enqueue_packet(dst.is_none(), dst.unwrap_or(0), packet) {
                break;
            }
            if !self.port.pump_tx(tx) {
                tracing::warn!("transmit path saturated, dropping packet");
                break;
            }
        }
        self.out.clear();
    }
}
