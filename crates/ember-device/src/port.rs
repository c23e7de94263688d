//! Frame port — the shared store between the reception context and the
//! main loop, plus packet fragmentation and reassembly.
//!
//! The driver side does exactly two things: push one received frame, or
//! take one queued frame for transmission. Everything else (run tracking,
//! concatenation, fragmentation) happens on the main-loop side. Every scan
//! or shift of the shared state runs inside one short mutex scope — the
//! critical section — which is never held across a flash operation or any
//! other call that can block.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;

use ember_core::frame::{Frame, FrameId, FRAME_PAYLOAD_MAX};
use ember_core::wire::MAX_PACKET;

use crate::hal::FrameTx;

struct PortState {
    rx: VecDeque<Frame>,
    rx_cap: usize,
    tx: VecDeque<Frame>,
    tx_cap: usize,
    device: u16,
    address: u8,
    next_tid: u8,
    rx_dropped: u64,
}

/// Shared transport port. Clone the surrounding `Arc` into the reception
/// driver; the engine keeps its own handle for the main loop.
pub struct FramePort {
    state: Mutex<PortState>,
}

impl FramePort {
    pub fn new(rx_cap: usize, tx_cap: usize) -> Self {
        Self {
            state: Mutex::new(PortState {
                rx: VecDeque::with_capacity(rx_cap),
                rx_cap,
                tx: VecDeque::with_capacity(tx_cap),
                tx_cap,
                device: 0,
                address: 0,
                next_tid: 0,
                rx_dropped: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)tune the identifier fields used for filtering and fragmentation.
    pub fn set_identity(&self, device: u16, address: u8) {
        let mut state = self.lock();
        state.device = device;
        state.address = address;
    }

    pub fn set_address(&self, address: u8) {
        self.lock().address = address;
    }

    /// Reception-context entry point: append one frame and return.
    ///
    /// Frames addressed elsewhere are filtered here, mirroring a hardware
    /// acceptance filter; a full ring drops the frame rather than growing.
    pub fn push_frame(&self, frame: Frame) {
        let mut state = self.lock();
        if !frame.id.broadcast && frame.id.dest != state.address {
            return;
        }
        if state.rx.len() >= state.rx_cap {
            state.rx_dropped += 1;
            return;
        }
        state.rx.push_back(frame);
    }

    /// Number of received frames dropped to the ring bound.
    pub fn rx_dropped(&self) -> u64 {
        self.lock().rx_dropped
    }

    /// Scan the ring for a completed packet and surface it once.
    ///
    /// A run is the prefix of buffered frames sharing one identifier
    /// (end bit aside). A frame that breaks the run discards the orphaned
    /// prefix — lost frames cost one packet, never a stalled bus. The run
    /// completes when its end-flagged frame is present; the payloads are
    /// concatenated in arrival order and the frames consumed.
    pub fn take_packet(&self) -> Option<BytesMut> {
        let mut state = self.lock();
        let mut idx = 0;
        let mut run_key: Option<u32> = None;
        let mut run_bytes = 0usize;

        while idx < state.rx.len() {
            let id = state.rx[idx].id;
            match run_key {
                Some(key) if id.run_key() != key => {
                    tracing::debug!(
                        orphaned = idx,
                        "transaction id changed mid-run, discarding prefix"
                    );
                    state.rx.drain(..idx);
                    idx = 0;
                    run_key = None;
                    run_bytes = 0;
                    continue;
                }
                _ => run_key = Some(id.run_key()),
            }

            run_bytes += state.rx[idx].payload().len();
            if run_bytes > MAX_PACKET {
                tracing::warn!(run_bytes, "oversized run, discarding");
                state.rx.drain(..=idx);
                idx = 0;
                run_key = None;
                run_bytes = 0;
                continue;
            }

            if id.end {
                let mut packet = BytesMut::with_capacity(run_bytes);
                for frame in state.rx.drain(..=idx) {
                    packet.extend_from_slice(frame.payload());
                }
                return Some(packet);
            }
            idx += 1;
        }
        None
    }

    /// Fragment one packet into frames and queue them FIFO.
    ///
    /// Returns false without queueing anything when the FIFO cannot take
    /// the whole packet — partial packets on the bus are worse than a
    /// retried send.
    pub fn enqueue_packet(&self, broadcast: bool, dest: u8, data: &[u8]) -> bool {
        debug_assert!(!data.is_empty());
        let mut state = self.lock();
        let frames = data.len().div_ceil(FRAME_PAYLOAD_MAX);
        if state.tx.len() + frames > state.tx_cap {
            return false;
        }
        let tid = state.next_tid;
        state.next_tid = (tid + 1) & 0x07;

        let chunks = data.chunks(FRAME_PAYLOAD_MAX);
        let last = frames - 1;
        for (i, chunk) in chunks.enumerate() {
            let id = FrameId {
                device: state.device,
                tid,
                broadcast,
                dest: if broadcast { 0 } else { dest },
                end: i == last,
            };
            state.tx.push_back(Frame::new(id, chunk));
        }
        true
    }

    /// Drain at most one queued frame — single-frame-in-flight.
    ///
    /// The frame is copied out before the transmit attempt so the critical
    /// section is not held while the driver touches hardware; only the
    /// main loop pops, so the front cannot change in between.
    pub fn pump_tx(&self, tx: &mut dyn FrameTx) -> bool {
        let front = {
            let state = self.lock();
            match state.tx.front() {
                Some(frame) => *frame,
                None => return false,
            }
        };
        if !tx.try_transmit(&front) {
            return false;
        }
        self.lock().tx.pop_front();
        true
    }

    pub fn tx_pending(&self) -> usize {
        self.lock().tx.len()
    }
}
