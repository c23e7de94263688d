//! ember integration harness.
//!
//! Every scenario runs a real `Device` over simulated collaborators: a
//! RAM flash region, a shared NV store that survives simulated restarts,
//! a symmetric keystream cipher, and a frame-capturing transmitter. The
//! host side of each exchange is encoded and decoded with the same
//! ember-core codec the device uses, so both directions of the wire
//! format are exercised.

mod admin;
mod discovery;
mod update;
