//! ember-device — the stateful side of the engine: shared frame port,
//! protocol session state machine, firmware update controller, and the
//! persisted device configuration. Wire-format types live in ember-core.

pub mod config;
pub mod device;
pub mod hal;
pub mod identity;
pub mod nvconfig;
pub mod port;
pub mod session;
pub mod update;

#[cfg(test)]
mod testkit;

pub use config::EngineConfig;
pub use device::{Device, Tick};
pub use hal::{Cipher, Flash, FrameTx, KeyMaterial, NvStore};
pub use nvconfig::{ConfigStore, Mode};
pub use port::FramePort;
pub use session::AccessOp;
pub use update::{
    SessionState, StreamSession, UpdateController, FIRMWARE_STREAM_NAME, FIRMWARE_WRITE_STREAM_ID,
};
