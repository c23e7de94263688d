//! Persisted device configuration over the non-volatile collaborator.
//!
//! One fixed address map, typed accessors, and the buffered-write
//! discipline: ordinary setters mark the shadow dirty and rely on the
//! periodic `work` pass; state that must survive an imminent restart is
//! flushed explicitly at the call site.

use crate::hal::{KeyMaterial, NvStore};

/// Non-volatile address map. Fixed for the life of a device: images written
/// by older firmware must stay readable by newer firmware.
pub mod map {
    /// u8 — local bus address.
    pub const LOCAL_ADDRESS: u16 = 0x00;
    /// u8 — operating mode.
    pub const MODE: u16 = 0x01;
    /// u32 — access PIN; zero means unprovisioned.
    pub const PIN: u16 = 0x04;
    /// u32 — pending firmware image size.
    pub const FIRMWARE_SIZE: u16 = 0x08;
    /// u16 — pending firmware image CRC16.
    pub const FIRMWARE_CRC: u16 = 0x0C;
    /// u8 — bus address of the firmware sender.
    pub const FIRMWARE_SOURCE: u16 = 0x0E;
    /// u16 — transaction id of the pending stream-open exchange.
    pub const FIRMWARE_TID: u16 = 0x10;
    /// 32 bytes — device name, NUL padded.
    pub const DEVICE_NAME: u16 = 0x20;
    /// 32 bytes — cipher key (all-zero = factory default).
    pub const CIPHER_KEY: u16 = 0x40;
    /// 16 bytes — cipher IV.
    pub const CIPHER_IV: u16 = 0x60;
}

/// Longest persistable device name.
pub const DEVICE_NAME_MAX: usize = 32;

/// Persisted operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    /// Jump to the application image.
    Run = 0x01,
    /// A firmware transfer is pending; reopen the stream after restart.
    Download = 0x02,
    /// Stay in the bootloader and wait.
    Boot = 0x03,
}

impl Mode {
    /// Unknown bytes (erased NV reads as 0xFF) resolve to Run — the safe
    /// mode is always "try to boot what is there".
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x02 => Mode::Download,
            0x03 => Mode::Boot,
            _ => Mode::Run,
        }
    }
}

/// Typed view of the persisted configuration.
pub struct ConfigStore<N: NvStore> {
    nv: N,
}

impl<N: NvStore> ConfigStore<N> {
    pub fn new(nv: N) -> Self {
        Self { nv }
    }

    pub fn address(&self) -> u8 {
        self.nv.read_u8(map::LOCAL_ADDRESS)
    }

    pub fn set_address(&mut self, address: u8) {
        self.nv.write_u8(map::LOCAL_ADDRESS, address);
        self.nv.mark_dirty();
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.nv.read_u8(map::MODE))
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.nv.write_u8(map::MODE, mode as u8);
        self.nv.mark_dirty();
    }

    pub fn pin(&self) -> u32 {
        self.nv.read_u32(map::PIN)
    }

    pub fn set_pin(&mut self, pin: u32) {
        self.nv.write_u32(map::PIN, pin);
        self.nv.mark_dirty();
    }

    pub fn firmware_size(&self) -> u32 {
        self.nv.read_u32(map::FIRMWARE_SIZE)
    }

    pub fn firmware_crc(&self) -> u16 {
        self.nv.read_u16(map::FIRMWARE_CRC)
    }

    pub fn set_firmware_meta(&mut self, size: u32, crc: u16) {
        self.nv.write_u32(map::FIRMWARE_SIZE, size);
        self.nv.write_u16(map::FIRMWARE_CRC, crc);
        self.nv.mark_dirty();
    }

    pub fn firmware_source(&self) -> u8 {
        self.nv.read_u8(map::FIRMWARE_SOURCE)
    }

    pub fn firmware_tid(&self) -> u16 {
        self.nv.read_u16(map::FIRMWARE_TID)
    }

    pub fn set_firmware_origin(&mut self, source: u8, tid: u16) {
        self.nv.write_u8(map::FIRMWARE_SOURCE, source);
        self.nv.write_u16(map::FIRMWARE_TID, tid);
        self.nv.mark_dirty();
    }

    pub fn name(&self) -> String {
        let mut name = Vec::with_capacity(DEVICE_NAME_MAX);
        for i in 0..DEVICE_NAME_MAX {
            let byte = self.nv.read_u8(map::DEVICE_NAME + i as u16);
            if byte == 0 || byte == 0xFF {
                break;
            }
            name.push(byte);
        }
        String::from_utf8_lossy(&name).into_owned()
    }

    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        for i in 0..DEVICE_NAME_MAX {
            let byte = bytes.get(i).copied().unwrap_or(0);
            self.nv.write_u8(map::DEVICE_NAME + i as u16, byte);
        }
        self.nv.mark_dirty();
    }

    /// Stored cipher key and IV; an all-zero key region means no key has
    /// been provisioned and the factory default applies.
    pub fn key_material(&self) -> KeyMaterial {
        let mut keys = KeyMaterial {
            key: [0u8; 32],
            iv: [0u8; 16],
        };
        for (i, byte) in keys.key.iter_mut().enumerate() {
            *byte = self.nv.read_u8(map::CIPHER_KEY + i as u16);
        }
        if keys.key.iter().all(|&b| b == 0) {
            return KeyMaterial::factory_default();
        }
        for (i, byte) in keys.iv.iter_mut().enumerate() {
            *byte = self.nv.read_u8(map::CIPHER_IV + i as u16);
        }
        keys
    }

    /// Periodic persistence pass.
    pub fn work(&mut self) {
        self.nv.work();
    }

    /// Persist immediately — used for mode transitions that must survive
    /// the restart that is about to happen.
    pub fn flush(&mut self) {
        self.nv.flush();
    }
}
