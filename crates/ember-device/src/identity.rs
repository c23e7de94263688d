//! Device identity derivation.
//!
//! The hardware id is a 32-character hex string derived once at startup
//! from chip-unique bytes: BLAKE3 digest, halves xor-folded to 16 bytes,
//! upper-hex. The bus device id used in frame identifiers is the seeded
//! CRC16 of that string, truncated to the 11-bit identifier field.

use ember_core::crc::crc16;

/// Derive the printable hardware id from chip-unique bytes.
pub fn derive_hardware_id(unique: &[u8]) -> String {
    let digest = blake3::hash(unique);
    let bytes = digest.as_bytes();
    let mut folded = [0u8; 16];
    for (i, out) in folded.iter_mut().enumerate() {
        *out = bytes[i] ^ bytes[16 + i];
    }
    hex::encode_upper(folded)
}

/// Derive the 11-bit bus device id from the hardware id.
///
/// Seeded with 1 so the id space is unrelated to packet checksums.
pub fn derive_device_id(hwid: &str) -> u16 {
    crc16(1, hwid.as_bytes()) & 0x07FF
}
