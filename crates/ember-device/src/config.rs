//! Build-profile configuration for the engine.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! This is the compile-target profile (identity strings, flash geometry,
//! timing, buffer sizing) — not the per-device persisted state, which
//! lives behind the non-volatile collaborator.
//!
//! Config file location: $EMBER_CONFIG, else defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level engine profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub firmware: FirmwareConfig,
    pub buffers: BufferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Device group advertised in search responses.
    pub group: u8,
    /// Default name used until one is persisted over the bus.
    pub name: String,
    pub producer: String,
    pub model: String,
    /// Platform descriptor word reported in device info.
    pub device_flags: u32,
    /// Firmware version word reported in device info.
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// First byte of the application image region.
    pub region_start: u32,
    /// Region length in bytes.
    pub region_size: u32,
    /// Idle window before an open stream is declared abandoned.
    pub wait_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Receive ring capacity, in frames.
    pub rx_ring_frames: usize,
    /// Transmit FIFO capacity, in frames.
    pub tx_fifo_frames: usize,
    /// Outbound packet buffer size, in bytes.
    pub out_buffer_bytes: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            firmware: FirmwareConfig::default(),
            buffers: BufferConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            group: 0x02,
            name: "ember-node".into(),
            producer: "ember".into(),
            model: "template-1.0".into(),
            device_flags: 0,
            version: 0x0001_0001,
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            region_start: 0x0800_4000,
            region_size: 0x0001_C000,
            wait_window_ms: 5_000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            rx_ring_frames: 256,
            tx_fifo_frames: 264,
            out_buffer_bytes: 512,
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load the profile: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("EMBER_CONFIG").map(PathBuf::from) {
            Ok(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
                toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
            }
            _ => EngineConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply EMBER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("EMBER_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Ok(v) = std::env::var("EMBER_FIRMWARE__WAIT_WINDOW_MS") {
            if let Ok(ms) = v.parse() {
                self.firmware.wait_window_ms = ms;
            }
        }
    }

    /// End of the application image region.
    pub fn region_end(&self) -> u32 {
        self.firmware.region_start + self.firmware.region_size
    }
}
