//! Device configuration
//!
//! Persisted as a small postcard blob behind a magic + length header so a
//! blank (all `0xFF`) or corrupt config area is recognised and replaced by
//! defaults instead of being misread.

use alloc::vec::Vec;

use embassy_time::Duration;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Marks the start of a persisted config blob.
pub const CONFIG_MAGIC: [u8; 4] = *b"SSCF";

const HEADER_LEN: usize = CONFIG_MAGIC.len() + 2;

/// Largest upload chunk the receiver accepts.
pub const MAX_CHUNK_LEN: u16 = 512;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config blob has no valid header")]
    BadHeader,
    #[error("config blob truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("config payload could not be decoded")]
    Decode,
    #[error("config could not be encoded")]
    Encode,
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Longest a sensor cycle waits for the shared bus.
    pub bus_timeout_ms: u32,
    /// Period of the diagnostic snapshot printer; 0 disables it.
    pub print_period_ms: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Absolute flash offset of the log region. Must be sector-aligned.
    pub region_base: u32,
    pub region_len: u32,
    /// RAM staging buffer size in bytes.
    pub staging_capacity: u32,
    pub flush_interval_ms: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Payload bytes per chunk, sized to fit one link-layer packet.
    pub chunk_len: u16,
    /// Pause after each header and each payload write.
    pub pacing_ms: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    pub baseline: f32,
    pub spread: f32,
    pub high_threshold: f32,
    pub mid_threshold: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DeviceConfig {
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub fusion: FusionConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bus_timeout_ms: 100,
            print_period_ms: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region_base: 0,
            region_len: 512 * 1024,
            staging_capacity: 4 * 1024,
            flush_interval_ms: 60 * 1000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_len: 180,
            pacing_ms: 2,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            baseline: 98.0,
            spread: 50.0,
            high_threshold: 0.8,
            mid_threshold: 0.5,
        }
    }
}

impl SchedulerConfig {
    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms as u64)
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms as u64)
    }
}

impl UploadConfig {
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms as u64)
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.region_len == 0 {
            return Err(ConfigError::Invalid("log region is empty"));
        }
        if self.storage.region_base.checked_add(self.storage.region_len).is_none() {
            return Err(ConfigError::Invalid("log region overflows address space"));
        }
        if self.storage.staging_capacity == 0 {
            return Err(ConfigError::Invalid("staging buffer is empty"));
        }
        if self.upload.chunk_len == 0 || self.upload.chunk_len > MAX_CHUNK_LEN {
            return Err(ConfigError::Invalid("upload chunk length out of range"));
        }
        if !(self.fusion.spread > 0.0) {
            return Err(ConfigError::Invalid("fusion spread must be positive"));
        }
        Ok(())
    }

    /// Serialize as `[magic:4][len:2 BE][postcard payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, ConfigError> {
        let payload = postcard::to_allocvec(self).map_err(|_| ConfigError::Encode)?;
        let len = u16::try_from(payload.len()).map_err(|_| ConfigError::Encode)?;

        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&CONFIG_MAGIC);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse and validate a blob produced by [`DeviceConfig::encode`].
    /// Trailing bytes (e.g. erased flash after the blob) are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.len() < HEADER_LEN || bytes[..4] != CONFIG_MAGIC {
            return Err(ConfigError::BadHeader);
        }
        let len = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        let needed = HEADER_LEN + len;
        let payload = bytes.get(HEADER_LEN..needed).ok_or(ConfigError::Truncated {
            needed,
            have: bytes.len(),
        })?;

        let config: Self = postcard::from_bytes(payload).map_err(|_| ConfigError::Decode)?;
        config.validate()?;
        Ok(config)
    }

    /// Decode `bytes`, falling back to defaults on any error.
    pub fn load_or_default(bytes: &[u8]) -> Self {
        match Self::decode(bytes) {
            Ok(config) => config,
            Err(e) => {
                warn!("using default config: {}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.region_len, 512 * 1024);
        assert_eq!(config.upload.chunk_len, 180);
        assert_eq!(config.scheduler.bus_timeout(), Duration::from_millis(100));
        assert_eq!(config.storage.flush_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_encode_decode_with_trailing_erased_bytes() {
        let mut config = DeviceConfig::default();
        config.storage.flush_interval_ms = 5_000;
        config.upload.chunk_len = 244;

        let mut blob = config.encode().unwrap();
        assert_eq!(&blob[..4], b"SSCF");
        blob.extend_from_slice(&[0xFF; 32]);

        assert_eq!(DeviceConfig::decode(&blob), Ok(config));
    }

    #[test]
    fn test_blank_flash_falls_back_to_default() {
        let blank = [0xFFu8; 64];
        assert_eq!(DeviceConfig::decode(&blank), Err(ConfigError::BadHeader));
        assert_eq!(DeviceConfig::load_or_default(&blank), DeviceConfig::default());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let blob = DeviceConfig::default().encode().unwrap();
        let cut = &blob[..blob.len() - 1];
        assert!(matches!(
            DeviceConfig::decode(cut),
            Err(ConfigError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DeviceConfig::default();
        config.upload.chunk_len = 0;
        let blob = config.encode().unwrap();
        assert_eq!(
            DeviceConfig::decode(&blob),
            Err(ConfigError::Invalid("upload chunk length out of range"))
        );
    }
}
