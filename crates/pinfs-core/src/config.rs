use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Size in bytes of a raw chunk encryption key (AES-256).
pub const ENCRYPTION_KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("encryption key is not valid hex: {0}")]
    KeyNotHex(#[from] hex::FromHexError),

    #[error("encryption key must be {ENCRYPTION_KEY_SIZE} bytes, got {0}")]
    KeyWrongLength(usize),
}

/// Provider configuration (loaded from pinfs.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Identifier of the chat guild housing the two channels
    pub guild_id: u64,
    /// Name of the metadata channel holding the pinned index message.
    /// Created if absent.
    pub db_channel_name: String,
    /// Name of the data channel holding file chunk attachments
    pub data_channel_name: String,
    /// Root of the local mirror for directory walks
    pub local_path: PathBuf,
    /// Hex-encoded 32-byte key; enables per-chunk encryption when set
    pub encryption_key: Option<String>,
    /// Transport attachment size limit in bytes (default: 8 MiB)
    pub max_attachment_size: u32,
    /// Full-resync interval in seconds (default: 180)
    pub resync_period_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            db_channel_name: "pinfs-db".into(),
            data_channel_name: "pinfs-data".into(),
            local_path: PathBuf::from("~/pinfs"),
            encryption_key: None,
            max_attachment_size: 8 * 1024 * 1024,
            resync_period_secs: 180,
        }
    }
}

impl ProviderConfig {
    /// Decode and validate the configured encryption key.
    ///
    /// Returns `None` when no key is configured (encryption disabled).
    pub fn encryption_key(&self) -> Result<Option<[u8; ENCRYPTION_KEY_SIZE]>, ConfigError> {
        let Some(hex_key) = &self.encryption_key else {
            return Ok(None);
        };
        let raw = hex::decode(hex_key)?;
        let key: [u8; ENCRYPTION_KEY_SIZE] = raw
            .try_into()
            .map_err(|v: Vec<u8>| ConfigError::KeyWrongLength(v.len()))?;
        Ok(Some(key))
    }

    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }
}
