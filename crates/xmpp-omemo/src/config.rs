use crate::{Error, Result, TrustLevels};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;
const WEEK_SECS: u64 = 7 * DAY_SECS;

/// Tunables of the OMEMO manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmemoConfig {
    /// Devices of one JID beyond this are ignored.
    pub max_devices_per_jid: usize,
    /// Envelopes per stanza beyond this are not created.
    pub max_devices_per_stanza: usize,
    pub pre_key_pool_size: u32,
    /// Stanzas sent to a device without a reply before it is skipped.
    pub unresponded_sent_limit: u32,
    /// Stanzas received from a device without a reply before a heartbeat
    /// is sent.
    pub unresponded_received_limit: u32,
    pub signed_pre_key_renewal_interval_secs: u64,
    pub signed_pre_key_renewal_check_interval_secs: u64,
    pub device_removal_interval_secs: u64,
    pub device_removal_check_interval_secs: u64,
    pub accepted_session_building_trust_levels: TrustLevels,
    pub new_device_auto_session_building: bool,
}

impl Default for OmemoConfig {
    fn default() -> Self {
        Self {
            max_devices_per_jid: 200,
            max_devices_per_stanza: 1000,
            pre_key_pool_size: 100,
            unresponded_sent_limit: 106,
            unresponded_received_limit: 53,
            signed_pre_key_renewal_interval_secs: 4 * WEEK_SECS,
            signed_pre_key_renewal_check_interval_secs: DAY_SECS,
            device_removal_interval_secs: 12 * WEEK_SECS,
            device_removal_check_interval_secs: DAY_SECS,
            accepted_session_building_trust_levels: TrustLevels::default(),
            new_device_auto_session_building: false,
        }
    }
}

impl OmemoConfig {
    /// Loads the config from `path`, falling back to defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pre_key_pool_size == 0 {
            return Err(Error::Config("pre_key_pool_size must be positive".to_string()));
        }
        if self.max_devices_per_jid == 0 {
            return Err(Error::Config("max_devices_per_jid must be positive".to_string()));
        }
        if self.max_devices_per_stanza == 0 {
            return Err(Error::Config("max_devices_per_stanza must be positive".to_string()));
        }
        if self.unresponded_received_limit >= self.unresponded_sent_limit {
            return Err(Error::Config(
                "unresponded_received_limit must be below unresponded_sent_limit".to_string(),
            ));
        }
        Ok(())
    }

    pub fn signed_pre_key_renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.signed_pre_key_renewal_check_interval_secs)
    }

    pub fn device_removal_check_interval(&self) -> Duration {
        Duration::from_secs(self.device_removal_check_interval_secs)
    }
}
