//! Session settings: device wait bounds, workflow pacing and default keys.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on every wait for a device response or workflow signal.
    #[serde(with = "humantime_duration")]
    pub device_timeout: Duration,
    /// Bound on a front end's wait for a provisioning run to finish.
    #[serde(with = "humantime_duration")]
    pub provisioning_timeout: Duration,
    /// Pause between adding the application key and requesting composition data.
    #[serde(with = "humantime_duration")]
    pub settle_delay: Duration,
    /// Pause before each application key bind.
    #[serde(with = "humantime_duration")]
    pub bind_pacing: Duration,
    /// Pause before persisting the directory at the end of a provisioning run.
    #[serde(with = "humantime_duration")]
    pub persist_delay: Duration,
    pub max_event_tasks: usize,
    pub net_key_index: u16,
    pub app_key_index: u16,
    #[serde(with = "hex::serde")]
    pub network_key: [u8; 16],
    #[serde(with = "hex::serde")]
    pub app_key: [u8; 16],
    pub iv_index: u32,
    /// Local unicast addresses claimed by the provisioner itself.
    pub local_element_count: u16,
    /// Subnet handle the device returns for the first subnet added.
    pub subnet_handle: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(10),
            provisioning_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(1),
            bind_pacing: Duration::from_millis(100),
            persist_delay: Duration::from_millis(500),
            max_event_tasks: 16,
            net_key_index: 0,
            app_key_index: 0,
            network_key: [0xBB; 16],
            app_key: [0xAA; 16],
            iv_index: 0,
            local_element_count: 1,
            subnet_handle: 0,
        }
    }
}

impl SessionConfig {
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }
}

/// Durations written the way humans type them: "10s", "500ms", "1m 30s".
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
