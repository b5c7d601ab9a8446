// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving bridge settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::ble_constants::{config::DEFAULT_MTU, MQTT_PROXY_SERVICE_UUID};
use crate::error::BridgeError;
use crate::mqtt::{CredentialsProvider, Keystore, MqttAuth};

const APP_DIR: &str = "ble-mqtt-proxy";

/// Bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// MQTT settings.
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Service UUIDs a device must advertise to be picked up by a scan.
    pub scan_filter: Vec<Uuid>,

    /// Scan duration in milliseconds, 0 scans until the first match.
    pub scan_duration_ms: u64,

    /// Time allowed for one GATT operation before the queue moves on.
    pub command_timeout_ms: u64,

    /// MTU requested after service discovery.
    pub preferred_mtu: u16,

    /// Connect to this address instead of scanning.
    pub device_address: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_filter: vec![MQTT_PROXY_SERVICE_UUID],
            scan_duration_ms: 20_000,
            command_timeout_ms: 3_000,
            preferred_mtu: crate::bluetooth::ble_constants::config::PREFERRED_MTU,
            device_address: None,
        }
    }
}

impl BluetoothConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// `None` when scanning is unbounded.
    pub fn scan_duration(&self) -> Option<Duration> {
        (self.scan_duration_ms > 0).then(|| Duration::from_millis(self.scan_duration_ms))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker port; the host comes from the device's Connect frame.
    pub port: u16,

    pub keep_alive_secs: u64,

    /// Delay before the synthesized SUBACK is sent to the device.
    pub suback_delay_ms: u64,

    /// Client certificate material for TLS authentication.
    pub keystore: Option<Keystore>,

    /// Username/password source, set programmatically.
    #[serde(skip)]
    pub credentials_provider: Option<Arc<dyn CredentialsProvider>>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            port: 8883,
            keep_alive_secs: 30,
            suback_delay_ms: 1_000,
            keystore: None,
            credentials_provider: None,
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("port", &self.port)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("suback_delay_ms", &self.suback_delay_ms)
            .field("keystore", &self.keystore)
            .field("credentials_provider", &self.credentials_provider.is_some())
            .finish()
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn suback_delay(&self) -> Duration {
        Duration::from_millis(self.suback_delay_ms)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials_provider.is_some() || self.keystore.is_some()
    }

    /// Authentication to use for the next connect. A provider wins over a keystore.
    pub fn auth(&self) -> Option<MqttAuth> {
        if let Some(provider) = &self.credentials_provider {
            return Some(MqttAuth::Provider(provider.clone()));
        }
        self.keystore.clone().map(MqttAuth::Keystore)
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            return Self::load_from(&config_path);
        }

        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let config = Self::default();
        config.save_to(&config_path)?;
        Ok(config)
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.bluetooth.command_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "bluetooth.command_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.bluetooth.scan_filter.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "bluetooth.scan_filter must list at least one service UUID".to_string(),
            ));
        }
        if (self.bluetooth.preferred_mtu as usize) < DEFAULT_MTU {
            return Err(BridgeError::InvalidConfig(format!(
                "bluetooth.preferred_mtu must be at least {}",
                DEFAULT_MTU
            )));
        }
        Ok(())
    }
}
