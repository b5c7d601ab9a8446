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

//! Shared bridge status.
//!
//! Written only by the bridge task; anyone holding the `Arc` may read.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::{BleConnectionState, MqttConnectionState};

#[derive(Debug)]
pub struct BridgeStatus {
    /// Negotiated ATT MTU, 0 until negotiated.
    pub mtu: RwLock<u16>,

    /// Largest single write/read payload, 0 until the MTU is known.
    pub max_payload: RwLock<usize>,

    pub link_state: RwLock<BleConnectionState>,

    pub mqtt_state: RwLock<MqttConnectionState>,

    pub proxy_enabled: RwLock<bool>,

    /// Whether a keystore or credentials provider is configured.
    pub credentials_configured: RwLock<bool>,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            mtu: RwLock::new(0),
            max_payload: RwLock::new(0),
            link_state: RwLock::new(BleConnectionState::Disconnected),
            mqtt_state: RwLock::new(MqttConnectionState::Disconnected),
            proxy_enabled: RwLock::new(false),
            credentials_configured: RwLock::new(false),
        }
    }
}

impl BridgeStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_mtu(&self, mtu: u16, max_payload: usize) {
        *self.mtu.write() = mtu;
        *self.max_payload.write() = max_payload;
    }

    pub fn get_mtu(&self) -> u16 {
        *self.mtu.read()
    }

    pub fn get_max_payload(&self) -> usize {
        *self.max_payload.read()
    }

    pub fn set_link_state(&self, state: BleConnectionState) {
        *self.link_state.write() = state;
    }

    pub fn get_link_state(&self) -> BleConnectionState {
        *self.link_state.read()
    }

    pub fn set_mqtt_state(&self, state: MqttConnectionState) {
        *self.mqtt_state.write() = state;
    }

    pub fn get_mqtt_state(&self) -> MqttConnectionState {
        *self.mqtt_state.read()
    }

    pub fn set_proxy_enabled(&self, enabled: bool) {
        *self.proxy_enabled.write() = enabled;
    }

    pub fn is_proxy_enabled(&self) -> bool {
        *self.proxy_enabled.read()
    }

    pub fn set_credentials_configured(&self, configured: bool) {
        *self.credentials_configured.write() = configured;
    }

    pub fn has_credentials(&self) -> bool {
        *self.credentials_configured.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let status = BridgeStatus::new();
        assert_eq!(status.get_mtu(), 0);
        assert_eq!(status.get_max_payload(), 0);
        assert_eq!(status.get_link_state(), BleConnectionState::Disconnected);
        assert_eq!(status.get_mqtt_state(), MqttConnectionState::Disconnected);
        assert!(!status.is_proxy_enabled());
        assert!(!status.has_credentials());
    }

    #[test]
    fn test_mtu_update() {
        let status = BridgeStatus::new();
        status.set_mtu(188, 185);
        assert_eq!(status.get_mtu(), 188);
        assert_eq!(status.get_max_payload(), 185);
    }
}
