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

//! BLE link lifecycle.
//!
//! Link teardown always drives MQTT teardown, never the other way round.

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Bridge, BridgeNotification};
use crate::bluetooth::ble_constants::config::max_payload_length;
use crate::bluetooth::{
    BleConnectionState, CharacteristicId, ChunkOutcome, Completion, DeviceInfo, DeviceInfoKind,
    GattEvent, GattStatus, GattTransport, LinkCommand, LinkCommandKind, ProxyControl,
};
use crate::mqtt::MqttClient;

impl<T: GattTransport, M: MqttClient> Bridge<T, M> {
    pub(super) fn on_link_event(&mut self, event: GattEvent, now: Instant) {
        match event {
            GattEvent::ConnectionStateChanged(state) => self.on_connection_state(state, now),
            GattEvent::ServicesDiscovered => self.on_services_discovered(now),
            GattEvent::MtuChanged { mtu, status } => self.on_mtu_changed(mtu, status, now),
            GattEvent::DescriptorWritten {
                characteristic,
                status,
            } => {
                self.scheduler.on_complete(
                    Completion::new(LinkCommandKind::WriteDescriptor, Some(characteristic)),
                    status,
                    now,
                );
            }
            GattEvent::CharacteristicWritten {
                characteristic,
                status,
            } => {
                self.scheduler.on_complete(
                    Completion::new(LinkCommandKind::WriteCharacteristic, Some(characteristic)),
                    status,
                    now,
                );
            }
            GattEvent::CharacteristicRead {
                characteristic,
                value,
                status,
            } => {
                let expected = self.scheduler.on_complete(
                    Completion::new(LinkCommandKind::ReadCharacteristic, Some(characteristic)),
                    status,
                    now,
                );
                // A read nobody is waiting for (late after a timeout) carries stale data.
                if expected && status.is_success() {
                    self.on_characteristic_value(characteristic, value, now);
                }
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_characteristic_value(characteristic, value, now),
        }
    }

    fn on_connection_state(&mut self, state: BleConnectionState, now: Instant) {
        if state == self.link_state {
            return;
        }

        match state {
            BleConnectionState::Connected => {
                info!("BLE link connected");
                self.set_link_state(state);
                self.scheduler.set_link_ready(true, now);
            }
            BleConnectionState::Disconnected => {
                info!("BLE link disconnected");
                self.teardown_link(now);
            }
            BleConnectionState::Connecting | BleConnectionState::Disconnecting => {
                if self.link_state == BleConnectionState::Connected {
                    info!("BLE link lost ({})", state.as_str());
                    self.teardown_link(now);
                } else {
                    debug!("BLE link {}", state.as_str());
                    self.scheduler.set_link_ready(false, now);
                }
                self.set_link_state(state);
            }
        }
    }

    fn on_services_discovered(&mut self, now: Instant) {
        if self.link_state != BleConnectionState::Connected {
            warn!("Services discovered on a link that is not connected, ignoring");
            return;
        }

        info!("Services discovered, enabling notifications");
        for characteristic in CharacteristicId::NOTIFYING {
            self.scheduler
                .enqueue(LinkCommand::WriteDescriptor(characteristic), now);
        }
        self.scheduler
            .enqueue(LinkCommand::RequestMtu(self.config.bluetooth.preferred_mtu), now);
    }

    fn on_mtu_changed(&mut self, mtu: u16, status: GattStatus, now: Instant) {
        self.scheduler
            .on_complete(Completion::new(LinkCommandKind::RequestMtu, None), status, now);
        if !status.is_success() {
            return;
        }

        let max_payload = max_payload_length(mtu as usize);
        info!("MTU negotiated: {} (max payload {} bytes)", mtu, max_payload);
        self.status.set_mtu(mtu, max_payload);
        for command in self.transfers.set_max_payload(max_payload) {
            self.scheduler.enqueue(command, now);
        }
    }

    fn on_characteristic_value(&mut self, characteristic: CharacteristicId, value: Vec<u8>, now: Instant) {
        match characteristic {
            CharacteristicId::MqttTx => self.on_device_frame(&value, now),
            CharacteristicId::MqttTxLarge => match self.transfers.inbound(characteristic, &value) {
                ChunkOutcome::NeedMore(read) => {
                    self.scheduler.enqueue(read, now);
                }
                ChunkOutcome::Complete(frame) => self.on_device_frame(&frame, now),
            },
            CharacteristicId::DeviceMtu
            | CharacteristicId::BrokerEndpoint
            | CharacteristicId::FirmwareVersion => self.on_device_info(characteristic, &value),
            CharacteristicId::MqttProxyControl => match ProxyControl::decode(&value) {
                Some(control) => info!(
                    "Device reports MQTT proxy {}",
                    if control.enabled { "enabled" } else { "disabled" }
                ),
                None => warn!("Malformed proxy control value ({} bytes)", value.len()),
            },
            CharacteristicId::ListNetwork
            | CharacteristicId::SaveNetwork
            | CharacteristicId::EditNetwork
            | CharacteristicId::DeleteNetwork => {
                debug!(
                    "Ignoring {} byte network config response on {:?}",
                    value.len(),
                    characteristic
                );
            }
            CharacteristicId::MqttRx | CharacteristicId::MqttRxLarge => {
                debug!("Unexpected value on write-only {:?}", characteristic);
            }
        }
    }

    fn on_device_info(&mut self, characteristic: CharacteristicId, value: &[u8]) {
        let Some(kind) = DeviceInfoKind::from_characteristic(characteristic) else {
            return;
        };
        match DeviceInfo::decode(kind, value) {
            Some(info) => {
                info!("Device info: {:?}", info);
                self.publish_notification(BridgeNotification::DeviceInfo(info));
            }
            None => warn!("Malformed {:?} value ({} bytes)", kind, value.len()),
        }
    }

    pub(super) fn read_device_info(&mut self, kind: DeviceInfoKind, now: Instant) {
        debug!("Reading device info {:?}", kind);
        self.scheduler
            .enqueue(LinkCommand::ReadCharacteristic(kind.characteristic()), now);
    }

    pub(super) fn set_proxy_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled && !self.config.mqtt.has_credentials() {
            error!("Cannot enable MQTT proxy without credentials");
            return;
        }

        info!("{} MQTT proxy", if enabled { "Enabling" } else { "Disabling" });
        self.scheduler.enqueue(
            LinkCommand::WriteCharacteristic(
                CharacteristicId::MqttProxyControl,
                ProxyControl { enabled }.encode(),
            ),
            now,
        );
        self.proxy_enabled = enabled;
        self.status.set_proxy_enabled(enabled);

        if !enabled {
            self.teardown_mqtt();
        }
    }

    /// Close the link on request of the host.
    pub(super) fn close(&mut self, now: Instant) {
        info!("Closing BLE link");
        self.scheduler.transport_mut().close();
        self.teardown_link(now);
    }

    fn teardown_link(&mut self, now: Instant) {
        self.scheduler.set_link_ready(false, now);
        self.scheduler.reset();
        self.transfers.reset();
        self.timers.clear();
        self.status.set_mtu(0, 0);
        if self.link_state != BleConnectionState::Disconnected {
            self.set_link_state(BleConnectionState::Disconnected);
        }
        self.teardown_mqtt();
    }

    fn set_link_state(&mut self, state: BleConnectionState) {
        self.link_state = state;
        self.status.set_link_state(state);
        self.publish_notification(BridgeNotification::LinkState(state));
    }
}
