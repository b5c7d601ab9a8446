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

//! BLE service and characteristic identities of the device-side proxy.

use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

/// Device information GATT service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff00);

/// Device MTU characteristic UUID (ASCII decimal).
/// Properties: Read, Notify
pub const DEVICE_MTU_UUID: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff01);

/// Broker endpoint characteristic UUID (ASCII host name).
/// Properties: Read
pub const BROKER_ENDPOINT_UUID: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff02);

/// Firmware version characteristic UUID (ASCII).
/// Properties: Read
pub const FIRMWARE_VERSION_UUID: Uuid = Uuid::from_u128(0x8a7f1168_48af_4efb_83b5_e679f932ff03);

/// MQTT proxy GATT service UUID.
pub const MQTT_PROXY_SERVICE_UUID: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30100);

/// MQTT TX characteristic UUID (device sends small frames here).
/// Properties: Notify
pub const MQTT_TX_UUID: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30101);

/// MQTT RX characteristic UUID (phone writes small frames here).
/// Properties: Write
pub const MQTT_RX_UUID: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30102);

/// MQTT TX large characteristic UUID (device sends chunked frames here).
/// Properties: Read, Notify
pub const MQTT_TX_LARGE_UUID: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30103);

/// MQTT RX large characteristic UUID (phone writes chunked frames here).
/// Properties: Write
pub const MQTT_RX_LARGE_UUID: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30104);

/// MQTT proxy control characteristic UUID (on/off switch).
/// Properties: Read, Write
pub const MQTT_PROXY_CONTROL_UUID: Uuid = Uuid::from_u128(0xa9d7166a_d72e_40a9_a002_48044cc30105);

/// Network configuration GATT service UUID.
pub const NETWORK_CONFIG_SERVICE_UUID: Uuid = Uuid::from_u128(0x3113a187_4b9f_4f9a_aa83_c614e11bff00);

pub const LIST_NETWORK_UUID: Uuid = Uuid::from_u128(0x3113a187_4b9f_4f9a_aa83_c614e11bff01);
pub const SAVE_NETWORK_UUID: Uuid = Uuid::from_u128(0x3113a187_4b9f_4f9a_aa83_c614e11bff02);
pub const EDIT_NETWORK_UUID: Uuid = Uuid::from_u128(0x3113a187_4b9f_4f9a_aa83_c614e11bff03);
pub const DELETE_NETWORK_UUID: Uuid = Uuid::from_u128(0x3113a187_4b9f_4f9a_aa83_c614e11bff04);

/// Client Characteristic Configuration descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value that turns notifications on.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// GATT services the bridge talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    DeviceInfo,
    MqttProxy,
    NetworkConfig,
}

impl ServiceId {
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::DeviceInfo => DEVICE_INFO_SERVICE_UUID,
            Self::MqttProxy => MQTT_PROXY_SERVICE_UUID,
            Self::NetworkConfig => NETWORK_CONFIG_SERVICE_UUID,
        }
    }
}

/// Every characteristic the bridge addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    DeviceMtu,
    BrokerEndpoint,
    FirmwareVersion,
    MqttProxyControl,
    MqttTx,
    MqttRx,
    MqttTxLarge,
    MqttRxLarge,
    ListNetwork,
    SaveNetwork,
    EditNetwork,
    DeleteNetwork,
}

impl CharacteristicId {
    pub const ALL: [CharacteristicId; 12] = [
        Self::DeviceMtu,
        Self::BrokerEndpoint,
        Self::FirmwareVersion,
        Self::MqttProxyControl,
        Self::MqttTx,
        Self::MqttRx,
        Self::MqttTxLarge,
        Self::MqttRxLarge,
        Self::ListNetwork,
        Self::SaveNetwork,
        Self::EditNetwork,
        Self::DeleteNetwork,
    ];

    /// Characteristics whose notifications are enabled after service discovery.
    pub const NOTIFYING: [CharacteristicId; 6] = [
        Self::MqttTx,
        Self::MqttTxLarge,
        Self::ListNetwork,
        Self::SaveNetwork,
        Self::DeleteNetwork,
        Self::EditNetwork,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::DeviceMtu => DEVICE_MTU_UUID,
            Self::BrokerEndpoint => BROKER_ENDPOINT_UUID,
            Self::FirmwareVersion => FIRMWARE_VERSION_UUID,
            Self::MqttProxyControl => MQTT_PROXY_CONTROL_UUID,
            Self::MqttTx => MQTT_TX_UUID,
            Self::MqttRx => MQTT_RX_UUID,
            Self::MqttTxLarge => MQTT_TX_LARGE_UUID,
            Self::MqttRxLarge => MQTT_RX_LARGE_UUID,
            Self::ListNetwork => LIST_NETWORK_UUID,
            Self::SaveNetwork => SAVE_NETWORK_UUID,
            Self::EditNetwork => EDIT_NETWORK_UUID,
            Self::DeleteNetwork => DELETE_NETWORK_UUID,
        }
    }

    pub fn service(&self) -> ServiceId {
        match self {
            Self::DeviceMtu | Self::BrokerEndpoint | Self::FirmwareVersion => ServiceId::DeviceInfo,
            Self::MqttProxyControl
            | Self::MqttTx
            | Self::MqttRx
            | Self::MqttTxLarge
            | Self::MqttRxLarge => ServiceId::MqttProxy,
            Self::ListNetwork | Self::SaveNetwork | Self::EditNetwork | Self::DeleteNetwork => {
                ServiceId::NetworkConfig
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("characteristic UUID {uuid} is shared by {first:?} and {second:?}")]
    DuplicateUuid {
        uuid: Uuid,
        first: CharacteristicId,
        second: CharacteristicId,
    },
    #[error("characteristic UUID {0} collides with a service UUID")]
    ServiceCollision(Uuid),
}

/// UUID to characteristic lookup, checked once at startup.
#[derive(Debug, Clone)]
pub struct CharacteristicTable {
    by_uuid: HashMap<Uuid, CharacteristicId>,
}

impl CharacteristicTable {
    /// Build the table from [`CharacteristicId::ALL`].
    pub fn new() -> Result<Self, TableError> {
        Self::from_ids(&CharacteristicId::ALL)
    }

    fn from_ids(ids: &[CharacteristicId]) -> Result<Self, TableError> {
        let services = [
            ServiceId::DeviceInfo.uuid(),
            ServiceId::MqttProxy.uuid(),
            ServiceId::NetworkConfig.uuid(),
        ];
        let mut by_uuid = HashMap::with_capacity(ids.len());
        for &id in ids {
            let uuid = id.uuid();
            if services.contains(&uuid) {
                return Err(TableError::ServiceCollision(uuid));
            }
            if let Some(first) = by_uuid.insert(uuid, id) {
                return Err(TableError::DuplicateUuid {
                    uuid,
                    first,
                    second: id,
                });
            }
        }
        Ok(Self { by_uuid })
    }

    /// Resolve a characteristic UUID reported by the transport.
    pub fn lookup(&self, uuid: &Uuid) -> Option<CharacteristicId> {
        self.by_uuid.get(uuid).copied()
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

/// BLE configuration constants.
pub mod config {
    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// MTU requested after service discovery unless configured otherwise.
    pub const PREFERRED_MTU: u16 = 512;

    /// Largest payload a single characteristic write or read can carry.
    pub fn max_payload_length(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD)
    }
}
