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

//! GATT client transport boundary.
//!
//! The bridge never talks to a BLE stack directly. It issues operations
//! through [`GattTransport`], which must return immediately, and learns
//! about their outcome from [`GattEvent`]s posted back to the bridge.

use thiserror::Error;

use super::ble_constants::CharacteristicId;

/// Connection state of the BLE link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BleConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl BleConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
        }
    }
}

/// Completion status of a GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// Stack-specific error code.
    Failure(i32),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Callbacks from the BLE transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionStateChanged(BleConnectionState),
    ServicesDiscovered,
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    DescriptorWritten {
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    CharacteristicWritten {
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Notification pushed by the device.
    CharacteristicChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("link is not connected")]
    NotConnected,
    #[error("characteristic {0:?} was not discovered")]
    CharacteristicUnavailable(CharacteristicId),
    #[error("transport worker has stopped")]
    WorkerStopped,
    #[error("{0}")]
    Stack(String),
}

/// Non-blocking GATT client operations.
///
/// Each successful call must eventually produce the matching [`GattEvent`]
/// (or none at all, in which case the bridge times the operation out).
pub trait GattTransport: Send {
    /// Enable notifications by writing the CCCD of `characteristic`.
    fn write_descriptor(
        &mut self,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn write_characteristic(
        &mut self,
        characteristic: CharacteristicId,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn read_characteristic(&mut self, characteristic: CharacteristicId) -> Result<(), TransportError>;

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError>;

    /// Drop the link. Must be safe to call more than once.
    fn close(&mut self);
}
