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

//! Bluetooth communication module.
//!
//! Handles the GATT client side of the device's MQTT proxy service:
//! frame codec, serialized link operations and chunked transfers.

pub mod ble_constants;
mod command_queue;
mod protocol;
mod reassembler;
mod transport;

#[cfg(feature = "bluez")]
pub mod bluez;

pub use ble_constants::{CharacteristicId, CharacteristicTable, ServiceId, TableError};
pub use command_queue::{Completion, LinkCommand, LinkCommandKind, LinkScheduler};
pub use protocol::{
    peek_type, Connack, Connect, DeviceInfo, DeviceInfoKind, MessageType, MqttConnectionState,
    ProxyControl, ProxyMessage, Puback, Publish, QoS, Suback, Subscribe, Unsuback, Unsubscribe,
};
pub use reassembler::{chunk_frame, ChunkOutcome, LargeObjectAssembly, TransferManager};
pub use transport::{BleConnectionState, GattEvent, GattStatus, GattTransport, TransportError};
