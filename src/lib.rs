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

//! Phone-side relay between a device's BLE MQTT proxy service and an MQTT broker.

pub mod bluetooth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod state;

pub use bridge::{channel, Bridge, BridgeEvent, BridgeEvents, BridgeHandle, BridgeNotification};
pub use config::Config;
pub use error::{BridgeError, MqttClientError};
pub use state::BridgeStatus;
