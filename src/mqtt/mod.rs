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

//! Broker side of the proxy.
//!
//! Holds the MQTT session model the bridge drives and the client that
//! actually talks to the broker.

mod rumqtt;
mod session;
pub mod topic;

pub use rumqtt::RumqttClient;
pub use session::{
    ConnectParams, Credentials, CredentialsProvider, DeliveryToken, Keystore, MqttAuth, MqttClient,
    MqttEvent, MqttEventSender, MqttSession, MqttStatus, PendingDelivery, SessionId,
};
