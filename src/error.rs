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

//! Error types returned to callers of the bridge.

use thiserror::Error;

/// Errors surfaced by caller-facing bridge entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no MQTT credentials provider or keystore configured")]
    MissingCredentials,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("bridge has shut down")]
    Closed,
}

/// Errors from the MQTT client collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MqttClientError {
    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("MQTT request rejected: {0}")]
    Request(String),

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}
