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

//! Broker-side MQTT session state and the MQTT client boundary.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::topic;
use crate::bluetooth::{MqttConnectionState, QoS};
use crate::bridge::BridgeEvent;
use crate::error::MqttClientError;

/// Identifies one MQTT connect attempt and everything it produces.
pub type SessionId = u64;

/// Correlates a publish with its delivery callback.
pub type DeliveryToken = u64;

/// Connection status reported by the MQTT client.
///
/// Every status except `Connecting` and `Connected` ends the session; the
/// client does not reconnect on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttStatus {
    Connecting,
    Connected,
    /// An established connection dropped.
    ConnectionLost,
    /// The broker rejected the CONNECT.
    Refused,
    /// The broker broke the MQTT protocol before or after CONNACK.
    ProtocolError,
    /// Network or TLS failure before CONNACK.
    Error,
}

/// Callbacks from the MQTT client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Status(MqttStatus),
    Message { topic: String, payload: Vec<u8> },
    Delivered { token: DeliveryToken, success: bool },
}

/// Posts MQTT client callbacks into the bridge, tagged with their session.
#[derive(Debug, Clone)]
pub struct MqttEventSender {
    session: SessionId,
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl MqttEventSender {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns `false` once the bridge is gone.
    pub fn send(&self, event: MqttEvent) -> bool {
        self.tx
            .send(BridgeEvent::Mqtt {
                session: self.session,
                event,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Username and password for a broker connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies broker credentials on demand.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials, MqttClientError>;
}

/// PEM files used for a mutually authenticated TLS connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystore {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// How the client authenticates to the broker.
#[derive(Clone)]
pub enum MqttAuth {
    Keystore(Keystore),
    Provider(Arc<dyn CredentialsProvider>),
}

impl fmt::Debug for MqttAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keystore(keystore) => f.debug_tuple("Keystore").field(keystore).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}

/// Everything an MQTT client needs to open a session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub client_id: String,
    pub broker_endpoint: String,
    pub port: u16,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub auth: MqttAuth,
}

/// Non-blocking MQTT client operations.
///
/// Outcomes arrive later through the [`MqttEventSender`] handed to
/// [`MqttClient::connect`].
pub trait MqttClient: Send {
    fn connect(&mut self, params: &ConnectParams, events: MqttEventSender) -> Result<(), MqttClientError>;

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), MqttClientError>;

    fn unsubscribe(&mut self, filter: &str) -> Result<(), MqttClientError>;

    /// Publish `payload`; delivery is reported as [`MqttEvent::Delivered`] with `token`.
    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        token: DeliveryToken,
    ) -> Result<(), MqttClientError>;

    fn disconnect(&mut self) -> Result<(), MqttClientError>;
}

/// A device publish waiting for its delivery callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelivery {
    pub qos: QoS,
    pub msg_id: u16,
}

/// Bridge-side view of the broker session.
#[derive(Debug)]
pub struct MqttSession {
    state: MqttConnectionState,
    session_id: SessionId,
    active: bool,
    subscriptions: HashMap<String, QoS>,
    last_message_id: u16,
    pending: HashMap<DeliveryToken, PendingDelivery>,
    next_token: DeliveryToken,
}

impl Default for MqttSession {
    fn default() -> Self {
        Self {
            state: MqttConnectionState::Disconnected,
            session_id: 0,
            active: false,
            subscriptions: HashMap::new(),
            last_message_id: 0,
            pending: HashMap::new(),
            next_token: 1,
        }
    }
}

impl MqttSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MqttConnectionState {
        self.state
    }

    /// Returns `true` if the state changed.
    pub fn set_state(&mut self, state: MqttConnectionState) -> bool {
        let changed = self.state != state;
        self.state = state;
        changed
    }

    pub fn is_connected(&self) -> bool {
        self.state == MqttConnectionState::Connected
    }

    /// States from which a device Connect starts a new broker connection.
    pub fn accepts_connect(&self) -> bool {
        matches!(
            self.state,
            MqttConnectionState::Disconnected
                | MqttConnectionState::Unknown
                | MqttConnectionState::ConnectionRefused
                | MqttConnectionState::ConnectionError
                | MqttConnectionState::ProtocolError
        )
    }

    /// Whether a client session is open (possibly reconnecting).
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        self.active && self.session_id == session
    }

    /// Start a new session generation.
    pub fn begin_session(&mut self) -> SessionId {
        self.clear();
        self.session_id += 1;
        self.active = true;
        debug!("MQTT session {} started", self.session_id);
        self.session_id
    }

    /// Close the current generation; its late events are ignored from now on.
    ///
    /// The connection state is left for the caller to set.
    pub fn end_session(&mut self) {
        if self.active {
            debug!("MQTT session {} ended", self.session_id);
        }
        self.clear();
        self.active = false;
    }

    pub fn add_subscription(&mut self, filter: &str, qos: QoS) {
        self.subscriptions.insert(filter.to_string(), qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> Option<QoS> {
        self.subscriptions.remove(filter)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// QoS for an inbound message on `topic`, or `None` if nothing matches.
    ///
    /// Overlapping filters resolve to the highest granted QoS.
    pub fn match_subscription(&self, topic_name: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic_name))
            .map(|(_, qos)| *qos)
            .max_by_key(|qos| *qos as u8)
    }

    pub fn record_message_id(&mut self, msg_id: u16) {
        self.last_message_id = msg_id;
    }

    pub fn last_message_id(&self) -> u16 {
        self.last_message_id
    }

    pub fn track_delivery(&mut self, qos: QoS, msg_id: u16) -> DeliveryToken {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.pending.insert(token, PendingDelivery { qos, msg_id });
        token
    }

    pub fn complete_delivery(&mut self, token: DeliveryToken) -> Option<PendingDelivery> {
        self.pending.remove(&token)
    }

    pub fn pending_deliveries(&self) -> usize {
        self.pending.len()
    }

    fn clear(&mut self) {
        self.subscriptions.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let session = MqttSession::new();
        assert_eq!(session.state(), MqttConnectionState::Disconnected);
        assert!(session.accepts_connect());
        assert!(!session.is_active());
        assert!(!session.is_current(0));
    }

    #[test]
    fn test_accepts_connect() {
        let mut session = MqttSession::new();
        for state in [
            MqttConnectionState::Unknown,
            MqttConnectionState::ConnectionRefused,
            MqttConnectionState::ConnectionError,
            MqttConnectionState::ProtocolError,
        ] {
            session.set_state(state);
            assert!(session.accepts_connect());
        }
        session.set_state(MqttConnectionState::Connecting);
        assert!(!session.accepts_connect());
        session.set_state(MqttConnectionState::Connected);
        assert!(!session.accepts_connect());
    }

    #[test]
    fn test_session_generations() {
        let mut session = MqttSession::new();
        let first = session.begin_session();
        assert!(session.is_current(first));

        session.end_session();
        assert!(!session.is_current(first));

        let second = session.begin_session();
        assert_ne!(first, second);
        assert!(session.is_current(second));
        assert!(!session.is_current(first));
    }

    #[test]
    fn test_end_session_clears() {
        let mut session = MqttSession::new();
        session.begin_session();
        session.set_state(MqttConnectionState::Connected);
        session.add_subscription("t1", QoS::AtLeastOnce);
        session.track_delivery(QoS::AtLeastOnce, 3);

        session.end_session();
        assert!(!session.is_active());
        assert_eq!(session.subscription_count(), 0);
        assert_eq!(session.pending_deliveries(), 0);
    }

    #[test]
    fn test_match_subscription() {
        let mut session = MqttSession::new();
        session.add_subscription("sensors/#", QoS::AtMostOnce);
        session.add_subscription("sensors/+/temp", QoS::AtLeastOnce);

        assert_eq!(session.match_subscription("sensors/a/temp"), Some(QoS::AtLeastOnce));
        assert_eq!(session.match_subscription("sensors/a/humidity"), Some(QoS::AtMostOnce));
        assert_eq!(session.match_subscription("other"), None);

        session.remove_subscription("sensors/#");
        assert_eq!(session.match_subscription("sensors/a/humidity"), None);
    }

    #[test]
    fn test_delivery_tracking() {
        let mut session = MqttSession::new();
        let a = session.track_delivery(QoS::AtLeastOnce, 7);
        let b = session.track_delivery(QoS::AtMostOnce, 8);
        assert_ne!(a, b);

        assert_eq!(
            session.complete_delivery(a),
            Some(PendingDelivery {
                qos: QoS::AtLeastOnce,
                msg_id: 7
            })
        );
        assert_eq!(session.complete_delivery(a), None);
        assert_eq!(session.pending_deliveries(), 1);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            username: "device".to_string(),
            password: "secret".to_string(),
        };
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("device"));
        assert!(!printed.contains("secret"));
    }
}
