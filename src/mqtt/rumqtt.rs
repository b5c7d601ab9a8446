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

//! `rumqttc`-backed MQTT client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Transport,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::{
    ConnectParams, DeliveryToken, MqttAuth, MqttClient, MqttEvent, MqttEventSender, MqttStatus,
};
use crate::bluetooth::QoS;
use crate::error::MqttClientError;

/// Request channel capacity between client handle and event loop.
const REQUEST_CAPACITY: usize = 10;

/// Status to report for an event loop error. `connected` is whether CONNACK was seen.
fn failure_status(error: &ConnectionError, connected: bool) -> MqttStatus {
    match error {
        ConnectionError::ConnectionRefused(_) => MqttStatus::Refused,
        ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => MqttStatus::ProtocolError,
        _ if connected => MqttStatus::ConnectionLost,
        _ => MqttStatus::Error,
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// Maps outgoing publishes to their delivery tokens.
#[derive(Debug, Default)]
struct DeliveryTracker {
    /// Publishes handed to the client, not yet written to the socket.
    queued: VecDeque<(DeliveryToken, QoS)>,
    /// QoS 1 publishes waiting for a PUBACK, keyed by packet id.
    awaiting_ack: HashMap<u16, DeliveryToken>,
}

impl DeliveryTracker {
    /// A publish left the client. Returns a token that is already delivered.
    fn on_outgoing(&mut self, pkid: u16) -> Option<DeliveryToken> {
        let (token, qos) = self.queued.pop_front()?;
        match qos {
            QoS::AtMostOnce => Some(token),
            QoS::AtLeastOnce => {
                self.awaiting_ack.insert(pkid, token);
                None
            }
        }
    }

    fn on_puback(&mut self, pkid: u16) -> Option<DeliveryToken> {
        self.awaiting_ack.remove(&pkid)
    }
}

/// MQTT client running a `rumqttc` event loop on a tokio task.
pub struct RumqttClient {
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    deliveries: Arc<Mutex<DeliveryTracker>>,
}

impl RumqttClient {
    pub fn new() -> Self {
        Self {
            client: None,
            task: None,
            stopping: Arc::new(AtomicBool::new(false)),
            deliveries: Arc::new(Mutex::new(DeliveryTracker::default())),
        }
    }

    fn client(&self) -> Result<&AsyncClient, MqttClientError> {
        self.client.as_ref().ok_or(MqttClientError::NotConnected)
    }

    fn build_options(params: &ConnectParams) -> Result<MqttOptions, MqttClientError> {
        let mut options = MqttOptions::new(&params.client_id, &params.broker_endpoint, params.port);
        options.set_keep_alive(params.keep_alive);
        options.set_clean_session(params.clean_session);

        let transport = match &params.auth {
            MqttAuth::Keystore(keystore) => {
                let read = |path: &std::path::Path| {
                    std::fs::read(path)
                        .map_err(|e| MqttClientError::Tls(format!("{}: {}", path.display(), e)))
                };
                let ca = read(&keystore.ca)?;
                let cert = read(&keystore.cert)?;
                let key = read(&keystore.key)?;
                Transport::tls(ca, Some((cert, key)), None)
            }
            MqttAuth::Provider(provider) => {
                let credentials = provider.credentials()?;
                options.set_credentials(credentials.username, credentials.password);
                Transport::tls_with_default_config()
            }
        };
        options.set_transport(transport);

        Ok(options)
    }

    fn stop_task(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(client) = self.client.take() {
            if client.try_disconnect().is_err() {
                debug!("MQTT disconnect request not queued, aborting event loop");
                if let Some(task) = self.task.take() {
                    task.abort();
                }
            }
        }
        // The event loop exits on its own once the DISCONNECT goes out.
        self.task = None;
    }
}

impl Default for RumqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttClient for RumqttClient {
    fn connect(&mut self, params: &ConnectParams, events: MqttEventSender) -> Result<(), MqttClientError> {
        if self.client.is_some() {
            self.stop_task();
        }

        let options = Self::build_options(params)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let stopping = Arc::new(AtomicBool::new(false));
        let deliveries = Arc::new(Mutex::new(DeliveryTracker::default()));

        info!(
            "Connecting to MQTT broker {}:{} as '{}'",
            params.broker_endpoint, params.port, params.client_id
        );
        events.send(MqttEvent::Status(MqttStatus::Connecting));

        self.task = Some(tokio::spawn(run_event_loop(
            eventloop,
            events,
            stopping.clone(),
            deliveries.clone(),
        )));
        self.client = Some(client);
        self.stopping = stopping;
        self.deliveries = deliveries;
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), MqttClientError> {
        self.client()?
            .try_subscribe(filter, to_rumqttc_qos(qos))
            .map_err(|e| MqttClientError::Request(e.to_string()))
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), MqttClientError> {
        self.client()?
            .try_unsubscribe(filter)
            .map_err(|e| MqttClientError::Request(e.to_string()))
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        token: DeliveryToken,
    ) -> Result<(), MqttClientError> {
        let client = self.client()?;
        let mut deliveries = self.deliveries.lock();
        deliveries.queued.push_back((token, qos));
        if let Err(e) = client.try_publish(topic, to_rumqttc_qos(qos), false, payload) {
            deliveries.queued.pop_back();
            return Err(MqttClientError::Request(e.to_string()));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), MqttClientError> {
        if self.client.is_none() {
            return Err(MqttClientError::NotConnected);
        }
        info!("Disconnecting from MQTT broker");
        self.stop_task();
        Ok(())
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: MqttEventSender,
    stopping: Arc<AtomicBool>,
    deliveries: Arc<Mutex<DeliveryTracker>>,
) {
    let mut connected = false;

    loop {
        if events.is_closed() {
            debug!("Bridge gone, stopping MQTT event loop");
            break;
        }

        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("MQTT session {} connected", events.session());
                    connected = true;
                    events.send(MqttEvent::Status(MqttStatus::Connected));
                } else {
                    warn!("MQTT broker refused connection: {:?}", ack.code);
                    events.send(MqttEvent::Status(MqttStatus::Refused));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "MQTT message on '{}' ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                events.send(MqttEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let token = deliveries.lock().on_puback(ack.pkid);
                if let Some(token) = token {
                    events.send(MqttEvent::Delivered {
                        token,
                        success: true,
                    });
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let token = deliveries.lock().on_outgoing(pkid);
                if let Some(token) = token {
                    events.send(MqttEvent::Delivered {
                        token,
                        success: true,
                    });
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                match &e {
                    ConnectionError::ConnectionRefused(code) => {
                        warn!("MQTT connection refused: {:?}", code)
                    }
                    other => warn!("MQTT connection error: {}", other),
                }
                // No automatic reconnect; the device retries with a new CONNECT.
                events.send(MqttEvent::Status(failure_status(&e, connected)));
                break;
            }
        }

        if stopping.load(Ordering::SeqCst) && !connected {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos0_delivered_when_sent() {
        let mut tracker = DeliveryTracker::default();
        tracker.queued.push_back((1, QoS::AtMostOnce));
        assert_eq!(tracker.on_outgoing(0), Some(1));
        assert!(tracker.awaiting_ack.is_empty());
    }

    #[test]
    fn test_qos1_delivered_on_puback() {
        let mut tracker = DeliveryTracker::default();
        tracker.queued.push_back((1, QoS::AtLeastOnce));
        tracker.queued.push_back((2, QoS::AtLeastOnce));

        assert_eq!(tracker.on_outgoing(10), None);
        assert_eq!(tracker.on_outgoing(11), None);
        assert_eq!(tracker.on_puback(11), Some(2));
        assert_eq!(tracker.on_puback(10), Some(1));
        assert_eq!(tracker.on_puback(10), None);
    }

    #[test]
    fn test_unknown_outgoing_ignored() {
        let mut tracker = DeliveryTracker::default();
        assert_eq!(tracker.on_outgoing(5), None);
    }

    #[test]
    fn test_refusal_reported_as_refused() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(failure_status(&error, false), MqttStatus::Refused);
    }

    #[test]
    fn test_network_failure_depends_on_connack() {
        let error = ConnectionError::NetworkTimeout;
        assert_eq!(failure_status(&error, false), MqttStatus::Error);
        assert_eq!(failure_status(&error, true), MqttStatus::ConnectionLost);
    }

    #[test]
    fn test_unexpected_first_packet_is_protocol_error() {
        let error = ConnectionError::NotConnAck(Packet::PingResp);
        assert_eq!(failure_status(&error, false), MqttStatus::ProtocolError);
    }

    #[test]
    fn test_publish_requires_connection() {
        let mut client = RumqttClient::new();
        assert_eq!(
            client.publish("t", QoS::AtMostOnce, vec![], 1),
            Err(MqttClientError::NotConnected)
        );
        assert_eq!(client.disconnect(), Err(MqttClientError::NotConnected));
    }
}
