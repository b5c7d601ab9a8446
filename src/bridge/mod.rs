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

//! BLE to MQTT bridge.
//!
//! A single task owns the link queue, the chunking state and the MQTT
//! session. Everything else talks to it by posting [`BridgeEvent`]s: the
//! host through a [`BridgeHandle`], the BLE transport through the same
//! handle, and the MQTT client through its [`MqttEventSender`].
//!
//! Handlers never fail. Problems are logged and the bridge carries on.

mod lifecycle;
mod timers;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{
    peek_type, BleConnectionState, Connack, Connect, DeviceInfo, DeviceInfoKind, GattEvent,
    GattTransport, LinkCommand, LinkScheduler, MqttConnectionState, ProxyMessage, Puback, Publish,
    QoS, Suback, Subscribe, TransferManager, Unsuback, Unsubscribe,
};
use crate::config::Config;
use crate::error::BridgeError;
use crate::mqtt::{
    ConnectParams, DeliveryToken, MqttClient, MqttEvent, MqttEventSender, MqttSession, MqttStatus,
    SessionId,
};
use crate::state::BridgeStatus;

pub use timers::TimerQueue;

/// Input to the bridge task.
#[derive(Debug)]
pub enum BridgeEvent {
    /// Callback from the BLE transport.
    Link(GattEvent),
    /// Callback from the MQTT client for a given session.
    Mqtt { session: SessionId, event: MqttEvent },
    SetProxyEnabled(bool),
    ReadDeviceInfo(DeviceInfoKind),
    /// Close the BLE link.
    Disconnect,
    /// Close the link and stop the bridge task.
    Shutdown,
}

/// Updates published to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeNotification {
    LinkState(BleConnectionState),
    MqttState(MqttConnectionState),
    DeviceInfo(DeviceInfo),
}

/// Cloneable handle used to drive a running bridge.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    status: Arc<BridgeStatus>,
}

impl BridgeHandle {
    /// Forward a BLE transport callback.
    pub fn link_event(&self, event: GattEvent) -> Result<(), BridgeError> {
        self.send(BridgeEvent::Link(event))
    }

    /// Ask the device to start proxying MQTT.
    ///
    /// Fails immediately if no credentials provider or keystore is configured.
    pub fn enable_mqtt_proxy(&self) -> Result<(), BridgeError> {
        if !self.status.has_credentials() {
            return Err(BridgeError::MissingCredentials);
        }
        self.send(BridgeEvent::SetProxyEnabled(true))
    }

    /// Ask the device to stop proxying and drop the broker connection.
    pub fn disable_mqtt_proxy(&self) -> Result<(), BridgeError> {
        self.send(BridgeEvent::SetProxyEnabled(false))
    }

    pub fn read_device_info(&self, kind: DeviceInfoKind) -> Result<(), BridgeError> {
        self.send(BridgeEvent::ReadDeviceInfo(kind))
    }

    pub fn disconnect(&self) -> Result<(), BridgeError> {
        self.send(BridgeEvent::Disconnect)
    }

    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.send(BridgeEvent::Shutdown)
    }

    pub fn status(&self) -> &Arc<BridgeStatus> {
        &self.status
    }

    fn send(&self, event: BridgeEvent) -> Result<(), BridgeError> {
        self.tx.send(event).map_err(|_| BridgeError::Closed)
    }
}

/// Receiving side of the bridge event channel, consumed by [`Bridge::new`].
#[derive(Debug)]
pub struct BridgeEvents {
    tx: mpsc::UnboundedSender<BridgeEvent>,
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
    status: Arc<BridgeStatus>,
}

/// Create the event channel shared by a bridge and its handles.
pub fn channel() -> (BridgeHandle, BridgeEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let status = BridgeStatus::new();
    (
        BridgeHandle {
            tx: tx.clone(),
            status: status.clone(),
        },
        BridgeEvents { tx, rx, status },
    )
}

#[derive(Debug)]
enum ScheduledTask {
    Suback { session: SessionId, suback: Suback },
}

/// The bridge task state.
pub struct Bridge<T, M> {
    config: Config,
    scheduler: LinkScheduler<T>,
    transfers: TransferManager,
    link_state: BleConnectionState,
    mqtt: MqttSession,
    client: M,
    timers: TimerQueue<ScheduledTask>,
    tx: mpsc::UnboundedSender<BridgeEvent>,
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
    notify: mpsc::Sender<BridgeNotification>,
    status: Arc<BridgeStatus>,
    proxy_enabled: bool,
    running: bool,
}

impl<T: GattTransport, M: MqttClient> Bridge<T, M> {
    pub fn new(
        config: Config,
        transport: T,
        client: M,
        events: BridgeEvents,
        notify: mpsc::Sender<BridgeNotification>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let BridgeEvents { tx, rx, status } = events;
        status.set_credentials_configured(config.mqtt.has_credentials());
        let scheduler = LinkScheduler::new(transport, config.bluetooth.command_timeout());

        Ok(Self {
            config,
            scheduler,
            transfers: TransferManager::new(),
            link_state: BleConnectionState::Disconnected,
            mqtt: MqttSession::new(),
            client,
            timers: TimerQueue::new(),
            tx,
            rx,
            notify,
            status,
            proxy_enabled: false,
            running: true,
        })
    }

    /// Process events until [`BridgeEvent::Shutdown`].
    pub async fn run(mut self) {
        info!("Bridge started");
        while self.running {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event, Instant::now()),
                    None => break,
                },
                _ = sleep_until(deadline) => self.poll_timers(Instant::now()),
            }
        }
        info!("Bridge stopped");
    }

    /// Handle every event already queued. Returns how many were handled.
    pub fn process_pending(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while self.running {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event, now);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    pub fn handle_event(&mut self, event: BridgeEvent, now: Instant) {
        match event {
            BridgeEvent::Link(event) => self.on_link_event(event, now),
            BridgeEvent::Mqtt { session, event } => {
                if !self.mqtt.is_current(session) {
                    debug!("Ignoring event from closed MQTT session {}", session);
                    return;
                }
                self.on_mqtt_event(event, now);
            }
            BridgeEvent::SetProxyEnabled(enabled) => self.set_proxy_enabled(enabled, now),
            BridgeEvent::ReadDeviceInfo(kind) => self.read_device_info(kind, now),
            BridgeEvent::Disconnect => self.close(now),
            BridgeEvent::Shutdown => {
                info!("Bridge shutting down");
                self.close(now);
                self.running = false;
            }
        }
    }

    /// Fire command timeouts and delayed tasks that are due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        self.scheduler.poll_timeout(now);

        for task in self.timers.pop_due(now) {
            match task {
                ScheduledTask::Suback { session, suback } => {
                    if self.mqtt.is_current(session) && self.mqtt.is_connected() {
                        debug!("Sending delayed SUBACK for message {}", suback.msg_id);
                        self.send_to_device(ProxyMessage::Suback(suback), now);
                    } else {
                        debug!("Dropping SUBACK for message {}, session closed", suback.msg_id);
                    }
                }
            }
        }
    }

    /// Earliest instant at which [`Bridge::poll_timers`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.scheduler.deadline(), self.timers.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn status(&self) -> &Arc<BridgeStatus> {
        &self.status
    }

    pub fn link_state(&self) -> BleConnectionState {
        self.link_state
    }

    pub fn mqtt_state(&self) -> MqttConnectionState {
        self.mqtt.state()
    }

    pub fn mqtt_session(&self) -> &MqttSession {
        &self.mqtt
    }

    pub fn max_payload(&self) -> usize {
        self.transfers.max_payload()
    }

    pub fn queue_len(&self) -> usize {
        self.scheduler.len()
    }

    pub fn pending_commands(&self) -> impl Iterator<Item = &LinkCommand> {
        self.scheduler.pending()
    }

    /// Whether a large object from the device is partially received.
    pub fn is_assembling(&self) -> bool {
        self.transfers.assembly().is_in_progress()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn is_proxy_enabled(&self) -> bool {
        self.proxy_enabled
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn transport(&self) -> &T {
        self.scheduler.transport()
    }

    pub fn client(&self) -> &M {
        &self.client
    }

    /// Decode and act on a complete frame from the device.
    fn on_device_frame(&mut self, frame: &[u8], now: Instant) {
        let Some(message) = ProxyMessage::decode(frame) else {
            match peek_type(frame) {
                Some(kind) => warn!(
                    "Discarding malformed or unsupported {} frame ({} bytes)",
                    kind.as_str(),
                    frame.len()
                ),
                None => warn!("Discarding frame with unknown type tag ({} bytes)", frame.len()),
            }
            return;
        };

        debug!("Device sent {}", message.message_type().as_str());
        match message {
            ProxyMessage::Connect(connect) => self.on_connect(connect, now),
            ProxyMessage::Publish(publish) => self.on_publish(publish),
            ProxyMessage::Puback(puback) => {
                info!("Device acknowledged message {}", puback.msg_id);
            }
            ProxyMessage::Subscribe(subscribe) => self.on_subscribe(subscribe, now),
            ProxyMessage::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe, now),
            ProxyMessage::Pingreq => self.send_to_device(ProxyMessage::Pingresp, now),
            ProxyMessage::Disconnect => {
                info!("Device requested MQTT disconnect");
                self.teardown_mqtt();
            }
            other => warn!("Unexpected {} from device", other.message_type().as_str()),
        }
    }

    fn on_connect(&mut self, connect: Connect, now: Instant) {
        if !self.proxy_enabled {
            warn!(
                "MQTT proxy is disabled, dropping CONNECT from '{}'",
                connect.client_id
            );
            return;
        }
        if self.mqtt.is_connected() {
            info!("MQTT already connected, re-sending CONNACK");
            self.send_connack(now);
            return;
        }
        if !self.mqtt.accepts_connect() {
            warn!(
                "MQTT connect already in progress, dropping CONNECT from '{}'",
                connect.client_id
            );
            return;
        }

        let Some(auth) = self.config.mqtt.auth() else {
            error!("Device sent CONNECT but no MQTT credentials are configured");
            self.set_mqtt_state(MqttConnectionState::ConnectionError);
            return;
        };

        let session = self.mqtt.begin_session();
        let params = ConnectParams {
            client_id: connect.client_id,
            broker_endpoint: connect.broker_endpoint,
            port: self.config.mqtt.port,
            clean_session: connect.clean_session,
            keep_alive: self.config.mqtt.keep_alive(),
            auth,
        };
        let events = MqttEventSender::new(session, self.tx.clone());

        match self.client.connect(&params, events) {
            Ok(()) => self.set_mqtt_state(MqttConnectionState::Connecting),
            Err(e) => {
                error!("MQTT connect to {} failed: {}", params.broker_endpoint, e);
                self.mqtt.end_session();
                self.set_mqtt_state(MqttConnectionState::ConnectionError);
            }
        }
    }

    fn on_publish(&mut self, publish: Publish) {
        self.mqtt.record_message_id(publish.msg_id);

        if !self.mqtt.is_connected() {
            warn!(
                "PUBLISH {} to '{}' while MQTT {}, dropping",
                publish.msg_id,
                publish.topic,
                self.mqtt.state().as_str()
            );
            return;
        }

        let token = self.mqtt.track_delivery(publish.qos, publish.msg_id);
        debug!(
            "Publishing {} bytes to '{}' (message {})",
            publish.payload.len(),
            publish.topic,
            publish.msg_id
        );
        if let Err(e) = self
            .client
            .publish(&publish.topic, publish.qos, publish.payload, token)
        {
            warn!("Publish to '{}' failed: {}", publish.topic, e);
            self.mqtt.complete_delivery(token);
        }
    }

    fn on_subscribe(&mut self, subscribe: Subscribe, now: Instant) {
        if !self.mqtt.is_connected() {
            warn!(
                "SUBSCRIBE {} while MQTT {}, dropping",
                subscribe.msg_id,
                self.mqtt.state().as_str()
            );
            return;
        }

        for (filter, qos) in &subscribe.topics {
            match self.client.subscribe(filter, *qos) {
                Ok(()) => {
                    info!("Subscribed to '{}' (QoS {})", filter, *qos as u8);
                    self.mqtt.add_subscription(filter, *qos);
                }
                Err(e) => warn!("Subscribe to '{}' failed: {}", filter, e),
            }
        }

        // The client gives no subscribe acknowledgement, so SUBACK is
        // synthesized after a fixed delay.
        let status = subscribe
            .topics
            .first()
            .map(|(_, qos)| *qos as u8)
            .unwrap_or_default();
        self.timers.schedule(
            now + self.config.mqtt.suback_delay(),
            ScheduledTask::Suback {
                session: self.mqtt.session_id(),
                suback: Suback {
                    msg_id: subscribe.msg_id,
                    status,
                },
            },
        );
    }

    fn on_unsubscribe(&mut self, unsubscribe: Unsubscribe, now: Instant) {
        if !self.mqtt.is_connected() {
            warn!(
                "UNSUBSCRIBE {} while MQTT {}, dropping",
                unsubscribe.msg_id,
                self.mqtt.state().as_str()
            );
            return;
        }

        for filter in &unsubscribe.topics {
            if let Err(e) = self.client.unsubscribe(filter) {
                warn!("Unsubscribe from '{}' failed: {}", filter, e);
            }
            self.mqtt.remove_subscription(filter);
        }

        self.send_to_device(
            ProxyMessage::Unsuback(Unsuback {
                msg_id: unsubscribe.msg_id,
            }),
            now,
        );
    }

    fn on_mqtt_event(&mut self, event: MqttEvent, now: Instant) {
        match event {
            MqttEvent::Status(MqttStatus::Connecting) => {
                self.set_mqtt_state(MqttConnectionState::Connecting);
            }
            MqttEvent::Status(MqttStatus::Connected) => {
                if self.link_state == BleConnectionState::Connected {
                    self.set_mqtt_state(MqttConnectionState::Connected);
                    self.send_connack(now);
                } else {
                    warn!("MQTT connected after the BLE link went down, disconnecting");
                    self.teardown_mqtt();
                }
            }
            MqttEvent::Status(MqttStatus::ConnectionLost) => {
                warn!("MQTT connection lost");
                self.end_mqtt_session(MqttConnectionState::Disconnected);
            }
            MqttEvent::Status(MqttStatus::Refused) => {
                warn!("MQTT broker refused the connection");
                self.end_mqtt_session(MqttConnectionState::ConnectionRefused);
            }
            MqttEvent::Status(MqttStatus::ProtocolError) => {
                warn!("MQTT protocol error");
                self.end_mqtt_session(MqttConnectionState::ProtocolError);
            }
            MqttEvent::Status(MqttStatus::Error) => {
                warn!("MQTT connection failed");
                self.end_mqtt_session(MqttConnectionState::ConnectionError);
            }
            MqttEvent::Message { topic, payload } => self.on_mqtt_message(topic, payload, now),
            MqttEvent::Delivered { token, success } => self.on_delivered(token, success, now),
        }
    }

    fn on_mqtt_message(&mut self, topic: String, payload: Vec<u8>, now: Instant) {
        let Some(qos) = self.mqtt.match_subscription(&topic) else {
            debug!("No subscription matches '{}', dropping message", topic);
            return;
        };

        debug!("Relaying {} bytes from '{}' to device", payload.len(), topic);
        let publish = Publish {
            topic,
            msg_id: self.mqtt.last_message_id(),
            qos,
            payload,
        };
        self.send_to_device(ProxyMessage::Publish(publish), now);
    }

    fn on_delivered(&mut self, token: DeliveryToken, success: bool, now: Instant) {
        match self.mqtt.complete_delivery(token) {
            Some(delivery) if success => {
                if delivery.qos == QoS::AtLeastOnce {
                    self.send_to_device(
                        ProxyMessage::Puback(Puback {
                            msg_id: delivery.msg_id,
                        }),
                        now,
                    );
                } else {
                    debug!("Message {} delivered", delivery.msg_id);
                }
            }
            Some(delivery) => warn!("Message {} was not delivered", delivery.msg_id),
            None => debug!("Delivery report for unknown token {}", token),
        }
    }

    fn send_connack(&mut self, now: Instant) {
        self.send_to_device(
            ProxyMessage::Connack(Connack {
                status: MqttConnectionState::Connected,
            }),
            now,
        );
    }

    /// Encode a frame and queue the writes that carry it.
    fn send_to_device(&mut self, message: ProxyMessage, now: Instant) {
        let kind = message.message_type();
        if self.link_state != BleConnectionState::Connected {
            warn!("BLE link not connected, dropping {}", kind.as_str());
            return;
        }
        let Some(frame) = message.encode() else {
            warn!("Failed to encode {}, not sending", kind.as_str());
            return;
        };

        debug!("Sending {} ({} bytes) to device", kind.as_str(), frame.len());
        for command in self.transfers.outbound(frame) {
            self.scheduler.enqueue(command, now);
        }
    }

    /// Drop the broker session if one is open.
    fn teardown_mqtt(&mut self) {
        if !self.mqtt.is_active() && self.mqtt.state() == MqttConnectionState::Disconnected {
            return;
        }
        if self.mqtt.is_active() {
            if let Err(e) = self.client.disconnect() {
                warn!("MQTT disconnect failed: {}", e);
            }
        }
        self.mqtt.end_session();
        self.timers.clear();
        self.set_mqtt_state(MqttConnectionState::Disconnected);
    }

    /// Forget a session the client already closed. The device retries with a new CONNECT.
    fn end_mqtt_session(&mut self, state: MqttConnectionState) {
        self.mqtt.end_session();
        self.timers.clear();
        self.set_mqtt_state(state);
    }

    fn set_mqtt_state(&mut self, state: MqttConnectionState) {
        if self.mqtt.set_state(state) {
            info!("MQTT state: {}", state.as_str());
            self.status.set_mqtt_state(state);
            self.publish_notification(BridgeNotification::MqttState(state));
        }
    }

    fn publish_notification(&self, notification: BridgeNotification) {
        match self.notify.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(notification)) => {
                warn!("Notification channel full, dropping {:?}", notification);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("No notification listener");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
