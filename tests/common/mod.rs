//! Scripted BLE transport and MQTT client for driving a bridge in tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use ble_mqtt_proxy::bluetooth::{
    chunk_frame, BleConnectionState, CharacteristicId, GattEvent, GattStatus, GattTransport,
    LinkCommand, ProxyMessage, QoS, TransportError,
};
use ble_mqtt_proxy::mqtt::{
    ConnectParams, DeliveryToken, Keystore, MqttClient, MqttEvent, MqttEventSender, MqttStatus,
};
use ble_mqtt_proxy::{
    channel, Bridge, BridgeEvent, BridgeHandle, BridgeNotification, Config, MqttClientError,
};

/// MTU the fake device negotiates; leaves 185 bytes per write.
pub const TEST_MTU: u16 = 188;

#[derive(Debug, Default)]
pub struct TransportLog {
    pub dispatched: Vec<LinkCommand>,
    pub closed: usize,
}

/// Records every GATT operation instead of performing it.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    pub log: Arc<Mutex<TransportLog>>,
}

impl GattTransport for FakeTransport {
    fn write_descriptor(&mut self, characteristic: CharacteristicId, _value: &[u8]) -> Result<(), TransportError> {
        self.log
            .lock()
            .dispatched
            .push(LinkCommand::WriteDescriptor(characteristic));
        Ok(())
    }

    fn write_characteristic(&mut self, characteristic: CharacteristicId, value: &[u8]) -> Result<(), TransportError> {
        self.log
            .lock()
            .dispatched
            .push(LinkCommand::WriteCharacteristic(characteristic, value.to_vec()));
        Ok(())
    }

    fn read_characteristic(&mut self, characteristic: CharacteristicId) -> Result<(), TransportError> {
        self.log
            .lock()
            .dispatched
            .push(LinkCommand::ReadCharacteristic(characteristic));
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        self.log.lock().dispatched.push(LinkCommand::RequestMtu(mtu));
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().closed += 1;
    }
}

#[derive(Debug, Default)]
pub struct MqttLog {
    pub connects: Vec<ConnectParams>,
    pub subscribes: Vec<(String, QoS)>,
    pub unsubscribes: Vec<String>,
    pub publishes: Vec<(String, QoS, Vec<u8>, DeliveryToken)>,
    pub disconnects: usize,
    pub events: Option<MqttEventSender>,
}

/// Accepts every request and keeps the event sender of the last connect.
#[derive(Debug, Clone, Default)]
pub struct FakeMqttClient {
    pub log: Arc<Mutex<MqttLog>>,
}

impl MqttClient for FakeMqttClient {
    fn connect(&mut self, params: &ConnectParams, events: MqttEventSender) -> Result<(), MqttClientError> {
        let mut log = self.log.lock();
        log.connects.push(params.clone());
        log.events = Some(events);
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), MqttClientError> {
        self.log.lock().subscribes.push((filter.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), MqttClientError> {
        self.log.lock().unsubscribes.push(filter.to_string());
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        token: DeliveryToken,
    ) -> Result<(), MqttClientError> {
        self.log
            .lock()
            .publishes
            .push((topic.to_string(), qos, payload, token));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), MqttClientError> {
        self.log.lock().disconnects += 1;
        Ok(())
    }
}

pub fn config_with_keystore() -> Config {
    let mut config = Config::default();
    config.mqtt.keystore = Some(Keystore {
        ca: PathBuf::from("ca.pem"),
        cert: PathBuf::from("cert.pem"),
        key: PathBuf::from("key.pem"),
    });
    config
}

/// A bridge wired to fakes, driven synchronously with a manual clock.
pub struct Harness {
    pub bridge: Bridge<FakeTransport, FakeMqttClient>,
    pub handle: BridgeHandle,
    pub transport: Arc<Mutex<TransportLog>>,
    pub mqtt: Arc<Mutex<MqttLog>>,
    pub notifications: mpsc::Receiver<BridgeNotification>,
    pub now: Instant,
    /// Completions delivered so far, in order.
    pub completed: Vec<LinkCommand>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config_with_keystore())
    }

    pub fn with_config(config: Config) -> Self {
        let transport = FakeTransport::default();
        let client = FakeMqttClient::default();
        let transport_log = transport.log.clone();
        let mqtt_log = client.log.clone();
        let (handle, events) = channel();
        let (notify_tx, notifications) = mpsc::channel(64);
        let bridge = Bridge::new(config, transport, client, events, notify_tx).unwrap();

        Self {
            bridge,
            handle,
            transport: transport_log,
            mqtt: mqtt_log,
            notifications,
            now: Instant::now(),
            completed: Vec::new(),
        }
    }

    pub fn link(&mut self, event: GattEvent) {
        self.bridge.handle_event(BridgeEvent::Link(event), self.now);
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.bridge.poll_timers(self.now);
    }

    /// Handle everything posted through the handle or the MQTT sender.
    pub fn pump(&mut self) -> usize {
        self.bridge.process_pending(self.now)
    }

    /// Connect the link and complete service setup, but leave the MTU unknown.
    pub fn connect_link_without_mtu(&mut self) {
        self.link(GattEvent::ConnectionStateChanged(BleConnectionState::Connected));
        self.link(GattEvent::ServicesDiscovered);
        while matches!(
            self.bridge.pending_commands().next(),
            Some(LinkCommand::WriteDescriptor(_))
        ) {
            self.complete_in_flight();
        }
    }

    /// Connect the link, enable notifications and negotiate [`TEST_MTU`].
    pub fn connect_link(&mut self) {
        self.connect_link_without_mtu();
        self.complete_in_flight();
        assert_eq!(self.bridge.max_payload(), (TEST_MTU - 3) as usize);
    }

    /// Report successful completion of the command at the head of the queue.
    pub fn complete_in_flight(&mut self) -> Option<LinkCommand> {
        let command = self.bridge.pending_commands().next().cloned()?;
        let event = match &command {
            LinkCommand::WriteDescriptor(characteristic) => GattEvent::DescriptorWritten {
                characteristic: *characteristic,
                status: GattStatus::Success,
            },
            LinkCommand::WriteCharacteristic(characteristic, _) => GattEvent::CharacteristicWritten {
                characteristic: *characteristic,
                status: GattStatus::Success,
            },
            LinkCommand::ReadCharacteristic(characteristic) => GattEvent::CharacteristicRead {
                characteristic: *characteristic,
                value: Vec::new(),
                status: GattStatus::Success,
            },
            LinkCommand::RequestMtu(_) => GattEvent::MtuChanged {
                mtu: TEST_MTU,
                status: GattStatus::Success,
            },
        };
        self.completed.push(command.clone());
        self.link(event);
        Some(command)
    }

    /// Complete queued writes until the queue is empty, returning the values written.
    pub fn drain_writes(&mut self) -> Vec<(CharacteristicId, Vec<u8>)> {
        let mut writes = Vec::new();
        while let Some(command) = self.complete_in_flight() {
            match command {
                LinkCommand::WriteCharacteristic(characteristic, value) => {
                    writes.push((characteristic, value))
                }
                other => panic!("expected a write, found {:?}", other),
            }
        }
        writes
    }

    /// Frames sent to the device, reassembled from their writes.
    pub fn drain_frames(&mut self) -> Vec<ProxyMessage> {
        let mut frames = Vec::new();
        let mut large = Vec::new();
        for (characteristic, value) in self.drain_writes() {
            match characteristic {
                CharacteristicId::MqttRx => frames.push(ProxyMessage::decode(&value).unwrap()),
                CharacteristicId::MqttRxLarge => {
                    let last = value.len() < self.bridge.max_payload();
                    large.extend_from_slice(&value);
                    if last {
                        frames.push(ProxyMessage::decode(&large).unwrap());
                        large.clear();
                    }
                }
                other => panic!("unexpected write to {:?}", other),
            }
        }
        frames
    }

    /// Notify a frame from the device, chunked the way the device would.
    pub fn device_sends(&mut self, message: ProxyMessage) {
        let frame = message.encode().unwrap();
        let max = self.bridge.max_payload();
        if max == 0 || frame.len() < max {
            self.link(GattEvent::CharacteristicChanged {
                characteristic: CharacteristicId::MqttTx,
                value: frame,
            });
            return;
        }

        let mut chunks: Vec<Vec<u8>> = chunk_frame(&frame, max)
            .into_iter()
            .map(|command| match command {
                LinkCommand::WriteCharacteristic(_, chunk) => chunk,
                other => panic!("unexpected chunk command {:?}", other),
            })
            .collect();
        if frame.len() % max == 0 {
            // The device terminates an exact multiple with an empty read.
            chunks.push(Vec::new());
        }

        let mut first = true;
        for chunk in chunks {
            if first {
                self.link(GattEvent::CharacteristicChanged {
                    characteristic: CharacteristicId::MqttTxLarge,
                    value: chunk,
                });
                first = false;
                continue;
            }
            assert_eq!(
                self.bridge.pending_commands().next(),
                Some(&LinkCommand::ReadCharacteristic(CharacteristicId::MqttTxLarge))
            );
            self.completed
                .push(LinkCommand::ReadCharacteristic(CharacteristicId::MqttTxLarge));
            self.link(GattEvent::CharacteristicRead {
                characteristic: CharacteristicId::MqttTxLarge,
                value: chunk,
                status: GattStatus::Success,
            });
        }
    }

    /// Post an MQTT client callback for the most recent session and handle it.
    pub fn mqtt_event(&mut self, event: MqttEvent) {
        let sender = self.mqtt.lock().events.clone().unwrap();
        assert!(sender.send(event));
        self.pump();
    }

    /// Turn the device's MQTT proxy on and complete the control write if it is next.
    pub fn enable_proxy(&mut self) {
        self.handle.enable_mqtt_proxy().unwrap();
        self.pump();
        while matches!(
            self.bridge.pending_commands().next(),
            Some(LinkCommand::WriteCharacteristic(CharacteristicId::MqttProxyControl, _))
        ) {
            self.complete_in_flight();
        }
    }

    /// Run the device CONNECT handshake through to CONNACK.
    pub fn establish_mqtt(&mut self) {
        if !self.bridge.is_proxy_enabled() {
            self.enable_proxy();
        }
        self.device_sends(ProxyMessage::Connect(ble_mqtt_proxy::bluetooth::Connect {
            client_id: "abc".to_string(),
            broker_endpoint: "x.iot.aws.com".to_string(),
            clean_session: true,
        }));
        self.mqtt_event(MqttEvent::Status(MqttStatus::Connected));
        let frames = self.drain_frames();
        assert_eq!(frames.len(), 1);
    }

    pub fn dispatched(&self) -> Vec<LinkCommand> {
        self.transport.lock().dispatched.clone()
    }

    pub fn take_notifications(&mut self) -> Vec<BridgeNotification> {
        let mut notifications = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            notifications.push(notification);
        }
        notifications
    }
}
