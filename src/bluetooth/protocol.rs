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

//! MQTT proxy frame definitions and their binary layout.
//!
//! Every frame starts with a one-byte [`MessageType`] tag. Integers are
//! big-endian and strings carry a `u16` length prefix. Encoding returns
//! `None` for frames that must not be transmitted; decoding returns `None`
//! for anything malformed and never panics.

use super::ble_constants::CharacteristicId;

/// MQTT message type tags shared with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Connect,
            2 => Self::Connack,
            3 => Self::Publish,
            4 => Self::Puback,
            5 => Self::Pubrec,
            6 => Self::Pubrel,
            7 => Self::Pubcomp,
            8 => Self::Subscribe,
            9 => Self::Suback,
            10 => Self::Unsubscribe,
            11 => Self::Unsuback,
            12 => Self::Pingreq,
            13 => Self::Pingresp,
            14 => Self::Disconnect,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connack => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::Puback => "PUBACK",
            Self::Pubrec => "PUBREC",
            Self::Pubrel => "PUBREL",
            Self::Pubcomp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::Suback => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsuback => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

/// Read the type tag of a frame without decoding the rest.
pub fn peek_type(frame: &[u8]) -> Option<MessageType> {
    frame.first().and_then(|&tag| MessageType::from_u8(tag))
}

/// MQTT quality of service. QoS 2 is not supported by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            _ => None,
        }
    }
}

/// State of the broker-side MQTT session, as reported to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MqttConnectionState {
    Unknown = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
    ConnectionRefused = 4,
    ConnectionError = 5,
    ProtocolError = 6,
}

impl MqttConnectionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Unknown,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnected,
            4 => Self::ConnectionRefused,
            5 => Self::ConnectionError,
            6 => Self::ProtocolError,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::ConnectionRefused => "ConnectionRefused",
            Self::ConnectionError => "ConnectionError",
            Self::ProtocolError => "ProtocolError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub broker_endpoint: String,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub status: MqttConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub msg_id: u16,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Puback {
    pub msg_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub msg_id: u16,
    pub topics: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suback {
    pub msg_id: u16,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub msg_id: u16,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsuback {
    pub msg_id: u16,
}

/// A decoded MQTT proxy frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMessage {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(Puback),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect,
}

impl ProxyMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect(_) => MessageType::Connect,
            Self::Connack(_) => MessageType::Connack,
            Self::Publish(_) => MessageType::Publish,
            Self::Puback(_) => MessageType::Puback,
            Self::Subscribe(_) => MessageType::Subscribe,
            Self::Suback(_) => MessageType::Suback,
            Self::Unsubscribe(_) => MessageType::Unsubscribe,
            Self::Unsuback(_) => MessageType::Unsuback,
            Self::Pingreq => MessageType::Pingreq,
            Self::Pingresp => MessageType::Pingresp,
            Self::Disconnect => MessageType::Disconnect,
        }
    }

    /// Encode to wire bytes, or `None` if the frame is structurally invalid.
    pub fn encode(&self) -> Option<Vec<u8>> {
        let mut buf = vec![self.message_type() as u8];
        match self {
            Self::Connect(connect) => {
                if connect.client_id.is_empty() || connect.broker_endpoint.is_empty() {
                    return None;
                }
                put_str(&mut buf, &connect.client_id)?;
                put_str(&mut buf, &connect.broker_endpoint)?;
                buf.push(connect.clean_session as u8);
            }
            Self::Connack(connack) => buf.push(connack.status as u8),
            Self::Publish(publish) => {
                if publish.topic.is_empty() {
                    return None;
                }
                buf.reserve(publish.topic.len() + publish.payload.len() + 5);
                put_str(&mut buf, &publish.topic)?;
                buf.extend_from_slice(&publish.msg_id.to_be_bytes());
                buf.push(publish.qos as u8);
                buf.extend_from_slice(&publish.payload);
            }
            Self::Puback(Puback { msg_id }) | Self::Unsuback(Unsuback { msg_id }) => {
                buf.extend_from_slice(&msg_id.to_be_bytes());
            }
            Self::Subscribe(subscribe) => {
                let count = topic_count(subscribe.topics.len())?;
                buf.extend_from_slice(&subscribe.msg_id.to_be_bytes());
                buf.push(count);
                for (topic, qos) in &subscribe.topics {
                    if topic.is_empty() {
                        return None;
                    }
                    put_str(&mut buf, topic)?;
                    buf.push(*qos as u8);
                }
            }
            Self::Suback(suback) => {
                buf.extend_from_slice(&suback.msg_id.to_be_bytes());
                buf.push(suback.status);
            }
            Self::Unsubscribe(unsubscribe) => {
                let count = topic_count(unsubscribe.topics.len())?;
                buf.extend_from_slice(&unsubscribe.msg_id.to_be_bytes());
                buf.push(count);
                for topic in &unsubscribe.topics {
                    if topic.is_empty() {
                        return None;
                    }
                    put_str(&mut buf, topic)?;
                }
            }
            Self::Pingreq | Self::Pingresp | Self::Disconnect => {}
        }
        Some(buf)
    }

    /// Decode wire bytes, or `None` if they do not form a supported frame.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(frame);
        let message_type = MessageType::from_u8(reader.u8()?)?;

        let message = match message_type {
            MessageType::Connect => Self::Connect(Connect {
                client_id: reader.non_empty_str()?,
                broker_endpoint: reader.non_empty_str()?,
                clean_session: match reader.u8()? {
                    0 => false,
                    1 => true,
                    _ => return None,
                },
            }),
            MessageType::Connack => Self::Connack(Connack {
                status: MqttConnectionState::from_u8(reader.u8()?)?,
            }),
            MessageType::Publish => {
                let topic = reader.non_empty_str()?;
                let msg_id = reader.u16()?;
                let qos = QoS::from_u8(reader.u8()?)?;
                let payload = reader.rest().to_vec();
                return Some(Self::Publish(Publish {
                    topic,
                    msg_id,
                    qos,
                    payload,
                }));
            }
            MessageType::Puback => Self::Puback(Puback { msg_id: reader.u16()? }),
            MessageType::Subscribe => {
                let msg_id = reader.u16()?;
                let count = reader.u8()?;
                if count == 0 {
                    return None;
                }
                let mut topics = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let topic = reader.non_empty_str()?;
                    let qos = QoS::from_u8(reader.u8()?)?;
                    topics.push((topic, qos));
                }
                Self::Subscribe(Subscribe { msg_id, topics })
            }
            MessageType::Suback => Self::Suback(Suback {
                msg_id: reader.u16()?,
                status: reader.u8()?,
            }),
            MessageType::Unsubscribe => {
                let msg_id = reader.u16()?;
                let count = reader.u8()?;
                if count == 0 {
                    return None;
                }
                let mut topics = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    topics.push(reader.non_empty_str()?);
                }
                Self::Unsubscribe(Unsubscribe { msg_id, topics })
            }
            MessageType::Unsuback => Self::Unsuback(Unsuback { msg_id: reader.u16()? }),
            MessageType::Pingreq => Self::Pingreq,
            MessageType::Pingresp => Self::Pingresp,
            MessageType::Disconnect => Self::Disconnect,
            MessageType::Pubrec | MessageType::Pubrel | MessageType::Pubcomp => return None,
        };

        reader.is_empty().then_some(message)
    }
}

/// Value written to the proxy control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyControl {
    pub enabled: bool,
}

impl ProxyControl {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.enabled as u8]
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        match data {
            [0] => Some(Self { enabled: false }),
            [1] => Some(Self { enabled: true }),
            _ => None,
        }
    }
}

/// Device information values that can be queried over BLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceInfoKind {
    Mtu,
    BrokerEndpoint,
    FirmwareVersion,
}

impl DeviceInfoKind {
    pub fn characteristic(&self) -> CharacteristicId {
        match self {
            Self::Mtu => CharacteristicId::DeviceMtu,
            Self::BrokerEndpoint => CharacteristicId::BrokerEndpoint,
            Self::FirmwareVersion => CharacteristicId::FirmwareVersion,
        }
    }

    pub fn from_characteristic(characteristic: CharacteristicId) -> Option<Self> {
        match characteristic {
            CharacteristicId::DeviceMtu => Some(Self::Mtu),
            CharacteristicId::BrokerEndpoint => Some(Self::BrokerEndpoint),
            CharacteristicId::FirmwareVersion => Some(Self::FirmwareVersion),
            _ => None,
        }
    }
}

/// A device information value, sent by the device as plain ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceInfo {
    Mtu(u16),
    BrokerEndpoint(String),
    FirmwareVersion(String),
}

impl DeviceInfo {
    pub fn kind(&self) -> DeviceInfoKind {
        match self {
            Self::Mtu(_) => DeviceInfoKind::Mtu,
            Self::BrokerEndpoint(_) => DeviceInfoKind::BrokerEndpoint,
            Self::FirmwareVersion(_) => DeviceInfoKind::FirmwareVersion,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Mtu(mtu) => mtu.to_string().into_bytes(),
            Self::BrokerEndpoint(value) | Self::FirmwareVersion(value) => value.as_bytes().to_vec(),
        }
    }

    pub fn decode(kind: DeviceInfoKind, data: &[u8]) -> Option<Self> {
        if !data.is_ascii() {
            return None;
        }
        let text = std::str::from_utf8(data).ok()?.trim_end_matches('\0').trim();
        match kind {
            DeviceInfoKind::Mtu => text.parse().ok().map(Self::Mtu),
            DeviceInfoKind::BrokerEndpoint => Some(Self::BrokerEndpoint(text.to_string())),
            DeviceInfoKind::FirmwareVersion => Some(Self::FirmwareVersion(text.to_string())),
        }
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Option<()> {
    let len = u16::try_from(s.len()).ok()?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Some(())
}

fn topic_count(len: usize) -> Option<u8> {
    match u8::try_from(len) {
        Ok(0) | Err(_) => None,
        Ok(count) => Some(count),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn non_empty_str(&mut self) -> Option<String> {
        let len = self.u16()? as usize;
        if len == 0 {
            return None;
        }
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).ok().map(str::to_string)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}
