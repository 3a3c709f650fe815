//! MQTT packet framing and codec
//!
//! Wraps the mqttrs crate to provide owned packets for the embedded broker:
//! frame detection on a byte stream, decoding of client packets and encoding
//! of the packets the broker sends back.

use crate::error::{GatewayError, Result};
use bytes::Bytes;
use mqttrs::{
    decode_slice, encode_slice, Connack, Packet, Pid, Protocol, Publish, QoS, QosPid, Suback,
    SubscribeReturnCodes,
};

pub use mqttrs::ConnectReturnCode;

/// Largest value the remaining-length field can encode
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decoded client packet
#[derive(Debug, Clone)]
pub enum MqttPacket {
    Connect(ParsedConnect),
    Publish(ParsedPublish),
    Puback(u16),
    Subscribe(ParsedSubscribe),
    Unsubscribe(ParsedUnsubscribe),
    PingReq,
    Disconnect,
    Other(MqttPacketType),
}

/// MQTT packet type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttPacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl MqttPacketType {
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

/// Parsed CONNECT packet
#[derive(Debug, Clone)]
pub struct ParsedConnect {
    /// Protocol version (3 = 3.1, 4 = 3.1.1)
    pub protocol_version: u8,
    /// Client identifier
    pub client_id: String,
    /// Clean session flag
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Username if provided
    pub username: Option<String>,
    /// Password if provided (stored as bytes for non-UTF8 passwords)
    pub password: Option<Vec<u8>>,
}

/// Parsed PUBLISH packet
#[derive(Debug, Clone)]
pub struct ParsedPublish {
    pub message: Message,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Packet identifier (for QoS > 0)
    pub packet_id: Option<u16>,
}

/// Parsed SUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct ParsedSubscribe {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

/// A single subscription request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter (may contain + and # wildcards)
    pub topic_filter: String,
    /// Requested QoS level
    pub qos: u8,
}

impl Subscription {
    pub fn new(topic_filter: impl Into<String>, qos: u8) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// Parsed UNSUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct ParsedUnsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Application message flowing through the gateway, independent of the
/// wire packet that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    /// Same message under another topic
    pub fn with_topic(&self, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..self.clone()
        }
    }

    /// Payload as UTF-8 text, lossy
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Packets sent by the broker to a downstream client
#[derive(Debug, Clone)]
pub enum Outgoing {
    Connack {
        session_present: bool,
        code: ConnectReturnCode,
    },
    Publish {
        message: Message,
        packet_id: Option<u16>,
    },
    Puback(u16),
    /// Granted QoS per filter, `None` for a refused filter
    Suback { packet_id: u16, granted: Vec<Option<u8>> },
    Unsuback(u16),
    Pingresp,
}

impl Outgoing {
    pub fn packet_type(&self) -> MqttPacketType {
        match self {
            Self::Connack { .. } => MqttPacketType::Connack,
            Self::Publish { .. } => MqttPacketType::Publish,
            Self::Puback(_) => MqttPacketType::Puback,
            Self::Suback { .. } => MqttPacketType::Suback,
            Self::Unsuback(_) => MqttPacketType::Unsuback,
            Self::Pingresp => MqttPacketType::Pingresp,
        }
    }
}

/// Total length of the first frame in `buf`, header included.
///
/// Returns `Ok(None)` while the fixed header itself is still incomplete.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;

    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        remaining += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some(1 + i + 1 + remaining));
        }
        multiplier *= 128;
    }

    if buf.len() >= 5 {
        return Err(GatewayError::Protocol(format!(
            "Remaining length exceeds {} bytes",
            MAX_REMAINING_LENGTH
        )));
    }
    Ok(None)
}

/// Parse one complete MQTT frame
pub fn parse_packet(data: &[u8]) -> Result<MqttPacket> {
    let packet = decode_slice(data)
        .map_err(|e| GatewayError::Protocol(format!("Failed to decode MQTT packet: {:?}", e)))?
        .ok_or_else(|| GatewayError::Protocol("Incomplete MQTT packet".to_string()))?;

    match packet {
        Packet::Connect(connect) => {
            let protocol_version = match connect.protocol {
                Protocol::MQTT311 => 4,
                Protocol::MQIsdp => 3,
            };

            Ok(MqttPacket::Connect(ParsedConnect {
                protocol_version,
                client_id: connect.client_id.to_string(),
                clean_session: connect.clean_session,
                keep_alive: connect.keep_alive,
                username: connect.username.map(|s| s.to_string()),
                password: connect.password.map(|p| p.to_vec()),
            }))
        }

        Packet::Publish(publish) => {
            // mqttrs uses QosPid enum to combine QoS and packet ID
            let (qos, packet_id) = match publish.qospid {
                QosPid::AtMostOnce => (0, None),
                QosPid::AtLeastOnce(pid) => (1, Some(pid.get())),
                QosPid::ExactlyOnce(pid) => (2, Some(pid.get())),
            };

            Ok(MqttPacket::Publish(ParsedPublish {
                message: Message {
                    topic: publish.topic_name.to_string(),
                    payload: Bytes::copy_from_slice(publish.payload),
                    qos,
                    retain: publish.retain,
                },
                dup: publish.dup,
                packet_id,
            }))
        }

        Packet::Subscribe(subscribe) => {
            let subscriptions = subscribe
                .topics
                .iter()
                .map(|t| Subscription::new(t.topic_path.to_string(), qos_to_u8(t.qos)))
                .collect();

            Ok(MqttPacket::Subscribe(ParsedSubscribe {
                packet_id: subscribe.pid.get(),
                subscriptions,
            }))
        }

        Packet::Unsubscribe(unsub) => Ok(MqttPacket::Unsubscribe(ParsedUnsubscribe {
            packet_id: unsub.pid.get(),
            topics: unsub.topics.iter().map(|t| t.to_string()).collect(),
        })),

        Packet::Puback(pid) => Ok(MqttPacket::Puback(pid.get())),
        Packet::Pingreq => Ok(MqttPacket::PingReq),
        Packet::Disconnect => Ok(MqttPacket::Disconnect),

        Packet::Pingresp => Ok(MqttPacket::Other(MqttPacketType::Pingresp)),
        Packet::Connack(_) => Ok(MqttPacket::Other(MqttPacketType::Connack)),
        Packet::Pubrec(_) => Ok(MqttPacket::Other(MqttPacketType::Pubrec)),
        Packet::Pubrel(_) => Ok(MqttPacket::Other(MqttPacketType::Pubrel)),
        Packet::Pubcomp(_) => Ok(MqttPacket::Other(MqttPacketType::Pubcomp)),
        Packet::Suback(_) => Ok(MqttPacket::Other(MqttPacketType::Suback)),
        Packet::Unsuback(_) => Ok(MqttPacket::Other(MqttPacketType::Unsuback)),
    }
}

/// Encode a broker packet into a fresh buffer
pub fn encode_packet(packet: &Outgoing) -> Result<Vec<u8>> {
    let (mqtt, capacity) = match packet {
        Outgoing::Connack {
            session_present,
            code,
        } => (
            Packet::Connack(Connack {
                session_present: *session_present,
                code: *code,
            }),
            4,
        ),
        Outgoing::Publish { message, packet_id } => {
            let qospid = match (message.qos, packet_id) {
                (0, _) | (_, None) => QosPid::AtMostOnce,
                (1, Some(pid)) => QosPid::AtLeastOnce(to_pid(*pid)?),
                (_, Some(pid)) => QosPid::ExactlyOnce(to_pid(*pid)?),
            };
            (
                Packet::Publish(Publish {
                    dup: false,
                    qospid,
                    retain: message.retain,
                    topic_name: &message.topic,
                    payload: &message.payload,
                }),
                9 + message.topic.len() + message.payload.len(),
            )
        }
        Outgoing::Puback(pid) => (Packet::Puback(to_pid(*pid)?), 4),
        Outgoing::Suback { packet_id, granted } => {
            let return_codes = granted
                .iter()
                .map(|g| match g {
                    Some(qos) => SubscribeReturnCodes::Success(u8_to_qos(*qos)),
                    None => SubscribeReturnCodes::Failure,
                })
                .collect();
            (
                Packet::Suback(Suback {
                    pid: to_pid(*packet_id)?,
                    return_codes,
                }),
                7 + granted.len(),
            )
        }
        Outgoing::Unsuback(pid) => (Packet::Unsuback(to_pid(*pid)?), 4),
        Outgoing::Pingresp => (Packet::Pingresp, 2),
    };

    let mut buf = vec![0u8; capacity];
    let len = encode_slice(&mqtt, &mut buf).map_err(|e| {
        GatewayError::Protocol(format!(
            "Failed to encode {}: {:?}",
            packet.packet_type().as_str(),
            e
        ))
    })?;
    buf.truncate(len);
    Ok(buf)
}

fn to_pid(id: u16) -> Result<Pid> {
    Pid::try_from(id).map_err(|e| GatewayError::Protocol(format!("Invalid packet id {}: {:?}", id, e)))
}

fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn u8_to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
