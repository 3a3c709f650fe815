//! MQTT protocol handling module
//!
//! Provides packet framing and codec for the embedded broker, and topic
//! matching for subscriptions and rewrite tables.

mod packet;
mod topic;

pub use packet::{
    encode_packet, frame_length, parse_packet, ConnectReturnCode, Message, MqttPacket,
    MqttPacketType, Outgoing, ParsedConnect, ParsedPublish, ParsedSubscribe, ParsedUnsubscribe,
    Subscription,
};
pub use topic::{RuleTable, TopicMatcher};
