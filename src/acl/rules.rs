//! Topic rules and the curated subject rule sets
//!
//! A subject sees a device through a fixed list of entry points. Each entry
//! is a `(pattern, rule)` pair built from the reader code and relay index.

use crate::mqtt::Message;
use bytes::Bytes;

/// Payload substituted for device-reported key errors
pub const ACCESS_DENIED_PAYLOAD: &str = r#"{"code":"Denied","message":"Access denied"}"#;

/// Payload substituted for key actuation echoes
pub const ACTUATED_PAYLOAD: &str = "true";

/// Only one sensor type is exposed to subjects
pub const SENSOR_PROPERTIES_PAYLOAD: &str = "s";

/// What to do with a message whose topic matched a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRule {
    /// Accept the message unchanged
    PassThrough,
    /// Replace the topic and/or the payload
    Rewrite {
        topic: Option<String>,
        payload: Option<Bytes>,
    },
}

impl TopicRule {
    pub fn rewrite(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::Rewrite {
            topic: Some(topic.into()),
            payload: Some(payload.into()),
        }
    }

    pub fn replace_payload(payload: impl Into<Bytes>) -> Self {
        Self::Rewrite {
            topic: None,
            payload: Some(payload.into()),
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough)
    }

    /// Apply the rule, keeping QoS and retain of the original message
    pub fn apply(&self, message: &Message) -> Message {
        match self {
            Self::PassThrough => message.clone(),
            Self::Rewrite { topic, payload } => Message {
                topic: topic.clone().unwrap_or_else(|| message.topic.clone()),
                payload: payload.clone().unwrap_or_else(|| message.payload.clone()),
                qos: message.qos,
                retain: message.retain,
            },
        }
    }
}

/// Publish entry points for one reader, in the subject's relative space.
///
/// One for the main sensor plus one per relay. Every entry redirects the
/// switch request to the key actuation topic and carries the mobile token.
pub fn publish_rules(code: &str, max_relays: u32, mobile_token: &str) -> Vec<(String, TopicRule)> {
    let token = Bytes::copy_from_slice(mobile_token.as_bytes());

    let main = (
        format!("sweet-home/{code}/d/s/set"),
        TopicRule::rewrite(format!("sweet-home/{code}/d/k/set"), token.clone()),
    );

    let relays = (1..=max_relays).map(|i| {
        (
            format!("sweet-home/{code}/r/s{i}/set"),
            TopicRule::rewrite(format!("sweet-home/{code}/r/k{i}/set"), token.clone()),
        )
    });

    std::iter::once(main).chain(relays).collect()
}

/// Forward rules for one reader, keyed by global topic.
pub fn forward_rules(root: &str, code: &str, max_relays: u32) -> Vec<(String, TopicRule)> {
    let device = format!("{root}/sweet-home/{code}");
    let errors = format!("{root}/errors/sweet-home/{code}");

    let pass = |pattern: String| (pattern, TopicRule::PassThrough);

    let mut rules = vec![
        pass(format!("{device}/+")),
        pass(format!("{device}/$fw/+")),
        // analog inputs
        pass(format!("{device}/$options/k1")),
        pass(format!("{device}/$options/k1/$name")),
        pass(format!("{device}/$options/k2")),
        pass(format!("{device}/$options/k2/$name")),
        pass(format!("{device}/d/$name")),
        pass(format!("{device}/d/$state")),
        (
            format!("{device}/d/$properties"),
            TopicRule::replace_payload(SENSOR_PROPERTIES_PAYLOAD),
        ),
        pass(format!("{device}/d/s")),
        pass(format!("{device}/d/s/+")),
        pass(format!("{errors}/d/s")),
        (
            format!("{errors}/d/k"),
            TopicRule::rewrite(format!("{errors}/d/s"), ACCESS_DENIED_PAYLOAD),
        ),
        (
            format!("{device}/d/k/set"),
            TopicRule::rewrite(format!("{device}/d/s/set"), ACTUATED_PAYLOAD),
        ),
        pass(format!("{device}/r/$name")),
        pass(format!("{device}/r/$state")),
    ];

    for i in 1..=max_relays {
        rules.push(pass(format!("{device}/r/s{i}")));
        rules.push(pass(format!("{device}/r/s{i}/+")));
        rules.push(pass(format!("{errors}/r/s{i}")));
        rules.push((
            format!("{errors}/r/k{i}"),
            TopicRule::rewrite(format!("{errors}/r/s{i}"), ACCESS_DENIED_PAYLOAD),
        ));
        rules.push((
            format!("{device}/r/k{i}/set"),
            TopicRule::rewrite(format!("{device}/r/s{i}/set"), ACTUATED_PAYLOAD),
        ));
    }

    rules
}
