//! Access Control List (ACL) module
//!
//! Identity-scoped authorization and topic rewriting. Every authenticated
//! downstream connection owns one [`Identity`]; it decides whether a publish
//! or subscription is accepted and how forwarded messages look to it.

mod identity;
mod rules;

pub use identity::{AdminIdentity, ReaderIdentity, SubjectIdentity};
pub use rules::{
    forward_rules, publish_rules, TopicRule, ACCESS_DENIED_PAYLOAD, ACTUATED_PAYLOAD,
    SENSOR_PROPERTIES_PAYLOAD,
};

use crate::error::Result;
use crate::mqtt::{Message, Subscription};

/// Authorization capability of a downstream connection
#[derive(Debug, Clone)]
pub enum Identity {
    Admin(AdminIdentity),
    Reader(ReaderIdentity),
    Subject(SubjectIdentity),
}

impl Identity {
    /// Variant name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Admin(_) => "admin",
            Self::Reader(_) => "reader",
            Self::Subject(_) => "subject",
        }
    }

    pub fn root_topic(&self) -> &str {
        match self {
            Self::Admin(admin) => admin.root_topic(),
            Self::Reader(reader) => reader.root_topic(),
            Self::Subject(subject) => subject.root_topic(),
        }
    }

    /// Map a relative publish into the tenant namespace.
    ///
    /// An error means the connection must be dropped.
    pub fn authorize_publish(&self, message: &Message) -> Result<Message> {
        match self {
            Self::Admin(admin) => admin.authorize_publish(message),
            Self::Reader(reader) => reader.authorize_publish(message),
            Self::Subject(subject) => subject.authorize_publish(message),
        }
    }

    /// Map a relative subscription into the tenant namespace.
    ///
    /// An error means the connection must be dropped.
    pub fn authorize_subscribe(&self, sub: &Subscription) -> Result<Subscription> {
        match self {
            Self::Admin(admin) => admin.authorize_subscribe(sub),
            Self::Reader(reader) => reader.authorize_subscribe(sub),
            Self::Subject(subject) => subject.authorize_subscribe(sub),
        }
    }

    /// Map a global message into the connection's view, `None` suppresses it
    pub fn authorize_forward(&self, message: &Message) -> Option<Message> {
        match self {
            Self::Admin(admin) => admin.authorize_forward(message),
            Self::Reader(reader) => reader.authorize_forward(message),
            Self::Subject(subject) => subject.authorize_forward(message),
        }
    }
}

impl From<AdminIdentity> for Identity {
    fn from(identity: AdminIdentity) -> Self {
        Self::Admin(identity)
    }
}

impl From<ReaderIdentity> for Identity {
    fn from(identity: ReaderIdentity) -> Self {
        Self::Reader(identity)
    }
}

impl From<SubjectIdentity> for Identity {
    fn from(identity: SubjectIdentity) -> Self {
        Self::Subject(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_variant() {
        let identities: Vec<Identity> = vec![
            AdminIdentity::new("root").into(),
            ReaderIdentity::new("root", "r1").into(),
            SubjectIdentity::new("root", "token", vec!["r1".to_string()], 1).into(),
        ];

        let kinds: Vec<_> = identities.iter().map(Identity::kind).collect();
        assert_eq!(kinds, vec!["admin", "reader", "subject"]);

        let message = Message::new("root/sweet-home/r1/d/s", "true");
        for identity in &identities {
            assert_eq!(identity.root_topic(), "root");
            let forwarded = identity.authorize_forward(&message).unwrap();
            assert_eq!(forwarded.topic, "sweet-home/r1/d/s");
        }
    }

    #[test]
    fn test_subject_subscribe_is_prefixed() {
        let identity: Identity = SubjectIdentity::new("root", "token", Vec::new(), 0).into();
        let sub = identity
            .authorize_subscribe(&Subscription::new("sweet-home/#", 1))
            .unwrap();
        assert_eq!(sub.topic_filter, "root/sweet-home/#");
        assert_eq!(sub.qos, 1);
    }
}
