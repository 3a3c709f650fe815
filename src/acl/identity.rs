//! Per-connection identities
//!
//! Each identity maps between the connection's relative topic space and the
//! tenant's global namespace rooted at `root_topic`.

use super::rules::{forward_rules, publish_rules, TopicRule};
use crate::error::{GatewayError, Result};
use crate::mqtt::{Message, RuleTable, Subscription};

fn prefix(root: &str, topic: &str) -> String {
    format!("{root}/{topic}")
}

/// Strip `root/` from a global topic, `None` when it lives elsewhere
fn strip<'a>(root: &str, topic: &'a str) -> Option<&'a str> {
    topic.strip_prefix(root)?.strip_prefix('/')
}

/// Tenant administrator: the whole namespace, mapped 1:1
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    root_topic: String,
}

impl AdminIdentity {
    pub fn new(root_topic: impl Into<String>) -> Self {
        Self {
            root_topic: root_topic.into(),
        }
    }

    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    pub fn authorize_publish(&self, message: &Message) -> Result<Message> {
        Ok(message.with_topic(prefix(&self.root_topic, &message.topic)))
    }

    pub fn authorize_subscribe(&self, sub: &Subscription) -> Result<Subscription> {
        Ok(Subscription::new(prefix(&self.root_topic, &sub.topic_filter), sub.qos))
    }

    pub fn authorize_forward(&self, message: &Message) -> Option<Message> {
        strip(&self.root_topic, &message.topic).map(|topic| message.with_topic(topic))
    }
}

/// Door-access reader: its own device and error subtrees only
#[derive(Debug, Clone)]
pub struct ReaderIdentity {
    root_topic: String,
    code: String,
}

impl ReaderIdentity {
    pub fn new(root_topic: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            root_topic: root_topic.into(),
            code: code.into(),
        }
    }

    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    fn owns(&self, relative: &str) -> bool {
        let device = format!("sweet-home/{}/", self.code);
        relative.starts_with(&device)
            || relative
                .strip_prefix("errors/")
                .is_some_and(|rest| rest.starts_with(&device))
    }

    pub fn authorize_publish(&self, message: &Message) -> Result<Message> {
        if !self.owns(&message.topic) {
            return Err(GatewayError::NotPermitted("Bad publish".to_string()));
        }
        Ok(message.with_topic(prefix(&self.root_topic, &message.topic)))
    }

    pub fn authorize_subscribe(&self, sub: &Subscription) -> Result<Subscription> {
        if !self.owns(&sub.topic_filter) {
            return Err(GatewayError::NotPermitted("Bad subscribe".to_string()));
        }
        Ok(Subscription::new(prefix(&self.root_topic, &sub.topic_filter), sub.qos))
    }

    pub fn authorize_forward(&self, message: &Message) -> Option<Message> {
        let relative = strip(&self.root_topic, &message.topic)?;
        self.owns(relative).then(|| message.with_topic(relative))
    }
}

/// Mobile app user: a curated view of the readers it was granted
#[derive(Debug, Clone)]
pub struct SubjectIdentity {
    root_topic: String,
    mobile_token: String,
    reader_codes: Vec<String>,
    max_additional_relays: u32,
    publish_table: RuleTable<TopicRule>,
    forward_table: RuleTable<TopicRule>,
}

impl SubjectIdentity {
    pub fn new(
        root_topic: impl Into<String>,
        mobile_token: impl Into<String>,
        reader_codes: Vec<String>,
        max_additional_relays: u32,
    ) -> Self {
        let root_topic = root_topic.into();
        let mobile_token = mobile_token.into();

        let mut publish_table = RuleTable::new();
        let mut forward_table = RuleTable::new();
        for code in &reader_codes {
            publish_table.extend(publish_rules(code, max_additional_relays, &mobile_token));
            forward_table.extend(forward_rules(&root_topic, code, max_additional_relays));
        }

        Self {
            root_topic,
            mobile_token,
            reader_codes,
            max_additional_relays,
            publish_table,
            forward_table,
        }
    }

    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }

    pub fn mobile_token(&self) -> &str {
        &self.mobile_token
    }

    pub fn reader_codes(&self) -> &[String] {
        &self.reader_codes
    }

    pub fn max_additional_relays(&self) -> u32 {
        self.max_additional_relays
    }

    pub fn publish_table(&self) -> &RuleTable<TopicRule> {
        &self.publish_table
    }

    pub fn forward_table(&self) -> &RuleTable<TopicRule> {
        &self.forward_table
    }

    pub fn authorize_publish(&self, message: &Message) -> Result<Message> {
        let rule = self
            .publish_table
            .first_match(&message.topic)
            .ok_or_else(|| GatewayError::NotPermitted("Not permitted".to_string()))?;

        let relative = rule.apply(message);
        Ok(relative.with_topic(prefix(&self.root_topic, &relative.topic)))
    }

    pub fn authorize_subscribe(&self, sub: &Subscription) -> Result<Subscription> {
        Ok(Subscription::new(prefix(&self.root_topic, &sub.topic_filter), sub.qos))
    }

    pub fn authorize_forward(&self, message: &Message) -> Option<Message> {
        let global = self.forward_table.first_match(&message.topic)?.apply(message);
        let relative = strip(&self.root_topic, &global.topic)?;
        Some(global.with_topic(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT_A: &str = "aaaa";
    const ROOT_B: &str = "bbbb";

    fn subject(root: &str, codes: &[&str]) -> SubjectIdentity {
        SubjectIdentity::new(
            root,
            "mobile-token",
            codes.iter().map(|c| c.to_string()).collect(),
            3,
        )
    }

    #[test]
    fn test_admin_maps_whole_namespace() {
        let admin = AdminIdentity::new(ROOT_A);

        let out = admin
            .authorize_publish(&Message::new("anything/at/all", "1").with_retain(true))
            .unwrap();
        assert_eq!(out.topic, "aaaa/anything/at/all");
        assert!(out.retain);

        let sub = admin.authorize_subscribe(&Subscription::new("#", 1)).unwrap();
        assert_eq!(sub, Subscription::new("aaaa/#", 1));

        let back = admin.authorize_forward(&Message::new("aaaa/sweet-home/x/d/s", "true"));
        assert_eq!(back.map(|m| m.topic), Some("sweet-home/x/d/s".to_string()));

        assert!(admin.authorize_forward(&Message::new("bbbb/sweet-home/x", "1")).is_none());
        assert!(admin.authorize_forward(&Message::new("aaaab/sweet-home/x", "1")).is_none());
    }

    #[test]
    fn test_reader_round_trip() {
        let reader = ReaderIdentity::new(ROOT_A, "r1");

        for relative in ["sweet-home/r1/d/s", "errors/sweet-home/r1/d/k"] {
            let upstream = reader.authorize_publish(&Message::new(relative, "x")).unwrap();
            assert_eq!(upstream.topic, format!("aaaa/{relative}"));

            let back = reader.authorize_forward(&upstream).unwrap();
            assert_eq!(back.topic, relative);
        }
    }

    #[test]
    fn test_reader_rejects_foreign_topics() {
        let reader = ReaderIdentity::new(ROOT_A, "r1");

        for topic in ["sweet-home/r2/d/s", "sweet-home/r1", "errors/sweet-home/r10/d/s", "other"] {
            let err = reader.authorize_publish(&Message::new(topic, "x")).unwrap_err();
            assert!(matches!(err, GatewayError::NotPermitted(ref m) if m == "Bad publish"));
        }

        let err = reader
            .authorize_subscribe(&Subscription::new("sweet-home/#", 0))
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotPermitted(ref m) if m == "Bad subscribe"));

        let sub = reader
            .authorize_subscribe(&Subscription::new("sweet-home/r1/#", 0))
            .unwrap();
        assert_eq!(sub.topic_filter, "aaaa/sweet-home/r1/#");

        assert!(reader.authorize_forward(&Message::new("aaaa/sweet-home/r2/d/s", "x")).is_none());
        assert!(reader.authorize_forward(&Message::new("bbbb/sweet-home/r1/d/s", "x")).is_none());
    }

    #[test]
    fn test_subject_publish_uses_mobile_token() {
        let subject = subject(ROOT_A, &["c1", "c2"]);

        let out = subject
            .authorize_publish(&Message::new("sweet-home/c2/d/s/set", "true"))
            .unwrap();
        assert_eq!(out.topic, "aaaa/sweet-home/c2/d/k/set");
        assert_eq!(out.payload.as_ref(), b"mobile-token");

        let relay = subject
            .authorize_publish(&Message::new("sweet-home/c1/r/s3/set", "true"))
            .unwrap();
        assert_eq!(relay.topic, "aaaa/sweet-home/c1/r/k3/set");

        for denied in ["sweet-home/c3/d/s/set", "sweet-home/c1/r/s4/set", "sweet-home/c1/d/k/set"] {
            assert!(subject.authorize_publish(&Message::new(denied, "true")).is_err());
        }
    }

    #[test]
    fn test_subject_forward_hides_key_topics() {
        let subject = subject(ROOT_A, &["c1"]);

        let state = subject
            .authorize_forward(&Message::new("aaaa/sweet-home/c1/d/s", "true"))
            .unwrap();
        assert_eq!(state.topic, "sweet-home/c1/d/s");

        let echo = subject
            .authorize_forward(&Message::new("aaaa/sweet-home/c1/d/k/set", "secret"))
            .unwrap();
        assert_eq!(echo.topic, "sweet-home/c1/d/s/set");
        assert_eq!(echo.payload.as_ref(), b"true");

        let denied = subject
            .authorize_forward(&Message::new("aaaa/errors/sweet-home/c1/r/k2", "secret"))
            .unwrap();
        assert_eq!(denied.topic, "errors/sweet-home/c1/r/s2");

        // not in the curated set
        assert!(subject.authorize_forward(&Message::new("aaaa/sweet-home/c1/d/k", "secret")).is_none());
        assert!(subject.authorize_forward(&Message::new("aaaa/sweet-home/c2/d/s", "true")).is_none());
    }

    #[test]
    fn test_subject_table_sizes() {
        let subject = subject(ROOT_A, &["c1", "c2"]);
        assert_eq!(subject.publish_table().len(), 2 * (3 + 1));
        assert_eq!(subject.forward_table().len(), 2 * (16 + 5 * 3));

        let empty = SubjectIdentity::new(ROOT_A, "t", Vec::new(), 3);
        assert!(empty.publish_table().is_empty());
        assert!(empty.authorize_publish(&Message::new("sweet-home/c1/d/s/set", "true")).is_err());
    }

    #[test]
    fn test_tenant_isolation() {
        let subject = subject(ROOT_A, &["c1"]);

        for (pattern, rule) in subject.forward_table().iter() {
            assert!(pattern.starts_with("aaaa/"), "{}", pattern);
            if let TopicRule::Rewrite { topic: Some(topic), .. } = rule {
                assert!(topic.starts_with("aaaa/"), "{}", topic);
            }
        }

        let foreign = [
            "bbbb/sweet-home/c1/d/s",
            "bbbb/sweet-home/c1/d/k/set",
            "bbbb/errors/sweet-home/c1/d/k",
        ];
        for topic in foreign {
            assert!(subject.authorize_forward(&Message::new(topic, "x")).is_none());
            assert!(ReaderIdentity::new(ROOT_A, "c1")
                .authorize_forward(&Message::new(topic, "x"))
                .is_none());
            assert!(AdminIdentity::new(ROOT_A)
                .authorize_forward(&Message::new(topic, "x"))
                .is_none());
        }

        let published = subject
            .authorize_publish(&Message::new("sweet-home/c1/d/s/set", "true"))
            .unwrap();
        assert!(!published.topic.starts_with(ROOT_B));
    }
}
