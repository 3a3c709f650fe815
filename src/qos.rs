//! QoS negotiation for downstream sessions
//!
//! The embedded broker speaks QoS 0 and 1. Subscriptions asking for more are
//! downgraded; QoS 2 publishes are refused.

/// Highest QoS the embedded broker handles
pub const MAX_QOS: u8 = 1;

/// QoS check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosCheckResult {
    /// Whether the QoS is allowed
    pub allowed: bool,
    /// QoS to use (granted for subscriptions)
    pub recommended_qos: u8,
    /// Reason for any changes
    pub reason: Option<String>,
}

impl QosCheckResult {
    pub fn allowed(qos: u8) -> Self {
        Self {
            allowed: true,
            recommended_qos: qos,
            reason: None,
        }
    }

    pub fn downgraded(original: u8, new: u8) -> Self {
        Self {
            allowed: true,
            recommended_qos: new,
            reason: Some(format!("QoS downgraded from {} to {}", original, new)),
        }
    }

    pub fn denied(qos: u8, max: u8) -> Self {
        Self {
            allowed: false,
            recommended_qos: max,
            reason: Some(format!("QoS {} exceeds maximum {}", qos, max)),
        }
    }
}

/// QoS policy of the embedded broker
#[derive(Debug, Clone, Copy)]
pub struct QosPolicy {
    max_qos: u8,
}

impl QosPolicy {
    pub const fn new(max_qos: u8) -> Self {
        Self { max_qos }
    }

    pub fn max_qos(&self) -> u8 {
        self.max_qos
    }

    /// Inbound PUBLISH: never downgraded, the sender expects its flow
    pub fn check_publish(&self, qos: u8) -> QosCheckResult {
        if qos <= self.max_qos {
            QosCheckResult::allowed(qos)
        } else {
            QosCheckResult::denied(qos, self.max_qos)
        }
    }

    /// SUBSCRIBE: grant at most the maximum
    pub fn grant(&self, requested: u8) -> QosCheckResult {
        if requested <= self.max_qos {
            QosCheckResult::allowed(requested)
        } else {
            QosCheckResult::downgraded(requested, self.max_qos)
        }
    }

    /// QoS of a delivery to a subscriber
    pub fn delivery_qos(&self, message_qos: u8, granted: u8) -> u8 {
        message_qos.min(granted).min(self.max_qos)
    }
}

impl Default for QosPolicy {
    fn default() -> Self {
        Self::new(MAX_QOS)
    }
}
