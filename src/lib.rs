//! Multi-tenant MQTT gateway
//!
//! Downstream clients (door-access readers, administrative consoles and
//! mobile "subject" apps) connect to an embedded broker. Every connection is
//! authenticated into an identity that sees only a relative view of its
//! tenant's namespace, and all traffic is bridged to one upstream broker
//! session shared by the whole process.
//!
//! - **Authentication**: `client/<login>`, `reader/<rootTopicHash>/<code>`
//!   and `user/<tenantId>/<email>` usernames resolved through a [`Directory`]
//! - **Topic rewriting**: per-identity rule tables between the virtual and
//!   the global topic space
//! - **Bridge**: accepted publishes go upstream, upstream messages are
//!   re-authorized per subscriber before delivery
//! - **Door actuation**: correlated request/response with timeout
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "listener": { "port": 1883, "ws-port": 8083 },
//!   "upstream": {
//!     "host": "broker.internal",
//!     "port": 1883,
//!     "root-topic": "gateway"
//!   },
//!   "devices": { "max-additional-relays-number": 3 },
//!   "directory": { "path": "/etc/gateway/directory.json" }
//! }
//! ```
//!
//! [`Directory`]: auth::Directory

pub mod acl;
pub mod auth;
pub mod broker;
pub mod config;
pub mod door;
pub mod error;
pub mod mqtt;
pub mod proxy;
pub mod qos;
pub mod transport;

// Re-export main types
pub use config::GatewayConfig;
pub use door::{ActuationError, DoorOpener};
pub use error::{GatewayError, Result};
pub use proxy::{MqttProxy, ProxyState};
pub use transport::{MqttTransport, UpstreamTransport};
