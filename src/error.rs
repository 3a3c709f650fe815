//! Error types for the gateway
//!
//! # Error Categories
//!
//! - **Setup faults**: listener or lifecycle misuse, surfaced to the caller
//! - **Authentication**: any credential failure, reported uniformly
//! - **Authorization**: publish/subscribe outside the identity's namespace
//! - **Transport**: upstream broker offline or failing

use thiserror::Error;

/// Gateway error taxonomy
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Programming or setup error
    #[error("Configuration fault: {0}")]
    Config(String),

    /// A listener or session was started twice
    #[error("{0} is already started")]
    AlreadyStarted(&'static str),

    /// A listener or session was stopped before being started
    #[error("{0} is not started")]
    NotStarted(&'static str),

    /// `destroy()` called while `init()` is running
    #[error("Cannot destroy while init")]
    InitInProgress,

    /// `init()` called while `destroy()` is running
    #[error("Cannot init while destroy")]
    DestroyInProgress,

    /// Authentication failed. Never says which stage failed.
    #[error("Bad credentials")]
    BadCredentials,

    /// Publish or subscribe outside the allowed set
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Upstream broker is not connected
    #[error("Upstream transport is offline")]
    TransportOffline,

    /// Upstream client failure
    #[error("Upstream transport error: {0}")]
    Transport(String),

    /// Publish larger than the upstream session accepts
    #[error("Packet of {size} bytes exceeds upstream limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    /// Malformed or unexpected MQTT traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Directory lookup failure
    #[error("Directory error: {0}")]
    Directory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
