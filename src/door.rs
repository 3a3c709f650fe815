//! Door actuation over the upstream session
//!
//! Publishes an actuation request for one reader and waits for the matching
//! acknowledgment or device error on the shared upstream message stream.

use crate::transport::{PublishOptions, TransportEvent, UpstreamTransport};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// How long a device has to answer
pub const ACTUATION_TIMEOUT: Duration = Duration::from_secs(10);

const GENERIC_FAILURE: &str = "Something went wrong";

/// Outcome of a failed actuation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActuationError {
    #[error("Timed out waiting for device response")]
    Timeout,

    /// Error reported by the device firmware
    #[error("Device error {code}: {message}")]
    Device { code: String, message: String },

    #[error("{0}")]
    Generic(String),

    #[error("Failed to send actuation request: {0}")]
    Transport(String),
}

/// Error payload published by devices on `errors/...` topics
#[derive(Debug, Deserialize)]
struct DeviceErrorPayload {
    code: String,
    message: String,
}

/// Topics and payloads of one request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
struct Exchange {
    request_topic: String,
    payload: String,
    success_topic: String,
    error_topic: String,
}

impl Exchange {
    fn new(root_topic: &str, code: &str, channel: &str, payload: String) -> Self {
        Self {
            request_topic: format!("{root_topic}/sweet-home/{code}/d/{channel}/set"),
            payload,
            success_topic: format!("{root_topic}/sweet-home/{code}/d/{channel}"),
            error_topic: format!("{root_topic}/errors/sweet-home/{code}/d/{channel}"),
        }
    }

    /// `None` when the message belongs to unrelated traffic
    fn outcome(&self, topic: &str, payload: &[u8]) -> Option<Result<(), ActuationError>> {
        if topic == self.success_topic && payload == self.payload.as_bytes() {
            return Some(Ok(()));
        }
        if topic != self.error_topic {
            return None;
        }

        let error = match serde_json::from_slice::<DeviceErrorPayload>(payload) {
            Ok(device) => ActuationError::Device {
                code: device.code,
                message: device.message,
            },
            Err(_) => ActuationError::Generic(GENERIC_FAILURE.to_string()),
        };
        Some(Err(error))
    }
}

/// Sends actuation requests to readers and awaits their answer
pub struct DoorOpener {
    transport: Arc<dyn UpstreamTransport>,
    timeout: Duration,
}

impl DoorOpener {
    pub fn new(transport: Arc<dyn UpstreamTransport>) -> Self {
        Self {
            transport,
            timeout: ACTUATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Actuate the main sensor of reader `code` in tenant `root_topic`
    pub async fn open(&self, root_topic: &str, code: &str) -> Result<(), ActuationError> {
        self.run(Exchange::new(root_topic, code, "s", "true".to_string()))
            .await
    }

    /// Actuate with a bearer token. Succeeds when the device echoes the token.
    pub async fn open_with_token(
        &self,
        root_topic: &str,
        code: &str,
        token: &str,
    ) -> Result<(), ActuationError> {
        self.run(Exchange::new(root_topic, code, "k", token.to_string()))
            .await
    }

    async fn run(&self, exchange: Exchange) -> Result<(), ActuationError> {
        // listen first, the answer may race the publish
        let mut events = self.transport.events();

        self.transport
            .publish(
                &exchange.request_topic,
                Bytes::from(exchange.payload.clone()),
                PublishOptions::retain(false),
            )
            .await
            .map_err(|e| ActuationError::Transport(e.to_string()))?;
        debug!(topic = %exchange.request_topic, "Actuation requested");

        match tokio::time::timeout(self.timeout, wait_for(&mut events, &exchange)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(topic = %exchange.request_topic, "Actuation timed out");
                Err(ActuationError::Timeout)
            }
        }
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<TransportEvent>,
    exchange: &Exchange,
) -> Result<(), ActuationError> {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Message(message)) => {
                if let Some(outcome) = exchange.outcome(&message.topic, &message.payload) {
                    return outcome;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Actuation listener lagged");
            }
            // no more messages, let the timer decide
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
