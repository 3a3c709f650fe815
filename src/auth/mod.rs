//! Authentication module
//!
//! Resolves CONNECT credentials to an [`Identity`]. The username selects the
//! identity variant by its leading segment:
//!
//! - `client/<login>`: tenant administrator
//! - `reader/<rootTopicHash>/<code>`: door-access reader
//! - `user/<tenantId>/<email>`: mobile subject
//!
//! Every failure, whatever the stage, surfaces as [`GatewayError::BadCredentials`].

mod directory;

pub use directory::{
    AccessSettingEntry, DirectoryData, FileDirectory, ReaderEntry, ReadersGroupEntry,
    SubjectEntry, TenantEntry, UserEntry,
};

use crate::acl::{AdminIdentity, Identity, ReaderIdentity, SubjectIdentity};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Tenant resolved from administrator credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminRecord {
    pub root_topic: String,
}

/// Reader resolved from its tenant access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderRecord {
    pub reader_id: String,
    pub root_topic: String,
}

/// Subject resolved from user credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    pub root_topic: String,
    pub mobile_token: String,
    /// Deduplicated codes of every reader the subject may use
    pub reader_codes: Vec<String>,
}

/// Credential store consulted during authentication.
///
/// `Ok(None)` is a lookup miss; `Err` is a storage failure. Both end up as
/// the same authentication failure for the client.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_admin(&self, login: &str, secret: &str) -> Result<Option<AdminRecord>>;

    async fn resolve_reader(
        &self,
        root_topic_hash: &str,
        access_token: &str,
        code: &str,
    ) -> Result<Option<ReaderRecord>>;

    async fn resolve_subject(
        &self,
        tenant_id: &str,
        email: &str,
        token: &str,
    ) -> Result<Option<SubjectRecord>>;
}

/// Parsed CONNECT username
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Admin { login: String },
    Reader { root_topic_hash: String, code: String },
    Subject { tenant_id: String, email: String },
}

impl Credentials {
    /// Parse a username. Segments after the expected ones are ignored.
    pub fn parse(username: &str) -> Option<Self> {
        let mut parts = username.split('/');

        match parts.next()? {
            "client" => Some(Self::Admin {
                login: parts.next()?.to_string(),
            }),
            "reader" => Some(Self::Reader {
                root_topic_hash: parts.next()?.to_string(),
                code: parts.next()?.to_string(),
            }),
            "user" => Some(Self::Subject {
                tenant_id: parts.next()?.to_string(),
                email: parts.next()?.to_string(),
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Admin { .. } => "admin",
            Self::Reader { .. } => "reader",
            Self::Subject { .. } => "subject",
        }
    }
}

/// Credential dispatcher
pub struct Authenticator {
    directory: Arc<dyn Directory>,
    max_additional_relays: u32,
}

impl Authenticator {
    pub fn new(directory: Arc<dyn Directory>, max_additional_relays: u32) -> Self {
        Self {
            directory,
            max_additional_relays,
        }
    }

    /// Authenticate CONNECT credentials and build the connection identity
    pub async fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<Identity> {
        let credentials = username.and_then(Credentials::parse);
        let secret = password.and_then(|p| std::str::from_utf8(p).ok());

        let (credentials, secret) = match (credentials, secret) {
            (Some(c), Some(s)) => (c, s),
            _ => {
                debug!(username = ?username, "Unrecognized credentials");
                return Err(GatewayError::BadCredentials);
            }
        };

        match self.resolve(&credentials, secret).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                debug!(kind = credentials.kind(), "Credential lookup missed");
                Err(GatewayError::BadCredentials)
            }
            Err(e) => {
                debug!(kind = credentials.kind(), error = %e, "Credential lookup failed");
                Err(GatewayError::BadCredentials)
            }
        }
    }

    async fn resolve(&self, credentials: &Credentials, secret: &str) -> Result<Option<Identity>> {
        let identity = match credentials {
            Credentials::Admin { login } => self
                .directory
                .resolve_admin(login, secret)
                .await?
                .map(|admin| AdminIdentity::new(admin.root_topic).into()),

            Credentials::Reader {
                root_topic_hash,
                code,
            } => self
                .directory
                .resolve_reader(root_topic_hash, secret, code)
                .await?
                .map(|reader| ReaderIdentity::new(reader.root_topic, code.clone()).into()),

            Credentials::Subject { tenant_id, email } => self
                .directory
                .resolve_subject(tenant_id, email, secret)
                .await?
                .map(|subject| {
                    SubjectIdentity::new(
                        subject.root_topic,
                        subject.mobile_token,
                        subject.reader_codes,
                        self.max_additional_relays,
                    )
                    .into()
                }),
        };

        Ok(identity)
    }
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Tenant namespace root: SHA-256 of the administrator login, lowercase hex
pub fn root_topic_hash(login: &str) -> String {
    sha256_hex(login)
}

/// MQTT username a reader connects with
pub fn reader_mqtt_username(root_topic: &str, code: &str) -> String {
    format!("reader/{root_topic}/{code}")
}

/// Password hash stored for a reader, derived from the tenant access token
pub fn reader_password_hash(access_token: &str) -> String {
    sha256_hex(access_token)
}

/// Upstream ACL patterns granted to a reader
pub fn reader_acl_patterns(root_topic: &str, code: &str) -> [String; 2] {
    [
        format!("{root_topic}/sweet-home/{code}/#"),
        format!("{root_topic}/errors/sweet-home/{code}/#"),
    ]
}
