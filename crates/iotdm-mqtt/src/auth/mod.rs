//! Device authentication gateway
//!
//! The transport engine hands CONNECT credentials to a [`DeviceAuthService`]
//! and continues the handshake when the returned future completes. The
//! service may answer immediately or after a remote round trip; either way
//! the connection's read loop is never blocked on it.

mod directory;

pub use directory::{DeviceDirectoryAuthService, DeviceDirectoryFile, DeviceRecord};

use crate::session::DeviceIdentity;
use mqtt5_protocol::ReasonCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Transport protocol a device authenticated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum ProtocolType {
    Mqtt,
    Coap,
    Http,
}

/// CONNECT return codes the engine can answer with.
///
/// Numeric values are the MQTT 3.1.1 return codes; MQTT 5.0 sessions get the
/// equivalent reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernameOrPassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocolVersion => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadUsernameOrPassword => 4,
            Self::NotAuthorized => 5,
        }
    }

    #[must_use]
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnacceptableProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadUsernameOrPassword),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    #[must_use]
    pub fn reason_code(self) -> ReasonCode {
        match self {
            Self::Accepted => ReasonCode::Success,
            Self::UnacceptableProtocolVersion => ReasonCode::UnsupportedProtocolVersion,
            Self::IdentifierRejected => ReasonCode::ClientIdentifierNotValid,
            Self::ServerUnavailable => ReasonCode::ServerUnavailable,
            Self::BadUsernameOrPassword => ReasonCode::BadUsernameOrPassword,
            Self::NotAuthorized => ReasonCode::NotAuthorized,
        }
    }
}

/// Secret-based credentials taken from a CONNECT frame.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretCredentials {
    pub client_id: String,
    pub username: Option<String>,
    /// Never absent: a CONNECT without password yields an empty string.
    pub password: String,
}

impl SecretCredentials {
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        username: Option<String>,
        password: Option<&[u8]>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username,
            password: password
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for SecretCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Outcome of an authentication round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Authenticated(DeviceIdentity),
    Rejected(ConnectReturnCode),
}

impl AuthResult {
    #[must_use]
    pub fn authenticated(identity: DeviceIdentity) -> Self {
        Self::Authenticated(identity)
    }

    /// Rejection with the default not-authorized code.
    #[must_use]
    pub fn rejected() -> Self {
        Self::Rejected(ConnectReturnCode::NotAuthorized)
    }

    #[must_use]
    pub fn rejected_with(code: ConnectReturnCode) -> Self {
        Self::Rejected(code)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

/// Failure of the auth round trip itself, as opposed to a rejection.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("auth service refused the request: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("auth service unavailable: {0}")]
    Unavailable(String),

    #[error("auth service did not answer in time")]
    Timeout,
}

impl AuthError {
    /// CONNACK code for this failure. Only an explicit refusal carries its
    /// own code; everything else is reported as server unavailable.
    #[must_use]
    pub fn return_code(&self) -> ConnectReturnCode {
        match self {
            Self::Refused(code) if *code != ConnectReturnCode::Accepted => *code,
            _ => ConnectReturnCode::ServerUnavailable,
        }
    }
}

/// External device authentication service.
pub trait DeviceAuthService: Send + Sync {
    /// Authenticates a device by its shared secret.
    fn authenticate_by_secret<'a>(
        &'a self,
        protocol: ProtocolType,
        credentials: &'a SecretCredentials,
    ) -> Pin<Box<dyn Future<Output = Result<AuthResult, AuthError>> + Send + 'a>>;
}
