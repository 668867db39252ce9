use crate::auth::ConnectReturnCode;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised while serving a device connection.
///
/// Every variant except [`TransportError::ResourceExhausted`] is scoped to a
/// single connection: the handler logs it, closes the connection and tears
/// the session down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame too large: size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Authentication rejected: {0:?}")]
    AuthRejected(ConnectReturnCode),

    #[error("Payload delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Session registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Whether this error must take the whole process down.
    ///
    /// Allocation failures surfaced by the socket layer are treated the same
    /// as an explicit [`TransportError::ResourceExhausted`].
    #[must_use]
    pub fn is_fatal_to_process(&self) -> bool {
        match self {
            Self::ResourceExhausted(_) | Self::Delivery(DeliveryError::ResourceExhausted(_)) => {
                true
            }
            Self::Io(e) => e.kind() == io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_normal_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<mqtt5_protocol::MqttError> for TransportError {
    fn from(err: mqtt5_protocol::MqttError) -> Self {
        use mqtt5_protocol::MqttError;
        match err {
            MqttError::PacketTooLarge { size, max } => Self::FrameTooLarge { size, max },
            MqttError::ProtocolError(msg) => Self::ProtocolViolation(msg),
            MqttError::ClientClosed | MqttError::ConnectionClosedByPeer => Self::ConnectionClosed,
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// Failure reported by a business collaborator for a decoded payload or a
/// session lifecycle notification.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("rejected by downstream: {0}")]
    Rejected(String),

    #[error("downstream unavailable: {0}")]
    Unavailable(String),

    #[error("downstream out of resources: {0}")]
    ResourceExhausted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("session registry is shut down")]
    Closed,

    #[error("session {0} is already registered")]
    Duplicate(String),

    #[error("session directory rejected the session: {0}")]
    Rejected(String),
}

/// Failure to push a command to a device through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("device {0} has no live session")]
    NotConnected(String),

    #[error("connection of device {0} is closed")]
    ConnectionClosed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_resource_exhaustion_is_fatal() {
        assert!(TransportError::ResourceExhausted("heap".into()).is_fatal_to_process());
        assert!(
            TransportError::Io(io::Error::new(io::ErrorKind::OutOfMemory, "alloc"))
                .is_fatal_to_process()
        );
        assert!(
            TransportError::Delivery(DeliveryError::ResourceExhausted("queue".into()))
                .is_fatal_to_process()
        );

        assert!(!TransportError::Malformed("bad".into()).is_fatal_to_process());
        assert!(!TransportError::ProtocolViolation("topic".into()).is_fatal_to_process());
        assert!(
            !TransportError::Delivery(DeliveryError::Rejected("nope".into()))
                .is_fatal_to_process()
        );
        assert!(!TransportError::AuthRejected(ConnectReturnCode::NotAuthorized)
            .is_fatal_to_process());
    }

    #[test]
    fn test_normal_disconnect_classification() {
        assert!(TransportError::ConnectionClosed.is_normal_disconnect());
        assert!(
            TransportError::Io(io::Error::from(io::ErrorKind::ConnectionReset))
                .is_normal_disconnect()
        );
        assert!(!TransportError::Malformed("x".into()).is_normal_disconnect());
    }

    #[test]
    fn test_codec_errors_map_to_taxonomy() {
        let err: TransportError =
            mqtt5_protocol::MqttError::MalformedPacket("short".to_string()).into();
        assert!(matches!(err, TransportError::Malformed(_)));

        let err: TransportError =
            mqtt5_protocol::MqttError::ProtocolError("flags".to_string()).into();
        assert!(matches!(err, TransportError::ProtocolViolation(_)));
    }
}
