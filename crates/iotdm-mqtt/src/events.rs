//! Boundary to the business layer.
//!
//! The transport engine reports session lifecycle changes, decoded uplink
//! payloads and command acknowledgements through [`DeviceEventHandler`].
//! Every method has a default so integrations implement only what they
//! consume.

use crate::error::DeliveryError;
use crate::session::{DataFormat, SessionId};
use crate::topics::UplinkKind;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of a session that completed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub device_id: Arc<str>,
    pub product_id: Arc<str>,
    pub data_format: DataFormat,
    pub tenant_id: Option<Arc<str>>,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub session_id: SessionId,
    pub product_id: Arc<str>,
    pub device_id: Arc<str>,
    pub peer_host: String,
    /// `true` when the device sent DISCONNECT, `false` for transport loss,
    /// protocol violations and server-side closes.
    pub clean: bool,
}

/// Connection log record written after a CONNECTED session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLogEvent {
    pub session_id: SessionId,
    pub device_id: Arc<str>,
    pub peer_host: String,
}

/// Decoded device-to-platform message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkMessage {
    pub session_id: SessionId,
    pub device_id: Arc<str>,
    pub product_id: Arc<str>,
    pub kind: UplinkKind,
    pub data_format: DataFormat,
    /// Text produced by the session's payload policy; `None` for kinds that
    /// carry no payload.
    pub payload: Option<String>,
}

pub type DeliveryResult = Result<(), DeliveryError>;

pub trait DeviceEventHandler: Send + Sync {
    /// Announces an authenticated session to the session directory. An error
    /// aborts the session after its CONNACK was already sent.
    fn on_connect_success<'a>(
        &'a self,
        _info: &'a SessionInfo,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    fn on_disconnect<'a>(
        &'a self,
        _event: DisconnectEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    fn on_activity<'a>(
        &'a self,
        _session_id: SessionId,
        _device_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    fn on_session_closed<'a>(
        &'a self,
        _event: SessionLogEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    /// Hands a decoded uplink message to the business layer. `Ok` triggers
    /// the PUBACK, an error closes the connection.
    fn deliver<'a>(
        &'a self,
        _message: UplinkMessage,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }

    /// Device acknowledged a server-to-device command.
    fn on_command_ack<'a>(
        &'a self,
        _session_id: SessionId,
        _device_id: &'a str,
        _packet_id: u16,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Accepts everything and logs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

impl DeviceEventHandler for LoggingEventHandler {
    fn on_connect_success<'a>(
        &'a self,
        info: &'a SessionInfo,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async move {
            info!(
                session_id = %info.session_id,
                device_id = %info.device_id,
                product_id = %info.product_id,
                peer = %info.peer,
                "Device online"
            );
            Ok(())
        })
    }

    fn on_disconnect<'a>(
        &'a self,
        event: DisconnectEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!(
                session_id = %event.session_id,
                device_id = %event.device_id,
                peer_host = %event.peer_host,
                clean = event.clean,
                "Device offline"
            );
        })
    }

    fn on_activity<'a>(
        &'a self,
        session_id: SessionId,
        device_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            debug!(session_id = %session_id, device_id, "Device activity");
        })
    }

    fn deliver<'a>(
        &'a self,
        message: UplinkMessage,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async move {
            info!(
                session_id = %message.session_id,
                device_id = %message.device_id,
                kind = %message.kind,
                payload = message.payload.as_deref().unwrap_or(""),
                "Uplink message"
            );
            Ok(())
        })
    }

    fn on_command_ack<'a>(
        &'a self,
        session_id: SessionId,
        device_id: &'a str,
        packet_id: u16,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            debug!(session_id = %session_id, device_id, packet_id, "Command acknowledged");
        })
    }
}
