//! Session registry
//!
//! Process-wide table of live, authenticated sessions. The transport engine
//! registers a session after its CONNACK was sent and deregisters it on every
//! terminal path; the rest of the platform uses the registry to reach a
//! device's connection.

use crate::codec::OutboundFrame;
use crate::error::{PushError, RegistrationError};
use crate::events::SessionInfo;
use crate::session::{wire_packet_id, Session, SessionId};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct RegisteredSession {
    info: SessionInfo,
    session: Arc<Session>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, RegisteredSession>,
    devices: HashMap<Arc<str>, SessionId>,
    closed: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    tables: RwLock<Tables>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live session under its device id.
    ///
    /// A device that already has a live session is taken over: the older
    /// session's entry is dropped and its connection closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is shut down or the session id is
    /// already registered
    pub async fn register(
        &self,
        info: SessionInfo,
        session: Arc<Session>,
    ) -> Result<(), RegistrationError> {
        let mut tables = self.tables.write().await;
        if tables.closed {
            return Err(RegistrationError::Closed);
        }
        if tables.sessions.contains_key(&info.session_id) {
            return Err(RegistrationError::Duplicate(info.session_id.to_string()));
        }

        if let Some(old_id) = tables
            .devices
            .insert(Arc::clone(&info.device_id), info.session_id)
        {
            if let Some(old) = tables.sessions.remove(&old_id) {
                info!(
                    device_id = %info.device_id,
                    old_session = %old_id,
                    new_session = %info.session_id,
                    "Device session takeover"
                );
                old.session.connection().close();
            }
        }

        debug!(session_id = %info.session_id, device_id = %info.device_id, "Registered session");
        tables
            .sessions
            .insert(info.session_id, RegisteredSession { info, session });
        Ok(())
    }

    /// Removes a session. The device index entry is only dropped while it
    /// still points at this session, so deregistering a taken-over session
    /// leaves its successor reachable.
    ///
    /// Returns `false` for a session the registry does not hold.
    pub async fn deregister(&self, session_id: SessionId, device_id: &str) -> bool {
        let mut tables = self.tables.write().await;
        if tables.sessions.remove(&session_id).is_none() {
            debug!(session_id = %session_id, device_id, "Deregister of unknown session ignored");
            return false;
        }
        if tables.devices.get(device_id) == Some(&session_id) {
            tables.devices.remove(device_id);
        }
        debug!(session_id = %session_id, device_id, "Deregistered session");
        true
    }

    pub async fn lookup_device(&self, device_id: &str) -> Option<Arc<Session>> {
        let tables = self.tables.read().await;
        let session_id = tables.devices.get(device_id)?;
        tables
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    pub async fn session_info(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.tables
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|entry| entry.info.clone())
    }

    pub async fn contains(&self, session_id: SessionId) -> bool {
        self.tables.read().await.sessions.contains_key(&session_id)
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.sessions.is_empty()
    }

    /// Sends a QoS 1 command to a device and returns the message id it was
    /// tagged with. The device's PUBACK is reported through
    /// [`DeviceEventHandler::on_command_ack`](crate::events::DeviceEventHandler::on_command_ack)
    /// with the matching wire packet id.
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no live session or its connection
    /// is closed
    pub async fn push_command(
        &self,
        device_id: &str,
        topic: impl Into<String>,
        payload: Bytes,
    ) -> Result<u32, PushError> {
        let Some(session) = self.lookup_device(device_id).await else {
            return Err(PushError::NotConnected(device_id.to_string()));
        };

        let message_id = session.next_message_id();
        let frame = OutboundFrame::Publish {
            packet_id: wire_packet_id(message_id),
            topic: topic.into(),
            payload,
        };
        if session.connection().send(frame) {
            debug!(session_id = %session.id(), device_id, message_id, "Command queued");
            Ok(message_id)
        } else {
            Err(PushError::ConnectionClosed(device_id.to_string()))
        }
    }

    /// Rejects further registrations and closes every registered connection.
    /// Returns how many sessions were closed.
    pub async fn shutdown(&self) -> usize {
        let mut tables = self.tables.write().await;
        tables.closed = true;
        for entry in tables.sessions.values() {
            entry.session.connection().close();
        }
        tables.sessions.len()
    }
}
