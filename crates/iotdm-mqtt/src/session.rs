//! Per-connection session state.
//!
//! A [`Session`] is shared between the connection's protocol task, the auth
//! continuation and the session registry. Lifecycle fields live behind one
//! lock so that the UNAUTHENTICATED -> CONNECTED -> DISCONNECTED transitions
//! are atomic with respect to frame processing; the message id counter is a
//! separate atomic so the command push path never contends with it.

use crate::connection::ConnectionHandle;
use crate::topics::Capability;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use ulid::Ulid;

/// Process-unique session identifier, fixed at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Ulid);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unauthenticated,
    Connected,
    Disconnected,
}

/// Payload encoding a product declares for its devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataFormat {
    Json,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Direct,
    Gateway,
    SubDevice,
}

/// Identity the auth service attaches to an authenticated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub product_id: String,
    pub data_format: DataFormat,
    #[serde(default)]
    pub device_code: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<NodeType>,
}

impl DeviceIdentity {
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        product_id: impl Into<String>,
        data_format: DataFormat,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            product_id: product_id.into(),
            data_format,
            device_code: None,
            tenant_id: None,
            node_type: None,
        }
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    #[must_use]
    pub fn with_device_code(mut self, device_code: impl Into<String>) -> Self {
        self.device_code = Some(device_code.into());
        self
    }
}

/// Capability topics the device is currently subscribed to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CapabilityFlags {
    pub config_pull: bool,
    pub ota: bool,
    pub control: bool,
}

impl CapabilityFlags {
    #[must_use]
    pub fn get(&self, capability: Capability) -> bool {
        match capability {
            Capability::ConfigPull => self.config_pull,
            Capability::Ota => self.ota,
            Capability::Control => self.control,
        }
    }

    pub fn set(&mut self, capability: Capability, enabled: bool) {
        match capability {
            Capability::ConfigPull => self.config_pull = enabled,
            Capability::Ota => self.ota = enabled,
            Capability::Control => self.control = enabled,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    connection: ConnectionState,
    auth_pending: bool,
    identity: Option<DeviceIdentity>,
    capabilities: CapabilityFlags,
}

/// State of one device connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: RwLock<SessionState>,
    message_ids: AtomicU32,
    connection: RwLock<ConnectionHandle>,
}

impl Session {
    #[must_use]
    pub fn new(peer: SocketAddr, connection: ConnectionHandle) -> Self {
        Self {
            id: SessionId::generate(),
            peer,
            state: RwLock::new(SessionState {
                connection: ConnectionState::Unauthenticated,
                auth_pending: false,
                identity: None,
                capabilities: CapabilityFlags::default(),
            }),
            message_ids: AtomicU32::new(0),
            connection: RwLock::new(connection),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.read().connection
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Set together with the transition to CONNECTED; `None` before.
    #[must_use]
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.state.read().identity.clone()
    }

    /// Marks an auth round trip as started. Fails if the session is not
    /// UNAUTHENTICATED or a round trip is already in flight.
    pub fn begin_auth(&self) -> bool {
        let mut state = self.state.write();
        if state.connection != ConnectionState::Unauthenticated || state.auth_pending {
            return false;
        }
        state.auth_pending = true;
        true
    }

    #[must_use]
    pub fn is_auth_pending(&self) -> bool {
        self.state.read().auth_pending
    }

    /// Clears the in-flight marker after a rejected or failed round trip.
    pub fn end_auth(&self) {
        self.state.write().auth_pending = false;
    }

    /// UNAUTHENTICATED -> CONNECTED, storing the device identity in the same
    /// step. Returns `false` and changes nothing from any other state.
    pub fn mark_connected(&self, identity: DeviceIdentity) -> bool {
        let mut state = self.state.write();
        if state.connection != ConnectionState::Unauthenticated {
            return false;
        }
        state.connection = ConnectionState::Connected;
        state.auth_pending = false;
        state.identity = Some(identity);
        true
    }

    /// Moves to the terminal DISCONNECTED state and returns the state it
    /// left. A second call returns `Disconnected` and changes nothing.
    pub fn mark_disconnected(&self) -> ConnectionState {
        let mut state = self.state.write();
        let previous = state.connection;
        state.connection = ConnectionState::Disconnected;
        state.auth_pending = false;
        previous
    }

    #[must_use]
    pub fn capabilities(&self) -> CapabilityFlags {
        self.state.read().capabilities
    }

    pub fn set_capability(&self, capability: Capability, enabled: bool) {
        self.state.write().capabilities.set(capability, enabled);
    }

    /// Allocates the next outbound message id.
    ///
    /// Ids start at 1 and strictly increase; 0 is reserved for "no ack
    /// requested" and is skipped when the counter wraps.
    pub fn next_message_id(&self) -> u32 {
        loop {
            let id = self.message_ids.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Last id handed out, 0 if none yet.
    #[must_use]
    pub fn last_message_id(&self) -> u32 {
        self.message_ids.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionHandle {
        self.connection.read().clone()
    }

    /// Points the session at a new transport channel. Has no effect once the
    /// session is DISCONNECTED.
    pub fn replace_connection(&self, handle: ConnectionHandle) -> bool {
        let state = self.state.read();
        if state.connection == ConnectionState::Disconnected {
            return false;
        }
        *self.connection.write() = handle;
        true
    }
}

/// Folds a 32-bit message id into the non-zero 16-bit packet identifier space.
#[must_use]
pub fn wire_packet_id(message_id: u32) -> u16 {
    let folded = (message_id.max(1) - 1) % u32::from(u16::MAX) + 1;
    u16::try_from(folded).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn session() -> Session {
        let peer: SocketAddr = "10.0.0.7:41000".parse().unwrap();
        let (handle, _rx) = ConnectionHandle::channel(peer, 8);
        Session::new(peer, handle)
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("device-1", "product-1", DataFormat::Json)
    }

    #[test]
    fn test_new_session_is_unauthenticated_without_identity() {
        let session = session();
        assert_eq!(session.state(), ConnectionState::Unauthenticated);
        assert!(session.identity().is_none());
        assert_eq!(session.capabilities(), CapabilityFlags::default());
        assert_eq!(session.last_message_id(), 0);
    }

    #[test]
    fn test_state_transitions_are_monotonic() {
        let session = session();
        assert!(session.mark_connected(identity()));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.identity().unwrap().device_id, "device-1");

        assert!(!session.mark_connected(DeviceIdentity::new("other", "p", DataFormat::Binary)));
        assert_eq!(session.identity().unwrap().device_id, "device-1");

        assert_eq!(session.mark_disconnected(), ConnectionState::Connected);
        assert_eq!(session.mark_disconnected(), ConnectionState::Disconnected);
        assert!(!session.mark_connected(identity()));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_before_auth_is_terminal() {
        let session = session();
        assert!(session.begin_auth());
        assert_eq!(session.mark_disconnected(), ConnectionState::Unauthenticated);
        assert!(!session.mark_connected(identity()));
        assert!(session.identity().is_none());
    }

    #[test]
    fn test_begin_auth_only_once() {
        let session = session();
        assert!(session.begin_auth());
        assert!(!session.begin_auth());
        session.end_auth();
        assert!(session.begin_auth());
        assert!(session.mark_connected(identity()));
        assert!(!session.is_auth_pending());
        assert!(!session.begin_auth());
    }

    #[test]
    fn test_capability_flags_toggle_independently() {
        let session = session();
        session.set_capability(Capability::Ota, true);
        session.set_capability(Capability::Control, true);
        session.set_capability(Capability::Control, false);

        let flags = session.capabilities();
        assert!(flags.ota);
        assert!(!flags.control);
        assert!(!flags.config_pull);
        assert!(flags.get(Capability::Ota));
    }

    #[test]
    fn test_message_ids_strictly_increase() {
        let session = session();
        let ids: Vec<u32> = (0..100).map(|_| session.next_message_id()).collect();
        assert_eq!(ids[0], 1);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_message_id_skips_zero_on_wrap() {
        let session = session();
        session.message_ids.store(u32::MAX - 1, Ordering::Release);
        assert_eq!(session.next_message_id(), u32::MAX);
        assert_eq!(session.next_message_id(), 1);
    }

    #[test]
    fn test_message_ids_unique_under_concurrency() {
        let session = Arc::new(session());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    (0..1000).map(|_| session.next_message_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for id in thread.join().unwrap() {
                assert!(seen.insert(id), "duplicate message id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
        assert_eq!(session.last_message_id(), 8000);
    }

    #[test]
    fn test_replace_connection_rejected_after_disconnect() {
        let session = session();
        let peer = session.peer();
        let (replacement, _rx) = ConnectionHandle::channel(peer, 8);
        assert!(session.replace_connection(replacement.clone()));
        assert!(session.connection().same_connection(&replacement));

        session.mark_disconnected();
        let (late, _rx) = ConnectionHandle::channel(peer, 8);
        assert!(!session.replace_connection(late.clone()));
        assert!(!session.connection().same_connection(&late));
    }

    #[test]
    fn test_wire_packet_id_folding() {
        assert_eq!(wire_packet_id(1), 1);
        assert_eq!(wire_packet_id(65_535), 65_535);
        assert_eq!(wire_packet_id(65_536), 1);
        assert_eq!(wire_packet_id(0), 1);
        assert_eq!(wire_packet_id(u32::MAX), 65_535);
    }
}
