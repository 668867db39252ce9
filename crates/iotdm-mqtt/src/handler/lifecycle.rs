use super::TransportHandler;
use crate::codec::OutboundFrame;
use crate::events::{DisconnectEvent, SessionLogEvent};
use crate::session::ConnectionState;
use std::sync::Arc;
use tracing::{debug, info};

impl TransportHandler {
    pub(super) async fn handle_pingreq(&mut self) {
        let Some(identity) = self.connected_identity("PINGREQ") else {
            return;
        };
        self.session.connection().send(OutboundFrame::PingResp);
        self.ctx
            .events
            .on_activity(self.session.id(), &identity.device_id)
            .await;
    }

    /// Orderly DISCONNECT: the session is torn down here so the business
    /// layer sees a clean disconnect before the transport goes away.
    pub(super) async fn handle_disconnect(&mut self) {
        debug!(session_id = %self.session.id(), "DISCONNECT received");
        self.clean_disconnect = true;
        self.session.connection().close();
        self.teardown().await;
    }

    /// Device acknowledged a command pushed through the registry.
    pub(super) async fn handle_puback(&mut self, packet_id: u16) {
        let Some(identity) = self.connected_identity("PUBACK") else {
            return;
        };
        self.ctx
            .events
            .on_command_ack(self.session.id(), &identity.device_id, packet_id)
            .await;
    }

    /// Moves the session to DISCONNECTED. Only the first call has any effect,
    /// and only a session that reached CONNECTED is reported and
    /// deregistered.
    pub async fn teardown(&mut self) {
        let previous = self.session.mark_disconnected();
        if previous != ConnectionState::Connected {
            if previous == ConnectionState::Unauthenticated {
                debug!(session_id = %self.session.id(), "Unauthenticated session closed");
            }
            return;
        }
        let Some(identity) = self.session.identity() else {
            return;
        };

        let session_id = self.session.id();
        let device_id: Arc<str> = identity.device_id.as_str().into();
        let peer_host = self.session.peer().ip().to_string();

        self.ctx.registry.deregister(session_id, &device_id).await;
        self.ctx
            .events
            .on_disconnect(DisconnectEvent {
                session_id,
                product_id: identity.product_id.as_str().into(),
                device_id: Arc::clone(&device_id),
                peer_host: peer_host.clone(),
                clean: self.clean_disconnect,
            })
            .await;
        self.ctx
            .events
            .on_session_closed(SessionLogEvent {
                session_id,
                device_id: Arc::clone(&device_id),
                peer_host,
            })
            .await;

        info!(
            session_id = %session_id,
            device_id = %device_id,
            clean = self.clean_disconnect,
            "Device disconnected"
        );
    }
}
