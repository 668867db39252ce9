use super::{TransportContext, TransportHandler};
use crate::auth::{AuthError, AuthResult, ConnectReturnCode, ProtocolType, SecretCredentials};
use crate::codec::{ConnectFrame, OutboundFrame, MQTT_V311, MQTT_V5};
use crate::error::{Result, TransportError};
use crate::events::{DisconnectEvent, SessionInfo};
use crate::session::{ConnectionState, DeviceIdentity, Session};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

impl TransportHandler {
    /// Starts authentication for a CONNECT frame. The round trip runs as a
    /// separate task; the read loop keeps going and drops data frames until
    /// the session becomes CONNECTED.
    pub(super) fn handle_connect(&mut self, connect: ConnectFrame) -> Result<()> {
        if !self.session.begin_auth() {
            return Err(TransportError::ProtocolViolation(format!(
                "CONNECT received in state {:?}",
                self.session.state()
            )));
        }

        let connection = self.session.connection();
        let version = connect.protocol_version;
        if version != MQTT_V311 && version != MQTT_V5 {
            connection.set_protocol_version(MQTT_V311);
            connection.send(OutboundFrame::ConnAck {
                return_code: ConnectReturnCode::UnacceptableProtocolVersion,
            });
            return Err(TransportError::ProtocolViolation(format!(
                "unsupported protocol version {version}"
            )));
        }
        connection.set_protocol_version(version);
        self.decoder.set_protocol_version(version);

        info!(
            session_id = %self.session.id(),
            peer = %self.session.peer(),
            client_id = %connect.client_id,
            protocol_version = version,
            keep_alive = connect.keep_alive,
            "Device connecting"
        );

        let credentials = SecretCredentials::new(
            connect.client_id,
            connect.username,
            connect.password.as_deref(),
        );
        let ctx = self.ctx.clone();
        let session = Arc::clone(&self.session);
        tokio::spawn(complete_auth(ctx, session, credentials).in_current_span());
        Ok(())
    }
}

async fn complete_auth(ctx: TransportContext, session: Arc<Session>, credentials: SecretCredentials) {
    let request = ctx.auth.authenticate_by_secret(ProtocolType::Mqtt, &credentials);
    let outcome = match ctx.config.auth_timeout {
        Some(limit) => tokio::time::timeout(limit, request)
            .await
            .unwrap_or(Err(AuthError::Timeout)),
        None => request.await,
    };

    match outcome {
        Ok(AuthResult::Authenticated(identity)) => accept(&ctx, &session, identity).await,
        Ok(AuthResult::Rejected(code)) => {
            let code = if code == ConnectReturnCode::Accepted {
                ConnectReturnCode::NotAuthorized
            } else {
                code
            };
            info!(session_id = %session.id(), client_id = %credentials.client_id, ?code, "Device rejected");
            reject(&session, code);
        }
        Err(e) => {
            warn!(session_id = %session.id(), client_id = %credentials.client_id, error = %e, "Auth round trip failed");
            reject(&session, e.return_code());
        }
    }
}

fn reject(session: &Session, code: ConnectReturnCode) {
    session.end_auth();
    let connection = session.connection();
    connection.send(OutboundFrame::ConnAck { return_code: code });
    connection.close();
}

async fn accept(ctx: &TransportContext, session: &Arc<Session>, identity: DeviceIdentity) {
    if session.state() != ConnectionState::Unauthenticated {
        debug!(session_id = %session.id(), "Connection closed during authentication");
        return;
    }

    let connection = session.connection();
    connection.send(OutboundFrame::ConnAck {
        return_code: ConnectReturnCode::Accepted,
    });

    let info = SessionInfo {
        session_id: session.id(),
        device_id: identity.device_id.as_str().into(),
        product_id: identity.product_id.as_str().into(),
        data_format: identity.data_format,
        tenant_id: identity.tenant_id.as_deref().map(Into::into),
        peer: session.peer(),
    };

    match register_session(ctx, session, &info, identity).await {
        Ok(()) => {
            info!(
                session_id = %info.session_id,
                device_id = %info.device_id,
                product_id = %info.product_id,
                peer = %info.peer,
                "Device connected"
            );
        }
        Err(TransportError::ConnectionClosed) => {
            debug!(session_id = %info.session_id, "Connection closed while registering session");
            connection.close();
        }
        Err(e) => {
            error!(session_id = %info.session_id, device_id = %info.device_id, error = %e, "Session registration failed");
            connection.close();
            if e.is_fatal_to_process() {
                ctx.fatal.on_fatal(&e);
            }
        }
    }
}

/// Announces the session, registers it and only then makes it CONNECTED.
/// Every failure after the announcement is followed by a disconnect event so
/// the session directory never keeps a session the engine dropped.
async fn register_session(
    ctx: &TransportContext,
    session: &Arc<Session>,
    info: &SessionInfo,
    identity: DeviceIdentity,
) -> Result<()> {
    ctx.events.on_connect_success(info).await?;

    if let Err(e) = ctx.registry.register(info.clone(), Arc::clone(session)).await {
        ctx.events.on_disconnect(disconnect_event(info)).await;
        return Err(e.into());
    }

    if !session.mark_connected(identity) {
        ctx.registry.deregister(info.session_id, &info.device_id).await;
        ctx.events.on_disconnect(disconnect_event(info)).await;
        return Err(TransportError::ConnectionClosed);
    }
    Ok(())
}

fn disconnect_event(info: &SessionInfo) -> DisconnectEvent {
    DisconnectEvent {
        session_id: info.session_id,
        product_id: Arc::clone(&info.product_id),
        device_id: Arc::clone(&info.device_id),
        peer_host: info.peer.ip().to_string(),
        clean: false,
    }
}
