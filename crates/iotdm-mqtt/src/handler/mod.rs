//! Device connection handler
//!
//! One [`TransportHandler`] runs per accepted connection. It owns the
//! connection's [`Session`], decodes frames, and routes them to the
//! sub-handlers below. Only CONNECT, PINGREQ and DISCONNECT are looked at
//! before the session is CONNECTED; every other frame is dropped until then.

mod connect;
mod lifecycle;
mod publish;
mod subscribe;

use crate::auth::DeviceAuthService;
use crate::codec::{Frame, FrameDecoder};
use crate::config::TransportConfig;
use crate::connection::ConnectionHandle;
use crate::error::{Result, TransportError};
use crate::events::DeviceEventHandler;
use crate::fatal::{FatalErrorPolicy, ProcessExitPolicy};
use crate::registry::SessionRegistry;
use crate::session::{DeviceIdentity, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Collaborators shared by every connection of a server.
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<TransportConfig>,
    pub auth: Arc<dyn DeviceAuthService>,
    pub registry: Arc<SessionRegistry>,
    pub events: Arc<dyn DeviceEventHandler>,
    pub fatal: Arc<dyn FatalErrorPolicy>,
}

impl TransportContext {
    /// Builds a context that exits the process on resource exhaustion.
    #[must_use]
    pub fn new(
        config: Arc<TransportConfig>,
        auth: Arc<dyn DeviceAuthService>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn DeviceEventHandler>,
    ) -> Self {
        Self {
            config,
            auth,
            registry,
            events,
            fatal: Arc::new(ProcessExitPolicy),
        }
    }

    #[must_use]
    pub fn with_fatal_policy(mut self, policy: Arc<dyn FatalErrorPolicy>) -> Self {
        self.fatal = policy;
        self
    }
}

pub struct TransportHandler {
    pub(super) ctx: TransportContext,
    pub(super) session: Arc<Session>,
    pub(super) decoder: FrameDecoder,
    pub(super) shutdown_rx: Option<broadcast::Receiver<()>>,
    pub(super) clean_disconnect: bool,
}

impl TransportHandler {
    #[must_use]
    pub fn new(ctx: TransportContext, peer: SocketAddr, connection: ConnectionHandle) -> Self {
        let decoder = FrameDecoder::new(ctx.config.max_packet_size);
        Self {
            session: Arc::new(Session::new(peer, connection)),
            ctx,
            decoder,
            shutdown_rx: None,
            clean_disconnect: false,
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown_rx: broadcast::Receiver<()>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Reads and dispatches frames until the connection closes, then tears
    /// the session down.
    ///
    /// # Errors
    ///
    /// Returns the error that closed the connection; a peer hang-up, a
    /// DISCONNECT frame or a server-side close return `Ok`
    pub async fn run<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let connection = self.session.connection();
        debug!(session_id = %self.session.id(), peer = %self.session.peer(), "Connection handler started");

        let result = loop {
            tokio::select! {
                frame = self.decoder.read_frame(&mut reader) => {
                    match frame {
                        Ok(Some(frame)) => {
                            if let Err(e) = self.on_frame(frame).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => {
                            debug!(session_id = %self.session.id(), "Peer closed the connection");
                            break Ok(());
                        }
                        Err(e) if e.is_normal_disconnect() => {
                            debug!(session_id = %self.session.id(), error = %e, "Connection lost");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }

                () = connection.closed() => {
                    break Ok(());
                }

                () = shutdown_signal(&mut self.shutdown_rx) => {
                    debug!(session_id = %self.session.id(), "Shutdown signal received");
                    break Ok(());
                }
            }
        };

        if let Err(ref e) = result {
            self.log_close_reason(e);
            if e.is_fatal_to_process() {
                self.ctx.fatal.on_fatal(e);
            }
        }

        self.session.connection().close();
        self.teardown().await;
        result
    }

    /// Dispatches one decoded frame. An error means the connection must be
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns an error for protocol violations and failed payload delivery
    pub async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        trace!(session_id = %self.session.id(), kind = frame.kind(), "Frame received");

        match frame {
            Frame::Connect(connect) => self.handle_connect(connect),
            Frame::Publish(publish) => self.handle_publish(publish).await,
            Frame::Subscribe(subscribe) => {
                self.handle_subscribe(subscribe).await;
                Ok(())
            }
            Frame::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(unsubscribe).await;
                Ok(())
            }
            Frame::PingReq => {
                self.handle_pingreq().await;
                Ok(())
            }
            Frame::Disconnect => {
                self.handle_disconnect().await;
                Ok(())
            }
            Frame::PubAck { packet_id } => {
                self.handle_puback(packet_id).await;
                Ok(())
            }
            Frame::Unsupported(kind) => {
                debug!(session_id = %self.session.id(), kind, "Ignoring unsupported frame");
                Ok(())
            }
        }
    }

    /// Identity of a CONNECTED session; `None` (and a log record) otherwise.
    pub(super) fn connected_identity(&self, kind: &'static str) -> Option<DeviceIdentity> {
        if self.session.is_connected() {
            if let Some(identity) = self.session.identity() {
                return Some(identity);
            }
        }
        debug!(
            session_id = %self.session.id(),
            peer = %self.session.peer(),
            state = ?self.session.state(),
            kind,
            "Dropping frame for session that is not connected"
        );
        None
    }

    fn log_close_reason(&self, err: &TransportError) {
        let session_id = self.session.id();
        let peer = self.session.peer();
        match err {
            TransportError::Malformed(_)
            | TransportError::FrameTooLarge { .. }
            | TransportError::UnexpectedFrame(_)
            | TransportError::ProtocolViolation(_) => {
                warn!(session_id = %session_id, peer = %peer, error = %err, "Closing connection");
            }
            TransportError::AuthRejected(_) => {
                info!(session_id = %session_id, peer = %peer, error = %err, "Closing connection");
            }
            _ => {
                error!(session_id = %session_id, peer = %peer, error = %err, "Closing connection");
            }
        }
    }
}

async fn shutdown_signal(rx: &mut Option<broadcast::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
