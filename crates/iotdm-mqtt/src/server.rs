//! TCP listener and per-connection task wiring.

use crate::connection::{run_writer, ConnectionHandle};
use crate::error::Result;
use crate::handler::{TransportContext, TransportHandler};
use crate::registry::SessionRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Instrument};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stops a running [`TransportServer`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

pub struct TransportServer {
    ctx: TransportContext,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl TransportServer {
    /// Validates the configuration and binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound
    pub async fn bind(ctx: TransportContext) -> Result<Self> {
        ctx.config.validate()?;
        let listener = TcpListener::bind(ctx.config.bind_address).await?;
        info!(
            addr = %listener.local_addr()?,
            max_connections = ctx.config.max_connections,
            "Device transport listening"
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            ctx,
            listener,
            shutdown_tx,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Accepts connections until a shutdown is requested, then closes every
    /// live session and waits briefly for connection tasks to finish.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept errors are logged and retried
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let active = self.active.load(Ordering::Acquire);
                            if active >= self.ctx.config.max_connections {
                                warn!(peer = %peer, active, "Connection limit reached, rejecting");
                                drop(stream);
                                continue;
                            }
                            self.spawn_connection(stream, peer);
                        }
                        Err(e) => {
                            error!("Accept error: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    debug!("Accept loop shutting down");
                    break;
                }
            }
        }

        let closed = self.ctx.registry.shutdown().await;
        info!(sessions = closed, "Closed live sessions");

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.active.load(Ordering::Acquire);
        if remaining > 0 {
            warn!(remaining, "Connections still open after drain timeout");
        }
        info!("Device transport stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, "Failed to set TCP_NODELAY: {e}");
        }
        let (reader, writer) = stream.into_split();
        let (handle, outbound) =
            ConnectionHandle::channel(peer, self.ctx.config.outbound_queue_capacity);
        let handler = TransportHandler::new(self.ctx.clone(), peer, handle.clone())
            .with_shutdown(self.shutdown_tx.subscribe());
        let span = info_span!("connection", session_id = %handler.session().id(), peer = %peer);
        let fatal = Arc::clone(&self.ctx.fatal);
        let guard = ActiveGuard::new(Arc::clone(&self.active));
        let write_timeout = self.ctx.config.write_timeout;

        debug!(peer = %peer, "Connection accepted");
        tokio::spawn(
            async move {
                let _guard = guard;
                let writer_task = tokio::spawn(
                    run_writer(writer, outbound, handle.clone(), write_timeout).in_current_span(),
                );

                if let Err(e) = handler.run(reader).await {
                    debug!(error = %e, "Connection handler finished with error");
                }
                handle.close();

                match writer_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_fatal_to_process() => fatal.on_fatal(&e),
                    Ok(Err(e)) => debug!(error = %e, "Writer finished with error"),
                    Err(e) => error!("Writer task panicked: {e}"),
                }
            }
            .instrument(span),
        );
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
