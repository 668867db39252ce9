//! Connection handle shared between the protocol handler, auth continuations
//! and the session registry.
//!
//! Outbound frames go through a bounded flume queue drained by a dedicated
//! writer task. Closing is idempotent: frames already queued are flushed,
//! later writes are dropped.

use crate::codec::{encode_frame, OutboundFrame};
use crate::error::Result;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

pub(crate) enum Outbound {
    Frame(OutboundFrame),
    Close,
}

struct Inner {
    peer: SocketAddr,
    tx: flume::Sender<Outbound>,
    closed: AtomicBool,
    close_notify: Notify,
    protocol_version: AtomicU8,
}

/// Cloneable write side of one device connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Creates a handle and the receiving end drained by the writer task.
    #[must_use]
    pub fn channel(peer: SocketAddr, capacity: usize) -> (Self, OutboundReceiver) {
        let (tx, rx) = flume::bounded(capacity);
        let handle = Self {
            inner: Arc::new(Inner {
                peer,
                tx,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                protocol_version: AtomicU8::new(5),
            }),
        };
        (handle, OutboundReceiver { rx })
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    #[must_use]
    pub fn protocol_version(&self) -> u8 {
        self.inner.protocol_version.load(Ordering::Acquire)
    }

    pub fn set_protocol_version(&self, version: u8) {
        self.inner.protocol_version.store(version, Ordering::Release);
    }

    /// Queues a frame for the writer task.
    ///
    /// Returns `false` if the connection is closed. A full queue means the
    /// peer stopped reading; the connection is closed in that case.
    pub fn send(&self, frame: OutboundFrame) -> bool {
        if self.is_closed() {
            trace!(peer = %self.inner.peer, ?frame, "Dropping frame for closed connection");
            return false;
        }

        match self.inner.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                warn!(peer = %self.inner.peer, "Outbound queue full, closing connection");
                self.close();
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                self.close();
                false
            }
        }
    }

    /// Requests the connection to close after already queued frames are
    /// flushed. Returns `true` only for the call that performed the close.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(peer = %self.inner.peer, "Closing connection");
        let _ = self.inner.tx.try_send(Outbound::Close);
        self.inner.close_notify.notify_waiters();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let notified = self.inner.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Receiving end of a [`ConnectionHandle`].
pub struct OutboundReceiver {
    rx: flume::Receiver<Outbound>,
}

impl OutboundReceiver {
    /// Next queued frame, or `None` once the connection was closed and the
    /// queue is drained up to the close marker.
    pub async fn recv(&self) -> Option<OutboundFrame> {
        match self.rx.recv_async().await {
            Ok(Outbound::Frame(frame)) => Some(frame),
            Ok(Outbound::Close) | Err(_) => None,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<OutboundFrame> {
        match self.rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame),
            Ok(Outbound::Close) | Err(_) => None,
        }
    }

    /// Collects every frame queued so far.
    pub fn drain(&self) -> Vec<OutboundFrame> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Writer task: encodes queued frames in the negotiated protocol version and
/// writes them to the socket until the connection closes.
///
/// Once the handle is closed, frames still queued are flushed and the task
/// exits even if the close marker never made it into a full queue. Each
/// socket write is bounded by `write_timeout`.
///
/// # Errors
///
/// Returns an error if encoding fails, the socket write fails or the write
/// timeout expires
pub async fn run_writer<W>(
    mut writer: W,
    outbound: OutboundReceiver,
    handle: ConnectionHandle,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    let result: Result<()> = async {
        loop {
            let first = tokio::select! {
                biased;
                item = outbound.rx.recv_async() => item.ok(),
                () = handle.closed() => None,
            };

            buf.clear();
            let mut closing = first.is_none();
            let version = handle.protocol_version();
            let mut next = first.or_else(|| outbound.rx.try_recv().ok());
            while let Some(item) = next.take() {
                match item {
                    Outbound::Frame(frame) => encode_frame(&frame, version, &mut buf)?,
                    Outbound::Close => {
                        closing = true;
                        break;
                    }
                }
                next = outbound.rx.try_recv().ok();
            }

            if !buf.is_empty() {
                write_batch(&mut writer, &buf, write_timeout).await?;
            }
            if closing {
                break;
            }
        }
        Ok(())
    }
    .await;

    handle.close();
    let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
    result
}

async fn write_batch<W>(writer: &mut W, buf: &[u8], write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(buf).await?;
        writer.flush().await
    };
    match tokio::time::timeout(write_timeout, write).await {
        Ok(written) => Ok(written?),
        Err(_) => {
            warn!(
                bytes = buf.len(),
                timeout = ?write_timeout,
                "Socket write timed out, peer is not reading"
            );
            Err(io::Error::new(io::ErrorKind::TimedOut, "socket write timed out").into())
        }
    }
}
