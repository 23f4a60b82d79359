//! Logical streams
//!
//! A [`Stream`] is one ordered, reliable byte connection inside a
//! [`Session`]. It leaves the session's stream table through exactly one of
//! three teardown paths:
//!
//! - [`Stream::close`]: local close. Tells the peer with a closing frame and
//!   detaches from the table.
//! - passive close: the peer's closing frame was reached in sequence order.
//!   Detaches from the table without answering.
//! - [`Stream::close_detached`]: session teardown. The session already holds
//!   its table lock and removes the entry itself, so this path never calls
//!   back into the session.

mod sorter;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shroud_core::StreamError;
use shroud_protocol::{Frame, StreamId};

use crate::session::Session;
use sorter::FrameSorter;

/// Receiving side of a stream
struct Inbound {
    rx: mpsc::UnboundedReceiver<Bytes>,
    /// Unread remainder of the last chunk
    leftover: Bytes,
}

/// One logical connection within a session
pub struct Stream {
    id: StreamId,
    session: Weak<Session>,
    next_send_seq: AtomicU32,
    closed: AtomicBool,
    /// Cancelled once the stream is closed by any path; wakes readers
    die: CancellationToken,
    sorter: Mutex<FrameSorter>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound: tokio::sync::Mutex<Inbound>,
    /// Held for the duration of a write so close never interleaves with it
    pub(crate) writing: tokio::sync::Mutex<()>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, session: Weak<Session>) -> Arc<Self> {
        let (inbound_tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            session,
            next_send_seq: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            die: CancellationToken::new(),
            sorter: Mutex::new(FrameSorter::new()),
            inbound_tx,
            inbound: tokio::sync::Mutex::new(Inbound {
                rx,
                leftover: Bytes::new(),
            }),
            writing: tokio::sync::Mutex::new(()),
        })
    }

    /// Stream identifier, shared with the peer
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether any teardown path has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Local address of the session's most recent physical connection
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.upgrade().and_then(|s| s.addr())
    }

    /// Remote address of the session's most recent physical connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.upgrade().and_then(|s| s.peer_addr())
    }

    /// Read in-order bytes into `buf`
    ///
    /// Returns `Ok(0)` once the stream is closed and everything received
    /// before the close has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.inbound.lock().await;
        let inbound = &mut *guard;

        if inbound.leftover.is_empty() {
            // Buffered data wins over the close signal
            let next = tokio::select! {
                biased;
                data = inbound.rx.recv() => data,
                _ = self.die.cancelled() => None,
            };
            match next {
                Some(data) => inbound.leftover = data,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(inbound.leftover.len());
        buf[..n].copy_from_slice(&inbound.leftover[..n]);
        inbound.leftover.advance(n);
        Ok(n)
    }

    /// Send `data` to the peer, split into frames no larger than the
    /// session's frame payload limit
    pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let _writing = self.writing.lock().await;
        if self.is_closed() {
            return Err(StreamError::BrokenStream);
        }
        let session = self.session.upgrade().ok_or(StreamError::BrokenStream)?;

        for chunk in data.chunks(session.config().max_frame_payload) {
            let seq = self.next_send_seq.fetch_add(1, Ordering::SeqCst);
            let frame = Frame::data(self.id, seq, Bytes::copy_from_slice(chunk));
            session.send_frame(&frame).await?;
        }
        Ok(data.len())
    }

    /// Close the stream and tell the peer
    ///
    /// A second call returns [`StreamError::RepeatClose`].
    pub async fn close(&self) -> Result<(), StreamError> {
        let _writing = self.writing.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StreamError::RepeatClose);
        }
        self.die.cancel();

        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };

        let seq = self.next_send_seq.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = session.send_frame(&Frame::closing(self.id, seq)).await {
            tracing::debug!(stream = %self.id, error = %e, "closing frame not sent");
        }
        session.del_stream(self.id);

        tracing::debug!(stream = %self.id, "stream closed");
        Ok(())
    }

    /// Close without touching the session's stream table
    ///
    /// Used only by session teardown, which removes the table entry itself
    /// while holding the table lock. Completes once any in-flight write has
    /// finished.
    pub(crate) async fn close_detached(&self) {
        self.closed.store(true, Ordering::Release);
        self.die.cancel();
        let _writing = self.writing.lock().await;
        tracing::trace!(stream = %self.id, "stream torn down with session");
    }

    /// The peer closed the stream
    fn passive_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.die.cancel();
        if let Some(session) = self.session.upgrade() {
            session.del_stream(self.id);
        }
        tracing::debug!(stream = %self.id, "stream closed by peer");
    }

    /// Deliver an inbound frame
    pub(crate) fn feed(&self, frame: Frame) {
        let mut peer_closed = false;
        {
            // Sends stay under the sorter lock so concurrent feeders from
            // different connections cannot reorder released frames
            let mut sorter = self.sorter.lock().unwrap_or_else(PoisonError::into_inner);
            for frame in sorter.push(frame) {
                if !frame.payload.is_empty() {
                    // The receiver lives as long as self
                    let _ = self.inbound_tx.send(frame.payload);
                }
                if frame.closing {
                    peer_closed = true;
                    break;
                }
            }
        }

        if peer_closed {
            self.passive_close();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
