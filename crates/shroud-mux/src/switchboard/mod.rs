//! Fan-out of records across a session's physical connections
//!
//! Each attached connection gets a writer task, fed through a bounded
//! channel, and a reader task that pulls one record at a time with the
//! session's [`RecordReader`], deobfuscates it and dispatches the frame to
//! the session. Outbound records are spread round-robin; a full channel
//! makes senders wait.

mod pool;

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shroud_core::{Connection, SessionError};
use shroud_protocol::{Deobfser, RecordReader, MAX_RECORD_BODY, RECORD_HEADER_SIZE};

use crate::session::Session;
use crate::valve::Valve;
use pool::{ConnHandle, ConnId, ConnectionPool};

/// Terminal message recorded when the last physical connection is lost
pub const NO_CONNECTION_MSG: &str = "no underlying connection left";

/// Everything a reader task needs besides its connection
#[derive(Clone)]
struct Inbound {
    session: Weak<Session>,
    valve: Arc<Valve>,
    deobfs: Arc<dyn Deobfser>,
    reader: Arc<dyn RecordReader>,
}

pub(crate) struct Switchboard {
    inbound: Inbound,
    pool: ConnectionPool,
    send_buffer: usize,
    /// Parent of every connection's token
    cancel: CancellationToken,
    runtime: Handle,
}

impl Switchboard {
    pub(crate) fn new(
        session: Weak<Session>,
        valve: Arc<Valve>,
        deobfs: Arc<dyn Deobfser>,
        reader: Arc<dyn RecordReader>,
        send_buffer: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            inbound: Inbound {
                session,
                valve,
                deobfs,
                reader,
            },
            pool: ConnectionPool::new(),
            send_buffer,
            cancel: CancellationToken::new(),
            runtime,
        }
    }

    /// Start serving a physical connection
    pub(crate) fn add_conn<C: Connection>(&self, conn: C) {
        if self.cancel.is_cancelled() {
            tracing::debug!("switchboard closed, dropping new connection");
            return;
        }

        let (read_half, write_half) = tokio::io::split(conn);
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let cancel = self.cancel.child_token();

        let conn_id = self.pool.insert(ConnHandle {
            tx,
            cancel: cancel.clone(),
        });

        self.runtime
            .spawn(write_loop(conn_id, write_half, rx, cancel.clone()));
        self.runtime
            .spawn(read_loop(self.inbound.clone(), conn_id, read_half, cancel));

        tracing::info!(conn = conn_id, total = self.pool.len(), "physical connection added");
    }

    /// Queue a record on the next connection
    pub(crate) async fn send(&self, record: Bytes) -> Result<(), SessionError> {
        self.inbound.valve.tx_wait(record.len()).await;

        loop {
            let (conn_id, tx) = self.pool.pick().ok_or(SessionError::NoConnection)?;
            match tx.send(record.clone()).await {
                Ok(()) => {
                    self.inbound.valve.add_tx(record.len());
                    return Ok(());
                }
                Err(_) => {
                    tracing::warn!(conn = conn_id, "connection writer gone, trying next");
                    self.remove_conn(conn_id);
                }
            }
        }
    }

    /// Drop a failed connection; losing the last one closes the session
    fn remove_conn(&self, conn_id: ConnId) {
        if !self.pool.remove(conn_id) || !self.pool.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let Some(session) = self.inbound.session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }
        session.set_terminal_msg(NO_CONNECTION_MSG);
        // A concurrent close may win; either way the session ends
        let _ = session.close();
    }

    /// Terminate every physical connection
    pub(crate) fn close_all(&self) {
        self.cancel.cancel();
        let closed = self.pool.clear();
        tracing::debug!(connections = closed, "switchboard closed");
    }
}

impl Drop for Switchboard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop<W>(
    conn_id: ConnId,
    mut conn: W,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = conn.write_all(&record) => written,
        };
        if let Err(e) = written {
            tracing::warn!(conn = conn_id, error = %e, "physical connection write failed");
            // Let the reader notice and retire the connection
            cancel.cancel();
            break;
        }
    }

    let _ = conn.shutdown().await;
    tracing::trace!(conn = conn_id, "writer stopped");
}

async fn read_loop<R>(inbound: Inbound, conn_id: ConnId, mut conn: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + MAX_RECORD_BODY);

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = inbound.reader.read_record(&mut conn, &mut buf) => read,
        };
        let len = match read {
            Ok(len) => len,
            Err(e) => {
                if !cancel.is_cancelled() {
                    tracing::warn!(conn = conn_id, error = %e, "physical connection read failed");
                }
                break;
            }
        };

        let Some(record) = buf.get(..len) else {
            tracing::warn!(
                conn = conn_id,
                len,
                buffered = buf.len(),
                "record reader overstated record length"
            );
            break;
        };

        inbound.valve.rx_wait(len).await;
        inbound.valve.add_rx(len);

        let frame = match inbound.deobfs.deobfuscate(record) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(conn = conn_id, error = %e, "dropping undecodable record");
                continue;
            }
        };

        let Some(session) = inbound.session.upgrade() else {
            break;
        };
        tracing::trace!(conn = conn_id, stream = %frame.stream_id, seq = frame.seq, "frame received");
        session.dispatch(frame).await;
    }

    if let Some(session) = inbound.session.upgrade() {
        session.switchboard().remove_conn(conn_id);
    }
    tracing::trace!(conn = conn_id, "reader stopped");
}
