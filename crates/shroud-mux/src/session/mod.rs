//! Multiplexing sessions
//!
//! A [`Session`] owns the stream table, allocates stream IDs, queues streams
//! opened by the peer until they are accepted, and tears everything down
//! exactly once, either on request or after sitting idle.
//!
//! # Locking
//!
//! One mutex guards the stream table together with the pending idle check.
//! Inserting or removing a stream, deciding that the table just became
//! empty, and flipping the closed flag all happen under it. The lock is
//! never held across an `.await`, and nothing reached while holding it
//! calls back into the session: session teardown closes streams through
//! [`Stream::close_detached`] on spawned tasks instead of the path a stream
//! uses on its own, which would take the lock again.

mod table;
mod timeout;

pub use crate::switchboard::NO_CONNECTION_MSG;
pub use timeout::IDLE_TIMEOUT_MSG;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shroud_core::{ConfigError, Connection, MuxConfig, SessionError, StreamError};
use shroud_protocol::{Deobfser, Frame, Obfser, RecordReader, SessionId, StreamId};

use crate::stream::Stream;
use crate::switchboard::Switchboard;
use crate::valve::Valve;
use table::StreamTable;

/// Addresses of the most recently attached physical connection
#[derive(Debug, Clone, Copy, Default)]
struct ConnAddrs {
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

/// The multiplexing context binding logical streams to physical links
pub struct Session {
    id: SessionId,
    config: MuxConfig,

    /// Adds multiplexing headers, masks and wraps frames in records; the
    /// matching deobfuscator lives with the switchboard's readers
    obfs: Arc<dyn Obfser>,
    session_key: Bytes,

    next_stream_id: AtomicU32,
    table: Mutex<StreamTable>,

    accept_tx: mpsc::Sender<Arc<Stream>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Stream>>>,
    /// Cancelled once on close; stands in for the end-of-accept sentinel
    closing: CancellationToken,
    closed: AtomicBool,

    switchboard: Switchboard,
    addrs: RwLock<ConnAddrs>,
    terminal_msg: OnceLock<String>,

    runtime: Handle,
    me: Weak<Session>,
}

impl Session {
    /// Create a session with the default configuration
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn make(
        id: SessionId,
        valve: Arc<Valve>,
        obfs: Arc<dyn Obfser>,
        deobfs: Arc<dyn Deobfser>,
        session_key: impl Into<Bytes>,
        reader: Arc<dyn RecordReader>,
    ) -> Arc<Self> {
        Self::build(id, valve, obfs, deobfs, session_key.into(), reader, MuxConfig::default())
    }

    /// Create a session with an explicit configuration
    ///
    /// `valve` is used as given. It is usually shared by every session of
    /// one user, so `config.valve` is not consulted here; build the shared
    /// valve with [`Valve::from_config`] instead.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_config(
        id: SessionId,
        valve: Arc<Valve>,
        obfs: Arc<dyn Obfser>,
        deobfs: Arc<dyn Deobfser>,
        session_key: impl Into<Bytes>,
        reader: Arc<dyn RecordReader>,
        config: MuxConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::build(id, valve, obfs, deobfs, session_key.into(), reader, config))
    }

    fn build(
        id: SessionId,
        valve: Arc<Valve>,
        obfs: Arc<dyn Obfser>,
        deobfs: Arc<dyn Deobfser>,
        session_key: Bytes,
        reader: Arc<dyn RecordReader>,
        config: MuxConfig,
    ) -> Arc<Self> {
        let runtime = Handle::current();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let session = Arc::new_cyclic(|me: &Weak<Session>| Session {
            id,
            obfs,
            session_key,
            next_stream_id: AtomicU32::new(StreamId::FIRST.as_u32()),
            table: Mutex::new(StreamTable::new()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            switchboard: Switchboard::new(
                me.clone(),
                valve,
                deobfs,
                reader,
                config.connection_send_buffer,
                runtime.clone(),
            ),
            addrs: RwLock::new(ConnAddrs::default()),
            terminal_msg: OnceLock::new(),
            runtime,
            me: me.clone(),
            config,
        });

        {
            let mut table = session.lock_table();
            session.arm_idle_check(&mut table);
        }

        tracing::info!(session = %id, "session created");
        session
    }

    fn lock_table(&self) -> MutexGuard<'_, StreamTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule a fresh idle check. Caller holds the table lock.
    fn arm_idle_check(&self, table: &mut StreamTable) {
        let check = self
            .runtime
            .spawn(timeout::close_when_idle(self.me.clone(), self.config.idle_timeout));
        table.replace_idle_check(check);
        tracing::debug!(session = %self.id, timeout = ?self.config.idle_timeout, "idle check armed");
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Key material shared with the obfuscation codec
    pub fn session_key(&self) -> &Bytes {
        &self.session_key
    }

    /// Active configuration
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub(crate) fn switchboard(&self) -> &Switchboard {
        &self.switchboard
    }

    /// Attach a physical connection
    ///
    /// May be called any number of times; records flow over every attached
    /// connection. Transport failures surface later, when the link is used.
    pub fn add_connection<C: Connection>(&self, conn: C) {
        let addrs = ConnAddrs {
            local: conn.local_addr(),
            peer: conn.peer_addr(),
        };
        self.switchboard.add_conn(conn);
        *self.addrs.write().unwrap_or_else(PoisonError::into_inner) = addrs;
    }

    /// Open a stream initiated by this side
    pub fn open_stream(&self) -> Result<Arc<Stream>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::BrokenSession);
        }

        // Post-increment: the first stream is 1 on both ends of the tunnel
        let id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let stream = Stream::new(id, self.me.clone());

        {
            let mut table = self.lock_table();
            if self.is_closed() {
                return Err(SessionError::BrokenSession);
            }
            table.streams.insert(id, Arc::clone(&stream));
        }

        tracing::debug!(session = %self.id, stream = %id, "stream opened");
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    ///
    /// Fails with [`SessionError::BrokenSession`] once the session closes,
    /// whatever the reason; [`terminal_msg`](Self::terminal_msg) tells why.
    pub async fn accept(&self) -> Result<Arc<Stream>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::BrokenSession);
        }

        let mut accept_rx = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(SessionError::BrokenSession),
            rx = self.accept_rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(SessionError::BrokenSession),
            stream = accept_rx.recv() => stream.ok_or(SessionError::BrokenSession),
        }
    }

    /// Route an inbound frame to its stream, creating the stream if the
    /// peer just opened it
    pub(crate) async fn dispatch(&self, frame: Frame) {
        let Some(stream) = self.get_stream(frame.stream_id, frame.closing).await else {
            tracing::trace!(
                session = %self.id,
                stream = %frame.stream_id,
                "closing frame for unknown stream ignored"
            );
            return;
        };
        stream.feed(frame);
    }

    /// Fetch the stream for `id`, or register a newly observed remote stream
    ///
    /// A closing frame for an unknown stream is a no-op. A new stream is
    /// queued for `accept` after the table lock is released; the push waits
    /// while the backlog is full, but never past session close.
    async fn get_stream(&self, id: StreamId, closing_frame: bool) -> Option<Arc<Stream>> {
        let stream = {
            let mut table = self.lock_table();
            if let Some(stream) = table.streams.get(&id) {
                return Some(Arc::clone(stream));
            }
            if closing_frame || self.is_closed() {
                return None;
            }
            let stream = Stream::new(id, self.me.clone());
            table.streams.insert(id, Arc::clone(&stream));
            stream
        };

        tracing::debug!(session = %self.id, stream = %id, "remote stream observed");

        tokio::select! {
            biased;
            _ = self.closing.cancelled() => {}
            queued = self.accept_tx.send(Arc::clone(&stream)) => {
                if queued.is_err() {
                    tracing::warn!(session = %self.id, stream = %id, "accept queue gone");
                }
            }
        }
        Some(stream)
    }

    /// Remove a stream that closed on its own
    ///
    /// Emptying the table arms a new idle check.
    pub(crate) fn del_stream(&self, id: StreamId) {
        let mut table = self.lock_table();
        if table.streams.remove(&id).is_none() {
            return;
        }
        if table.streams.is_empty() && !self.is_closed() {
            self.arm_idle_check(&mut table);
        }
    }

    /// Obfuscate a frame and hand it to the switchboard
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), StreamError> {
        let record = self.obfs.obfuscate(frame)?;
        self.switchboard.send(record).await?;
        Ok(())
    }

    /// Close the session if the table is still empty. Runs when an idle
    /// check fires.
    pub(crate) fn expire_if_idle(&self) {
        let table = self.lock_table();
        if !table.streams.is_empty() || self.is_closed() {
            return;
        }
        self.closed.store(true, Ordering::Release);
        self.set_terminal_msg(IDLE_TIMEOUT_MSG);
        tracing::info!(session = %self.id, "session idle, closing");
        self.shutdown(table);
    }

    /// Close the session
    ///
    /// Only the first call has any effect; later calls return
    /// [`SessionError::RepeatClose`], which callers may ignore. Blocked
    /// `accept` calls fail with [`SessionError::BrokenSession`]. Streams
    /// are torn down on detached tasks that this call does not wait for.
    pub fn close(&self) -> Result<(), SessionError> {
        let table = self.lock_table();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::RepeatClose);
        }
        self.shutdown(table);
        Ok(())
    }

    /// Teardown after the closed flag was set under `table`
    fn shutdown(&self, mut table: MutexGuard<'_, StreamTable>) {
        self.closing.cancel();
        table.cancel_idle_check();

        let count = table.streams.len();
        for (_, stream) in table.streams.drain() {
            self.runtime.spawn(async move {
                stream.close_detached().await;
            });
        }
        drop(table);

        self.switchboard.close_all();
        tracing::info!(
            session = %self.id,
            streams = count,
            reason = self.terminal_msg(),
            "session closed"
        );
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record why the session ended. Only the first message is kept.
    pub fn set_terminal_msg(&self, msg: impl Into<String>) {
        if let Err(msg) = self.terminal_msg.set(msg.into()) {
            tracing::debug!(session = %self.id, ignored = %msg, "terminal message already set");
        }
    }

    /// Why the session ended, or an empty string if never recorded
    pub fn terminal_msg(&self) -> &str {
        self.terminal_msg.get().map_or("", String::as_str)
    }

    /// Local address of the most recently attached physical connection
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addrs.read().unwrap_or_else(PoisonError::into_inner).local
    }

    /// Remote address of the most recently attached physical connection
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addrs.read().unwrap_or_else(PoisonError::into_inner).peer
    }

    /// Number of registered streams
    pub fn stream_count(&self) -> usize {
        self.lock_table().streams.len()
    }

    /// Idle checks scheduled but not yet fired
    pub fn pending_idle_checks(&self) -> usize {
        self.lock_table().pending_idle_checks()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("terminal_msg", &self.terminal_msg())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use shroud_protocol::{PlainObfs, TlsRecordReader};

    fn session() -> Arc<Session> {
        Session::make(
            SessionId::new(1),
            Arc::new(Valve::unlimited()),
            Arc::new(PlainObfs),
            Arc::new(PlainObfs),
            Bytes::from_static(b"session key"),
            Arc::new(TlsRecordReader),
        )
    }

    fn data(id: u32, seq: u32, payload: &'static [u8]) -> Frame {
        Frame::data(StreamId::new(id), seq, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_open_stream_ids_start_at_one() {
        let session = session();
        let a = session.open_stream().unwrap();
        let b = session.open_stream().unwrap();

        assert_eq!(a.id(), StreamId::new(1));
        assert_eq!(b.id(), StreamId::new(2));
        assert_eq!(session.stream_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_open_ids_unique() {
        let session = session();
        let opens = (0..200).map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.open_stream().unwrap().id() })
        });

        let ids: HashSet<StreamId> = futures::future::join_all(opens)
            .await
            .into_iter()
            .map(|id| id.unwrap())
            .collect();

        assert_eq!(ids.len(), 200);
        assert_eq!(session.stream_count(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_stream_accepted_once() {
        let session = session();

        session.dispatch(data(7, 0, b"first")).await;
        session.dispatch(data(7, 1, b"second")).await;

        let stream = session.accept().await.unwrap();
        assert_eq!(stream.id(), StreamId::new(7));

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");

        // The second frame did not produce a second delivery
        let again = tokio::time::timeout(Duration::from_millis(50), session.accept()).await;
        assert!(again.is_err());
        assert_eq!(session.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_closing_frame_is_no_op() {
        let session = session();

        session.dispatch(Frame::closing(StreamId::new(9), 0)).await;

        assert_eq!(session.stream_count(), 0);
        let accepted = tokio::time::timeout(Duration::from_millis(50), session.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_detaches_stream() {
        let session = session();

        session.dispatch(data(3, 0, b"bye")).await;
        let stream = session.accept().await.unwrap();
        session.dispatch(Frame::closing(StreamId::new(3), 1)).await;

        assert!(stream.is_closed());
        assert_eq!(session.stream_count(), 0);
        assert_eq!(session.pending_idle_checks(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session();
        assert!(session.close().is_ok());
        assert_eq!(session.close(), Err(SessionError::RepeatClose));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let session = session();
        session.close().unwrap();

        assert_eq!(session.open_stream().unwrap_err(), SessionError::BrokenSession);
        assert_eq!(session.accept().await.unwrap_err(), SessionError::BrokenSession);
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let session = session();
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.accept().await })
        };
        tokio::task::yield_now().await;

        session.close().unwrap();
        assert_eq!(waiter.await.unwrap().unwrap_err(), SessionError::BrokenSession);
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_stream_teardown() {
        let session = session();
        let stream = session.open_stream().unwrap();

        // Simulate a write stuck in flight
        let in_flight = stream.writing.lock().await;

        session.close().unwrap();
        assert_eq!(session.stream_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !stream.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stream marked closed");

        drop(in_flight);
    }

    #[tokio::test]
    async fn test_session_close_skips_stream_table_callbacks() {
        let session = session();
        let streams: Vec<_> = (0..10).map(|_| session.open_stream().unwrap()).collect();

        session.close().unwrap();

        for stream in &streams {
            // Already gone from the table; a local close must not panic or rearm
            let _ = stream.close().await;
        }
        assert_eq!(session.stream_count(), 0);
        assert_eq!(session.pending_idle_checks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_times_out() {
        let session = session();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(session.is_closed());
        assert_eq!(session.terminal_msg(), IDLE_TIMEOUT_MSG);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_stream_keeps_session_alive() {
        let session = session();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stream = session.open_stream().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!session.is_closed());

        // No physical link: the closing frame is dropped but the stream detaches
        stream.close().await.unwrap();
        assert_eq!(session.stream_count(), 0);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!session.is_closed());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(session.is_closed());
        assert_eq!(session.terminal_msg(), IDLE_TIMEOUT_MSG);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_checks_do_not_accumulate() {
        let session = session();

        for _ in 0..1000 {
            let stream = session.open_stream().unwrap();
            stream.close().await.unwrap();
            assert!(session.pending_idle_checks() <= 1);
        }
        assert_eq!(session.pending_idle_checks(), 1);

        // The surviving check still closes the session
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_close_before_timeout() {
        let session = session();

        let a = session.open_stream().unwrap();
        let b = session.open_stream().unwrap();
        assert_eq!(
            [a.id(), b.id()].into_iter().collect::<HashSet<_>>(),
            HashSet::from([StreamId::new(1), StreamId::new(2)])
        );

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.accept().await })
        };

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(session.stream_count(), 0);
        assert_eq!(session.pending_idle_checks(), 1);

        session.close().unwrap();
        assert!(session.is_closed());
        assert_eq!(waiter.await.unwrap().unwrap_err(), SessionError::BrokenSession);
        // Closed explicitly, not by the timer
        assert_eq!(session.terminal_msg(), "");

        // The superseded timer never fires a second close
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(session.terminal_msg(), "");
    }

    #[tokio::test]
    async fn test_terminal_msg_set_once() {
        let session = session();
        assert_eq!(session.terminal_msg(), "");

        session.set_terminal_msg("upstream reset");
        session.set_terminal_msg("ignored");
        assert_eq!(session.terminal_msg(), "upstream reset");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = Session::with_config(
            SessionId::new(2),
            Arc::new(Valve::unlimited()),
            Arc::new(PlainObfs),
            Arc::new(PlainObfs),
            Bytes::new(),
            Arc::new(TlsRecordReader),
            MuxConfig {
                accept_backlog: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_close_releases_producer_blocked_on_full_backlog() {
        let session = Session::with_config(
            SessionId::new(3),
            Arc::new(Valve::unlimited()),
            Arc::new(PlainObfs),
            Arc::new(PlainObfs),
            Bytes::new(),
            Arc::new(TlsRecordReader),
            MuxConfig {
                accept_backlog: 1,
                ..Default::default()
            },
        )
        .unwrap();

        // Fills the backlog
        session.dispatch(data(1, 0, b"one")).await;

        let blocked = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.dispatch(data(2, 0, b"two")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(session.stream_count(), 2);

        session.close().unwrap();

        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("producer still blocked after close")
            .unwrap();
        assert_eq!(session.stream_count(), 0);
        assert_eq!(session.accept().await.unwrap_err(), SessionError::BrokenSession);
    }
}
