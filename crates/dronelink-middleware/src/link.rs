//! The single persistent downstream connection.
//!
//! [`ReliableLink`] owns the connection and its [`LinkState`]; other
//! components only observe the state through [`ReliableLink::subscribe_state`].
//!
//! # Policy
//!
//! | Situation | Reaction |
//! |---|---|
//! | not connected when sending | `connect()` first |
//! | connect attempt fails | close stale connection, pause `reconnect_pause`, retry, up to `reconnect_attempts` |
//! | last connect attempt fails | enter [`LinkState::Stopped`] forever and cancel the service token |
//! | send hits a reset | abandon the connection, reconnect immediately, pause `reset_pause`, retry |
//! | send hits a timeout / other I/O error | abandon the connection, pause `retry_pause`, retry on a fresh connection |
//! | last retry fails | no reconnect; the next event connects afresh |
//! | `send_retries` attempts fail | classify [`Delivery::Dropped`]; never replayed |
//!
//! The transport is abstracted behind [`Connector`] / [`FrameSink`] so the
//! policy can be exercised without a network.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dronelink_types::{Delivery, Event, LinkState};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport-level failure, split by how it must be propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The peer reset or closed the connection. Retryable after reconnect.
    #[error("connection reset: {0}")]
    Reset(String),

    /// The operation did not complete in time. Retryable.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Any other transport error. Retryable.
    #[error("i/o error: {0}")]
    Io(String),

    /// The reconnect budget is spent. Fatal.
    #[error("reconnect budget exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The owning service is shutting down. Fatal.
    #[error("link shut down")]
    Shutdown,
}

impl LinkError {
    /// `true` when no further attempt may be made on this link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Exhausted { .. } | LinkError::Shutdown)
    }

    /// `true` when the connection is gone and must be re-established.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self, LinkError::Reset(_))
    }

    /// Classify an I/O error from the socket.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => LinkError::Reset(err.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                LinkError::Timeout(err.to_string())
            }
            _ => LinkError::Io(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Opens connections to the downstream endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable endpoint for logs, e.g. `"10.0.0.2:5000"`.
    fn endpoint(&self) -> String;

    /// Open one fresh connection.
    async fn connect(&self) -> Result<Box<dyn FrameSink>, LinkError>;
}

/// Write half of one downstream connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write `frame` followed by a newline.
    async fn send_frame(&mut self, frame: &str) -> Result<(), LinkError>;

    /// Best-effort close. Errors are ignored.
    async fn close(&mut self);
}

/// Newline-framed text over TCP.
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    /// Default per-attempt connect timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
    /// Default per-frame write timeout.
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

    /// `addr` is anything [`TcpStream::connect`] accepts, e.g. `"host:5000"`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn endpoint(&self) -> String {
        self.addr.clone()
    }

    async fn connect(&self) -> Result<Box<dyn FrameSink>, LinkError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LinkError::Timeout(format!("connect to {}", self.addr)))?
            .map_err(LinkError::from_io)?;
        // Frames are tiny and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on downstream socket");
        }
        Ok(Box::new(TcpFrameSink {
            stream,
            write_timeout: self.write_timeout,
        }))
    }
}

struct TcpFrameSink {
    stream: TcpStream,
    write_timeout: Duration,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send_frame(&mut self, frame: &str) -> Result<(), LinkError> {
        let mut line = String::with_capacity(frame.len() + 1);
        line.push_str(frame);
        line.push('\n');
        tokio::time::timeout(self.write_timeout, self.stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| LinkError::Timeout(format!("write of {frame:?}")))?
            .map_err(LinkError::from_io)
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry and reconnect budget for a [`ReliableLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Connect attempts per `connect()` before the link stops for good.
    pub reconnect_attempts: u32,
    /// Pause after each failed connect attempt.
    pub reconnect_pause: Duration,
    /// Delivery attempts per event.
    pub send_retries: u32,
    /// Pause before retrying after a timeout or generic I/O error.
    pub retry_pause: Duration,
    /// Pause before retrying after a reset and reconnect.
    pub reset_pause: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_pause: Duration::from_secs(5),
            send_retries: 3,
            retry_pause: Duration::from_millis(200),
            reset_pause: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// ReliableLink
// ---------------------------------------------------------------------------

/// Persistent downstream connection with bounded reconnect and retry.
pub struct ReliableLink {
    connector: Box<dyn Connector>,
    config: LinkConfig,
    /// The live connection. Held across a whole `send` so frames from
    /// concurrent callers never interleave and no frame is written twice.
    conn: Mutex<Option<Box<dyn FrameSink>>>,
    state: watch::Sender<LinkState>,
    shutdown: CancellationToken,
    fatal_signaled: AtomicBool,
}

impl ReliableLink {
    /// Create a disconnected link. `shutdown` is cancelled when the
    /// reconnect budget is exhausted, and stops retries when cancelled by
    /// someone else.
    pub fn new(
        connector: impl Connector + 'static,
        config: LinkConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            connector: Box::new(connector),
            config,
            conn: Mutex::new(None),
            state,
            shutdown,
            fatal_signaled: AtomicBool::new(false),
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Observe state transitions without being able to cause them.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// (Re-)establish the connection.
    ///
    /// # Errors
    ///
    /// [`LinkError::Exhausted`] once every attempt has failed; the link is
    /// then permanently [`LinkState::Stopped`]. [`LinkError::Shutdown`] if the
    /// service is shutting down.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let mut conn = self.conn.lock().await;
        self.connect_locked(&mut conn).await
    }

    /// Deliver one event downstream.
    ///
    /// Never writes the same event twice: a frame counts as delivered as
    /// soon as one write completes without a transport error.
    pub async fn send(&self, event: &Event) -> Delivery {
        let frame = event.to_wire();
        let mut conn = self.conn.lock().await;
        let mut pause: Option<Duration> = None;

        for attempt in 1..=self.config.send_retries {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(p) = pause.take() {
                tokio::time::sleep(p).await;
            }

            if conn.is_none()
                && let Err(e) = self.connect_locked(&mut conn).await
            {
                warn!(event = %frame, attempt, error = %e, "no downstream connection");
                break;
            }
            let Some(sink) = conn.as_mut() else {
                break;
            };

            match sink.send_frame(&frame).await {
                Ok(()) => {
                    self.transition(LinkState::Connected);
                    debug!(event = %frame, attempt, "event delivered");
                    return Delivery::Delivered;
                }
                Err(e) => {
                    // A failed write may have left part of the frame on the
                    // socket, so the connection is never written to again.
                    self.transition(LinkState::Degraded);
                    if let Some(mut stale) = conn.take() {
                        stale.close().await;
                    }
                    let last = attempt == self.config.send_retries;
                    warn!(
                        event = %frame,
                        attempt,
                        max = self.config.send_retries,
                        error = %e,
                        "send failed; connection abandoned"
                    );
                    if e.triggers_reconnect() {
                        if !last && let Err(e) = self.connect_locked(&mut conn).await {
                            warn!(event = %frame, error = %e, "reconnect failed");
                            break;
                        }
                        pause = Some(self.config.reset_pause);
                    } else {
                        pause = Some(self.config.retry_pause);
                    }
                }
            }
        }

        if self.state() == LinkState::Degraded {
            if let Some(mut stale) = conn.take() {
                stale.close().await;
            }
            self.transition(LinkState::Disconnected);
        }
        warn!(event = %frame, endpoint = %self.connector.endpoint(), "dropping undelivered event");
        Delivery::Dropped
    }

    /// Close the connection and move to `Disconnected` (unless stopped).
    pub async fn close(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(mut sink) = conn.take() {
            sink.close().await;
        }
        self.transition(LinkState::Disconnected);
    }

    async fn connect_locked(&self, conn: &mut Option<Box<dyn FrameSink>>) -> Result<(), LinkError> {
        let attempts = self.config.reconnect_attempts;
        if self.state() == LinkState::Stopped {
            return Err(LinkError::Exhausted { attempts });
        }
        let endpoint = self.connector.endpoint();

        for attempt in 1..=attempts {
            if self.shutdown.is_cancelled() {
                return Err(LinkError::Shutdown);
            }
            if let Some(mut stale) = conn.take() {
                stale.close().await;
            }
            self.transition(LinkState::Connecting);

            match self.connector.connect().await {
                Ok(sink) => {
                    *conn = Some(sink);
                    self.transition(LinkState::Connected);
                    info!(endpoint = %endpoint, attempt, "downstream connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        max = attempts,
                        error = %e,
                        "downstream connect failed"
                    );
                    if attempt < attempts {
                        self.transition(LinkState::Disconnected);
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.reconnect_pause) => {}
                            _ = self.shutdown.cancelled() => return Err(LinkError::Shutdown),
                        }
                    }
                }
            }
        }

        self.stop(attempts);
        Err(LinkError::Exhausted { attempts })
    }

    /// Enter the terminal state and signal the service, exactly once.
    fn stop(&self, attempts: u32) {
        self.transition(LinkState::Stopped);
        if !self.fatal_signaled.swap(true, Ordering::AcqRel) {
            error!(
                endpoint = %self.connector.endpoint(),
                attempts,
                "downstream reconnect budget exhausted; shutting down"
            );
            self.shutdown.cancel();
        }
    }

    fn transition(&self, next: LinkState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == LinkState::Stopped {
                return false;
            }
            info!(from = %current, to = %next, "link state");
            *current = next;
            true
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dronelink_types::EventKind;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// In-memory connector whose connect and send outcomes are scripted.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedConnector {
        pub connects: Arc<AtomicU32>,
        /// Remaining connect attempts that fail before one succeeds.
        pub failing_connects: Arc<AtomicU32>,
        /// Outcomes for successive `send_frame` calls; `Ok` once empty.
        pub send_script: Arc<StdMutex<VecDeque<Result<(), LinkError>>>>,
        /// Every frame handed to a sink, with its outcome.
        pub attempts: Arc<StdMutex<Vec<(String, bool)>>>,
    }

    impl ScriptedConnector {
        pub fn failing_connects(n: u32) -> Self {
            let c = Self::default();
            c.failing_connects.store(n, Ordering::SeqCst);
            c
        }

        pub fn with_send_results(results: Vec<Result<(), LinkError>>) -> Self {
            let c = Self::default();
            *c.send_script.lock().unwrap() = results.into();
            c
        }

        pub fn delivered(&self) -> Vec<String> {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, ok)| *ok)
                .map(|(f, _)| f.clone())
                .collect()
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn endpoint(&self) -> String {
            "scripted:0".to_string()
        }

        async fn connect(&self) -> Result<Box<dyn FrameSink>, LinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failing_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(LinkError::Io("connection refused".to_string()));
            }
            Ok(Box::new(ScriptedSink {
                script: Arc::clone(&self.send_script),
                attempts: Arc::clone(&self.attempts),
            }))
        }
    }

    struct ScriptedSink {
        script: Arc<StdMutex<VecDeque<Result<(), LinkError>>>>,
        attempts: Arc<StdMutex<Vec<(String, bool)>>>,
    }

    #[async_trait]
    impl FrameSink for ScriptedSink {
        async fn send_frame(&mut self, frame: &str) -> Result<(), LinkError> {
            let result = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            self.attempts
                .lock()
                .unwrap()
                .push((frame.to_string(), result.is_ok()));
            result
        }

        async fn close(&mut self) {}
    }

    pub(crate) fn fast_config() -> LinkConfig {
        LinkConfig {
            reconnect_attempts: 5,
            reconnect_pause: Duration::from_millis(1),
            send_retries: 3,
            retry_pause: Duration::from_millis(1),
            reset_pause: Duration::from_millis(1),
        }
    }

    fn press_w() -> Event {
        Event::operator(EventKind::parse_wire("press:w").unwrap())
    }

    #[tokio::test]
    async fn send_connects_lazily_and_delivers_once() {
        let connector = ScriptedConnector::default();
        let link = ReliableLink::new(connector.clone(), fast_config(), CancellationToken::new());
        assert_eq!(link.state(), LinkState::Disconnected);

        assert_eq!(link.send(&press_w()).await, Delivery::Delivered);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.delivered(), vec!["press:w"]);
    }

    #[tokio::test]
    async fn three_failed_sends_drop_the_event() {
        let connector = ScriptedConnector::with_send_results(vec![
            Err(LinkError::Timeout("write".into())),
            Err(LinkError::Timeout("write".into())),
            Err(LinkError::Io("broken".into())),
        ]);
        let link = ReliableLink::new(connector.clone(), fast_config(), CancellationToken::new());

        assert_eq!(link.send(&press_w()).await, Delivery::Dropped);
        assert_eq!(connector.attempt_count(), 3, "exactly three attempts, no infinite retry");
        assert!(connector.delivered().is_empty());

        // Every failed write abandoned its connection.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(link.state(), LinkState::Disconnected);

        // The next event goes through on a fresh connection.
        let release = Event::operator(EventKind::parse_wire("release:w").unwrap());
        assert_eq!(link.send(&release).await, Delivery::Delivered);
        assert_eq!(connector.delivered(), vec!["release:w"]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn timed_out_write_retries_on_a_fresh_connection() {
        let connector =
            ScriptedConnector::with_send_results(vec![Err(LinkError::Timeout("write".into()))]);
        let link = ReliableLink::new(connector.clone(), fast_config(), CancellationToken::new());

        assert_eq!(link.send(&press_w()).await, Delivery::Delivered);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.delivered(), vec!["press:w"]);
    }

    #[tokio::test]
    async fn reset_on_last_retry_does_not_reconnect() {
        let connector = ScriptedConnector::with_send_results(vec![
            Err(LinkError::Reset("peer reset".into())),
            Err(LinkError::Reset("peer reset".into())),
            Err(LinkError::Reset("peer reset".into())),
        ]);
        let link = ReliableLink::new(connector.clone(), fast_config(), CancellationToken::new());

        assert_eq!(link.send(&press_w()).await, Delivery::Dropped);
        // Initial connect plus one reconnect per retry that follows a reset.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(connector.attempt_count(), 3);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn reset_reconnects_before_the_next_retry() {
        let connector =
            ScriptedConnector::with_send_results(vec![Err(LinkError::Reset("peer reset".into()))]);
        let link = ReliableLink::new(connector.clone(), fast_config(), CancellationToken::new());

        assert_eq!(link.send(&press_w()).await, Delivery::Delivered);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.delivered(), vec!["press:w"], "no duplicate on the wire");
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn connect_recovers_within_budget() {
        let connector = ScriptedConnector::failing_connects(4);
        let shutdown = CancellationToken::new();
        let link = ReliableLink::new(connector.clone(), fast_config(), shutdown.clone());

        link.connect().await.expect("fifth attempt succeeds");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
        assert_eq!(link.state(), LinkState::Connected);
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn five_failed_connects_stop_the_link_and_signal_once() {
        let connector = ScriptedConnector::failing_connects(u32::MAX);
        let shutdown = CancellationToken::new();
        let link = ReliableLink::new(connector.clone(), fast_config(), shutdown.clone());
        let mut states = link.subscribe_state();

        let err = link.connect().await.unwrap_err();
        assert_eq!(err, LinkError::Exhausted { attempts: 5 });
        assert!(err.is_fatal());
        assert_eq!(link.state(), LinkState::Stopped);
        assert!(shutdown.is_cancelled());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LinkState::Stopped);

        // Terminal: no further connect attempts, every send is dropped.
        assert_eq!(link.send(&press_w()).await, Delivery::Dropped);
        assert!(link.connect().await.is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
        assert_eq!(link.state(), LinkState::Stopped);
        assert!(link.fatal_signaled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn external_shutdown_aborts_reconnect_pause() {
        let connector = ScriptedConnector::failing_connects(u32::MAX);
        let shutdown = CancellationToken::new();
        let config = LinkConfig {
            reconnect_pause: Duration::from_secs(60),
            ..fast_config()
        };
        let link = Arc::new(ReliableLink::new(connector.clone(), config, shutdown.clone()));

        let task = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connect must return promptly")
            .unwrap();
        assert_eq!(result, Err(LinkError::Shutdown));
        assert_ne!(link.state(), LinkState::Stopped);
    }

    #[test]
    fn io_errors_are_classified() {
        let reset = LinkError::from_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.triggers_reconnect());
        let pipe = LinkError::from_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(pipe.triggers_reconnect());
        let timeout = LinkError::from_io(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(timeout, LinkError::Timeout(_)));
        assert!(!timeout.is_fatal());
        let other = LinkError::from_io(io::Error::other("boom"));
        assert!(matches!(other, LinkError::Io(_)));
    }

    #[tokio::test]
    async fn partial_write_is_never_followed_by_a_copy_on_the_same_connection() {
        const FRAME_LEN: usize = 16 * 1024 * 1024;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(usize, Vec<u8>)>();
        tokio::spawn(async move {
            for index in 0.. {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    use tokio::io::AsyncReadExt;
                    // The first peer stalls long enough for the write to time out.
                    if index == 0 {
                        tokio::time::sleep(Duration::from_millis(600)).await;
                    }
                    let mut bytes = Vec::new();
                    let _ = stream.read_to_end(&mut bytes).await;
                    let _ = tx.send((index, bytes));
                });
            }
        });

        let connector = TcpConnector::new(addr.to_string())
            .with_write_timeout(Duration::from_millis(250));
        let link = ReliableLink::new(connector, fast_config(), CancellationToken::new());
        let frame = "x".repeat(FRAME_LEN);
        let event = Event::operator(EventKind::Raw(frame.clone()));

        assert_eq!(link.send(&event).await, Delivery::Delivered);
        link.close().await;

        let mut received = Vec::new();
        for _ in 0..2 {
            let conn = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("both connections finish")
                .unwrap();
            received.push(conn);
        }
        received.sort_by_key(|(index, _)| *index);

        let (_, stalled) = &received[0];
        assert!(stalled.len() < FRAME_LEN + 1, "first connection only saw a partial frame");
        assert!(!stalled.contains(&b'\n'));
        let (_, fresh) = &received[1];
        assert_eq!(fresh.len(), FRAME_LEN + 1);
        assert_eq!(fresh.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn tcp_connector_writes_newline_framed_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut out = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                out.push(line);
                if out.len() == 3 {
                    break;
                }
            }
            out
        });

        let link = ReliableLink::new(
            TcpConnector::new(addr.to_string()),
            fast_config(),
            CancellationToken::new(),
        );
        for text in ["press:w", "release:w", "heartbeat:ping"] {
            assert_eq!(link.send(&Event::from_wire(text).unwrap()).await, Delivery::Delivered);
        }

        let lines = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lines, vec!["press:w", "release:w", "heartbeat:ping"]);
    }
}
