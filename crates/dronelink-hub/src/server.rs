//! [`HubServer`] – authenticated WebSocket fan-out for observers.
//!
//! Listens on `0.0.0.0:8765` (configurable via [`HubServer::with_bind`] and
//! [`HubServer::with_port`]).
//!
//! Session lifecycle:
//!
//! 1. The first byte of the TCP stream is peeked to tell a TLS handshake
//!    from a plain HTTP upgrade; a mismatch with the hub's configuration is
//!    rejected before anything is registered.
//! 2. The first WebSocket message must equal the shared token.
//! 3. The session is registered and receives one `status` snapshot.
//! 4. Inbound messages are answered (`get_throttle`) or enqueued as operator
//!    events; outbound envelopes arrive through the session's registry
//!    channel.
//! 5. On disconnect the session is deregistered.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dronelink_middleware::{ClientRegistry, EventQueue, SessionId};
use dronelink_types::{Envelope, Event, LinkState, Protocol, RelayError, ThrottleLevel, unix_timestamp};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Default TCP port for the observer hub.
pub const DEFAULT_PORT: u16 = 8765;

/// Default interval between keep-alive pings on each session.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Default limit for each handshake step of a new connection: the first
/// byte, the TLS and WebSocket handshakes, and the token.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for protocol violations (bad token, transport mismatch).
pub const CLOSE_PROTOCOL_ERROR: u16 = 4003;

const REASON_INVALID_TOKEN: &str = "Invalid token";
const REASON_EXPECT_WSS: &str = "Protocol mismatch (expect wss)";

/// First byte of every TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Handles into the rest of the relay that every session needs.
#[derive(Clone)]
pub struct HubContext {
    pub registry: Arc<ClientRegistry>,
    pub queue: Arc<EventQueue>,
    /// Read-only view of the link state owned by the reliable link.
    pub link_state: watch::Receiver<LinkState>,
    pub throttle: Arc<ThrottleLevel>,
}

impl HubContext {
    /// Point-in-time status snapshot for a session using `protocol`.
    pub fn status(&self, protocol: Protocol, keyboard_enabled: bool) -> Envelope {
        let link_state = *self.link_state.borrow();
        Envelope::Status {
            connected: link_state.is_connected(),
            link_state,
            queue_size: self.queue.len(),
            clients: self.registry.len(),
            protocol,
            keyboard_enabled,
            throttle: self.throttle.value(),
            timestamp: unix_timestamp(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport admission
// ---------------------------------------------------------------------------

/// What to do with a connection given the hub's and the client's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Serve,
    /// Plain client on an encrypted hub: answer with a close frame.
    RejectPlain,
    /// TLS client on a plain hub: no WebSocket can be spoken, drop it.
    DropTls,
}

fn admit(expected: Protocol, detected: Protocol) -> Admission {
    match (expected, detected) {
        (Protocol::Wss, Protocol::Ws) => Admission::RejectPlain,
        (Protocol::Ws, Protocol::Wss) => Admission::DropTls,
        _ => Admission::Serve,
    }
}

// ---------------------------------------------------------------------------
// HubServer
// ---------------------------------------------------------------------------

/// Accept loop and per-session handling for observer clients.
///
/// # Example
///
/// ```rust,no_run
/// use dronelink_hub::{HubContext, HubServer};
/// use tokio_util::sync::CancellationToken;
///
/// async fn serve(ctx: HubContext) {
///     let shutdown = CancellationToken::new();
///     if let Err(e) = HubServer::new(ctx, "secret").with_port(9000).run(shutdown).await {
///         eprintln!("hub failed: {e}");
///     }
/// }
/// ```
pub struct HubServer {
    ctx: HubContext,
    token: Zeroizing<String>,
    bind: IpAddr,
    port: u16,
    tls: Option<TlsAcceptor>,
    keyboard_enabled: bool,
    ping_interval: Duration,
    auth_timeout: Duration,
}

impl HubServer {
    /// Create a plain (`ws`) hub on `0.0.0.0:`[`DEFAULT_PORT`] that admits
    /// sessions presenting `token`.
    pub fn new(ctx: HubContext, token: impl Into<String>) -> Self {
        Self {
            ctx,
            token: Zeroizing::new(token.into()),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            tls: None,
            keyboard_enabled: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            auth_timeout: AUTH_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Require TLS (`wss`) on every session.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Reported to observers in the status snapshot.
    pub fn with_keyboard_enabled(mut self, enabled: bool) -> Self {
        self.keyboard_enabled = enabled;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Limit for each handshake step; a silent client is dropped after it.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The transport every session must use.
    pub fn protocol(&self) -> Protocol {
        if self.tls.is_some() {
            Protocol::Wss
        } else {
            Protocol::Ws
        }
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// [`RelayError::Bind`] if the address is unavailable.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr = SocketAddr::new(self.bind, self.port);
        TcpListener::bind(addr).await.map_err(|e| RelayError::Bind {
            addr: addr.to_string(),
            details: e.to_string(),
        })
    }

    /// Bind and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve sessions from an already bound `listener` until `shutdown` is
    /// cancelled. Open sessions are closed on shutdown as well.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        let local = listener
            .local_addr()
            .map_err(|e| RelayError::Transport(format!("listener address: {e}")))?;
        let protocol = self.protocol();
        info!(addr = %local, ?protocol, "observer hub listening");

        let hub = Arc::new(self);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = Arc::clone(&hub);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream, peer, shutdown).await {
                                debug!(%peer, error = %e, "observer connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
            }
        }

        info!(addr = %local, "observer hub stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Per-connection handling
    // -----------------------------------------------------------------------

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        // `peek` leaves the byte in place for the TLS or HTTP handshaker.
        let mut first = [0u8; 1];
        let n = tokio::time::timeout(self.auth_timeout, stream.peek(&mut first))
            .await
            .map_err(|_| RelayError::Protocol(format!("{peer} sent nothing")))?
            .map_err(|e| RelayError::Transport(format!("peek error from {peer}: {e}")))?;
        if n == 0 {
            return Ok(());
        }
        let detected = if first[0] == TLS_HANDSHAKE_RECORD {
            Protocol::Wss
        } else {
            Protocol::Ws
        };

        match admit(self.protocol(), detected) {
            Admission::Serve => match &self.tls {
                Some(acceptor) => {
                    let handshake = acceptor.accept(stream);
                    let tls = within(self.auth_timeout, peer, "TLS handshake", handshake)
                        .await?
                        .map_err(|e| {
                            RelayError::Transport(format!("TLS handshake from {peer}: {e}"))
                        })?;
                    let ws = ws_handshake(tls, peer, self.auth_timeout).await?;
                    self.serve_session(ws, peer, Protocol::Wss, shutdown).await
                }
                None => {
                    let ws = ws_handshake(stream, peer, self.auth_timeout).await?;
                    self.serve_session(ws, peer, Protocol::Ws, shutdown).await
                }
            },
            Admission::RejectPlain => {
                warn!(%peer, "plain connection on encrypted hub");
                let mut ws = ws_handshake(stream, peer, self.auth_timeout).await?;
                close_with(&mut ws, REASON_EXPECT_WSS).await;
                Ok(())
            }
            Admission::DropTls => {
                warn!(%peer, "TLS handshake on plain hub; dropping connection");
                Ok(())
            }
        }
    }

    async fn serve_session<S>(
        &self,
        mut ws: WebSocketStream<S>,
        peer: SocketAddr,
        protocol: Protocol,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // ── Token exchange ──────────────────────────────────────────────────
        let presented = match tokio::time::timeout(self.auth_timeout, next_text(&mut ws)).await {
            Ok(Some(text)) => Zeroizing::new(text),
            Ok(None) => {
                debug!(%peer, "observer left before presenting a token");
                return Ok(());
            }
            Err(_) => {
                warn!(%peer, "no token within {:?}", self.auth_timeout);
                close_with(&mut ws, REASON_INVALID_TOKEN).await;
                return Ok(());
            }
        };
        if presented.as_str() != self.token.as_str() {
            warn!(%peer, "invalid observer token");
            close_with(&mut ws, REASON_INVALID_TOKEN).await;
            return Ok(());
        }

        let (id, mut outbound) = self.ctx.registry.register(peer, protocol);
        let result = self
            .session_loop(ws, id, &mut outbound, peer, protocol, shutdown)
            .await;
        self.ctx.registry.deregister(id);
        result
    }

    async fn session_loop<S>(
        &self,
        ws: WebSocketStream<S>,
        id: SessionId,
        outbound: &mut mpsc::Receiver<String>,
        peer: SocketAddr,
        protocol: Protocol,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();

        let status = self
            .ctx
            .status(protocol, self.keyboard_enabled)
            .to_json()?;
        ws_tx
            .send(Message::Text(status.into()))
            .await
            .map_err(|e| RelayError::Transport(format!("status to {peer}: {e}")))?;

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                // ── Registry → observer ─────────────────────────────────────
                outgoing = outbound.recv() => match outgoing {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Removed from the registry by a failed publish.
                    None => break,
                },
                // ── Observer → queue ────────────────────────────────────────
                incoming = ws_rx.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(session = %id, %peer, error = %e, "observer read error");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };
                    if let Some(reply) = handle_inbound(&self.ctx, &text) {
                        let json = reply.to_json()?;
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Next text payload, skipping control frames. `None` once the stream ends.
async fn next_text<S>(ws: &mut WebSocketStream<S>) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Binary(bytes)) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn close_with<S>(ws: &mut WebSocketStream<S>, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(CLOSE_PROTOCOL_ERROR),
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "close frame not sent");
    }
}

// ---------------------------------------------------------------------------
// Inbound message handling
// ---------------------------------------------------------------------------

/// Act on one message from an authenticated observer.
///
/// | Message | Effect |
/// |---|---|
/// | `{"type":"get_throttle"}` | reply with `throttle_status` |
/// | `{"type":"command","command":"press:w"}` | enqueue `press:w` |
/// | any other JSON | enqueue the message text |
/// | malformed JSON / plain text | enqueue the message text |
///
/// Empty commands are ignored; commands spanning several lines are
/// rejected. Returns the direct reply, if any.
pub(crate) fn handle_inbound(ctx: &HubContext, text: &str) -> Option<Envelope> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(json) = serde_json::from_str::<Value>(trimmed)
        && let Some(obj) = json.as_object()
    {
        match obj.get("type").and_then(Value::as_str) {
            Some("get_throttle") => {
                return Some(Envelope::throttle_status(ctx.throttle.value()));
            }
            Some("command") => {
                let command = obj.get("command").and_then(Value::as_str).unwrap_or("").trim();
                if command.is_empty() {
                    debug!("empty observer command ignored");
                } else {
                    debug!(command, "observer command");
                    enqueue_command(ctx, command);
                }
                return None;
            }
            _ => {}
        }
    }

    debug!(text = trimmed, "observer text command");
    enqueue_command(ctx, trimmed);
    None
}

/// Await one handshake step, giving up after `limit`.
async fn within<F: Future>(
    limit: Duration,
    peer: SocketAddr,
    step: &str,
    fut: F,
) -> Result<F::Output, RelayError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RelayError::Protocol(format!("{step} from {peer} timed out")))
}

async fn ws_handshake<S>(
    stream: S,
    peer: SocketAddr,
    limit: Duration,
) -> Result<WebSocketStream<S>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    within(limit, peer, "WS handshake", accept_async(stream))
        .await?
        .map_err(|e| RelayError::Transport(format!("WS handshake from {peer}: {e}")))
}

fn enqueue_command(ctx: &HubContext, text: &str) {
    match Event::from_wire(text) {
        Some(event) => {
            ctx.queue.enqueue(event);
        }
        None => warn!(text, "multi-line observer command rejected"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
