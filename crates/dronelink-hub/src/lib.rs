//! `dronelink-hub` – the observer side of the relay.
//!
//! Boots a WebSocket server (default port `8765`) that:
//!
//! 1. **Checks** the transport of every connection against the hub's
//!    configuration: plain `ws` by default, `wss` once a
//!    [`TlsAcceptor`](tokio_rustls::TlsAcceptor) is supplied. Mismatches are
//!    closed with code `4003`.
//!
//! 2. **Authenticates** each session with a pre-shared token sent as the
//!    first message, then registers it in the
//!    [`ClientRegistry`](dronelink_middleware::ClientRegistry) and sends one
//!    `status` snapshot.
//!
//! 3. **Accepts** inbound messages:
//!    - `{"type":"get_throttle"}` → immediate `throttle_status` reply.
//!    - `{"type":"command","command":"…"}` → the command is enqueued.
//!    - anything else, including malformed JSON → enqueued as raw text.
//!
//! Outbound envelopes (`event`, `heartbeat`, `throttle_status`) are fanned
//! out through the registry by the relay service.
//!
//! [`tls`] builds the rustls acceptor from PEM material and can generate a
//! self-signed certificate.

pub mod server;
pub mod tls;

pub use server::{CLOSE_PROTOCOL_ERROR, DEFAULT_PING_INTERVAL, DEFAULT_PORT, HubContext, HubServer};
pub use tls::{SelfSigned, acceptor_from_pem, generate_self_signed};
