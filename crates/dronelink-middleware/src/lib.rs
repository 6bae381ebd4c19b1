//! `dronelink-middleware` – queueing, delivery, and fan-out plumbing.
//!
//! Moves operator intent from producers to the downstream endpoint and
//! status out to observers without caring what the commands mean.
//!
//! # Modules
//!
//! - [`queue`] – [`EventQueue`]: mutex-guarded double-ended queue whose
//!   drain returns release events ahead of everything else.
//! - [`link`] – [`ReliableLink`]: the single persistent downstream
//!   connection with bounded reconnect and per-event retry.
//! - [`heartbeat`] – [`HeartbeatMonitor`]: keep-alive originator on its own
//!   cadence.
//! - [`registry`] – [`ClientRegistry`]: the set of authenticated observer
//!   sessions and the `publish` fan-out over them.

pub mod heartbeat;
pub mod link;
pub mod queue;
pub mod registry;

pub use heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatMonitor};
pub use link::{Connector, FrameSink, LinkConfig, LinkError, ReliableLink, TcpConnector};
pub use queue::EventQueue;
pub use registry::{ClientRegistry, SessionId};
