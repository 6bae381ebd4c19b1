//! Shared vocabulary for the relay: operator events, observer envelopes,
//! link state, the quantized throttle level, and the service error type.
//!
//! Wire text (`"press:w"`, `"release:w"`, `"heartbeat:ping"`,
//! `"throttle:0.35"`) is translated to and from [`EventKind`] in exactly one
//! place, [`EventKind::parse_wire`] / [`EventKind::to_wire`], so nothing
//! downstream of the queue ever re-parses strings.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// The fixed symbol set understood by the downstream control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Key {
    W,
    A,
    S,
    D,
    Q,
    E,
    Z,
    X,
    L,
    H,
    C,
    J,
    K,
}

impl Key {
    /// Every symbol, in control-surface order.
    pub const ALL: [Key; 13] = [
        Key::W,
        Key::A,
        Key::S,
        Key::D,
        Key::Q,
        Key::E,
        Key::Z,
        Key::X,
        Key::L,
        Key::H,
        Key::C,
        Key::J,
        Key::K,
    ];

    /// Single-character wire symbol.
    pub fn symbol(self) -> char {
        match self {
            Key::W => 'w',
            Key::A => 'a',
            Key::S => 's',
            Key::D => 'd',
            Key::Q => 'q',
            Key::E => 'e',
            Key::Z => 'z',
            Key::X => 'x',
            Key::L => 'l',
            Key::H => 'h',
            Key::C => 'c',
            Key::J => 'j',
            Key::K => 'k',
        }
    }

    /// Look up a key by its wire symbol (case-insensitive).
    pub fn from_symbol(symbol: &str) -> Option<Key> {
        let mut chars = symbol.chars();
        let c = chars.next()?.to_ascii_lowercase();
        if chars.next().is_some() {
            return None;
        }
        Key::ALL.into_iter().find(|k| k.symbol() == c)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What an [`Event`] asks the relay to do.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Key-down on the control surface.
    Press(Key),
    /// Key-up on the control surface.
    Release(Key),
    /// Keep-alive sentinel.
    Heartbeat,
    /// Absolute throttle set-point request, handled locally.
    ThrottleSet(f64),
    /// Opaque command text forwarded verbatim.
    Raw(String),
}

impl EventKind {
    /// Translate one inbound text command into an [`EventKind`].
    ///
    /// Input is trimmed and lowercased. Anything that is not a recognised
    /// press/release/heartbeat/throttle form becomes [`EventKind::Raw`]
    /// carrying the trimmed original text.
    ///
    /// Returns `None` for blank text and for text with an interior line
    /// break: every event occupies exactly one downstream line.
    pub fn parse_wire(text: &str) -> Option<EventKind> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.contains(['\r', '\n']) {
            return None;
        }
        Some(Self::parse_line(trimmed))
    }

    fn parse_line(trimmed: &str) -> EventKind {
        let lowered = trimmed.to_ascii_lowercase();

        if let Some((prefix, rest)) = lowered.split_once(':') {
            match prefix {
                "press" => {
                    if let Some(key) = Key::from_symbol(rest) {
                        return EventKind::Press(key);
                    }
                }
                "release" => {
                    if let Some(key) = Key::from_symbol(rest) {
                        return EventKind::Release(key);
                    }
                }
                "heartbeat" if rest == "ping" => return EventKind::Heartbeat,
                "throttle" => {
                    if let Ok(value) = rest.trim().parse::<f64>()
                        && value.is_finite()
                    {
                        return EventKind::ThrottleSet(value);
                    }
                }
                _ => {}
            }
        }

        EventKind::Raw(trimmed.to_string())
    }

    /// Downstream line encoding (without the trailing newline).
    pub fn to_wire(&self) -> String {
        match self {
            EventKind::Press(key) => format!("press:{key}"),
            EventKind::Release(key) => format!("release:{key}"),
            EventKind::Heartbeat => "heartbeat:ping".to_string(),
            EventKind::ThrottleSet(value) => format!("throttle:{value}"),
            EventKind::Raw(raw) => raw.clone(),
        }
    }

    /// `true` for key-up events, which drain ahead of everything else.
    pub fn is_release(&self) -> bool {
        matches!(self, EventKind::Release(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Who produced an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Raw operator input: local key capture or an observer client.
    Operator,
    /// Generated by the relay itself (throttle steps, heartbeats).
    Synthetic,
}

/// An immutable unit of outbound intent.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Event originating from operator input.
    pub fn operator(kind: EventKind) -> Self {
        Self::new(kind, Origin::Operator)
    }

    /// Event generated internally by the relay.
    pub fn synthetic(kind: EventKind) -> Self {
        Self::new(kind, Origin::Synthetic)
    }

    /// The keep-alive sentinel.
    pub fn heartbeat() -> Self {
        Self::synthetic(EventKind::Heartbeat)
    }

    /// Parse operator text into an event. See [`EventKind::parse_wire`].
    pub fn from_wire(text: &str) -> Option<Self> {
        EventKind::parse_wire(text).map(Self::operator)
    }

    /// Downstream line encoding (without the trailing newline).
    pub fn to_wire(&self) -> String {
        self.kind.to_wire()
    }

    /// `true` when both events would look identical on the wire.
    ///
    /// Identity, origin, and timestamp are ignored.
    pub fn same_command(&self, other: &Event) -> bool {
        self.kind == other.kind
    }
}

// ---------------------------------------------------------------------------
// Link state & delivery
// ---------------------------------------------------------------------------

/// Lifecycle of the downstream connection.
///
/// `Disconnected → Connecting → Connected → Degraded → Disconnected`, with
/// [`LinkState::Stopped`] as the terminal state once the reconnect budget is
/// spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// A transport error occurred on a live connection; retrying.
    Degraded,
    /// Reconnect budget exhausted. Never left.
    Stopped,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
            LinkState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Final classification of one outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Delivered,
    Dropped,
}

// ---------------------------------------------------------------------------
// Throttle level
// ---------------------------------------------------------------------------

/// Size of one throttle step.
pub const THROTTLE_STEP: f64 = 0.05;

/// Number of steps between 0.0 and 1.0.
pub const THROTTLE_MAX_STEPS: u32 = 20;

/// Direction of a single throttle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Up,
    Down,
}

impl StepDirection {
    /// The control-surface key that performs this step.
    pub fn key(self) -> Key {
        match self {
            StepDirection::Up => Key::K,
            StepDirection::Down => Key::J,
        }
    }

    /// Inverse of [`StepDirection::key`].
    pub fn from_key(key: Key) -> Option<StepDirection> {
        match key {
            Key::K => Some(StepDirection::Up),
            Key::J => Some(StepDirection::Down),
            _ => None,
        }
    }
}

/// Quantized throttle value shared between its single writer and readers.
///
/// Stored as a whole number of [`THROTTLE_STEP`]s so the value is always an
/// exact multiple of 0.05 inside `[0.0, 1.0]`.
#[derive(Debug)]
pub struct ThrottleLevel {
    steps: AtomicU32,
}

impl ThrottleLevel {
    /// Create a level at `initial`, clamped and quantized.
    pub fn new(initial: f64) -> Self {
        Self {
            steps: AtomicU32::new(Self::quantize(initial)),
        }
    }

    /// Clamp `value` to `[0, 1]` and round it to the nearest step count.
    ///
    /// Non-finite input maps to zero.
    pub fn quantize(value: f64) -> u32 {
        if !value.is_finite() {
            return 0;
        }
        let clamped = value.clamp(0.0, 1.0);
        (clamped * f64::from(THROTTLE_MAX_STEPS)).round() as u32
    }

    /// Convert a step count back into a throttle value.
    pub fn steps_to_value(steps: u32) -> f64 {
        f64::from(steps.min(THROTTLE_MAX_STEPS)) / f64::from(THROTTLE_MAX_STEPS)
    }

    pub fn steps(&self) -> u32 {
        self.steps.load(Ordering::Acquire)
    }

    pub fn value(&self) -> f64 {
        Self::steps_to_value(self.steps())
    }

    /// Move one step in `direction`, saturating at the range bounds.
    ///
    /// Returns the new value.
    pub fn step(&self, direction: StepDirection) -> f64 {
        let next = |s: u32| match direction {
            StepDirection::Up => (s + 1).min(THROTTLE_MAX_STEPS),
            StepDirection::Down => s.saturating_sub(1),
        };
        let previous = self
            .steps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(next(s)))
            .unwrap_or_else(|s| s);
        Self::steps_to_value(next(previous))
    }
}

// ---------------------------------------------------------------------------
// Observer envelopes
// ---------------------------------------------------------------------------

/// Transport security of an observer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ws,
    Wss,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        })
    }
}

/// Structured server-to-observer message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Snapshot sent once right after a successful token exchange.
    Status {
        connected: bool,
        link_state: LinkState,
        queue_size: usize,
        clients: usize,
        protocol: Protocol,
        keyboard_enabled: bool,
        throttle: f64,
        timestamp: f64,
    },
    ThrottleStatus {
        throttle: f64,
        timestamp: f64,
    },
    /// Outcome of one relayed event.
    Event {
        event: String,
        outcome: Delivery,
        timestamp: f64,
    },
    Heartbeat {
        status: String,
        timestamp: f64,
    },
}

impl Envelope {
    pub fn throttle_status(throttle: f64) -> Self {
        Envelope::ThrottleStatus {
            throttle,
            timestamp: unix_timestamp(),
        }
    }

    pub fn event_result(event: &Event, outcome: Delivery) -> Self {
        Envelope::Event {
            event: event.to_wire(),
            outcome,
            timestamp: unix_timestamp(),
        }
    }

    pub fn heartbeat() -> Self {
        Envelope::Heartbeat {
            status: "active".to_string(),
            timestamp: unix_timestamp(),
        }
    }

    /// The `type` discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Status { .. } => "status",
            Envelope::ThrottleStatus { .. } => "throttle_status",
            Envelope::Event { .. } => "event",
            Envelope::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Serialise to the JSON text sent to observers.
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }
}

/// Seconds since the Unix epoch with millisecond resolution.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Service-level error spanning startup, transport, and observer failures.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The downstream reconnect budget is spent; the service must stop.
    #[error("downstream link exhausted after {attempts} connect attempts")]
    LinkExhausted { attempts: u32 },

    #[error("bind error on {addr}: {details}")]
    Bind { addr: String, details: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}
