//! Bidirectional tunnels carrying the instruction stream.
//!
//! A tunnel is driven by a background task that owns the actual transport.
//! Everything it observes (state changes, errors, parsed instructions)
//! flows to the single consumer through an event channel, in receive order.
//! Outbound instructions flow the other way through a cloneable
//! [`InstructionSender`].

pub mod chained;
pub mod http;
pub mod websocket;

pub use chained::ChainedTunnel;
pub use http::HttpTunnel;
pub use websocket::WebSocketTunnel;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GuacError;
use crate::instruction::{encode_elements, Instruction};
use crate::parser::Parser;
use crate::status::{Status, StatusCode};

/// Default window after which a silent connection is closed with
/// [`StatusCode::UpstreamTimeout`].
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(15_000);

// ── TunnelState ──────────────────────────────────────────────────

/// Lifecycle of a tunnel. `Closed` is terminal and absorbing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// Connection establishment in progress. Initial state.
    #[default]
    Connecting = 0,
    /// Instructions may flow in both directions.
    Open = 1,
    /// The tunnel is permanently closed.
    Closed = 2,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Connecting,
            1 => TunnelState::Open,
            _ => TunnelState::Closed,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Connecting => write!(f, "Connecting"),
            TunnelState::Open => write!(f, "Open"),
            TunnelState::Closed => write!(f, "Closed"),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Everything a tunnel reports to its consumer, in order.
#[derive(Debug)]
pub enum TunnelEvent {
    /// The tunnel changed state.
    State(TunnelState),
    /// A fatal transport, protocol, or timeout error.
    Error(Status),
    /// A complete instruction arrived.
    Instruction(Instruction),
}

/// Receiving half of a tunnel's event stream.
pub type TunnelEvents = mpsc::UnboundedReceiver<TunnelEvent>;

// ── InstructionSender ────────────────────────────────────────────

/// Cheaply cloneable handle used to enqueue outbound instructions.
///
/// Sends are best-effort: once the driver task is gone (tunnel closed),
/// they become no-ops.
#[derive(Debug, Clone)]
pub struct InstructionSender {
    tx: mpsc::UnboundedSender<String>,
}

impl InstructionSender {
    /// Wrap the sending half of a driver's outbound channel.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Enqueue an instruction.
    pub fn send(&self, instruction: &Instruction) {
        let _ = self.tx.send(instruction.encode());
    }

    /// Enqueue an instruction given as raw elements (opcode first).
    pub fn send_elements<'a>(&self, elements: impl IntoIterator<Item = &'a str>) {
        let _ = self.tx.send(encode_elements(elements));
    }

    /// Enqueue an already-encoded instruction.
    pub fn send_raw(&self, encoded: String) {
        let _ = self.tx.send(encoded);
    }
}

// ── Stats ────────────────────────────────────────────────────────

/// Byte and instruction counters maintained by the driver task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub instructions_received: u64,
}

// ── Shared driver state ──────────────────────────────────────────

/// State shared between a tunnel handle and its driver task.
pub(crate) struct TunnelShared {
    state: AtomicU8,
    events: mpsc::UnboundedSender<TunnelEvent>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    instructions_received: AtomicU64,
}

impl TunnelShared {
    pub(crate) fn new(events: mpsc::UnboundedSender<TunnelEvent>) -> Self {
        Self {
            state: AtomicU8::new(TunnelState::Connecting as u8),
            events,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            instructions_received: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Transition state, emitting an event on change. `Closed` absorbs all
    /// later transitions.
    pub(crate) fn set_state(&self, state: TunnelState) {
        let current = self.state();
        if current == TunnelState::Closed || current == state {
            return;
        }
        self.state.store(state as u8, Ordering::SeqCst);
        let _ = self.events.send(TunnelEvent::State(state));
    }

    pub(crate) fn emit_error(&self, status: Status) {
        let _ = self.events.send(TunnelEvent::Error(status));
    }

    pub(crate) fn emit_instruction(&self, instruction: Instruction) {
        self.instructions_received.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(TunnelEvent::Instruction(instruction));
    }

    pub(crate) fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> TunnelStats {
        TunnelStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            instructions_received: self.instructions_received.load(Ordering::Relaxed),
        }
    }

    /// Feed transport bytes through the parser, emitting every complete
    /// instruction. A framing violation is returned to the driver, which
    /// must treat it as fatal.
    pub(crate) fn ingest(&self, parser: &mut Parser, bytes: &[u8]) -> Result<(), GuacError> {
        self.add_received(bytes.len());
        parser.feed(bytes);
        loop {
            match parser.next_instruction() {
                Ok(Some(instruction)) => self.emit_instruction(instruction),
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Standard fatal-close sequence: surface the status as an error when
    /// it is error-class, then transition to `Closed`.
    pub(crate) fn close_with(&self, status: Status) {
        if status.is_error() {
            self.emit_error(status);
        }
        self.set_state(TunnelState::Closed);
    }

    pub(crate) fn close_timeout(&self) {
        self.close_with(Status::new(
            StatusCode::UpstreamTimeout,
            "no data received within the receive timeout",
        ));
    }
}

// ── Tunnel trait ─────────────────────────────────────────────────

/// A bidirectional transport carrying instructions.
///
/// Construct, [`connect`](Tunnel::connect), consume events from
/// [`take_events`](Tunnel::take_events), send through
/// [`sender`](Tunnel::sender). After the tunnel reports
/// [`TunnelState::Closed`] all sends are dropped silently.
#[async_trait]
pub trait Tunnel: Send {
    /// Begin connecting, passing the opaque handshake data.
    ///
    /// An `Err` means the attempt failed before any transport existed;
    /// failures after that surface as [`TunnelEvent::Error`] +
    /// [`TunnelEvent::State`] events.
    async fn connect(&mut self, data: &str) -> Result<(), GuacError>;

    /// Gracefully close the tunnel.
    async fn disconnect(&mut self);

    /// A cloneable handle for sending instructions.
    fn sender(&self) -> InstructionSender;

    /// Take the event stream. Yields `None` after the first call; there
    /// is exactly one consumer.
    fn take_events(&mut self) -> Option<TunnelEvents>;

    /// Current state.
    fn state(&self) -> TunnelState;

    /// Counters maintained by the driver task.
    fn stats(&self) -> TunnelStats {
        TunnelStats::default()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_absorbing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = TunnelShared::new(tx);

        shared.set_state(TunnelState::Open);
        shared.set_state(TunnelState::Closed);
        shared.set_state(TunnelState::Open);
        assert_eq!(shared.state(), TunnelState::Closed);

        assert!(matches!(
            rx.try_recv().unwrap(),
            TunnelEvent::State(TunnelState::Open)
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TunnelEvent::State(TunnelState::Closed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn repeated_state_is_not_reemitted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = TunnelShared::new(tx);
        shared.set_state(TunnelState::Open);
        shared.set_state(TunnelState::Open);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ingest_emits_in_order_and_counts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = TunnelShared::new(tx);
        let mut parser = Parser::new();

        shared
            .ingest(&mut parser, b"4.sync,1.0;4.sync,1.1;")
            .unwrap();

        for expected in ["0", "1"] {
            match rx.try_recv().unwrap() {
                TunnelEvent::Instruction(ins) => assert_eq!(ins.args()[0], expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(shared.stats().instructions_received, 2);
        assert_eq!(shared.stats().bytes_received, 22);
    }

    #[test]
    fn close_with_success_emits_no_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = TunnelShared::new(tx);
        shared.close_with(Status::from_code(StatusCode::Success));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TunnelEvent::State(TunnelState::Closed)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sender_encodes_elements() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = InstructionSender::new(tx);
        sender.send_elements(["key", "65307", "1"]);
        assert_eq!(rx.try_recv().unwrap(), "3.key,5.65307,1.1;");
    }
}
