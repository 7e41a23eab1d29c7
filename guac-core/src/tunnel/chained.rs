//! Chained tunnel: ordered failover across candidate tunnels.
//!
//! Candidates are tried in order. A candidate *commits* the moment it
//! opens or delivers its first instruction; from then on all of its events
//! forward verbatim and no further candidate is ever tried. A candidate
//! failing before commit is detached and the next one is attempted, with
//! one exception: an upstream timeout means the server is reachable but
//! dead, so the remaining candidates are dropped and the failure
//! propagates immediately.

use std::collections::VecDeque;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::GuacError;
use crate::status::{Status, StatusCode};

use super::{
    InstructionSender, Tunnel, TunnelEvent, TunnelEvents, TunnelShared, TunnelState, TunnelStats,
};

/// Tunnel that composes an ordered list of inner tunnels.
pub struct ChainedTunnel {
    candidates: Option<Vec<Box<dyn Tunnel>>>,
    shared: Arc<TunnelShared>,
    events_rx: Option<TunnelEvents>,
    out_tx: mpsc::UnboundedSender<String>,
    out_rx: Option<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl ChainedTunnel {
    /// Chain the given tunnels, first candidate first.
    pub fn new(tunnels: Vec<Box<dyn Tunnel>>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            candidates: Some(tunnels),
            shared: Arc::new(TunnelShared::new(events_tx)),
            events_rx: Some(events_rx),
            out_tx,
            out_rx: Some(out_rx),
            cancel: CancellationToken::new(),
            driver: None,
        }
    }
}

#[async_trait]
impl Tunnel for ChainedTunnel {
    async fn connect(&mut self, data: &str) -> Result<(), GuacError> {
        let Some(candidates) = self.candidates.take() else {
            return Err(GuacError::Other("tunnel already connected".into()));
        };
        if candidates.is_empty() {
            let status = Status::new(StatusCode::ServerError, "no tunnels to try");
            self.shared.close_with(status.clone());
            return Err(GuacError::TunnelClosed(status));
        }
        let out_rx = self.out_rx.take().ok_or(GuacError::ChannelClosed)?;

        self.driver = Some(tokio::spawn(drive(
            candidates.into(),
            data.to_string(),
            Arc::clone(&self.shared),
            out_rx,
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        self.shared.close_with(Status::from_code(StatusCode::Success));
    }

    fn sender(&self) -> InstructionSender {
        InstructionSender::new(self.out_tx.clone())
    }

    fn take_events(&mut self) -> Option<TunnelEvents> {
        self.events_rx.take()
    }

    fn state(&self) -> TunnelState {
        self.shared.state()
    }

    fn stats(&self) -> TunnelStats {
        self.shared.stats()
    }
}

/// Outcome of trying a single candidate before commit.
enum Trial {
    /// The candidate opened (or produced an instruction): committed.
    Committed,
    /// The candidate failed; try the next one.
    Failed(Option<Status>),
    /// Fatal for the whole chain (timeout, cancellation).
    Abort,
}

async fn drive(
    mut candidates: VecDeque<Box<dyn Tunnel>>,
    data: String,
    shared: Arc<TunnelShared>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut last_failure: Option<Status> = None;

    while let Some(mut tunnel) = candidates.pop_front() {
        if cancel.is_cancelled() {
            shared.close_with(Status::from_code(StatusCode::Success));
            return;
        }

        let Some(mut events) = tunnel.take_events() else {
            trace!("skipping candidate with consumed event stream");
            continue;
        };

        if let Err(e) = tunnel.connect(&data).await {
            debug!("tunnel candidate failed to connect: {e}");
            last_failure = Some(Status::new(StatusCode::ServerError, e.to_string()));
            continue;
        }
        let sender = tunnel.sender();

        match try_candidate(&mut tunnel, &mut events, &sender, &mut out_rx, &cancel, &shared).await
        {
            Trial::Committed => {
                debug!("tunnel candidate committed");
                forward_committed(tunnel, events, sender, out_rx, cancel, shared).await;
                return;
            }
            Trial::Failed(status) => {
                if status.is_some() {
                    last_failure = status;
                }
                tunnel.disconnect().await;
            }
            Trial::Abort => return,
        }
    }

    // Every candidate failed: propagate the last failure as a real status.
    shared.close_with(
        last_failure
            .unwrap_or_else(|| Status::new(StatusCode::ServerError, "all tunnels failed")),
    );
}

/// Pump one candidate until it commits or fails.
async fn try_candidate(
    tunnel: &mut Box<dyn Tunnel>,
    events: &mut TunnelEvents,
    sender: &InstructionSender,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
    shared: &TunnelShared,
) -> Trial {
    let mut outbound_open = true;
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tunnel.disconnect().await;
                shared.close_with(Status::from_code(StatusCode::Success));
                return Trial::Abort;
            }

            out = out_rx.recv(), if outbound_open => {
                match out {
                    Some(encoded) => sender.send_raw(encoded),
                    None => outbound_open = false,
                }
            }

            event = events.recv() => match event {
                Some(TunnelEvent::State(TunnelState::Open)) => {
                    shared.set_state(TunnelState::Open);
                    return Trial::Committed;
                }
                Some(TunnelEvent::Instruction(instruction)) => {
                    // Receiving data counts as proof of life even before
                    // an explicit open.
                    shared.set_state(TunnelState::Open);
                    shared.emit_instruction(instruction);
                    return Trial::Committed;
                }
                Some(TunnelEvent::State(TunnelState::Closed)) => {
                    return Trial::Failed(None);
                }
                Some(TunnelEvent::State(TunnelState::Connecting)) => {}
                Some(TunnelEvent::Error(status)) => {
                    if status.code() == Some(StatusCode::UpstreamTimeout) {
                        // The server answered and then went silent; another
                        // transport will fare no better.
                        debug!("upstream timeout during failover; dropping remaining tunnels");
                        shared.close_with(status);
                        return Trial::Abort;
                    }
                    return Trial::Failed(Some(status));
                }
                None => return Trial::Failed(None),
            }
        }
    }
}

/// After commit: forward events verbatim and route sends to the committed
/// tunnel until it closes.
async fn forward_committed(
    mut tunnel: Box<dyn Tunnel>,
    mut events: TunnelEvents,
    sender: InstructionSender,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    shared: Arc<TunnelShared>,
) {
    let mut outbound_open = true;
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tunnel.disconnect().await;
                shared.close_with(Status::from_code(StatusCode::Success));
                return;
            }

            out = out_rx.recv(), if outbound_open => {
                match out {
                    Some(encoded) => sender.send_raw(encoded),
                    None => outbound_open = false,
                }
            }

            event = events.recv() => match event {
                Some(TunnelEvent::State(state)) => {
                    shared.set_state(state);
                    if state == TunnelState::Closed {
                        return;
                    }
                }
                Some(TunnelEvent::Error(status)) => shared.emit_error(status),
                Some(TunnelEvent::Instruction(instruction)) => shared.emit_instruction(instruction),
                None => {
                    shared.set_state(TunnelState::Closed);
                    return;
                }
            }
        }
    }
}
