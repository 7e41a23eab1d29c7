//! HTTP long-poll tunnel.
//!
//! Three endpoints hang off one base URL: `?connect` (POST, handshake,
//! returns the session UUID), `?read:<uuid>:<seq>` (GET, long-poll), and
//! `?write:<uuid>` (POST, batched upstream instructions).
//!
//! The read side parses each response body incrementally as chunks arrive
//! and pre-allocates the next read as soon as the current response proves
//! good, so the handover on the zero-length terminator costs no round
//! trip. The write side coalesces everything queued while a POST was in
//! flight into the next POST.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TunnelConfig;
use crate::error::GuacError;
use crate::parser::Parser;
use crate::status::{Status, StatusCode};

use super::{
    InstructionSender, Tunnel, TunnelEvents, TunnelShared, TunnelState, TunnelStats,
};

/// Content type of `?connect` and `?write` POST bodies.
const WRITE_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

/// Tunnel over HTTP long-polling.
pub struct HttpTunnel {
    base_url: String,
    config: TunnelConfig,
    client: reqwest::Client,
    shared: Arc<TunnelShared>,
    events_rx: Option<TunnelEvents>,
    out_tx: mpsc::UnboundedSender<String>,
    out_rx: Option<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
    drivers: Vec<tokio::task::JoinHandle<()>>,
}

impl HttpTunnel {
    /// Create an unconnected tunnel targeting an `http://` or `https://`
    /// base URL.
    pub fn new(base_url: impl Into<String>, config: TunnelConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            base_url: base_url.into(),
            config,
            client: reqwest::Client::new(),
            shared: Arc::new(TunnelShared::new(events_tx)),
            events_rx: Some(events_rx),
            out_tx,
            out_rx: Some(out_rx),
            cancel: CancellationToken::new(),
            drivers: Vec::new(),
        }
    }
}

#[async_trait]
impl Tunnel for HttpTunnel {
    async fn connect(&mut self, data: &str) -> Result<(), GuacError> {
        let Some(out_rx) = self.out_rx.take() else {
            return Err(GuacError::Other("tunnel already connected".into()));
        };

        let response = self
            .client
            .post(format!("{}?connect", self.base_url))
            .header(CONTENT_TYPE, WRITE_CONTENT_TYPE)
            .body(data.to_string())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.shared
                    .close_with(Status::new(StatusCode::ServerError, e.to_string()));
                return Err(GuacError::Transport(e.to_string()));
            }
        };

        // While connecting every error surfaces, RESOURCE_NOT_FOUND
        // included.
        if !response.status().is_success() {
            let status = status_from_response(&response);
            self.shared.close_with(status.clone());
            return Err(GuacError::TunnelClosed(status));
        }

        let uuid = match response.text().await {
            Ok(body) => body.trim().to_string(),
            Err(e) => {
                self.shared
                    .close_with(Status::new(StatusCode::ServerError, e.to_string()));
                return Err(GuacError::Transport(e.to_string()));
            }
        };
        if uuid.is_empty() {
            let status = Status::new(StatusCode::ServerError, "connect returned no session id");
            self.shared.close_with(status.clone());
            return Err(GuacError::TunnelClosed(status));
        }

        debug!(uuid = %uuid, "http tunnel session established");
        self.shared.set_state(TunnelState::Open);

        self.drivers.push(tokio::spawn(read_loop(
            self.client.clone(),
            self.base_url.clone(),
            uuid.clone(),
            Arc::clone(&self.shared),
            self.cancel.clone(),
            self.config.receive_timeout(),
            self.config.poll_interval(),
        )));
        self.drivers.push(tokio::spawn(write_loop(
            self.client.clone(),
            self.base_url.clone(),
            uuid,
            Arc::clone(&self.shared),
            out_rx,
            self.cancel.clone(),
        )));

        Ok(())
    }

    async fn disconnect(&mut self) {
        self.cancel.cancel();
        for driver in self.drivers.drain(..) {
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

/// Synthesize a status from a non-200 response.
fn status_from_response(response: &reqwest::Response) -> Status {
    let code = response
        .headers()
        .get("Guacamole-Status-Code")
        .and_then(|v| v.to_str().ok());
    let message = response
        .headers()
        .get("Guacamole-Error-Message")
        .and_then(|v| v.to_str().ok());
    Status::from_http_response(response.status().as_u16(), code, message)
}

/// Post-open errors: RESOURCE_NOT_FOUND is the normal end of stream and
/// must not surface as an error.
fn close_post_open(shared: &TunnelShared, status: Status) {
    if status.code() == Some(StatusCode::ResourceNotFound) {
        shared.close_with(Status::from_code(StatusCode::Success));
    } else {
        shared.close_with(status);
    }
}

/// Completes on the fallback interval while one is armed, never otherwise.
async fn poll_tick(poll: &mut Option<tokio::time::Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ── Read loop ────────────────────────────────────────────────────

async fn read_loop(
    client: reqwest::Client,
    base_url: String,
    uuid: String,
    shared: Arc<TunnelShared>,
    cancel: CancellationToken,
    receive_timeout: Duration,
    poll_interval: Duration,
) {
    let mut seq: u64 = 0;
    let mut deadline = Instant::now() + receive_timeout;
    let mut prepared: Option<tokio::task::JoinHandle<Result<reqwest::Response, reqwest::Error>>> =
        None;

    'reads: loop {
        if cancel.is_cancelled() {
            shared.close_with(Status::from_code(StatusCode::Success));
            return;
        }

        let result = match prepared.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    shared.close_with(Status::new(StatusCode::ServerError, e.to_string()));
                    return;
                }
            },
            None => {
                let url = format!("{base_url}?read:{uuid}:{seq}");
                client.get(url).send().await
            }
        };
        seq += 1;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                shared.close_with(Status::new(StatusCode::UpstreamError, e.to_string()));
                return;
            }
        };

        if !response.status().is_success() {
            close_post_open(&shared, status_from_response(&response));
            return;
        }

        // The response is known good: prepare the next read so the
        // terminator handover is seamless.
        let next_url = format!("{base_url}?read:{uuid}:{seq}");
        let next_client = client.clone();
        prepared = Some(tokio::spawn(
            async move { next_client.get(next_url).send().await },
        ));

        // Instructions never span read responses; each response gets a
        // fresh parse state.
        let mut parser = Parser::new();
        let mut body = Box::pin(response.bytes_stream());
        let mut progress_events: u32 = 0;
        let mut poll = Some(tokio::time::interval(poll_interval));

        'body: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    shared.close_with(Status::from_code(StatusCode::Success));
                    return;
                }

                _ = tokio::time::sleep_until(deadline) => {
                    shared.close_timeout();
                    return;
                }

                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            progress_events += 1;
                            if progress_events >= 2 {
                                // Two partial-body events on one request:
                                // the transport surfaces progress on its
                                // own, the fallback is dead weight.
                                poll = None;
                            }
                            deadline = Instant::now() + receive_timeout;
                            shared.add_received(bytes.len());
                            parser.feed(&bytes);

                            loop {
                                match parser.next_instruction() {
                                    Ok(Some(instruction)) => {
                                        if instruction.opcode().is_empty() {
                                            // Zero-length element: this read
                                            // is done; pick up the prepared
                                            // one. Any pending poll interval
                                            // dies with the request.
                                            trace!(seq, "read terminated, rotating to prepared request");
                                            continue 'reads;
                                        }
                                        shared.emit_instruction(instruction);
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        shared.close_with(Status::new(
                                            StatusCode::ServerError,
                                            e.to_string(),
                                        ));
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            shared.close_with(Status::new(StatusCode::UpstreamError, e.to_string()));
                            return;
                        }
                        // Body ended without a terminator; move on to the
                        // next read anyway.
                        None => break 'body,
                    }
                }

                _ = poll_tick(&mut poll) => {
                    // Chunked bodies surface progress by themselves; the
                    // tick exists for transports that buffer until
                    // completion and merely re-arms the select.
                }
            }
        }
    }
}

// ── Write loop ───────────────────────────────────────────────────

async fn write_loop(
    client: reqwest::Client,
    base_url: String,
    uuid: String,
    shared: Arc<TunnelShared>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            message = out_rx.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        if shared.state() != TunnelState::Open {
            trace!("dropping send on non-open tunnel");
            continue;
        }

        // Everything queued while the previous POST was in flight rides
        // in this one.
        let mut body = first;
        while let Ok(more) = out_rx.try_recv() {
            body.push_str(&more);
        }
        shared.add_sent(body.len());

        let result = client
            .post(format!("{base_url}?write:{uuid}"))
            .header(CONTENT_TYPE, WRITE_CONTENT_TYPE)
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                close_post_open(&shared, status_from_response(&response));
                return;
            }
            Err(e) => {
                shared.close_with(Status::new(StatusCode::UpstreamError, e.to_string()));
                return;
            }
        }
    }
}
