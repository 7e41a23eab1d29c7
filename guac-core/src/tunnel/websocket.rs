//! Websocket tunnel.
//!
//! A single websocket connection using the `"guacamole"` subprotocol. The
//! opaque handshake payload travels in the query string of the upgrade
//! request; every incoming text frame is fed through the instruction
//! parser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TunnelConfig;
use crate::error::GuacError;
use crate::parser::Parser;
use crate::status::{Status, StatusCode};

use super::{
    InstructionSender, Tunnel, TunnelEvents, TunnelShared, TunnelState, TunnelStats,
};

/// Subprotocol requested during the websocket upgrade.
const SUBPROTOCOL: &str = "guacamole";

/// Tunnel over a single websocket connection.
pub struct WebSocketTunnel {
    url: String,
    config: TunnelConfig,
    shared: Arc<TunnelShared>,
    events_rx: Option<TunnelEvents>,
    out_tx: mpsc::UnboundedSender<String>,
    out_rx: Option<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketTunnel {
    /// Create an unconnected tunnel targeting a `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>, config: TunnelConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            config,
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
impl Tunnel for WebSocketTunnel {
    async fn connect(&mut self, data: &str) -> Result<(), GuacError> {
        let Some(out_rx) = self.out_rx.take() else {
            return Err(GuacError::Other("tunnel already connected".into()));
        };

        let full_url = if data.is_empty() {
            self.url.clone()
        } else {
            format!("{}?{data}", self.url)
        };

        let mut request = full_url
            .into_client_request()
            .map_err(|e| GuacError::Transport(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let websocket = match connect_async(request).await {
            Ok((websocket, _response)) => websocket,
            Err(e) => {
                self.shared
                    .close_with(Status::new(StatusCode::ServerError, e.to_string()));
                return Err(GuacError::Transport(e.to_string()));
            }
        };

        debug!(url = %self.url, "websocket established");
        self.shared.set_state(TunnelState::Open);

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let receive_timeout = self.config.receive_timeout();
        self.driver = Some(tokio::spawn(async move {
            drive(websocket, shared, out_rx, cancel, receive_timeout).await;
        }));

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

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Driver task: pumps the socket in both directions until close, error,
/// timeout, or cancellation.
async fn drive(
    websocket: WsStream,
    shared: Arc<TunnelShared>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    receive_timeout: Duration,
) {
    let (mut sink, mut stream) = websocket.split();
    let mut parser = Parser::new();
    let mut deadline = Instant::now() + receive_timeout;
    let mut outbound_open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                shared.close_with(Status::from_code(StatusCode::Success));
                break;
            }

            _ = tokio::time::sleep_until(deadline) => {
                shared.close_timeout();
                break;
            }

            out = out_rx.recv(), if outbound_open => {
                match out {
                    Some(text) if shared.state() == TunnelState::Open => {
                        shared.add_sent(text.len());
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            shared.close_with(Status::new(StatusCode::ServerError, e.to_string()));
                            break;
                        }
                    }
                    Some(_) => trace!("dropping send on non-open tunnel"),
                    None => outbound_open = false,
                }
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        deadline = Instant::now() + receive_timeout;
                        if let Err(e) = shared.ingest(&mut parser, text.as_bytes()) {
                            shared.close_with(Status::new(StatusCode::ServerError, e.to_string()));
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        deadline = Instant::now() + receive_timeout;
                        if let Err(e) = shared.ingest(&mut parser, &bytes) {
                            shared.close_with(Status::new(StatusCode::ServerError, e.to_string()));
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let status = frame
                            .map(|f| Status::from_websocket_close(u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| Status::from_code(StatusCode::Success));
                        debug!(%status, "websocket closed by peer");
                        shared.close_with(status);
                        break;
                    }
                    Some(Ok(_ping_pong)) => {
                        deadline = Instant::now() + receive_timeout;
                    }
                    Some(Err(e)) => {
                        shared.close_with(Status::new(StatusCode::ServerError, e.to_string()));
                        break;
                    }
                    None => {
                        shared.close_with(Status::new(
                            StatusCode::ServerError,
                            "websocket connection lost",
                        ));
                        break;
                    }
                }
            }
        }
    }
}
