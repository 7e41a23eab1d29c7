//! The top-level protocol client.
//!
//! Owns the tunnel, the display, the stream and object tables, the media
//! player registries, and the index pool. Incoming instructions are routed
//! through one dispatch table, and everything (tunnel events, unblocked
//! render tasks, keep-alive ticks) funnels through a single event loop:
//! `run` / `step` / `pump` are the only places shared state is touched.

mod object;

pub use object::{BodyCallback, GuacObject, ROOT_STREAM, STREAM_INDEX_MIMETYPE};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::audio::{AudioFormat, AudioPlayer, PcmSinkFactory, RawAudioPlayer};
use crate::config::ClientConfig;
use crate::display::{BitmapSlot, Display, TaskId};
use crate::error::GuacError;
use crate::instruction::Instruction;
use crate::parser::Parser;
use crate::pool::IndexPool;
use crate::status::{Status, StatusCode};
use crate::stream::{DataUriReader, InputStream, OutputStream};
use crate::surface::{DecodeCallback, LineCap, LineJoin, SurfaceFactory, TRANSFER_DEST, TRANSFER_SRC};
use crate::tunnel::{InstructionSender, Tunnel, TunnelEvent, TunnelEvents, TunnelState, TunnelStats};
use crate::video::VideoPlayer;

// ── ClientState ──────────────────────────────────────────────────

/// Connection lifecycle of the client.
///
/// ```text
///  Idle ──► Connecting ──► Waiting ──► Connected
///                │            │            │
///                ▼            ▼            ▼
///          Disconnected ◄── Disconnecting ◄┘
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Constructed, never connected.
    #[default]
    Idle = 0,
    /// The tunnel is being established.
    Connecting = 1,
    /// The tunnel is up; waiting for the server's first frame.
    Waiting = 2,
    /// Fully connected.
    Connected = 3,
    /// Graceful shutdown in progress.
    Disconnecting = 4,
    /// Terminal state.
    Disconnected = 5,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Idle,
            1 => ClientState::Connecting,
            2 => ClientState::Waiting,
            3 => ClientState::Connected,
            4 => ClientState::Disconnecting,
            _ => ClientState::Disconnected,
        }
    }

    /// Whether input events may be sent in this state.
    pub fn is_interactive(self) -> bool {
        matches!(self, ClientState::Waiting | ClientState::Connected)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Input events ─────────────────────────────────────────────────

/// Pointer state as sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseState {
    pub x: i32,
    pub y: i32,
    /// Button mask; see the `BUTTON_*` constants.
    pub buttons: u8,
}

impl MouseState {
    pub const BUTTON_LEFT: u8 = 0x01;
    pub const BUTTON_MIDDLE: u8 = 0x02;
    pub const BUTTON_RIGHT: u8 = 0x04;
    pub const SCROLL_UP: u8 = 0x08;
    pub const SCROLL_DOWN: u8 = 0x10;
}

// ── Handlers ─────────────────────────────────────────────────────

/// User callback slots. All run on the client's event loop.
#[derive(Default)]
pub struct ClientHandlers {
    pub on_state_change: Option<Box<dyn FnMut(ClientState) + Send>>,
    pub on_error: Option<Box<dyn FnMut(&Status) + Send>>,
    pub on_name: Option<Box<dyn FnMut(&str) + Send>>,
    pub on_sync: Option<Box<dyn FnMut(i64) + Send>>,
    pub on_clipboard: Option<Box<dyn FnMut(InputStream, &str) + Send>>,
    pub on_file: Option<Box<dyn FnMut(InputStream, &str, &str) + Send>>,
    pub on_pipe: Option<Box<dyn FnMut(InputStream, &str, &str) + Send>>,
    pub on_audio: Option<Box<dyn FnMut(&InputStream, &str) -> Option<Box<dyn AudioPlayer>> + Send>>,
    pub on_video:
        Option<Box<dyn FnMut(&InputStream, i32, &str) -> Option<Box<dyn VideoPlayer>> + Send>>,
    pub on_filesystem: Option<Box<dyn FnMut(GuacObject, &str) + Send>>,
}

// ── ClientHandle ─────────────────────────────────────────────────

/// Cheap cloneable handle exposing the input-event sends, for use outside
/// the task that owns the [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
    sender: InstructionSender,
    state: Arc<AtomicU8>,
}

impl ClientHandle {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Send a pointer event. Dropped unless connected.
    pub fn send_mouse_state(&self, mouse: &MouseState) {
        if !self.state().is_interactive() {
            return;
        }
        self.sender.send_elements([
            "mouse",
            &mouse.x.to_string(),
            &mouse.y.to_string(),
            &mouse.buttons.to_string(),
        ]);
    }

    /// Send a key event. `keysym` is an X11 keysym value.
    pub fn send_key(&self, keysym: u32, pressed: bool) {
        if !self.state().is_interactive() {
            return;
        }
        self.sender.send_elements([
            "key",
            &keysym.to_string(),
            if pressed { "1" } else { "0" },
        ]);
    }

    /// Announce a new optimal screen size.
    pub fn send_size(&self, width: u32, height: u32) {
        if !self.state().is_interactive() {
            return;
        }
        self.sender
            .send_elements(["size", &width.to_string(), &height.to_string()]);
    }
}

// ── Internal loop events ─────────────────────────────────────────

/// Completions posted back onto the client loop.
enum LoopEvent {
    /// A blocked render task's resource became ready.
    Unblock(TaskId),
    /// The frame flush for a `sync` finished.
    SyncComplete(i64),
    /// An `img` stream delivered its last blob.
    ImageStreamEnd(i32),
}

struct PendingImage {
    task: TaskId,
    slot: BitmapSlot,
    mimetype: String,
    reader: DataUriReader,
}

// ── Client ───────────────────────────────────────────────────────

/// Protocol client over one tunnel.
pub struct Client {
    tunnel: Box<dyn Tunnel>,
    sender: InstructionSender,
    events: TunnelEvents,
    display: Display,
    config: ClientConfig,
    state: Arc<AtomicU8>,
    handlers: ClientHandlers,

    pool: IndexPool,
    input_streams: HashMap<i32, InputStream>,
    output_streams: HashMap<i32, OutputStream>,
    objects: HashMap<i32, GuacObject>,
    audio_players: HashMap<i32, Box<dyn AudioPlayer>>,
    video_players: HashMap<i32, Box<dyn VideoPlayer>>,
    audio_sink_factory: Option<PcmSinkFactory>,

    /// Sub-parsers for `nest`, keyed by parser index.
    parsers: HashMap<i64, Parser>,
    /// Streamed images awaiting their end signal, keyed by stream index.
    pending_images: HashMap<i32, PendingImage>,

    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    loop_rx: mpsc::UnboundedReceiver<LoopEvent>,
    keepalive: Option<tokio::time::Interval>,

    /// Most recent server timestamp, echoed by the keep-alive.
    last_received_ts: i64,
    /// Timestamp of the last sync echoed back to the server.
    last_echoed_ts: i64,
    /// Deferred shutdown; the payload says whether to send `disconnect`.
    pending_disconnect: Option<bool>,
}

impl Client {
    /// Create a client over the given tunnel, drawing through surfaces
    /// from `factory`.
    pub fn new(
        mut tunnel: Box<dyn Tunnel>,
        factory: Box<dyn SurfaceFactory>,
        config: ClientConfig,
    ) -> Result<Self, GuacError> {
        let events = tunnel.take_events().ok_or(GuacError::ChannelClosed)?;
        let sender = tunnel.sender();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();

        Ok(Self {
            tunnel,
            sender,
            events,
            display: Display::new(factory),
            config,
            state: Arc::new(AtomicU8::new(ClientState::Idle as u8)),
            handlers: ClientHandlers::default(),
            pool: IndexPool::new(),
            input_streams: HashMap::new(),
            output_streams: HashMap::new(),
            objects: HashMap::new(),
            audio_players: HashMap::new(),
            video_players: HashMap::new(),
            audio_sink_factory: None,
            parsers: HashMap::new(),
            pending_images: HashMap::new(),
            loop_tx,
            loop_rx,
            keepalive: None,
            last_received_ts: 0,
            last_echoed_ts: 0,
            pending_disconnect: None,
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut Display {
        &mut self.display
    }

    /// User callback slots.
    pub fn handlers_mut(&mut self) -> &mut ClientHandlers {
        &mut self.handlers
    }

    /// Handle for sending input events from other tasks.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            sender: self.sender.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Transport counters.
    pub fn tunnel_stats(&self) -> TunnelStats {
        self.tunnel.stats()
    }

    /// Enable the built-in raw audio player by supplying a sink factory.
    pub fn register_audio_sink(&mut self, factory: PcmSinkFactory) {
        self.audio_sink_factory = Some(factory);
    }

    /// Look up a named object by index.
    pub fn object(&self, index: i32) -> Option<&GuacObject> {
        self.objects.get(&index)
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state() == state {
            return;
        }
        debug!(%state, "client state change");
        self.state.store(state as u8, Ordering::SeqCst);
        if let Some(on_state_change) = self.handlers.on_state_change.as_mut() {
            on_state_change(state);
        }
    }

    fn fire_error(&mut self, status: &Status) {
        if let Some(on_error) = self.handlers.on_error.as_mut() {
            on_error(status);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect, passing the opaque handshake data to the tunnel.
    pub async fn connect(&mut self, data: &str) -> Result<(), GuacError> {
        if self.state() != ClientState::Idle {
            return Err(GuacError::Other("client already connected".into()));
        }
        self.set_state(ClientState::Connecting);

        match self.tunnel.connect(data).await {
            Ok(()) => {
                let period = self.config.keepalive_interval();
                self.keepalive = Some(tokio::time::interval_at(
                    tokio::time::Instant::now() + period,
                    period,
                ));
                self.set_state(ClientState::Waiting);
                Ok(())
            }
            Err(e) => {
                // The tunnel reported its own failure through the event
                // channel; deliver those callbacks before going terminal.
                while let Ok(event) = self.events.try_recv() {
                    self.handle_tunnel_event(event);
                }
                self.set_state(ClientState::Disconnected);
                Err(e)
            }
        }
    }

    /// Gracefully disconnect: sends `disconnect`, closes the tunnel, and
    /// drops pending frames without painting them.
    pub async fn disconnect(&mut self) {
        self.shutdown(true).await;
    }

    /// Run the event loop until disconnected.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    /// Await and handle one event. Returns `false` once disconnected.
    pub async fn step(&mut self) -> bool {
        if self.state() == ClientState::Disconnected {
            return false;
        }

        enum Arm {
            Loop(LoopEvent),
            Tunnel(TunnelEvent),
            Tick,
            Lost,
        }

        let arm = tokio::select! {
            biased;
            event = self.loop_rx.recv() => event.map(Arm::Loop).unwrap_or(Arm::Lost),
            event = self.events.recv() => event.map(Arm::Tunnel).unwrap_or(Arm::Lost),
            _ = keepalive_tick(&mut self.keepalive) => Arm::Tick,
        };

        match arm {
            Arm::Loop(event) => self.handle_loop_event(event),
            Arm::Tunnel(event) => self.handle_tunnel_event(event),
            Arm::Tick => self.send_keepalive(),
            Arm::Lost => {
                self.display.drop_pending();
                self.set_state(ClientState::Disconnected);
            }
        }

        if let Some(send_op) = self.pending_disconnect.take() {
            self.shutdown(send_op).await;
        }
        self.state() != ClientState::Disconnected
    }

    /// Handle everything already queued without waiting for more.
    pub async fn pump(&mut self) {
        loop {
            if let Ok(event) = self.loop_rx.try_recv() {
                self.handle_loop_event(event);
            } else if let Ok(event) = self.events.try_recv() {
                self.handle_tunnel_event(event);
            } else {
                break;
            }
            if let Some(send_op) = self.pending_disconnect.take() {
                self.shutdown(send_op).await;
                break;
            }
        }
    }

    async fn shutdown(&mut self, send_disconnect: bool) {
        if matches!(
            self.state(),
            ClientState::Disconnected | ClientState::Disconnecting
        ) {
            return;
        }
        self.set_state(ClientState::Disconnecting);
        if send_disconnect {
            self.sender.send_elements(["disconnect"]);
        }
        self.keepalive = None;
        self.tunnel.disconnect().await;
        self.display.drop_pending();
        self.set_state(ClientState::Disconnected);
    }

    fn send_keepalive(&mut self) {
        if self.state().is_interactive() {
            self.sender
                .send_elements(["sync", &self.last_received_ts.to_string()]);
        }
    }

    // ── Event handling ───────────────────────────────────────────

    fn handle_tunnel_event(&mut self, event: TunnelEvent) {
        match event {
            TunnelEvent::Instruction(instruction) => {
                if let Err(e) = self.dispatch(instruction) {
                    // Malformed parameters spoil one instruction, not the
                    // connection.
                    warn!("ignoring malformed instruction: {e}");
                }
            }
            TunnelEvent::Error(status) => {
                self.fire_error(&status);
            }
            TunnelEvent::State(TunnelState::Closed) => {
                if self.state() != ClientState::Disconnected {
                    self.keepalive = None;
                    self.display.drop_pending();
                    self.set_state(ClientState::Disconnected);
                }
            }
            TunnelEvent::State(state) => trace!(%state, "tunnel state change"),
        }
    }

    fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Unblock(task) => {
                self.display.unblock(task);
            }
            LoopEvent::SyncComplete(timestamp) => {
                for player in self.audio_players.values_mut() {
                    player.sync();
                }
                for player in self.video_players.values_mut() {
                    player.sync();
                }
                if timestamp != self.last_echoed_ts {
                    self.last_echoed_ts = timestamp;
                    self.sender
                        .send_elements(["sync", &timestamp.to_string()]);
                }
                if let Some(on_sync) = self.handlers.on_sync.as_mut() {
                    on_sync(timestamp);
                }
            }
            LoopEvent::ImageStreamEnd(index) => self.finish_image_stream(index),
        }
    }

    // ── Outbound stream API ──────────────────────────────────────

    fn create_output_stream(&mut self) -> OutputStream {
        let index = self.pool.next();
        let stream = OutputStream::new(index, self.sender.clone());
        self.output_streams.insert(index, stream.clone());
        stream
    }

    /// Open a clipboard stream toward the server.
    pub fn create_clipboard_stream(&mut self, mimetype: &str) -> OutputStream {
        let stream = self.create_output_stream();
        self.sender
            .send_elements(["clipboard", &stream.index().to_string(), mimetype]);
        stream
    }

    /// Open a file upload stream.
    pub fn create_file_stream(&mut self, mimetype: &str, filename: &str) -> OutputStream {
        let stream = self.create_output_stream();
        self.sender.send_elements([
            "file",
            &stream.index().to_string(),
            mimetype,
            filename,
        ]);
        stream
    }

    /// Open a named pipe stream.
    pub fn create_pipe_stream(&mut self, mimetype: &str, name: &str) -> OutputStream {
        let stream = self.create_output_stream();
        self.sender
            .send_elements(["pipe", &stream.index().to_string(), mimetype, name]);
        stream
    }

    /// Open an output stream into a named object (`put`).
    pub fn create_object_output_stream(
        &mut self,
        object: i32,
        mimetype: &str,
        name: &str,
    ) -> OutputStream {
        let stream = self.create_output_stream();
        self.sender.send_elements([
            "put",
            &object.to_string(),
            &stream.index().to_string(),
            mimetype,
            name,
        ]);
        stream
    }

    // ── Dispatch ─────────────────────────────────────────────────

    fn dispatch(&mut self, ins: Instruction) -> Result<(), GuacError> {
        match ins.opcode() {
            // Drawing.
            "arc" => {
                self.display.arc(
                    ins.layer_arg(0)?,
                    ins.float_arg(1)?,
                    ins.float_arg(2)?,
                    ins.float_arg(3)?,
                    ins.float_arg(4)?,
                    ins.float_arg(5)?,
                    ins.int_arg(6)? != 0,
                );
            }
            "cfill" => {
                let mask = ins.int_arg(0)? as u8;
                let layer = ins.layer_arg(1)?;
                self.display.set_channel_mask(layer, mask);
                self.display.fill_color(
                    layer,
                    ins.int_arg(2)? as u8,
                    ins.int_arg(3)? as u8,
                    ins.int_arg(4)? as u8,
                    ins.int_arg(5)? as u8,
                );
            }
            "clip" => self.display.clip(ins.layer_arg(0)?),
            "close" => self.display.close_path(ins.layer_arg(0)?),
            "copy" => {
                let mask = ins.int_arg(5)? as u8;
                let dst = ins.layer_arg(6)?;
                self.display.set_channel_mask(dst, mask);
                self.display.copy(
                    ins.layer_arg(0)?,
                    ins.int_arg(1)?.max(0) as u32,
                    ins.int_arg(2)?.max(0) as u32,
                    ins.int_arg(3)?.max(0) as u32,
                    ins.int_arg(4)?.max(0) as u32,
                    dst,
                    ins.float_arg(7)?,
                    ins.float_arg(8)?,
                );
            }
            "cstroke" => {
                let mask = ins.int_arg(0)? as u8;
                let layer = ins.layer_arg(1)?;
                self.display.set_channel_mask(layer, mask);
                self.display.stroke_color(
                    layer,
                    LineCap::from_index(ins.int_arg(2)?)?,
                    LineJoin::from_index(ins.int_arg(3)?)?,
                    ins.float_arg(4)?,
                    ins.int_arg(5)? as u8,
                    ins.int_arg(6)? as u8,
                    ins.int_arg(7)? as u8,
                    ins.int_arg(8)? as u8,
                );
            }
            "cursor" => {
                self.display.set_cursor(
                    ins.int_arg(0)? as i32,
                    ins.int_arg(1)? as i32,
                    ins.layer_arg(2)?,
                    ins.int_arg(3)?.max(0) as u32,
                    ins.int_arg(4)?.max(0) as u32,
                    ins.int_arg(5)?.max(0) as u32,
                    ins.int_arg(6)?.max(0) as u32,
                );
            }
            "curve" => {
                self.display.curve_to(
                    ins.layer_arg(0)?,
                    ins.float_arg(1)?,
                    ins.float_arg(2)?,
                    ins.float_arg(3)?,
                    ins.float_arg(4)?,
                    ins.float_arg(5)?,
                    ins.float_arg(6)?,
                );
            }
            "dispose" => self.display.dispose(ins.layer_arg(0)?),
            "distort" => {
                self.display.distort(
                    ins.layer_arg(0)?,
                    [
                        ins.float_arg(1)?,
                        ins.float_arg(2)?,
                        ins.float_arg(3)?,
                        ins.float_arg(4)?,
                        ins.float_arg(5)?,
                        ins.float_arg(6)?,
                    ],
                );
            }
            "identity" => {
                self.display
                    .set_transform(ins.layer_arg(0)?, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0);
            }
            "img" => self.handle_img(&ins)?,
            "jpeg" => self.handle_inline_image(&ins, "image/jpeg")?,
            "lfill" => {
                let mask = ins.int_arg(0)? as u8;
                let layer = ins.layer_arg(1)?;
                self.display.set_channel_mask(layer, mask);
                self.display.fill_pattern(layer, ins.layer_arg(2)?);
            }
            "line" => {
                self.display
                    .line_to(ins.layer_arg(0)?, ins.float_arg(1)?, ins.float_arg(2)?);
            }
            "lstroke" => {
                let mask = ins.int_arg(0)? as u8;
                let layer = ins.layer_arg(1)?;
                self.display.set_channel_mask(layer, mask);
                self.display.stroke_pattern(
                    layer,
                    LineCap::from_index(ins.int_arg(2)?)?,
                    LineJoin::from_index(ins.int_arg(3)?)?,
                    ins.float_arg(4)?,
                    ins.layer_arg(5)?,
                );
            }
            "mouse" => {
                // Server-side pointer movement.
                self.display
                    .move_cursor(ins.int_arg(0)? as i32, ins.int_arg(1)? as i32);
            }
            "move" => {
                self.display.move_layer(
                    ins.layer_arg(0)?,
                    ins.layer_arg(1)?,
                    ins.int_arg(2)? as i32,
                    ins.int_arg(3)? as i32,
                    ins.int_arg(4)? as i32,
                );
            }
            "png" => self.handle_inline_image(&ins, "image/png")?,
            "pop" => self.display.pop(ins.layer_arg(0)?),
            "push" => self.display.push(ins.layer_arg(0)?),
            "rect" => {
                self.display.rect(
                    ins.layer_arg(0)?,
                    ins.float_arg(1)?,
                    ins.float_arg(2)?,
                    ins.float_arg(3)?,
                    ins.float_arg(4)?,
                );
            }
            "reset" => self.display.reset(ins.layer_arg(0)?),
            "set" => {
                let layer = ins.layer_arg(0)?;
                match ins.arg(1)? {
                    "miter-limit" => self.display.set_miter_limit(layer, ins.float_arg(2)?),
                    other => trace!(property = other, "unknown layer property ignored"),
                }
            }
            "shade" => {
                let alpha = ins.int_arg(1)?.clamp(0, 255) as u8;
                self.display.shade(ins.layer_arg(0)?, alpha);
            }
            "size" => {
                self.display.resize(
                    ins.layer_arg(0)?,
                    ins.int_arg(1)?.max(0) as u32,
                    ins.int_arg(2)?.max(0) as u32,
                );
            }
            "start" => {
                self.display
                    .move_to(ins.layer_arg(0)?, ins.float_arg(1)?, ins.float_arg(2)?);
            }
            "transfer" => self.handle_transfer(&ins)?,
            "transform" => {
                self.display.transform(
                    ins.layer_arg(0)?,
                    ins.float_arg(1)?,
                    ins.float_arg(2)?,
                    ins.float_arg(3)?,
                    ins.float_arg(4)?,
                    ins.float_arg(5)?,
                    ins.float_arg(6)?,
                );
            }

            // Control.
            "disconnect" => {
                debug!("server requested disconnect");
                self.pending_disconnect = Some(false);
            }
            "error" => {
                let reason = ins.arg(0)?.to_string();
                let code = ins.int_arg(1)? as i32;
                let status = Status::from_raw(code, Some(reason));
                self.fire_error(&status);
                self.pending_disconnect = Some(true);
            }
            "name" => {
                let name = ins.arg(0)?.to_string();
                if let Some(on_name) = self.handlers.on_name.as_mut() {
                    on_name(&name);
                }
            }
            "nest" => self.handle_nest(&ins)?,
            "sync" => self.handle_sync(&ins)?,

            // Streams.
            "ack" => self.handle_ack(&ins)?,
            "audio" => self.handle_audio(&ins)?,
            "blob" => {
                let index = ins.layer_arg(0)?;
                match self.input_streams.get(&index) {
                    Some(stream) => stream.deliver_blob(ins.arg(1)?),
                    None => trace!(stream = index, "blob for unknown stream dropped"),
                }
            }
            "clipboard" => {
                let stream = self.create_input_stream(ins.layer_arg(0)?);
                let mimetype = ins.arg(1)?.to_string();
                match self.handlers.on_clipboard.as_mut() {
                    Some(on_clipboard) => on_clipboard(stream, &mimetype),
                    None => Self::reject_stream(
                        &mut self.input_streams,
                        stream,
                        "Clipboard unsupported",
                    ),
                }
            }
            "end" => {
                let index = ins.layer_arg(0)?;
                if let Some(stream) = self.input_streams.remove(&index) {
                    stream.deliver_end();
                }
            }
            "file" => {
                let stream = self.create_input_stream(ins.layer_arg(0)?);
                let mimetype = ins.arg(1)?.to_string();
                let filename = ins.arg(2)?.to_string();
                match self.handlers.on_file.as_mut() {
                    Some(on_file) => on_file(stream, &mimetype, &filename),
                    None => Self::reject_stream(
                        &mut self.input_streams,
                        stream,
                        "File transfer unsupported",
                    ),
                }
            }
            "pipe" => {
                let stream = self.create_input_stream(ins.layer_arg(0)?);
                let mimetype = ins.arg(1)?.to_string();
                let name = ins.arg(2)?.to_string();
                match self.handlers.on_pipe.as_mut() {
                    Some(on_pipe) => on_pipe(stream, &mimetype, &name),
                    None => Self::reject_stream(
                        &mut self.input_streams,
                        stream,
                        "Named pipes unsupported",
                    ),
                }
            }
            "video" => self.handle_video(&ins)?,

            // Named objects.
            "body" => {
                let object_index = ins.layer_arg(0)?;
                let stream = self.create_input_stream(ins.layer_arg(1)?);
                let mimetype = ins.arg(2)?.to_string();
                let name = ins.arg(3)?.to_string();
                match self.objects.get(&object_index).cloned() {
                    Some(object) => object.handle_body(stream, mimetype, name),
                    None => {
                        trace!(object = object_index, "body for unknown object dropped");
                        self.input_streams.remove(&stream.index());
                    }
                }
            }
            "filesystem" => {
                let index = ins.layer_arg(0)?;
                let name = ins.arg(1)?.to_string();
                let object = GuacObject::new(index, self.sender.clone());
                self.objects.insert(index, object.clone());
                if let Some(on_filesystem) = self.handlers.on_filesystem.as_mut() {
                    on_filesystem(object, &name);
                }
            }
            "undefine" => {
                let index = ins.layer_arg(0)?;
                if let Some(object) = self.objects.remove(&index) {
                    object.handle_undefine();
                }
            }

            // Forward compatibility: unknown opcodes are ignored.
            other => trace!(opcode = other, "unknown opcode ignored"),
        }
        Ok(())
    }

    // ── Stream helpers ───────────────────────────────────────────

    fn create_input_stream(&mut self, index: i32) -> InputStream {
        let stream = InputStream::new(index, self.sender.clone());
        self.input_streams.insert(index, stream.clone());
        stream
    }

    /// Ack a channel the client cannot consume and drop its stream.
    ///
    /// Takes the table rather than `self` so callers can hold a handler
    /// borrow in the other match arm.
    fn reject_stream(
        input_streams: &mut HashMap<i32, InputStream>,
        stream: InputStream,
        message: &str,
    ) {
        debug!(stream = stream.index(), message, "rejecting stream");
        stream.ack(message, StatusCode::Unsupported as i32);
        input_streams.remove(&stream.index());
    }

    fn handle_ack(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let index = ins.layer_arg(0)?;
        let message = ins.arg(1)?.to_string();
        let code = ins.int_arg(2)? as i32;
        let status = Status::from_raw(code, Some(message));

        if let Some(stream) = self.output_streams.get(&index) {
            stream.deliver_ack(&status);
            // An error-class ack destroys the stream and frees its index.
            if status.is_error() {
                self.output_streams.remove(&index);
                self.pool.free(index);
            }
        }
        Ok(())
    }

    fn handle_audio(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let index = ins.layer_arg(0)?;
        let mimetype = ins.arg(1)?.to_string();
        let stream = self.create_input_stream(index);

        let mut player = match self.handlers.on_audio.as_mut() {
            Some(on_audio) => on_audio(&stream, &mimetype),
            None => None,
        };

        if player.is_none() {
            if let Some(factory) = self.audio_sink_factory.as_mut() {
                if let Ok(format) = AudioFormat::parse(&mimetype) {
                    let sink = factory(&format);
                    match RawAudioPlayer::attach(&stream, &mimetype, sink) {
                        Ok(raw) => player = Some(Box::new(raw) as Box<dyn AudioPlayer>),
                        Err(e) => debug!("built-in audio player rejected stream: {e}"),
                    }
                }
            }
        }

        match player {
            Some(player) => {
                self.audio_players.insert(index, player);
                stream.ack("OK", StatusCode::Success as i32);
            }
            None => {
                stream.ack("BAD TYPE", StatusCode::ClientBadType as i32);
                self.input_streams.remove(&index);
            }
        }
        Ok(())
    }

    fn handle_video(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let index = ins.layer_arg(0)?;
        let layer = ins.layer_arg(1)?;
        let mimetype = ins.arg(2)?.to_string();
        let stream = self.create_input_stream(index);

        let player = match self.handlers.on_video.as_mut() {
            Some(on_video) => on_video(&stream, layer, &mimetype),
            None => None,
        };

        match player {
            Some(player) => {
                self.video_players.insert(index, player);
                stream.ack("OK", StatusCode::Success as i32);
            }
            None => {
                // No built-in video decoding exists.
                stream.ack("BAD TYPE", StatusCode::ClientBadType as i32);
                self.input_streams.remove(&index);
            }
        }
        Ok(())
    }

    // ── Image handling ───────────────────────────────────────────

    /// `png` / `jpeg`: image data inline, drawn through a blocked task
    /// unblocked when decoding finishes.
    fn handle_inline_image(&mut self, ins: &Instruction, mimetype: &str) -> Result<(), GuacError> {
        let mask = ins.int_arg(0)? as u8;
        let layer = ins.layer_arg(1)?;
        let x = ins.float_arg(2)?;
        let y = ins.float_arg(3)?;
        let data64 = ins.arg(4)?;

        self.display.set_channel_mask(layer, mask);
        let (task, slot) = self.display.draw_image_deferred(layer, x, y);

        let bytes = match BASE64.decode(data64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("undecodable {mimetype} payload: {e}");
                self.display.unblock(task);
                return Ok(());
            }
        };

        let done = self.decode_completion(task, slot);
        self.display.decode_image(mimetype, bytes, done);
        Ok(())
    }

    /// `img`: image data streamed, accumulated as a data URI, decoded and
    /// drawn once the stream ends.
    fn handle_img(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let index = ins.layer_arg(0)?;
        let mask = ins.int_arg(1)? as u8;
        let layer = ins.layer_arg(2)?;
        let mimetype = ins.arg(3)?.to_string();
        let x = ins.float_arg(4)?;
        let y = ins.float_arg(5)?;

        let stream = self.create_input_stream(index);
        let reader = DataUriReader::attach(&stream, &mimetype);

        self.display.set_channel_mask(layer, mask);
        let (task, slot) = self.display.draw_image_deferred(layer, x, y);

        let loop_tx = self.loop_tx.clone();
        reader.on_end(move || {
            let _ = loop_tx.send(LoopEvent::ImageStreamEnd(index));
        });

        self.pending_images.insert(
            index,
            PendingImage {
                task,
                slot,
                mimetype,
                reader,
            },
        );
        Ok(())
    }

    fn finish_image_stream(&mut self, index: i32) {
        let Some(pending) = self.pending_images.remove(&index) else {
            return;
        };
        match pending.reader.decode_payload() {
            Ok(bytes) => {
                let done = self.decode_completion(pending.task, pending.slot);
                self.display.decode_image(&pending.mimetype, bytes, done);
            }
            Err(e) => {
                warn!("undecodable image stream {index}: {e}");
                self.display.unblock(pending.task);
            }
        }
    }

    /// A decode callback that deposits the bitmap and reposts the unblock
    /// onto this client's loop.
    fn decode_completion(&self, task: TaskId, slot: BitmapSlot) -> DecodeCallback {
        let loop_tx = self.loop_tx.clone();
        Box::new(move |result| {
            match result {
                Ok(bitmap) => *slot.lock().expect("bitmap slot poisoned") = Some(bitmap),
                Err(e) => warn!("image decode failed: {e}"),
            }
            let _ = loop_tx.send(LoopEvent::Unblock(task));
        })
    }

    // ── Transfer / sync / nest ───────────────────────────────────

    fn handle_transfer(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let src = ins.layer_arg(0)?;
        let sx = ins.int_arg(1)?.max(0) as u32;
        let sy = ins.int_arg(2)?.max(0) as u32;
        let w = ins.int_arg(3)?.max(0) as u32;
        let h = ins.int_arg(4)?.max(0) as u32;
        let function = ins.int_arg(5)? as u8;
        let dst = ins.layer_arg(6)?;
        let dx = ins.int_arg(7)?.max(0) as u32;
        let dy = ins.int_arg(8)?.max(0) as u32;

        match function & 0xF {
            // SRC is a plain overwrite.
            TRANSFER_SRC => self.display.put(src, sx, sy, w, h, dst, dx, dy),
            // DEST leaves the destination untouched.
            TRANSFER_DEST => {}
            function => self
                .display
                .transfer(src, sx, sy, w, h, dst, dx, dy, function),
        }
        Ok(())
    }

    fn handle_sync(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let timestamp = ins.int_arg(0)?;
        self.last_received_ts = timestamp;

        if self.state() == ClientState::Waiting {
            self.set_state(ClientState::Connected);
        }

        let loop_tx = self.loop_tx.clone();
        self.display.flush(Some(Box::new(move || {
            let _ = loop_tx.send(LoopEvent::SyncComplete(timestamp));
        })));
        Ok(())
    }

    fn handle_nest(&mut self, ins: &Instruction) -> Result<(), GuacError> {
        let index = ins.int_arg(0)?;
        let data = ins.arg(1)?.to_string();

        let mut parser = self.parsers.remove(&index).unwrap_or_default();
        parser.feed(data.as_bytes());

        let mut nested = Vec::new();
        loop {
            match parser.next_instruction() {
                Ok(Some(instruction)) => nested.push(instruction),
                Ok(None) => break,
                Err(e) => {
                    // A framing violation inside a nest is as fatal as one
                    // on the wire.
                    let status = Status::new(StatusCode::ServerError, e.to_string());
                    self.fire_error(&status);
                    self.pending_disconnect = Some(true);
                    return Ok(());
                }
            }
        }
        self.parsers.insert(index, parser);

        // Nested instructions are indistinguishable from top-level ones.
        for instruction in nested {
            if let Err(e) = self.dispatch(instruction) {
                warn!("ignoring malformed nested instruction: {e}");
            }
        }
        Ok(())
    }
}

/// Completes on the keep-alive interval while one is armed.
async fn keepalive_tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
