//! Shared test doubles: a scriptable mock tunnel and a recording surface
//! factory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use guac_core::error::GuacError;
use guac_core::instruction::Instruction;
use guac_core::parser::Parser;
use guac_core::status::Status;
use guac_core::surface::{
    Bitmap, CompositeOp, DecodeCallback, LineCap, LineJoin, Surface, SurfaceFactory,
};
use guac_core::tunnel::{
    InstructionSender, Tunnel, TunnelEvent, TunnelEvents, TunnelState, TunnelStats,
};

// ── MockTunnel ───────────────────────────────────────────────────

/// What the mock does when `connect` is called.
pub struct MockScript {
    /// Emit `State(Open)` on successful connect.
    pub open_on_connect: bool,
    /// Events queued right after connect.
    pub events: Vec<TunnelEvent>,
    /// Fail the connect call itself.
    pub fail_connect: Option<String>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            open_on_connect: true,
            events: Vec::new(),
            fail_connect: None,
        }
    }
}

/// Scriptable in-memory tunnel.
pub struct MockTunnel {
    script: MockScript,
    state: Arc<Mutex<TunnelState>>,
    events_tx: mpsc::UnboundedSender<TunnelEvent>,
    events_rx: Option<TunnelEvents>,
    out_tx: mpsc::UnboundedSender<String>,
    out_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    pub connect_called: Arc<AtomicBool>,
    pub connect_data: Arc<Mutex<Option<String>>>,
}

impl MockTunnel {
    pub fn new(script: MockScript) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            script,
            state: Arc::new(Mutex::new(TunnelState::Connecting)),
            events_tx,
            events_rx: Some(events_rx),
            out_tx,
            out_rx: Arc::new(Mutex::new(out_rx)),
            connect_called: Arc::new(AtomicBool::new(false)),
            connect_data: Arc::new(Mutex::new(None)),
        }
    }

    /// Remote-side handle: inject events as if the server produced them.
    pub fn remote(&self) -> MockRemote {
        MockRemote {
            events_tx: self.events_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Log of everything sent through the tunnel, drained on demand.
    pub fn sent(&self) -> SentLog {
        SentLog {
            rx: Arc::clone(&self.out_rx),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn connect(&mut self, data: &str) -> Result<(), GuacError> {
        self.connect_called.store(true, Ordering::SeqCst);
        *self.connect_data.lock().unwrap() = Some(data.to_string());

        if let Some(message) = self.script.fail_connect.take() {
            *self.state.lock().unwrap() = TunnelState::Closed;
            return Err(GuacError::Transport(message));
        }

        if self.script.open_on_connect {
            *self.state.lock().unwrap() = TunnelState::Open;
            let _ = self.events_tx.send(TunnelEvent::State(TunnelState::Open));
        }
        for event in self.script.events.drain(..) {
            let _ = self.events_tx.send(event);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock().unwrap();
        if *state != TunnelState::Closed {
            *state = TunnelState::Closed;
            let _ = self.events_tx.send(TunnelEvent::State(TunnelState::Closed));
        }
    }

    fn sender(&self) -> InstructionSender {
        InstructionSender::new(self.out_tx.clone())
    }

    fn take_events(&mut self) -> Option<TunnelEvents> {
        self.events_rx.take()
    }

    fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    fn stats(&self) -> TunnelStats {
        TunnelStats::default()
    }
}

/// Server-side handle over a [`MockTunnel`].
#[derive(Clone)]
pub struct MockRemote {
    events_tx: mpsc::UnboundedSender<TunnelEvent>,
    state: Arc<Mutex<TunnelState>>,
}

impl MockRemote {
    /// Feed wire text, emitting each complete instruction.
    pub fn send_wire(&self, wire: &str) {
        let mut parser = Parser::new();
        parser.feed(wire.as_bytes());
        while let Some(instruction) = parser.next_instruction().expect("test wire must be valid") {
            let _ = self.events_tx.send(TunnelEvent::Instruction(instruction));
        }
    }

    pub fn send_instruction(&self, instruction: Instruction) {
        let _ = self.events_tx.send(TunnelEvent::Instruction(instruction));
    }

    pub fn error(&self, status: Status) {
        let _ = self.events_tx.send(TunnelEvent::Error(status));
    }

    pub fn close(&self) {
        *self.state.lock().unwrap() = TunnelState::Closed;
        let _ = self.events_tx.send(TunnelEvent::State(TunnelState::Closed));
    }
}

/// Drains and accumulates the tunnel's outbound instructions.
#[derive(Clone)]
pub struct SentLog {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl SentLog {
    pub fn drain(&self) -> Vec<String> {
        let mut rx = self.rx.lock().unwrap();
        let mut log = self.log.lock().unwrap();
        while let Ok(sent) = rx.try_recv() {
            log.push(sent);
        }
        log.clone()
    }

    pub fn contains(&self, wire: &str) -> bool {
        self.drain().iter().any(|sent| sent == wire)
    }
}

// ── Recording surfaces ───────────────────────────────────────────

/// Factory producing recording surfaces and holding image decodes until
/// the test completes them.
#[derive(Clone)]
pub struct TestFactory {
    pub ops: Arc<Mutex<Vec<String>>>,
    pub decodes: Arc<Mutex<Vec<DecodeCallback>>>,
    next_id: Arc<Mutex<u32>>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
            decodes: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(Mutex::new(0)),
        }
    }

    pub fn pending_decodes(&self) -> usize {
        self.decodes.lock().unwrap().len()
    }

    /// Complete the oldest pending decode with a 1×1 bitmap.
    pub fn complete_decode(&self) {
        let done = self.decodes.lock().unwrap().remove(0);
        let bitmap = Bitmap::new(1, 1, vec![0, 0, 0, 255]).unwrap();
        done(Ok(bitmap));
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn op_count(&self, needle: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| op.contains(needle))
            .count()
    }
}

impl SurfaceFactory for TestFactory {
    fn create_surface(&mut self, width: u32, height: u32) -> Box<dyn Surface> {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        Box::new(TestSurface {
            id,
            width,
            height,
            ops: Arc::clone(&self.ops),
        })
    }

    fn decode_image(&mut self, _mimetype: &str, _data: Vec<u8>, done: DecodeCallback) {
        self.decodes.lock().unwrap().push(done);
    }
}

/// Surface that records operation names tagged with its surface id.
pub struct TestSurface {
    id: u32,
    width: u32,
    height: u32,
    ops: Arc<Mutex<Vec<String>>>,
}

impl TestSurface {
    fn record(&self, op: &str) {
        self.ops.lock().unwrap().push(format!("s{}:{op}", self.id));
    }
}

impl Surface for TestSurface {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn resize(&mut self, width: u32, height: u32) {
        self.record(&format!("resize {width}x{height}"));
        self.width = width;
        self.height = height;
    }
    fn begin_path(&mut self) {
        self.record("begin_path");
    }
    fn move_to(&mut self, x: f64, y: f64) {
        self.record(&format!("move_to {x} {y}"));
    }
    fn line_to(&mut self, x: f64, y: f64) {
        self.record(&format!("line_to {x} {y}"));
    }
    fn arc(&mut self, _x: f64, _y: f64, _r: f64, _s: f64, _e: f64, _n: bool) {
        self.record("arc");
    }
    fn curve_to(&mut self, _a: f64, _b: f64, _c: f64, _d: f64, _x: f64, _y: f64) {
        self.record("curve_to");
    }
    fn rect(&mut self, x: f64, y: f64, w: f64, h: f64) {
        self.record(&format!("rect {x} {y} {w} {h}"));
    }
    fn close_path(&mut self) {
        self.record("close_path");
    }
    fn clip(&mut self) {
        self.record("clip");
    }
    fn fill_color(&mut self, r: u8, g: u8, b: u8, a: u8) {
        self.record(&format!("fill_color {r} {g} {b} {a}"));
    }
    fn stroke_color(
        &mut self,
        _cap: LineCap,
        _join: LineJoin,
        _t: f64,
        r: u8,
        g: u8,
        b: u8,
        a: u8,
    ) {
        self.record(&format!("stroke_color {r} {g} {b} {a}"));
    }
    fn fill_pattern(&mut self, _image: &Bitmap) {
        self.record("fill_pattern");
    }
    fn stroke_pattern(&mut self, _cap: LineCap, _join: LineJoin, _t: f64, _image: &Bitmap) {
        self.record("stroke_pattern");
    }
    fn draw_bitmap(&mut self, x: f64, y: f64, image: &Bitmap) {
        self.record(&format!(
            "draw_bitmap {x} {y} {}x{}",
            image.width(),
            image.height()
        ));
    }
    fn get_pixels(&self, _x: u32, _y: u32, width: u32, height: u32) -> Vec<u8> {
        vec![0; (width * height * 4) as usize]
    }
    fn put_pixels(&mut self, x: u32, y: u32, width: u32, height: u32, _rgba: &[u8]) {
        self.record(&format!("put_pixels {x} {y} {width}x{height}"));
    }
    fn save(&mut self) {
        self.record("save");
    }
    fn restore(&mut self) {
        self.record("restore");
    }
    fn set_transform(&mut self, _a: f64, _b: f64, _c: f64, _d: f64, _e: f64, _f: f64) {
        self.record("set_transform");
    }
    fn transform(&mut self, _a: f64, _b: f64, _c: f64, _d: f64, _e: f64, _f: f64) {
        self.record("transform");
    }
    fn set_composite(&mut self, op: CompositeOp) {
        self.record(&format!("set_composite {op:?}"));
    }
    fn set_alpha(&mut self, _alpha: f64) {
        self.record("set_alpha");
    }
    fn set_miter_limit(&mut self, _limit: f64) {
        self.record("set_miter_limit");
    }
}
