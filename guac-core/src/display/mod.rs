//! The display: a scene graph of compositable layers driven by an ordered
//! frame queue.
//!
//! Every drawing call on [`Display`] becomes a scheduled task, so the
//! display serializes all drawing; nothing touches a surface until the
//! frame containing the task is flushed and unblocked. The one exception is
//! cursor *motion*, which bypasses the queue for responsiveness (changing
//! the cursor image is still queued).

mod scheduler;

pub use scheduler::{FrameCallback, Scheduler, TaskFn, TaskId};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::surface::{Bitmap, Layer, LineCap, LineJoin, Surface, SurfaceFactory};

/// Index of the root visible layer.
pub const ROOT_LAYER: i32 = 0;

/// Shared slot an asynchronous image decode deposits its result into; the
/// blocked draw task picks the bitmap up when it finally runs.
pub type BitmapSlot = Arc<Mutex<Option<Bitmap>>>;

const IDENTITY: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

// ── Scene ────────────────────────────────────────────────────────

/// A visible layer or buffer plus its scene-graph attributes.
pub struct LayerNode {
    layer: Layer,
    parent: Option<i32>,
    x: i32,
    y: i32,
    z: i32,
    alpha: u8,
    matrix: [f64; 6],
    /// Document insertion order; breaks z ties.
    seq: u64,
}

impl LayerNode {
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn parent(&self) -> Option<i32> {
        self.parent
    }

    pub fn position(&self) -> (i32, i32, i32) {
        (self.x, self.y, self.z)
    }

    pub fn alpha(&self) -> u8 {
        self.alpha
    }
}

struct CursorState {
    layer: Layer,
    hotspot_x: i32,
    hotspot_y: i32,
    x: i32,
    y: i32,
}

/// Mutable scene state handed to render tasks.
///
/// Owned by the display; tasks receive it as their explicit context.
pub struct Scene {
    factory: Box<dyn SurfaceFactory>,
    nodes: HashMap<i32, LayerNode>,
    insertion: u64,
    width: u32,
    height: u32,
    cursor: CursorState,
    on_resize: Option<Box<dyn FnMut(u32, u32) + Send>>,
}

impl Scene {
    fn new(mut factory: Box<dyn SurfaceFactory>) -> Self {
        let root_surface = factory.create_surface(0, 0);
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_LAYER,
            LayerNode {
                layer: Layer::new(ROOT_LAYER, root_surface),
                parent: None,
                x: 0,
                y: 0,
                z: 0,
                alpha: 255,
                matrix: IDENTITY,
                seq: 0,
            },
        );

        let cursor_surface = factory.create_surface(0, 0);
        let mut cursor_layer = Layer::new(i32::MIN, cursor_surface);
        cursor_layer.set_autosize(false);
        // The cursor always composites source-only over everything else.
        cursor_layer.set_channel_mask(0xC);

        Self {
            factory,
            nodes,
            insertion: 1,
            width: 0,
            height: 0,
            cursor: CursorState {
                layer: cursor_layer,
                hotspot_x: 0,
                hotspot_y: 0,
                x: 0,
                y: 0,
            },
            on_resize: None,
        }
    }

    /// Look up a layer, creating it on first reference.
    ///
    /// Fresh positive-index layers are parented beneath the root; fresh
    /// negative-index layers are off-screen buffers.
    pub fn layer_mut(&mut self, index: i32) -> &mut Layer {
        self.ensure_node(index);
        &mut self
            .nodes
            .get_mut(&index)
            .expect("node just ensured")
            .layer
    }

    fn ensure_node(&mut self, index: i32) {
        if self.nodes.contains_key(&index) {
            return;
        }
        let surface = self.factory.create_surface(0, 0);
        let seq = self.insertion;
        self.insertion += 1;
        self.nodes.insert(
            index,
            LayerNode {
                layer: Layer::new(index, surface),
                parent: (index > 0).then_some(ROOT_LAYER),
                x: 0,
                y: 0,
                z: 0,
                alpha: 255,
                matrix: IDENTITY,
                seq,
            },
        );
    }

    pub fn node(&self, index: i32) -> Option<&LayerNode> {
        self.nodes.get(&index)
    }

    /// Snapshot a rectangle of a layer, clamped to its bounds.
    ///
    /// Returns `None` for unknown layers or empty intersections.
    pub fn snapshot(&self, index: i32, x: u32, y: u32, w: u32, h: u32) -> Option<Bitmap> {
        let node = self.nodes.get(&index)?;
        let lw = node.layer.width();
        let lh = node.layer.height();
        if x >= lw || y >= lh {
            return None;
        }
        let w = w.min(lw - x);
        let h = h.min(lh - y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(node.layer.snapshot(x, y, w, h))
    }

    fn resize_layer(&mut self, index: i32, width: u32, height: u32) {
        self.layer_mut(index).resize(width, height);
        if index == ROOT_LAYER {
            self.width = width;
            self.height = height;
            if let Some(on_resize) = self.on_resize.as_mut() {
                on_resize(width, height);
            }
        }
    }

    fn dispose(&mut self, index: i32) {
        if index == ROOT_LAYER {
            trace!("dispose of root layer ignored");
            return;
        }
        // Detaches from its parent implicitly: children are found through
        // the node map, so a removed node simply stops being drawn.
        self.nodes.remove(&index);
    }

    fn move_layer(&mut self, index: i32, parent: i32, x: i32, y: i32, z: i32) {
        if index <= ROOT_LAYER {
            trace!(layer = index, "move of root or buffer ignored");
            return;
        }
        self.ensure_node(parent);
        self.ensure_node(index);
        let node = self.nodes.get_mut(&index).expect("node just ensured");
        node.parent = Some(parent);
        node.x = x;
        node.y = y;
        node.z = z;
    }

    fn shade(&mut self, index: i32, alpha: u8) {
        if index < ROOT_LAYER {
            trace!(layer = index, "shade of buffer ignored");
            return;
        }
        self.ensure_node(index);
        self.nodes.get_mut(&index).expect("node just ensured").alpha = alpha;
    }

    fn distort(&mut self, index: i32, matrix: [f64; 6]) {
        if index < ROOT_LAYER {
            trace!(layer = index, "distort of buffer ignored");
            return;
        }
        self.ensure_node(index);
        self.nodes.get_mut(&index).expect("node just ensured").matrix = matrix;
    }

    fn set_cursor_image(&mut self, hx: i32, hy: i32, snapshot: Bitmap) {
        self.cursor.hotspot_x = hx;
        self.cursor.hotspot_y = hy;
        self.cursor
            .layer
            .resize(snapshot.width(), snapshot.height());
        self.cursor.layer.put(0, 0, &snapshot);
    }
}

// ── Display ──────────────────────────────────────────────────────

/// Scene graph plus render queue.
pub struct Display {
    scene: Scene,
    scheduler: Scheduler<Scene>,
}

impl Display {
    /// Create a display whose layers draw onto surfaces from `factory`.
    pub fn new(factory: Box<dyn SurfaceFactory>) -> Self {
        Self {
            scene: Scene::new(factory),
            scheduler: Scheduler::new(),
        }
    }

    /// Current display width (the root layer's width).
    pub fn width(&self) -> u32 {
        self.scene.width
    }

    /// Current display height.
    pub fn height(&self) -> u32 {
        self.scene.height
    }

    /// Called whenever the root layer is resized.
    pub fn set_on_resize(&mut self, f: impl FnMut(u32, u32) + Send + 'static) {
        self.scene.on_resize = Some(Box::new(f));
    }

    /// Read-only scene access (tests, flattening embedders).
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    // ── Scheduling primitives ────────────────────────────────────

    /// Schedule an arbitrary task against the scene.
    pub fn schedule(&mut self, blocked: bool, handler: TaskFn<Scene>) -> TaskId {
        self.scheduler.schedule(blocked, handler)
    }

    /// Seal all scheduled tasks into a frame; `on_complete` fires once the
    /// frame (and every frame before it) has fully executed.
    pub fn flush(&mut self, on_complete: Option<FrameCallback>) {
        self.scheduler.flush(on_complete, &mut self.scene);
    }

    /// Unblock a previously scheduled task and drain ready frames.
    pub fn unblock(&mut self, id: TaskId) -> bool {
        self.scheduler.unblock(id, &mut self.scene)
    }

    /// Number of frames waiting to complete.
    pub fn queued_frames(&self) -> usize {
        self.scheduler.queued_frames()
    }

    /// Number of tasks scheduled but not yet sealed into a frame.
    pub fn pending_tasks(&self) -> usize {
        self.scheduler.pending_tasks()
    }

    /// Drop all queued frames and pending tasks (disconnect path).
    pub fn drop_pending(&mut self) {
        self.scheduler.clear();
    }

    /// Decode an image through the surface factory.
    ///
    /// The completion callback runs wherever the factory finishes decoding;
    /// the caller must repost it onto its own runner.
    pub fn decode_image(
        &mut self,
        mimetype: &str,
        data: Vec<u8>,
        done: crate::surface::DecodeCallback,
    ) {
        self.scene.factory.decode_image(mimetype, data, done);
    }

    // ── Sizing / scene graph ─────────────────────────────────────

    pub fn resize(&mut self, layer: i32, width: u32, height: u32) {
        self.schedule(
            false,
            Box::new(move |scene| scene.resize_layer(layer, width, height)),
        );
    }

    pub fn dispose(&mut self, layer: i32) {
        self.schedule(false, Box::new(move |scene| scene.dispose(layer)));
    }

    pub fn move_layer(&mut self, layer: i32, parent: i32, x: i32, y: i32, z: i32) {
        self.schedule(
            false,
            Box::new(move |scene| scene.move_layer(layer, parent, x, y, z)),
        );
    }

    pub fn shade(&mut self, layer: i32, alpha: u8) {
        self.schedule(false, Box::new(move |scene| scene.shade(layer, alpha)));
    }

    pub fn distort(&mut self, layer: i32, matrix: [f64; 6]) {
        self.schedule(false, Box::new(move |scene| scene.distort(layer, matrix)));
    }

    // ── Path ─────────────────────────────────────────────────────

    pub fn move_to(&mut self, layer: i32, x: f64, y: f64) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).move_to(x, y)));
    }

    pub fn line_to(&mut self, layer: i32, x: f64, y: f64) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).line_to(x, y)));
    }

    pub fn arc(&mut self, layer: i32, x: f64, y: f64, radius: f64, start: f64, end: f64, negative: bool) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).arc(x, y, radius, start, end, negative)),
        );
    }

    pub fn curve_to(&mut self, layer: i32, cp1x: f64, cp1y: f64, cp2x: f64, cp2y: f64, x: f64, y: f64) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).curve_to(cp1x, cp1y, cp2x, cp2y, x, y)),
        );
    }

    pub fn rect(&mut self, layer: i32, x: f64, y: f64, width: f64, height: f64) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).rect(x, y, width, height)),
        );
    }

    pub fn close_path(&mut self, layer: i32) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).close_path()));
    }

    pub fn clip(&mut self, layer: i32) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).clip()));
    }

    // ── Paint ────────────────────────────────────────────────────

    pub fn set_channel_mask(&mut self, layer: i32, mask: u8) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).set_channel_mask(mask)),
        );
    }

    pub fn set_miter_limit(&mut self, layer: i32, limit: f64) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).set_miter_limit(limit)),
        );
    }

    pub fn fill_color(&mut self, layer: i32, r: u8, g: u8, b: u8, a: u8) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).fill_color(r, g, b, a)),
        );
    }

    pub fn stroke_color(
        &mut self,
        layer: i32,
        cap: LineCap,
        join: LineJoin,
        thickness: f64,
        r: u8,
        g: u8,
        b: u8,
        a: u8,
    ) {
        self.schedule(
            false,
            Box::new(move |scene| {
                scene
                    .layer_mut(layer)
                    .stroke_color(cap, join, thickness, r, g, b, a)
            }),
        );
    }

    /// Fill the current path with the contents of another layer.
    pub fn fill_pattern(&mut self, layer: i32, src: i32) {
        self.schedule(
            false,
            Box::new(move |scene| {
                let Some(pattern) = scene.whole_snapshot(src) else {
                    return;
                };
                scene.layer_mut(layer).fill_pattern(&pattern);
            }),
        );
    }

    /// Stroke the current path with the contents of another layer.
    pub fn stroke_pattern(&mut self, layer: i32, cap: LineCap, join: LineJoin, thickness: f64, src: i32) {
        self.schedule(
            false,
            Box::new(move |scene| {
                let Some(pattern) = scene.whole_snapshot(src) else {
                    return;
                };
                scene
                    .layer_mut(layer)
                    .stroke_pattern(cap, join, thickness, &pattern);
            }),
        );
    }

    // ── State ────────────────────────────────────────────────────

    pub fn push(&mut self, layer: i32) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).push()));
    }

    pub fn pop(&mut self, layer: i32) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).pop()));
    }

    pub fn reset(&mut self, layer: i32) {
        self.schedule(false, Box::new(move |scene| scene.layer_mut(layer).reset()));
    }

    pub fn set_transform(&mut self, layer: i32, a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).set_transform(a, b, c, d, e, f)),
        );
    }

    pub fn transform(&mut self, layer: i32, a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) {
        self.schedule(
            false,
            Box::new(move |scene| scene.layer_mut(layer).transform(a, b, c, d, e, f)),
        );
    }

    // ── Raster ───────────────────────────────────────────────────

    /// Composite-honoring copy of a rectangle from one layer to another
    /// (or within one layer). The source is snapshotted at execution time.
    pub fn copy(&mut self, src: i32, sx: u32, sy: u32, w: u32, h: u32, dst: i32, dx: f64, dy: f64) {
        self.schedule(
            false,
            Box::new(move |scene| {
                let Some(snapshot) = scene.snapshot(src, sx, sy, w, h) else {
                    return;
                };
                scene.layer_mut(dst).copy(dx, dy, &snapshot);
            }),
        );
    }

    /// Raw pixel copy of a rectangle from one layer to another.
    pub fn put(&mut self, src: i32, sx: u32, sy: u32, w: u32, h: u32, dst: i32, dx: u32, dy: u32) {
        self.schedule(
            false,
            Box::new(move |scene| {
                let Some(snapshot) = scene.snapshot(src, sx, sy, w, h) else {
                    return;
                };
                scene.layer_mut(dst).put(dx, dy, &snapshot);
            }),
        );
    }

    /// Per-pixel transfer-function copy.
    pub fn transfer(
        &mut self,
        src: i32,
        sx: u32,
        sy: u32,
        w: u32,
        h: u32,
        dst: i32,
        dx: u32,
        dy: u32,
        function: u8,
    ) {
        self.schedule(
            false,
            Box::new(move |scene| {
                let Some(snapshot) = scene.snapshot(src, sx, sy, w, h) else {
                    return;
                };
                scene.layer_mut(dst).transfer(dx, dy, &snapshot, function);
            }),
        );
    }

    /// Schedule a blocked image draw.
    ///
    /// Returns the task id (to unblock once decoding completes) and the
    /// slot the decoded bitmap must be deposited into before unblocking.
    pub fn draw_image_deferred(&mut self, layer: i32, x: f64, y: f64) -> (TaskId, BitmapSlot) {
        let slot: BitmapSlot = Arc::new(Mutex::new(None));
        let task_slot = Arc::clone(&slot);
        let id = self.schedule(
            true,
            Box::new(move |scene| {
                let bitmap = task_slot.lock().expect("bitmap slot poisoned").take();
                match bitmap {
                    Some(bitmap) => scene.layer_mut(layer).draw_image(x, y, &bitmap),
                    None => warn!(layer, "image draw unblocked without a decoded bitmap"),
                }
            }),
        );
        (id, slot)
    }

    // ── Cursor ───────────────────────────────────────────────────

    /// Replace the cursor image from a layer rectangle (queued).
    pub fn set_cursor(&mut self, hx: i32, hy: i32, src: i32, sx: u32, sy: u32, w: u32, h: u32) {
        self.schedule(
            false,
            Box::new(move |scene| {
                let Some(snapshot) = scene.snapshot(src, sx, sy, w, h) else {
                    return;
                };
                scene.set_cursor_image(hx, hy, snapshot);
            }),
        );
    }

    /// Move the cursor immediately — never queued, so pointer feedback is
    /// not delayed behind pending frames.
    pub fn move_cursor(&mut self, x: i32, y: i32) {
        self.scene.cursor.x = x;
        self.scene.cursor.y = y;
    }

    /// Current cursor position.
    pub fn cursor_position(&self) -> (i32, i32) {
        (self.scene.cursor.x, self.scene.cursor.y)
    }

    /// Current cursor hotspot.
    pub fn cursor_hotspot(&self) -> (i32, i32) {
        (self.scene.cursor.hotspot_x, self.scene.cursor.hotspot_y)
    }

    // ── Flatten ──────────────────────────────────────────────────

    /// Composite the visible scene graph into a freshly allocated surface,
    /// children sorted by z ascending with insertion order breaking ties.
    pub fn flatten(&mut self) -> Box<dyn Surface> {
        let mut out = self
            .scene
            .factory
            .create_surface(self.scene.width, self.scene.height);
        Self::draw_subtree(&self.scene.nodes, ROOT_LAYER, out.as_mut());
        out
    }

    fn draw_subtree(nodes: &HashMap<i32, LayerNode>, index: i32, out: &mut dyn Surface) {
        let Some(node) = nodes.get(&index) else {
            return;
        };

        out.save();
        out.transform(1.0, 0.0, 0.0, 1.0, node.x as f64, node.y as f64);
        if node.matrix != IDENTITY {
            let [a, b, c, d, e, f] = node.matrix;
            out.transform(a, b, c, d, e, f);
        }
        out.set_alpha(node.alpha as f64 / 255.0);

        let w = node.layer.width();
        let h = node.layer.height();
        if w > 0 && h > 0 {
            let snapshot = node.layer.snapshot(0, 0, w, h);
            out.draw_bitmap(0.0, 0.0, &snapshot);
        }

        let mut children: Vec<&LayerNode> = nodes
            .values()
            .filter(|n| n.parent == Some(index))
            .collect();
        children.sort_by_key(|n| (n.z, n.seq));
        for child in children {
            Self::draw_subtree(nodes, child.layer.index(), out);
        }

        out.restore();
    }
}

impl Scene {
    fn whole_snapshot(&self, index: i32) -> Option<Bitmap> {
        let node = self.nodes.get(&index)?;
        let w = node.layer.width();
        let h = node.layer.height();
        self.snapshot(index, 0, 0, w, h)
    }
}

// ── Tests ────────────────────────────────────────────────────────
