//! Layer bookkeeping over a raster surface.
//!
//! A [`Layer`] owns one [`Surface`] plus the state the protocol expects the
//! client to track itself: the saved-state stack depth, whether the current
//! path has been consumed, the active composite operator, and automatic
//! growth for off-screen buffers.

use tracing::trace;

use super::{
    composite_for_mask, transfer_pixels, Bitmap, CompositeOp, LineCap, LineJoin, Surface,
};

/// A compositable 2-D drawing layer.
///
/// Index semantics: 0 is the root visible layer, positive indices are
/// visible layers, negative indices are off-screen buffers. Buffers start
/// with autosize enabled and grow to contain whatever is drawn into them.
pub struct Layer {
    index: i32,
    surface: Box<dyn Surface>,
    width: u32,
    height: u32,
    /// Grow to fit any written rectangle.
    autosize: bool,
    /// Depth of the saved-state stack.
    stack_size: usize,
    /// Set once the current path has been filled, stroked or clipped; the
    /// next path operation then implicitly begins a new path.
    path_closed: bool,
    /// Operator selected by the current channel mask.
    composite: CompositeOp,
}

impl Layer {
    /// Wrap a surface as the layer with the given index.
    pub fn new(index: i32, surface: Box<dyn Surface>) -> Self {
        let width = surface.width();
        let height = surface.height();
        Self {
            index,
            surface,
            width,
            height,
            autosize: index < 0,
            stack_size: 0,
            path_closed: true,
            composite: CompositeOp::SourceOver,
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether this layer grows to contain drawn rectangles.
    pub fn autosize(&self) -> bool {
        self.autosize
    }

    pub fn set_autosize(&mut self, autosize: bool) {
        self.autosize = autosize;
    }

    /// Snapshot a rectangle of this layer as a bitmap.
    pub fn snapshot(&self, x: u32, y: u32, width: u32, height: u32) -> Bitmap {
        let pixels = self.surface.get_pixels(x, y, width, height);
        // get_pixels returns exactly w*h*4 bytes by contract.
        Bitmap::new(width, height, pixels).unwrap_or_else(|_| {
            Bitmap::new(0, 0, Vec::new()).expect("empty bitmap")
        })
    }

    // ── Sizing ───────────────────────────────────────────────────

    /// Resize the layer, preserving overlapping pixels.
    ///
    /// Clears the saved-state stack and re-applies the current composite
    /// operator to the resized target.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(width, height);
        self.width = width;
        self.height = height;
        self.stack_size = 0;
        self.surface.set_composite(self.composite);
    }

    /// Grow the layer to contain the given rectangle if autosize is on.
    fn fit(&mut self, x: f64, y: f64, w: f64, h: f64) {
        if !self.autosize {
            return;
        }
        let need_w = (x + w).ceil().max(0.0) as u32;
        let need_h = (y + h).ceil().max(0.0) as u32;
        if need_w > self.width || need_h > self.height {
            self.resize(self.width.max(need_w), self.height.max(need_h));
        }
    }

    // ── Path ─────────────────────────────────────────────────────

    fn begin_path_if_closed(&mut self) {
        if self.path_closed {
            self.surface.begin_path();
            self.path_closed = false;
        }
    }

    pub fn move_to(&mut self, x: f64, y: f64) {
        self.begin_path_if_closed();
        self.fit(x, y, 0.0, 0.0);
        self.surface.move_to(x, y);
    }

    pub fn line_to(&mut self, x: f64, y: f64) {
        self.begin_path_if_closed();
        self.fit(x, y, 0.0, 0.0);
        self.surface.line_to(x, y);
    }

    pub fn arc(&mut self, x: f64, y: f64, radius: f64, start: f64, end: f64, negative: bool) {
        self.begin_path_if_closed();
        self.fit(x - radius, y - radius, radius * 2.0, radius * 2.0);
        self.surface.arc(x, y, radius, start, end, negative);
    }

    pub fn curve_to(&mut self, cp1x: f64, cp1y: f64, cp2x: f64, cp2y: f64, x: f64, y: f64) {
        self.begin_path_if_closed();
        self.fit(x, y, 0.0, 0.0);
        self.surface.curve_to(cp1x, cp1y, cp2x, cp2y, x, y);
    }

    pub fn rect(&mut self, x: f64, y: f64, width: f64, height: f64) {
        self.begin_path_if_closed();
        self.fit(x, y, width, height);
        self.surface.rect(x, y, width, height);
    }

    /// Close the current path subcontour. Subsequent path operations begin
    /// a new path.
    pub fn close_path(&mut self) {
        self.surface.close_path();
        self.path_closed = true;
    }

    /// Intersect the clipping region with the current path.
    pub fn clip(&mut self) {
        self.surface.clip();
        self.path_closed = true;
    }

    // ── Paint ────────────────────────────────────────────────────

    pub fn fill_color(&mut self, r: u8, g: u8, b: u8, a: u8) {
        self.surface.fill_color(r, g, b, a);
        self.path_closed = true;
    }

    pub fn stroke_color(
        &mut self,
        cap: LineCap,
        join: LineJoin,
        thickness: f64,
        r: u8,
        g: u8,
        b: u8,
        a: u8,
    ) {
        self.surface.stroke_color(cap, join, thickness, r, g, b, a);
        self.path_closed = true;
    }

    pub fn fill_pattern(&mut self, image: &Bitmap) {
        self.surface.fill_pattern(image);
        self.path_closed = true;
    }

    pub fn stroke_pattern(
        &mut self,
        cap: LineCap,
        join: LineJoin,
        thickness: f64,
        image: &Bitmap,
    ) {
        self.surface.stroke_pattern(cap, join, thickness, image);
        self.path_closed = true;
    }

    // ── Raster ───────────────────────────────────────────────────

    /// Draw a decoded image honoring the current composite operator.
    pub fn draw_image(&mut self, x: f64, y: f64, image: &Bitmap) {
        self.fit(x, y, image.width() as f64, image.height() as f64);
        self.surface.draw_bitmap(x, y, image);
    }

    /// Composite-honoring blit of a snapshot (the `copy` operation).
    pub fn copy(&mut self, x: f64, y: f64, snapshot: &Bitmap) {
        self.draw_image(x, y, snapshot);
    }

    /// Raw pixel copy, ignoring composite and clip (the `put` operation).
    pub fn put(&mut self, x: u32, y: u32, snapshot: &Bitmap) {
        self.fit(
            x as f64,
            y as f64,
            snapshot.width() as f64,
            snapshot.height() as f64,
        );
        self.surface
            .put_pixels(x, y, snapshot.width(), snapshot.height(), snapshot.data());
    }

    /// Per-pixel binary raster operation from a source snapshot onto this
    /// layer. Destination alpha is preserved.
    pub fn transfer(&mut self, x: u32, y: u32, snapshot: &Bitmap, function: u8) {
        let w = snapshot.width();
        let h = snapshot.height();
        self.fit(x as f64, y as f64, w as f64, h as f64);
        let mut dst = self.surface.get_pixels(x, y, w, h);
        transfer_pixels(function, snapshot.data(), &mut dst);
        self.surface.put_pixels(x, y, w, h, &dst);
    }

    // ── State ────────────────────────────────────────────────────

    /// Push the current drawing state (transform, clip, composite).
    pub fn push(&mut self) {
        self.surface.save();
        self.stack_size += 1;
    }

    /// Pop the last saved state. A pop with nothing saved is tolerated.
    pub fn pop(&mut self) {
        if self.stack_size == 0 {
            trace!(layer = self.index, "pop on empty state stack ignored");
            return;
        }
        self.surface.restore();
        self.stack_size -= 1;
    }

    /// Drop all saved state, start a new empty path, and restore the
    /// initial transform.
    pub fn reset(&mut self) {
        while self.stack_size > 0 {
            self.surface.restore();
            self.stack_size -= 1;
        }
        self.surface.set_transform(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        self.surface.begin_path();
        self.path_closed = false;
    }

    pub fn set_transform(&mut self, a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) {
        self.surface.set_transform(a, b, c, d, e, f);
    }

    /// Multiply the current transform by the given matrix.
    pub fn transform(&mut self, a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) {
        self.surface.transform(a, b, c, d, e, f);
    }

    /// Select the composite operator by channel mask.
    ///
    /// Masks with no defined operator are ignored silently.
    pub fn set_channel_mask(&mut self, mask: u8) {
        match composite_for_mask(mask) {
            Some(op) => {
                self.composite = op;
                self.surface.set_composite(op);
            }
            None => trace!(layer = self.index, mask, "unmapped channel mask ignored"),
        }
    }

    pub fn set_miter_limit(&mut self, limit: f64) {
        self.surface.set_miter_limit(limit);
    }

    /// Direct access to the underlying surface (flatten, cursor blits).
    pub fn surface_mut(&mut self) -> &mut dyn Surface {
        self.surface.as_mut()
    }

    pub fn surface(&self) -> &dyn Surface {
        self.surface.as_ref()
    }
}

// ── Tests ────────────────────────────────────────────────────────
