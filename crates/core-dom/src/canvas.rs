//! Raster surfaces: canvases, 2D context state, and immutable bitmaps.
//!
//! [`Context2d`] models exactly the state the pooling layer must restore
//! before a canvas is handed out again. [`ContextState::default`] is the
//! canonical "fresh context" the hygiene checks compare against.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{DomError, DomResult};

static NEXT_CANVAS_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_BITMAP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    SourceOver,
    Multiply,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCap {
    Butt,
    Round,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineJoin {
    Miter,
    Round,
    Bevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    Start,
    Center,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextBaseline {
    Alphabetic,
    Top,
    Middle,
}

/// Full mutable state of a 2D drawing context.
///
/// `Default` yields the values a freshly created host context carries; the
/// canvas pool restores these (plus a device-pixel-ratio scale on the
/// transform) on every acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextState {
    /// Row-major 2x3 affine matrix `[a, b, c, d, e, f]`.
    pub transform: [f32; 6],
    pub global_alpha: f32,
    pub composite_op: CompositeOp,
    pub fill_style: String,
    pub stroke_style: String,
    pub line_width: f32,
    pub line_cap: LineCap,
    pub line_join: LineJoin,
    pub miter_limit: f32,
    pub shadow_blur: f32,
    pub shadow_offset_x: f32,
    pub shadow_offset_y: f32,
    pub shadow_color: String,
    pub font: String,
    pub text_align: TextAlign,
    pub text_baseline: TextBaseline,
}

pub const IDENTITY: [f32; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

impl Default for ContextState {
    fn default() -> Self {
        Self {
            transform: IDENTITY,
            global_alpha: 1.0,
            composite_op: CompositeOp::SourceOver,
            fill_style: "#000".to_string(),
            stroke_style: "#000".to_string(),
            line_width: 1.0,
            line_cap: LineCap::Butt,
            line_join: LineJoin::Miter,
            miter_limit: 10.0,
            shadow_blur: 0.0,
            shadow_offset_x: 0.0,
            shadow_offset_y: 0.0,
            shadow_color: "rgba(0, 0, 0, 0)".to_string(),
            font: "10px sans-serif".to_string(),
            text_align: TextAlign::Start,
            text_baseline: TextBaseline::Alphabetic,
        }
    }
}

/// 2D drawing context attached to a [`Canvas`].
///
/// Draw operations are counted rather than rasterized; tests observe paints
/// and clears through the counters.
#[derive(Debug, Default)]
pub struct Context2d {
    state: ContextState,
    path_segments: usize,
    draw_calls: u64,
    clear_calls: u64,
}

impl Context2d {
    pub fn state(&self) -> &ContextState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ContextState {
        &mut self.state
    }

    /// Restore every state field to its fresh-context value and drop any
    /// open path. Does not touch the draw counters.
    pub fn reset(&mut self) {
        self.state = ContextState::default();
        self.path_segments = 0;
    }

    pub fn set_transform(&mut self, m: [f32; 6]) {
        self.state.transform = m;
    }

    /// Post-multiply a scale onto the current transform.
    pub fn scale(&mut self, sx: f32, sy: f32) {
        let t = &mut self.state.transform;
        t[0] *= sx;
        t[1] *= sx;
        t[2] *= sy;
        t[3] *= sy;
    }

    pub fn begin_path(&mut self) {
        self.path_segments = 0;
    }

    pub fn line_to(&mut self, _x: f32, _y: f32) {
        self.path_segments += 1;
    }

    pub fn path_segments(&self) -> usize {
        self.path_segments
    }

    pub fn clear_rect(&mut self, _x: f32, _y: f32, _w: f32, _h: f32) {
        self.clear_calls += 1;
    }

    pub fn fill_rect(&mut self, _x: f32, _y: f32, _w: f32, _h: f32) {
        self.draw_calls += 1;
    }

    /// Blit a bitmap. Fails when the bitmap was closed (the pools close
    /// bitmaps on eviction; a stale handle must surface loudly).
    pub fn draw_bitmap(&mut self, bitmap: &ImageBitmap) -> DomResult<()> {
        if bitmap.is_closed() {
            return Err(DomError::BitmapClosed);
        }
        self.draw_calls += 1;
        Ok(())
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    pub fn clear_calls(&self) -> u64 {
        self.clear_calls
    }

    /// Deterministic text metric: half an em per character at the current
    /// font size. Overlay builders use the ratio of expected to measured
    /// width, so only proportionality matters.
    pub fn measure_text(&self, text: &str) -> f32 {
        let size = self
            .state
            .font
            .split_once("px")
            .and_then(|(n, _)| n.trim().parse::<f32>().ok())
            .unwrap_or(10.0);
        text.chars().count() as f32 * size * 0.5
    }
}

#[derive(Debug)]
struct CanvasInner {
    width: u32,
    height: u32,
    css_width: f32,
    css_height: f32,
    context: Context2d,
}

/// A raster surface with distinct physical (device pixel) and CSS sizes.
///
/// Cheap to clone; clones share the same backing surface. Identity (`id`)
/// is what the pools key on.
#[derive(Debug, Clone)]
pub struct Canvas {
    id: u64,
    inner: Arc<Mutex<CanvasInner>>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            id: NEXT_CANVAS_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(CanvasInner {
                width,
                height,
                css_width: width as f32,
                css_height: height as f32,
                context: Context2d::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CanvasInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn physical_size(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.width, inner.height)
    }

    /// Resize the backing store. Mirrors host semantics: the context is
    /// reset as a side effect.
    pub fn set_physical_size(&self, width: u32, height: u32) {
        let mut inner = self.lock();
        inner.width = width;
        inner.height = height;
        inner.context.reset();
    }

    pub fn css_size(&self) -> (f32, f32) {
        let inner = self.lock();
        (inner.css_width, inner.css_height)
    }

    pub fn set_css_size(&self, width: f32, height: f32) {
        let mut inner = self.lock();
        inner.css_width = width;
        inner.css_height = height;
    }

    /// Run a closure against the context while holding the surface lock.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Context2d) -> R) -> R {
        let mut inner = self.lock();
        f(&mut inner.context)
    }

    /// Bytes the backing store occupies (RGBA).
    pub fn estimated_bytes(&self) -> u64 {
        let inner = self.lock();
        inner.width as u64 * inner.height as u64 * 4
    }
}

impl PartialEq for Canvas {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Canvas {}

#[derive(Debug)]
struct BitmapInner {
    width: u32,
    height: u32,
    closed: bool,
}

/// Immutable snapshot of a canvas. Closing releases the backing store and
/// is idempotent.
#[derive(Debug, Clone)]
pub struct ImageBitmap {
    id: u64,
    inner: Arc<Mutex<BitmapInner>>,
}

impl ImageBitmap {
    pub fn snapshot(source: &Canvas) -> Self {
        let (width, height) = source.physical_size();
        Self::with_size(width, height)
    }

    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            id: NEXT_BITMAP_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(BitmapInner {
                width,
                height,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BitmapInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.width, inner.height)
    }

    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn estimated_bytes(&self) -> u64 {
        let inner = self.lock();
        if inner.closed {
            0
        } else {
            inner.width as u64 * inner.height as u64 * 4
        }
    }
}

impl PartialEq for ImageBitmap {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ImageBitmap {}
