//! The page virtualizer: window maintenance, progressive rendering, and
//! coordination between the queue, the pools, and the host surface.
//!
//! Concurrency model: all mutable state lives in one mutex; every await
//! happens with the lock released, and async completions re-validate the
//! slot generation captured at start before committing anything. Two tasks
//! run per virtualizer: the queue pump (strictly serialized render jobs
//! with a cooperative pause between jobs) and the maintenance sweep
//! (periodic cancellation, pressure handling, pool cleanup, trailing-edge
//! windowing).
//!
//! Render pipeline per slot: placeholder (sized wrapper, no raster) →
//! base pass at `scale > 1 ? min(1, scale/2) : scale`, CSS-stretched to the
//! visual size → overlays → hi-res pass at the true scale when `scale > 1`,
//! snapshotted to a bitmap and drawn into a device-pixel display canvas.

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use core_dom::{ElementId, HostSurface};
use core_events::{EventBus, InstanceId, ViewerEvent};
use core_pool::{BitmapPool, CanvasPool, MemoryGauge, PoolError, memory_pressure};
use core_provider::{
    DocumentHandle, PageHandle, ProviderError, Viewport, ViewportCloneOpts,
};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cancel::{CancelAction, CancelContext};
use crate::overlay::{
    AnnotationLayerFactory, build_annotation_overlay, build_text_overlay,
};
use crate::pacing::{ScrollPacer, Throttle};
use crate::position::{PAGE_GAP, PagePositionMap};
use crate::queue::{QueueMetrics, RenderQueue, priority_for};
use crate::slot::{PageSlot, SlotPhase};
use crate::wrapper::{WrapperPool, wrapper_capacity};
use crate::zoom::{ZoomPolicy, anchored_scroll_top};

#[derive(Debug, Error)]
pub enum VirtError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Dom(#[from] core_dom::DomError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("virtualizer destroyed")]
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct VirtualizerConfig {
    /// Buffer radius `B`: pages kept on each side of the center page.
    pub buffer: u32,
    pub gap: f32,
    pub zoom: ZoomPolicy,
    pub initial_scale: f32,
    /// Beyond this distance everything is cancelled unconditionally.
    pub hard_limit: u32,
    pub rapid_scroll_ms: u64,
    pub scroll_throttle_ms: u64,
    /// Cooperative pause between queue jobs.
    pub queue_pause_ms: u64,
    pub sweep_interval_ms: u64,
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub disable_text_overlay: bool,
    /// Mini-viewer mode: the window is pinned to exactly this page.
    pub single_page: Option<u32>,
}

impl Default for VirtualizerConfig {
    fn default() -> Self {
        Self {
            buffer: 3,
            gap: PAGE_GAP,
            zoom: ZoomPolicy::default(),
            initial_scale: 1.0,
            hard_limit: 8,
            rapid_scroll_ms: 500,
            scroll_throttle_ms: 100,
            queue_pause_ms: 5,
            sweep_interval_ms: 2000,
            viewport_width: 800.0,
            viewport_height: 900.0,
            disable_text_overlay: false,
            single_page: None,
        }
    }
}

/// Everything the virtualizer borrows from its owning instance.
pub struct VirtualizerParams {
    pub instance_id: InstanceId,
    pub surface: HostSurface,
    pub host_container: ElementId,
    pub document: Arc<dyn DocumentHandle>,
    pub canvas_pool: Arc<CanvasPool>,
    pub bitmap_pool: Arc<BitmapPool>,
    pub bus: EventBus,
    pub gauge: Arc<dyn MemoryGauge>,
    pub annotation_layer: Arc<dyn AnnotationLayerFactory>,
    pub config: VirtualizerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtStats {
    pub materialized: usize,
    pub queued: usize,
    pub active_render: bool,
    pub current_page: u32,
    pub scale: f32,
    pub fully_rendered_at_scale: usize,
    pub queue_metrics: QueueMetrics,
}

struct VirtState {
    scale: f32,
    rotation: u16,
    current_page: u32,
    last_notified_page: Option<u32>,
    scroll_top: f32,
    slots: ahash::AHashMap<u32, PageSlot>,
    positions: PagePositionMap,
    queue: RenderQueue,
    wrappers: WrapperPool,
    pacer: ScrollPacer,
    throttle: Throttle,
    scale_change_in_progress: bool,
    active_render: Option<u32>,
    destroyed: bool,
    viewport_el: ElementId,
    content_el: ElementId,
    /// Per-page viewports at scale 1, rotation 0, fetched once at load.
    base_viewports: Vec<Viewport>,
    next_generation: u64,
}

struct Shared {
    instance_id: InstanceId,
    surface: HostSurface,
    document: Arc<dyn DocumentHandle>,
    canvas_pool: Arc<CanvasPool>,
    bitmap_pool: Arc<BitmapPool>,
    bus: EventBus,
    gauge: Arc<dyn MemoryGauge>,
    annotation_layer: Arc<dyn AnnotationLayerFactory>,
    config: VirtualizerConfig,
    state: Mutex<VirtState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VirtState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Virtualizer {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Virtualizer {
    /// Build the DOM scaffold, learn page geometry, materialize the initial
    /// window, and start the pump and sweep tasks. Resolves once the
    /// initial buffer is materialized (placeholders sized and queued).
    pub async fn new(params: VirtualizerParams) -> Result<Self, VirtError> {
        let VirtualizerParams {
            instance_id,
            surface,
            host_container,
            document,
            canvas_pool,
            bitmap_pool,
            bus,
            gauge,
            annotation_layer,
            config,
        } = params;

        let page_count = document.page_count();
        let mut base_viewports = Vec::with_capacity(page_count as usize);
        for number in 1..=page_count {
            let page = document.page(number).await?;
            base_viewports.push(page.viewport(1.0));
        }

        let scale = config.zoom.snap(config.initial_scale);
        let rotation = 0u16;
        let scaled: Vec<Viewport> = base_viewports
            .iter()
            .map(|vp| {
                vp.clone_with(ViewportCloneOpts {
                    scale: Some(scale),
                    rotation: Some(rotation),
                })
            })
            .collect();
        let positions = PagePositionMap::rebuild(config.gap, &scaled);

        // Scaffold: a scroll container and an absolutely-positioned content
        // box sized to the full document extent.
        let viewport_el = surface.create_element("div");
        surface.set_attribute(viewport_el, "id", &format!("viewerContainer-{}", instance_id.0))?;
        surface.set_style(viewport_el, "overflow", "auto")?;
        surface.set_style(viewport_el, "width", &format!("{:.0}px", config.viewport_width))?;
        surface.set_style(viewport_el, "height", &format!("{:.0}px", config.viewport_height))?;
        surface.append_child(host_container, viewport_el)?;

        let content_el = surface.create_element("div");
        surface.set_attribute(content_el, "id", &format!("viewerContent-{}", instance_id.0))?;
        surface.set_style(content_el, "position", "relative")?;
        surface.append_child(viewport_el, content_el)?;

        let initial_visible =
            (config.viewport_height / (positions.page_height(1).unwrap_or(792.0) + config.gap))
                .ceil()
                .max(1.0) as u32;
        let wrappers = WrapperPool::new(
            surface.clone(),
            wrapper_capacity(page_count, initial_visible).max(1),
        );

        let current_page = config.single_page.unwrap_or(1).clamp(1, page_count.max(1));
        let state = VirtState {
            scale,
            rotation,
            current_page,
            last_notified_page: None,
            scroll_top: 0.0,
            slots: ahash::AHashMap::new(),
            positions,
            queue: RenderQueue::new(),
            wrappers,
            pacer: ScrollPacer::new(Duration::from_millis(config.rapid_scroll_ms)),
            throttle: Throttle::new(Duration::from_millis(config.scroll_throttle_ms)),
            scale_change_in_progress: false,
            active_render: None,
            destroyed: false,
            viewport_el,
            content_el,
            base_viewports,
            next_generation: 1,
        };

        let shared = Arc::new(Shared {
            instance_id,
            surface,
            document,
            canvas_pool,
            bitmap_pool,
            bus,
            gauge,
            annotation_layer,
            config,
            state: Mutex::new(state),
            wake: Notify::new(),
        });

        {
            let state = shared.lock();
            resize_content(&shared, &state)?;
        }

        let virtualizer = Self {
            shared: Arc::clone(&shared),
            pump: Mutex::new(Some(tokio::spawn(pump_loop(Arc::clone(&shared))))),
            sweep: Mutex::new(Some(tokio::spawn(sweep_loop(Arc::clone(&shared))))),
        };

        apply_window(&shared).await;
        info!(
            target: "virt.window",
            instance = %instance_id,
            pages = page_count,
            scale,
            "virtualizer_ready"
        );
        Ok(virtualizer)
    }

    /// Scroll-event entry point. Cancellation runs on every call; window
    /// recomputation is throttled and suppressed during scale changes.
    pub async fn handle_scroll(&self, scroll_top: f32) {
        let shared = &self.shared;
        let recompute = {
            let mut state = shared.lock();
            if state.destroyed {
                return;
            }
            state.scroll_top = scroll_top.max(0.0);
            let viewport_el = state.viewport_el;
            let _ = shared.surface.set_scroll_top(viewport_el, state.scroll_top);
            let now = Instant::now();
            state.pacer.note_scroll(now);
            run_cancel_pass(shared, &mut state, false);
            if state.scale_change_in_progress || shared.config.single_page.is_some() {
                false
            } else {
                state.throttle.allow(now)
            }
        };
        if recompute {
            apply_window(shared).await;
        }
        shared.wake.notify_one();
    }

    /// Navigate to a page (clamped): aligns the scroll offset to its top
    /// and recomputes the window immediately, bypassing the throttle.
    pub async fn go_to_page(&self, page: u32) -> u32 {
        let shared = &self.shared;
        let target = {
            let mut state = shared.lock();
            if state.destroyed {
                return state.current_page;
            }
            let count = state.positions.page_count().max(1);
            let target = page.clamp(1, count);
            state.scroll_top = state.positions.page_top(target).unwrap_or(0.0);
            let viewport_el = state.viewport_el;
            let scroll_top = state.scroll_top;
            let _ = shared.surface.set_scroll_top(viewport_el, scroll_top);
            // Navigation pins the center page; the midpoint rule would pick
            // a neighbor for pages shorter than half the viewport.
            state.current_page = target;
            target
        };
        apply_window_pinned(shared, Some(target)).await;
        target
    }

    pub fn set_zoom(&self, scale: f32) -> f32 {
        let snapped = self.shared.config.zoom.snap(scale);
        apply_scale_change(&self.shared, snapped)
    }

    pub fn zoom_in(&self) -> f32 {
        let next = {
            let state = self.shared.lock();
            self.shared.config.zoom.zoom_in(state.scale)
        };
        apply_scale_change(&self.shared, next)
    }

    pub fn zoom_out(&self) -> f32 {
        let next = {
            let state = self.shared.lock();
            self.shared.config.zoom.zoom_out(state.scale)
        };
        apply_scale_change(&self.shared, next)
    }

    pub fn fit_width(&self) -> f32 {
        let next = {
            let state = self.shared.lock();
            let max_base_width = max_base_width(&state);
            self.shared.config.zoom.fit_width(
                self.shared.config.viewport_width,
                self.shared.config.gap,
                max_base_width,
            )
        };
        apply_scale_change(&self.shared, next)
    }

    pub fn fit_page(&self) -> f32 {
        let next = {
            let state = self.shared.lock();
            let index = (state.current_page.saturating_sub(1)) as usize;
            let (w, h) = state
                .base_viewports
                .get(index)
                .map(|vp| (vp.width, vp.height))
                .unwrap_or((612.0, 792.0));
            self.shared.config.zoom.fit_page(
                self.shared.config.viewport_width,
                self.shared.config.viewport_height,
                self.shared.config.gap,
                w,
                h,
            )
        };
        apply_scale_change(&self.shared, next)
    }

    /// Rotate the document by quarter turns; re-lays-out and re-renders.
    pub fn rotate(&self, deg: u16) -> u16 {
        apply_rotation(&self.shared, (deg / 90 * 90) % 360)
    }

    pub fn current_page(&self) -> u32 {
        self.shared.lock().current_page
    }

    pub fn scale(&self) -> f32 {
        self.shared.lock().scale
    }

    pub fn rotation(&self) -> u16 {
        self.shared.lock().rotation
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    pub fn stats(&self) -> VirtStats {
        let state = self.shared.lock();
        VirtStats {
            materialized: state.slots.len(),
            queued: state.queue.len(),
            active_render: state.active_render.is_some(),
            current_page: state.current_page,
            scale: state.scale,
            fully_rendered_at_scale: state
                .slots
                .values()
                .filter(|s| s.is_fully_rendered && s.rendered_at(state.scale))
                .count(),
            queue_metrics: state.queue.metrics(),
        }
    }

    /// Wait until the queue is drained and no render is active. Test and
    /// shutdown helper; resolves immediately on a destroyed instance.
    pub async fn quiesce(&self) {
        loop {
            {
                let state = self.shared.lock();
                if state.destroyed
                    || (state.queue.is_empty() && state.active_render.is_none())
                {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Tear down every slot, stop both tasks, and remove the scaffold.
    /// Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = self.shared.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let pages: Vec<u32> = state.slots.keys().copied().collect();
            for page in pages {
                teardown_slot(&self.shared, &mut state, page);
            }
            state.queue.clear();
            state.wrappers.destroy();
            let viewport_el = state.viewport_el;
            let _ = self.shared.surface.remove_subtree(viewport_el);
        }
        self.shared.wake.notify_waiters();
        let mut pump = self.pump.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pump.take() {
            handle.abort();
        }
        let mut sweep = self.sweep.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sweep.take() {
            handle.abort();
        }
        debug!(target: "virt.window", instance = %self.shared.instance_id, "virtualizer_destroyed");
    }
}

impl Drop for Virtualizer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn window_range(state: &VirtState, config: &VirtualizerConfig) -> RangeInclusive<u32> {
    let count = state.positions.page_count().max(1);
    if let Some(page) = config.single_page {
        let page = page.clamp(1, count);
        return page..=page;
    }
    let center = state.current_page;
    let low = center.saturating_sub(config.buffer).max(1);
    let high = (center + config.buffer).min(count);
    low..=high
}

fn max_base_width(state: &VirtState) -> f32 {
    state
        .base_viewports
        .iter()
        .map(|vp| vp.width)
        .fold(0.0, f32::max)
}

fn scaled_viewport(state: &VirtState, page: u32, scale: f32) -> Option<Viewport> {
    let base = state.base_viewports.get((page.checked_sub(1)?) as usize)?;
    Some(base.clone_with(ViewportCloneOpts {
        scale: Some(scale),
        rotation: Some(state.rotation),
    }))
}

fn resize_content(shared: &Shared, state: &VirtState) -> Result<(), core_dom::DomError> {
    shared.surface.set_style(
        state.content_el,
        "width",
        &format!("{:.2}px", state.positions.container_width()),
    )?;
    shared.surface.set_style(
        state.content_el,
        "height",
        &format!("{:.2}px", state.positions.container_height()),
    )?;
    Ok(())
}

/// Recompute the window from the scroll offset and reconcile slots.
async fn apply_window(shared: &Arc<Shared>) {
    apply_window_pinned(shared, None).await;
}

async fn apply_window_pinned(shared: &Arc<Shared>, pinned_center: Option<u32>) {
    let (entering, notify_page) = {
        let mut state = shared.lock();
        if state.destroyed {
            return;
        }
        let count = state.positions.page_count().max(1);
        let center = shared
            .config
            .single_page
            .map(|page| page.clamp(1, count))
            .or(pinned_center)
            .unwrap_or_else(|| {
                state
                    .positions
                    .center_page(state.scroll_top, shared.config.viewport_height)
            });
        state.current_page = center;
        let window = window_range(&state, &shared.config);

        let leaving: Vec<u32> = state
            .slots
            .keys()
            .copied()
            .filter(|p| !window.contains(p))
            .collect();
        for page in leaving {
            teardown_slot(shared, &mut state, page);
        }

        let mut entering = Vec::new();
        let scale = state.scale;
        for page in window.clone() {
            match state.slots.get_mut(&page) {
                None => entering.push(page),
                Some(slot) => {
                    slot.is_visible = true;
                    let needs_render = !(slot.rendered_at(scale)
                        && (scale <= 1.0 || slot.hires_bitmap.is_some()));
                    if needs_render && !slot.is_transitioning {
                        state.queue.enqueue(page, priority_for(page, center));
                    }
                }
            }
        }

        let notify = (state.last_notified_page != Some(center)).then_some(center);
        if notify.is_some() {
            state.last_notified_page = Some(center);
        }
        trace!(
            target: "virt.window",
            instance = %shared.instance_id,
            center,
            window_start = *window.start(),
            window_end = *window.end(),
            entering = entering.len(),
            "window_update"
        );
        (entering, notify)
    };

    for page in entering {
        materialize_slot(shared, page).await;
    }
    if let Some(page) = notify_page {
        shared.bus.emit(ViewerEvent::PageChange { page });
    }
    shared.wake.notify_one();
}

/// Create the placeholder slot for a page: fetch the handle (once, to learn
/// dimensions), allocate a wrapper, size and position it, and queue the
/// render.
async fn materialize_slot(shared: &Arc<Shared>, page_number: u32) {
    let handle = match shared.document.page(page_number).await {
        Ok(handle) => handle,
        Err(error) => {
            warn!(
                target: "virt.window",
                instance = %shared.instance_id,
                page = page_number,
                %error,
                "page_fetch_failed"
            );
            return;
        }
    };

    let mut state = shared.lock();
    if state.destroyed || state.slots.contains_key(&page_number) {
        return;
    }
    if !window_range(&state, &shared.config).contains(&page_number) {
        return; // the window moved on while we were fetching
    }
    let Some(viewport) = scaled_viewport(&state, page_number, state.scale) else {
        return;
    };
    let Some(top) = state.positions.page_top(page_number) else {
        return;
    };

    let wrapper = state.wrappers.get();
    let surface = &shared.surface;
    let element = wrapper.element;
    let styled = surface
        .set_attribute(element, "data-page-number", &page_number.to_string())
        .and_then(|_| {
            surface.set_attribute(
                element,
                "id",
                &format!("pageContainer-{}-{}", shared.instance_id.0, page_number),
            )
        })
        .and_then(|_| surface.set_style(element, "position", "absolute"))
        .and_then(|_| surface.set_style(element, "top", &format!("{top:.2}px")))
        .and_then(|_| surface.set_style(element, "left", "50%"))
        .and_then(|_| surface.set_style(element, "transform", "translateX(-50%)"))
        .and_then(|_| surface.set_style(element, "width", &format!("{:.2}px", viewport.width)))
        .and_then(|_| surface.set_style(element, "height", &format!("{:.2}px", viewport.height)))
        .and_then(|_| surface.set_style(element, "background", "#fff"))
        .and_then(|_| surface.append_child(state.content_el, element));
    if let Err(error) = styled {
        warn!(target: "virt.window", page = page_number, %error, "wrapper_setup_failed");
        state.wrappers.release(wrapper);
        return;
    }

    let mut slot = PageSlot::new(page_number);
    state.next_generation += 1;
    slot.generation = state.next_generation;
    slot.page = Some(handle);
    slot.wrapper = Some(wrapper);
    slot.is_visible = true;
    state.slots.insert(page_number, slot);
    let current = state.current_page;
    state
        .queue
        .enqueue(page_number, priority_for(page_number, current));
}

/// Release everything a slot holds and drop it. Pooled surfaces go back to
/// their pools; overlays and the wrapper subtree are destroyed.
fn teardown_slot(shared: &Shared, state: &mut VirtState, page: u32) {
    let Some(mut slot) = state.slots.remove(&page) else {
        return;
    };
    release_base_tier(shared, &mut slot);
    release_hires_tier(shared, &mut slot);
    if let Some(overlay) = slot.text_overlay.take() {
        overlay.destroy(&shared.surface);
    }
    if let Some(overlay) = slot.annotation_overlay.take() {
        overlay.destroy(&shared.surface);
    }
    if let Some(page_handle) = slot.page.take() {
        page_handle.cleanup();
    }
    if let Some(wrapper) = slot.wrapper.take() {
        state.wrappers.release(wrapper);
    }
    state.queue.remove(page);
    trace!(target: "virt.window", instance = %shared.instance_id, page, "slot_torn_down");
}

/// Kill a slot's base tier: in-flight task, pooled canvas, DOM surface.
/// The slot falls back to a placeholder and re-renders on a later pass.
/// An in-flight job's own canvas stays job-owned; the generation bump
/// makes its eventual commit release it.
fn release_base_tier(shared: &Shared, slot: &mut PageSlot) {
    let mut touched = false;
    if let Some(control) = slot.base_control.take() {
        control.cancel();
        touched = true;
    }
    if let Some(canvas) = slot.base_canvas.take() {
        shared.canvas_pool.release(&canvas);
        touched = true;
    }
    if let Some(canvas_el) = slot.base_canvas_el.take() {
        let _ = shared.surface.remove_subtree(canvas_el);
    }
    if touched {
        slot.bump_generation();
        slot.rendered_scale = None;
        slot.is_fully_rendered = false;
        if slot.phase != SlotPhase::Failed {
            slot.phase = SlotPhase::Placeholder;
        }
    }
}

/// Kill a slot's hi-res tier: in-flight task, display canvas, bitmap,
/// overlay container.
fn release_hires_tier(shared: &Shared, slot: &mut PageSlot) {
    let mut touched = false;
    if let Some(control) = slot.hires_control.take() {
        control.cancel();
        touched = true;
    }
    if let Some(container) = slot.hires_container.take() {
        let _ = shared.surface.remove_subtree(container);
        touched = true;
    }
    if let Some(canvas) = slot.hires_canvas.take() {
        shared.canvas_pool.release(&canvas);
        touched = true;
    }
    if let Some(bitmap) = slot.hires_bitmap.take() {
        shared.bitmap_pool.release(&bitmap);
        touched = true;
    }
    if touched {
        slot.bump_generation();
        if slot.phase == SlotPhase::FullyRendered || slot.phase == SlotPhase::HiResRendering {
            slot.phase = SlotPhase::BaseRendered;
        }
    }
}

/// One cancellation pass over every slot. Runs on scroll, before each
/// dequeue, periodically, and (as `emergency`) under memory pressure.
/// Each applied action cancels the task, releases the pooled surface, and
/// clears the corresponding DOM layer.
fn run_cancel_pass(shared: &Shared, state: &mut VirtState, emergency: bool) {
    let pressure = memory_pressure(shared.gauge.as_ref(), &shared.canvas_pool);
    let context = CancelContext {
        current_page: state.current_page,
        buffer: shared.config.buffer,
        hard_limit: shared.config.hard_limit,
        rapid_scrolling: state.pacer.is_rapid(Instant::now()),
        memory_pressure: pressure,
    };
    let window = window_range(state, &shared.config);
    let pages: Vec<u32> = state.slots.keys().copied().collect();
    for page in pages {
        let visible = window.contains(&page);
        let actions = if emergency {
            context.emergency_plan(page, visible)
        } else {
            context.plan(page, visible)
        };
        if actions.is_empty() {
            continue;
        }
        if let Some(slot) = state.slots.get_mut(&page) {
            slot.is_visible = visible;
            if actions.contains(CancelAction::CANCEL_BASE) {
                release_base_tier(shared, slot);
            }
            if actions.contains(CancelAction::CANCEL_HIRES) {
                release_hires_tier(shared, slot);
            }
        }
        if actions.contains(CancelAction::DROP_QUEUED) {
            state.queue.remove(page);
        }
    }
    if emergency {
        state.queue.retain(|job| job.priority <= 1);
        shared.canvas_pool.handle_memory_pressure();
        shared.bitmap_pool.handle_memory_pressure();
        debug!(
            target: "virt.cancel",
            instance = %shared.instance_id,
            queue = state.queue.len(),
            "emergency_cancel"
        );
    }
}

/// The anchored scale transition (all steps are synchronous; in-flight
/// renders are invalidated by generation).
fn apply_scale_change(shared: &Arc<Shared>, new_scale: f32) -> f32 {
    let emitted = {
        let mut state = shared.lock();
        if state.destroyed || state.scale_change_in_progress {
            return state.scale;
        }
        if (new_scale - state.scale).abs() < f32::EPSILON {
            return state.scale;
        }
        state.scale_change_in_progress = true;
        let old_scale = state.scale;
        let anchor = state.current_page;
        let old_top = state.positions.page_top(anchor).unwrap_or(0.0);
        let offset_in_page = state.scroll_top - old_top;

        // Kill all in-flight work and the queue before touching layout.
        let pages: Vec<u32> = state.slots.keys().copied().collect();
        for page in &pages {
            if let Some(slot) = state.slots.get_mut(page) {
                if let Some(control) = slot.base_control.take() {
                    control.cancel();
                }
                if let Some(control) = slot.hires_control.take() {
                    control.cancel();
                }
                slot.bump_generation();
            }
        }
        state.queue.clear();

        state.scale = new_scale;
        let scaled: Vec<Viewport> = state
            .base_viewports
            .iter()
            .map(|vp| {
                vp.clone_with(ViewportCloneOpts {
                    scale: Some(new_scale),
                    rotation: Some(state.rotation),
                })
            })
            .collect();
        state.positions = PagePositionMap::rebuild(shared.config.gap, &scaled);
        let _ = resize_content(shared, &state);

        // Immediate CSS reflow of every visible slot; stale hi-res layers
        // are dropped outright.
        for page in &pages {
            resize_slot_for_scale(shared, &mut state, *page);
        }

        let new_top = state.positions.page_top(anchor).unwrap_or(0.0);
        state.scroll_top =
            anchored_scroll_top(new_top, offset_in_page, new_scale / old_scale);
        let viewport_el = state.viewport_el;
        let scroll_top = state.scroll_top;
        let _ = shared.surface.set_scroll_top(viewport_el, scroll_top);

        for page in &pages {
            if state.slots.contains_key(page) {
                state.queue.enqueue(*page, page.abs_diff(anchor));
            }
        }
        state.scale_change_in_progress = false;
        info!(
            target: "zoom",
            instance = %shared.instance_id,
            old_scale,
            new_scale,
            anchor,
            "scale_changed"
        );
        new_scale
    };
    shared.bus.emit(ViewerEvent::ScaleChange { scale: emitted });
    shared.wake.notify_one();
    emitted
}

/// Resize one slot's wrapper, base canvas CSS, and overlay transforms to
/// the current scale; clear its hi-res layer.
fn resize_slot_for_scale(shared: &Shared, state: &mut VirtState, page: u32) {
    let scale = state.scale;
    let Some(viewport) = scaled_viewport(state, page, scale) else {
        return;
    };
    let Some(top) = state.positions.page_top(page) else {
        return;
    };
    let Some(slot) = state.slots.get_mut(&page) else {
        return;
    };
    let surface = &shared.surface;
    if let Some(wrapper) = slot.wrapper {
        let _ = surface.set_style(wrapper.element, "top", &format!("{top:.2}px"));
        let _ = surface.set_style(wrapper.element, "width", &format!("{:.2}px", viewport.width));
        let _ = surface.set_style(wrapper.element, "height", &format!("{:.2}px", viewport.height));
    }
    if let Some(canvas) = &slot.base_canvas {
        canvas.set_css_size(viewport.width, viewport.height);
    }
    if let Some(canvas_el) = slot.base_canvas_el {
        let _ = surface.set_style(canvas_el, "width", &format!("{:.2}px", viewport.width));
        let _ = surface.set_style(canvas_el, "height", &format!("{:.2}px", viewport.height));
    }
    // Overlays were built at `rendered_scale`; stretch them until the next
    // base pass replaces the raster underneath.
    if let Some(rendered) = slot.rendered_scale {
        let ratio = scale / rendered;
        for root in [
            slot.text_overlay.as_ref().map(|o| o.root),
            slot.annotation_overlay.as_ref().map(|o| o.root),
        ]
        .into_iter()
        .flatten()
        {
            let _ = surface.set_style(root, "transform-origin", "0 0");
            let _ = surface.set_style(root, "transform", &format!("scale({ratio:.4})"));
        }
    }
    release_hires_tier(shared, slot);
}

fn apply_rotation(shared: &Arc<Shared>, deg: u16) -> u16 {
    let emitted = {
        let mut state = shared.lock();
        if state.destroyed || deg == state.rotation {
            return state.rotation;
        }
        state.rotation = deg;
        let pages: Vec<u32> = state.slots.keys().copied().collect();
        for page in &pages {
            if let Some(slot) = state.slots.get_mut(page) {
                if let Some(control) = slot.base_control.take() {
                    control.cancel();
                }
                if let Some(control) = slot.hires_control.take() {
                    control.cancel();
                }
                slot.bump_generation();
            }
        }
        state.queue.clear();

        let scale = state.scale;
        let scaled: Vec<Viewport> = state
            .base_viewports
            .iter()
            .map(|vp| {
                vp.clone_with(ViewportCloneOpts {
                    scale: Some(scale),
                    rotation: Some(deg),
                })
            })
            .collect();
        state.positions = PagePositionMap::rebuild(shared.config.gap, &scaled);
        let _ = resize_content(shared, &state);

        // A quarter-turn mirrors every raster: drop them and re-render.
        for page in &pages {
            resize_slot_for_scale(shared, &mut state, *page);
            if let Some(slot) = state.slots.get_mut(page) {
                release_base_tier(shared, slot);
            }
        }
        let anchor = state.current_page;
        for page in &pages {
            if state.slots.contains_key(page) {
                state.queue.enqueue(*page, page.abs_diff(anchor));
            }
        }
        deg
    };
    shared.bus.emit(ViewerEvent::RotationChange { deg: emitted });
    shared.wake.notify_one();
    emitted
}

enum PumpStep {
    Job(u32),
    Idle,
    Stop,
}

/// Strictly serialized queue pump: one job at a time, cancellation re-run
/// before every dequeue, cooperative pause between jobs.
async fn pump_loop(shared: Arc<Shared>) {
    loop {
        let step = {
            let mut state = shared.lock();
            if state.destroyed {
                PumpStep::Stop
            } else {
                run_cancel_pass(&shared, &mut state, false);
                next_eligible_job(&shared, &mut state)
            }
        };
        match step {
            PumpStep::Stop => break,
            PumpStep::Idle => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
            PumpStep::Job(page) => {
                execute_job(&shared, page).await;
                {
                    let mut state = shared.lock();
                    state.active_render = None;
                    if let Some(slot) = state.slots.get_mut(&page) {
                        slot.is_transitioning = false;
                    }
                }
                tokio::time::sleep(Duration::from_millis(shared.config.queue_pause_ms)).await;
            }
        }
    }
}

/// Pop jobs until one passes the eligibility re-check. Ineligible jobs are
/// dropped (they re-enter on the next window pass if still needed).
fn next_eligible_job(shared: &Shared, state: &mut VirtState) -> PumpStep {
    loop {
        let Some(job) = state.queue.pop_best() else {
            return PumpStep::Idle;
        };
        let scale = state.scale;
        let Some(slot) = state.slots.get_mut(&job.page) else {
            continue;
        };
        if !slot.is_visible || slot.is_transitioning {
            continue;
        }
        let satisfied =
            slot.rendered_at(scale) && (scale <= 1.0 || slot.hires_bitmap.is_some());
        if satisfied {
            continue;
        }
        let Some(wrapper) = slot.wrapper else {
            continue;
        };
        if !shared.surface.is_attached(wrapper.element) {
            continue;
        }
        slot.render_failed = false;
        slot.is_transitioning = true;
        state.active_render = Some(job.page);
        return PumpStep::Job(job.page);
    }
}

struct JobInputs {
    handle: Arc<dyn PageHandle>,
    wrapper_el: ElementId,
    generation: u64,
    scale: f32,
    base_viewport: Viewport,
    full_viewport: Viewport,
    needs_base: bool,
}

fn snapshot_job_inputs(shared: &Shared, state: &VirtState, page: u32) -> Option<JobInputs> {
    let slot = state.slots.get(&page)?;
    let handle = slot.page.clone()?;
    let wrapper_el = slot.wrapper?.element;
    let scale = state.scale;
    let full_viewport = scaled_viewport(state, page, scale)?;
    let base_scale = if scale > 1.0 {
        (scale / 2.0).min(1.0)
    } else {
        scale
    };
    let base_viewport = scaled_viewport(state, page, base_scale)?;
    Some(JobInputs {
        handle,
        wrapper_el,
        generation: slot.generation,
        scale,
        base_viewport,
        full_viewport,
        needs_base: !slot.rendered_at(scale),
    })
}

/// Run the two-tier render for one page: base pass (plus overlays on first
/// success), then the hi-res pass when the scale calls for it.
async fn execute_job(shared: &Arc<Shared>, page: u32) {
    let Some(inputs) = ({
        let state = shared.lock();
        if state.destroyed {
            None
        } else {
            snapshot_job_inputs(shared, &state, page)
        }
    }) else {
        return;
    };

    if inputs.needs_base && !run_base_pass(shared, page, &inputs).await {
        return;
    }
    if inputs.scale > 1.0 {
        run_hires_pass(shared, page, &inputs).await;
    }
}

/// Base pass. Returns whether the slot holds a fresh base raster (and may
/// proceed to hi-res).
async fn run_base_pass(shared: &Arc<Shared>, page: u32, inputs: &JobInputs) -> bool {
    let canvas = match shared
        .canvas_pool
        .acquire(inputs.base_viewport.width, inputs.base_viewport.height)
    {
        Ok(canvas) => canvas,
        Err(error) => {
            warn!(target: "virt.queue", page, %error, "base_canvas_unavailable");
            return false;
        }
    };
    // The low-resolution raster is CSS-stretched to the visual size.
    canvas.set_css_size(inputs.full_viewport.width, inputs.full_viewport.height);

    let task = inputs.handle.render(&canvas, &inputs.base_viewport);
    {
        let mut state = shared.lock();
        let destroyed = state.destroyed;
        match state.slots.get_mut(&page) {
            Some(slot) if slot.generation == inputs.generation && !destroyed => {
                slot.base_control = Some(task.control());
                slot.phase = SlotPhase::BaseRendering;
            }
            _ => {
                task.cancel();
                shared.canvas_pool.release(&canvas);
                return false;
            }
        }
    }

    let result = task.wait().await;
    let committed = {
        let mut state = shared.lock();
        let valid = !state.destroyed
            && state
                .slots
                .get(&page)
                .is_some_and(|s| s.generation == inputs.generation);
        if !valid {
            shared.canvas_pool.release(&canvas);
            false
        } else {
            let surface = shared.surface.clone();
            let slot = state
                .slots
                .get_mut(&page)
                .expect("slot presence checked above");
            slot.base_control = None;
            match result {
                Ok(()) => {
                    let canvas_el = surface.create_element("canvas");
                    let attach = surface
                        .set_style(canvas_el, "position", "absolute")
                        .and_then(|_| surface.set_style(canvas_el, "top", "0"))
                        .and_then(|_| surface.set_style(canvas_el, "left", "0"))
                        .and_then(|_| {
                            surface.set_style(
                                canvas_el,
                                "width",
                                &format!("{:.2}px", inputs.full_viewport.width),
                            )
                        })
                        .and_then(|_| {
                            surface.set_style(
                                canvas_el,
                                "height",
                                &format!("{:.2}px", inputs.full_viewport.height),
                            )
                        })
                        .and_then(|_| surface.append_child(inputs.wrapper_el, canvas_el));
                    match attach {
                        Ok(()) => {
                            if let Some(old) = slot.base_canvas.take() {
                                shared.canvas_pool.release(&old);
                            }
                            if let Some(old_el) = slot.base_canvas_el.take() {
                                let _ = surface.remove_subtree(old_el);
                            }
                            slot.base_canvas = Some(canvas.clone());
                            slot.base_canvas_el = Some(canvas_el);
                            slot.rendered_scale = Some(inputs.scale);
                            slot.phase = SlotPhase::BaseRendered;
                            true
                        }
                        Err(error) => {
                            let _ = surface.remove_subtree(canvas_el);
                            shared.canvas_pool.release(&canvas);
                            slot.render_failed = true;
                            slot.phase = SlotPhase::Failed;
                            warn!(target: "virt.queue", page, %error, "base_attach_failed");
                            false
                        }
                    }
                }
                Err(error) if error.is_cancelled() => {
                    shared.canvas_pool.release(&canvas);
                    slot.phase = SlotPhase::Placeholder;
                    trace!(target: "virt.cancel", page, "base_cancelled");
                    false
                }
                Err(error) => {
                    shared.canvas_pool.release(&canvas);
                    slot.render_failed = true;
                    slot.phase = SlotPhase::Failed;
                    warn!(target: "virt.queue", page, %error, "base_render_failed");
                    false
                }
            }
        }
    };
    if !committed {
        return false;
    }

    attach_overlays(shared, page, inputs).await;
    {
        let mut state = shared.lock();
        if let Some(slot) = state.slots.get_mut(&page)
            && slot.generation == inputs.generation
        {
            slot.is_fully_rendered = true;
        }
    }
    true
}

/// Build the text and annotation overlays exactly once per slot, after the
/// first successful base pass. Losing a teardown race is swallowed.
async fn attach_overlays(shared: &Arc<Shared>, page: u32, inputs: &JobInputs) {
    let (build_text, build_annotations) = {
        let state = shared.lock();
        match state.slots.get(&page) {
            Some(slot) if slot.generation == inputs.generation => (
                !shared.config.disable_text_overlay && slot.text_overlay.is_none(),
                slot.annotation_overlay.is_none(),
            ),
            _ => return,
        }
    };
    let alive = {
        let shared = Arc::clone(shared);
        let generation = inputs.generation;
        move || {
            let state = shared.lock();
            !state.destroyed
                && state
                    .slots
                    .get(&page)
                    .is_some_and(|s| s.generation == generation)
        }
    };

    if build_text {
        match build_text_overlay(
            &shared.surface,
            Arc::clone(&inputs.handle),
            inputs.wrapper_el,
            inputs.scale,
            alive.clone(),
        )
        .await
        {
            Ok(overlay) => {
                let mut state = shared.lock();
                match state.slots.get_mut(&page) {
                    Some(slot) if slot.generation == inputs.generation => {
                        slot.text_overlay = Some(overlay);
                    }
                    _ => overlay.destroy(&shared.surface),
                }
            }
            Err(crate::overlay::OverlayError::SlotDestroyed) => {}
            Err(error) => {
                warn!(target: "virt.queue", page, %error, "text_overlay_failed");
            }
        }
    }
    if build_annotations {
        match build_annotation_overlay(
            &shared.surface,
            Arc::clone(&inputs.handle),
            inputs.wrapper_el,
            inputs.scale,
            shared.annotation_layer.as_ref(),
            alive,
        )
        .await
        {
            Ok(overlay) => {
                let mut state = shared.lock();
                match state.slots.get_mut(&page) {
                    Some(slot) if slot.generation == inputs.generation => {
                        slot.annotation_overlay = Some(overlay);
                    }
                    _ => overlay.destroy(&shared.surface),
                }
            }
            Err(crate::overlay::OverlayError::SlotDestroyed) => {}
            Err(error) => {
                warn!(target: "virt.queue", page, %error, "annotation_overlay_failed");
            }
        }
    }
}

/// Hi-res pass: rasterize at the true scale offscreen, snapshot to a
/// bitmap, draw into a device-pixel display canvas layered above the base.
async fn run_hires_pass(shared: &Arc<Shared>, page: u32, inputs: &JobInputs) {
    let needs = {
        let state = shared.lock();
        state
            .slots
            .get(&page)
            .is_some_and(|s| s.generation == inputs.generation && s.hires_bitmap.is_none())
    };
    if !needs {
        return;
    }

    let offscreen = match shared
        .canvas_pool
        .acquire(inputs.full_viewport.width, inputs.full_viewport.height)
    {
        Ok(canvas) => canvas,
        Err(error) => {
            warn!(target: "virt.queue", page, %error, "hires_canvas_unavailable");
            return;
        }
    };
    let task = inputs.handle.render(&offscreen, &inputs.full_viewport);
    {
        let mut state = shared.lock();
        let destroyed = state.destroyed;
        match state.slots.get_mut(&page) {
            Some(slot) if slot.generation == inputs.generation && !destroyed => {
                slot.hires_control = Some(task.control());
                slot.phase = SlotPhase::HiResRendering;
            }
            _ => {
                task.cancel();
                shared.canvas_pool.release(&offscreen);
                return;
            }
        }
    }

    let result = task.wait().await;
    let mut state = shared.lock();
    let valid = !state.destroyed
        && state
            .slots
            .get(&page)
            .is_some_and(|s| s.generation == inputs.generation);
    if !valid {
        shared.canvas_pool.release(&offscreen);
        return;
    }
    let surface = shared.surface.clone();
    let slot = state
        .slots
        .get_mut(&page)
        .expect("slot presence checked above");
    slot.hires_control = None;
    match result {
        Ok(()) => {
            let bitmap = match shared.bitmap_pool.acquire(&offscreen, None, None) {
                Ok(bitmap) => bitmap,
                Err(error) => {
                    shared.canvas_pool.release(&offscreen);
                    slot.phase = SlotPhase::BaseRendered;
                    warn!(target: "virt.queue", page, %error, "hires_bitmap_unavailable");
                    return;
                }
            };
            shared.canvas_pool.release(&offscreen);
            let display = match shared
                .canvas_pool
                .acquire(inputs.full_viewport.width, inputs.full_viewport.height)
            {
                Ok(canvas) => canvas,
                Err(error) => {
                    shared.bitmap_pool.release(&bitmap);
                    slot.phase = SlotPhase::BaseRendered;
                    warn!(target: "virt.queue", page, %error, "hires_display_unavailable");
                    return;
                }
            };
            if let Err(error) = display.with_context(|ctx| ctx.draw_bitmap(&bitmap)) {
                shared.bitmap_pool.release(&bitmap);
                shared.canvas_pool.release(&display);
                slot.phase = SlotPhase::BaseRendered;
                warn!(target: "virt.queue", page, %error, "hires_blit_failed");
                return;
            }

            let container = surface.create_element("div");
            let attach = surface
                .set_attribute(container, "class", "hiResLayer")
                .and_then(|_| surface.set_style(container, "position", "absolute"))
                .and_then(|_| surface.set_style(container, "inset", "0"))
                .and_then(|_| {
                    let canvas_el = surface.create_element("canvas");
                    surface
                        .set_style(
                            canvas_el,
                            "width",
                            &format!("{:.2}px", inputs.full_viewport.width),
                        )
                        .and_then(|_| {
                            surface.set_style(
                                canvas_el,
                                "height",
                                &format!("{:.2}px", inputs.full_viewport.height),
                            )
                        })
                        .and_then(|_| surface.append_child(container, canvas_el))
                })
                .and_then(|_| surface.append_child(inputs.wrapper_el, container));
            match attach {
                Ok(()) => {
                    slot.hires_container = Some(container);
                    slot.hires_canvas = Some(display);
                    slot.hires_bitmap = Some(bitmap);
                    slot.phase = SlotPhase::FullyRendered;
                    trace!(target: "virt.queue", page, "hires_attached");
                }
                Err(error) => {
                    let _ = surface.remove_subtree(container);
                    shared.bitmap_pool.release(&bitmap);
                    shared.canvas_pool.release(&display);
                    slot.phase = SlotPhase::BaseRendered;
                    warn!(target: "virt.queue", page, %error, "hires_attach_failed");
                }
            }
        }
        Err(error) if error.is_cancelled() => {
            shared.canvas_pool.release(&offscreen);
            slot.phase = SlotPhase::BaseRendered;
            trace!(target: "virt.cancel", page, "hires_cancelled");
        }
        Err(error) => {
            shared.canvas_pool.release(&offscreen);
            slot.render_failed = true;
            slot.phase = SlotPhase::BaseRendered;
            warn!(target: "virt.queue", page, %error, "hires_render_failed");
        }
    }
}

/// Maintenance sweep: periodic cancellation, emergency handling under
/// pressure, pool cleanup on a slower cadence, and trailing-edge window
/// recomputation for scrolls the throttle swallowed.
async fn sweep_loop(shared: Arc<Shared>) {
    let interval = Duration::from_millis(shared.config.sweep_interval_ms.max(1));
    let cleanup_every = (30_000 / shared.config.sweep_interval_ms.max(1)).max(1);
    let mut ticks: u64 = 0;
    loop {
        tokio::time::sleep(interval).await;
        let recompute = {
            let mut state = shared.lock();
            if state.destroyed {
                break;
            }
            ticks += 1;
            let pressure = memory_pressure(shared.gauge.as_ref(), &shared.canvas_pool);
            run_cancel_pass(&shared, &mut state, pressure);
            if ticks % cleanup_every == 0 {
                shared.canvas_pool.periodic_cleanup();
                shared.bitmap_pool.cleanup();
            }
            let center = state
                .positions
                .center_page(state.scroll_top, shared.config.viewport_height);
            !state.scale_change_in_progress
                && shared.config.single_page.is_none()
                && center != state.current_page
        };
        if recompute {
            apply_window(&shared).await;
        }
        shared.wake.notify_one();
    }
}
