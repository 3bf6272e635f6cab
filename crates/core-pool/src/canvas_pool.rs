//! Bucketed canvas pool.
//!
//! Matching is by bucket (next power of two, minimum 64): an idle entry
//! whose buckets cover the required pixels is resized to the exact physical
//! size and handed out with a fully reset context. Physical dimensions are
//! always exact; buckets only control reuse.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use core_dom::Canvas;
use tracing::{debug, trace};

use crate::{PoolError, PoolResult};

/// Bucket a pixel extent: next power of two, at least 64.
pub fn bucket_size(px: u32) -> u32 {
    px.max(64).next_power_of_two()
}

#[derive(Debug, Clone, Copy)]
pub struct CanvasPoolConfig {
    pub max_entries: usize,
    pub device_pixel_ratio: f32,
}

impl Default for CanvasPoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 20,
            device_pixel_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasPoolStats {
    pub total: usize,
    pub in_use: usize,
    pub free: usize,
    pub estimated_bytes: u64,
    pub created_total: u64,
    pub reused_total: u64,
}

impl CanvasPoolStats {
    pub fn estimated_mb(&self) -> f64 {
        self.estimated_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug)]
struct Entry {
    canvas: Canvas,
    bucket_w: u32,
    bucket_h: u32,
    in_use: bool,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<Entry>,
    created: u64,
    reused: u64,
    destroyed: bool,
}

#[derive(Debug)]
pub struct CanvasPool {
    config: CanvasPoolConfig,
    state: Mutex<PoolState>,
}

impl CanvasPool {
    pub fn new(config: CanvasPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device_pixel_ratio(&self) -> f32 {
        self.config.device_pixel_ratio
    }

    /// Borrow a canvas sized for a `css_w x css_h` box. The returned canvas
    /// has exact physical pixels (`ceil(css * dpr)`), the requested CSS
    /// size, and a fresh context carrying only the dpr scale.
    pub fn acquire(&self, css_w: f32, css_h: f32) -> PoolResult<Canvas> {
        let dpr = self.config.device_pixel_ratio;
        let required_w = (css_w * dpr).ceil().max(1.0) as u32;
        let required_h = (css_h * dpr).ceil().max(1.0) as u32;

        let mut state = self.lock();
        if state.destroyed {
            return Err(PoolError::Destroyed);
        }

        // Best fit: the idle entry wasting the least bucket area.
        let candidate = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_use && e.bucket_w >= required_w && e.bucket_h >= required_h)
            .min_by_key(|(_, e)| e.bucket_w as u64 * e.bucket_h as u64)
            .map(|(i, _)| i);

        if let Some(index) = candidate {
            let entry = &mut state.entries[index];
            entry.canvas.set_physical_size(required_w, required_h);
            entry.canvas.set_css_size(css_w, css_h);
            reset_for_handout(&entry.canvas, dpr);
            entry.in_use = true;
            entry.last_used = Instant::now();
            state.reused += 1;
            trace!(target: "pool.canvas", required_w, required_h, "canvas_reused");
            return Ok(state.entries[index].canvas.clone());
        }

        let canvas = Canvas::new(required_w, required_h);
        canvas.set_css_size(css_w, css_h);
        reset_for_handout(&canvas, dpr);
        state.created += 1;

        if state.entries.len() < self.config.max_entries {
            state.entries.push(Entry {
                canvas: canvas.clone(),
                bucket_w: bucket_size(required_w),
                bucket_h: bucket_size(required_h),
                in_use: true,
                last_used: Instant::now(),
            });
            trace!(target: "pool.canvas", required_w, required_h, "canvas_pooled");
        } else {
            // Pool saturated: hand out an untracked canvas that dies with
            // its borrower.
            debug!(target: "pool.canvas", required_w, required_h, "canvas_adhoc");
        }
        Ok(canvas)
    }

    /// Return a canvas. Pooled entries are scrubbed and marked idle;
    /// untracked canvases are simply forgotten. Returns whether the canvas
    /// was pooled.
    pub fn release(&self, canvas: &Canvas) -> bool {
        let mut state = self.lock();
        let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.canvas.id() == canvas.id())
        else {
            return false;
        };
        let (w, h) = entry.canvas.physical_size();
        entry.canvas.with_context(|ctx| {
            ctx.set_transform(core_dom::IDENTITY);
            ctx.clear_rect(0.0, 0.0, w as f32, h as f32);
        });
        entry.in_use = false;
        entry.last_used = Instant::now();
        true
    }

    /// Evict idle entries LRU-first until at most `target` remain.
    pub fn shrink(&self, target: usize) {
        let mut state = self.lock();
        while state.entries.len() > target {
            let victim = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i);
            match victim {
                Some(index) => {
                    state.entries.swap_remove(index);
                }
                None => break, // everything is borrowed
            }
        }
        debug!(target: "pool.canvas", remaining = state.entries.len(), shrink_target = target, "pool_shrunk");
    }

    /// Aggressive shrink used under memory pressure: keep ~30 % of capacity.
    pub fn handle_memory_pressure(&self) {
        self.shrink(self.config.max_entries * 3 / 10);
    }

    /// Periodic maintenance: when 70 % or more of the pool sits idle,
    /// shrink down to the pressure target. Scheduling is the owner's job.
    pub fn periodic_cleanup(&self) {
        let stats = self.stats();
        if stats.total > 0 && stats.free * 10 >= stats.total * 7 {
            self.handle_memory_pressure();
        }
    }

    pub fn estimated_bytes(&self) -> u64 {
        let state = self.lock();
        state.entries.iter().map(|e| e.canvas.estimated_bytes()).sum()
    }

    pub fn stats(&self) -> CanvasPoolStats {
        let state = self.lock();
        let in_use = state.entries.iter().filter(|e| e.in_use).count();
        CanvasPoolStats {
            total: state.entries.len(),
            in_use,
            free: state.entries.len() - in_use,
            estimated_bytes: state
                .entries
                .iter()
                .map(|e| e.canvas.estimated_bytes())
                .sum(),
            created_total: state.created,
            reused_total: state.reused,
        }
    }

    /// Drop every entry and refuse future acquires. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        state.entries.clear();
    }
}

fn reset_for_handout(canvas: &Canvas, dpr: f32) {
    canvas.with_context(|ctx| {
        ctx.reset();
        ctx.scale(dpr, dpr);
    });
}
