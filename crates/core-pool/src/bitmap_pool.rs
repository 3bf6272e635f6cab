//! High-resolution bitmap pool.
//!
//! Entry slots are reused, bitmap contents are not: acquiring through a
//! compatible idle slot closes the stale snapshot and takes a new one.
//! Small bitmaps (both sides ≤ 128 px) match within a 32 px slack so
//! thumbnail-sized overlays share slots; larger sizes must match exactly.
//! Evicted and destroyed entries always close their bitmap.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use core_dom::{Canvas, ImageBitmap};
use tracing::{debug, trace};

use crate::{PoolError, PoolResult};

const SMALL_SIDE_PX: u32 = 128;
const SMALL_SLACK_PX: u32 = 32;

#[derive(Debug, Clone, Copy)]
pub struct BitmapPoolConfig {
    pub max_entries: usize,
    /// Idle entries older than this are closed by [`BitmapPool::cleanup`].
    pub max_idle_age: Duration,
}

impl Default for BitmapPoolConfig {
    fn default() -> Self {
        Self {
            max_entries: 12,
            max_idle_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapPoolStats {
    pub total: usize,
    pub in_use: usize,
    pub free: usize,
    pub estimated_bytes: u64,
}

#[derive(Debug)]
struct Entry {
    bitmap: ImageBitmap,
    width: u32,
    height: u32,
    in_use: bool,
    last_used: Instant,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<Entry>,
    destroyed: bool,
}

#[derive(Debug)]
pub struct BitmapPool {
    config: BitmapPoolConfig,
    state: Mutex<PoolState>,
}

fn sizes_compatible(entry_w: u32, entry_h: u32, w: u32, h: u32) -> bool {
    if entry_w == w && entry_h == h {
        return true;
    }
    let small = entry_w.max(entry_h) <= SMALL_SIDE_PX && w.max(h) <= SMALL_SIDE_PX;
    small && entry_w.abs_diff(w) <= SMALL_SLACK_PX && entry_h.abs_diff(h) <= SMALL_SLACK_PX
}

impl BitmapPool {
    pub fn new(config: BitmapPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot `source` into a pooled bitmap. `width`/`height` override the
    /// canvas' physical size when given.
    pub fn acquire(
        &self,
        source: &Canvas,
        width: Option<u32>,
        height: Option<u32>,
    ) -> PoolResult<ImageBitmap> {
        let (src_w, src_h) = source.physical_size();
        let w = width.unwrap_or(src_w);
        let h = height.unwrap_or(src_h);

        let mut state = self.lock();
        if state.destroyed {
            return Err(PoolError::Destroyed);
        }

        let slot = state
            .entries
            .iter()
            .position(|e| !e.in_use && sizes_compatible(e.width, e.height, w, h));
        if let Some(index) = slot {
            let entry = &mut state.entries[index];
            entry.bitmap.close();
            entry.bitmap = ImageBitmap::with_size(w, h);
            entry.width = w;
            entry.height = h;
            entry.in_use = true;
            entry.last_used = Instant::now();
            trace!(target: "pool.bitmap", w, h, "bitmap_slot_reused");
            return Ok(entry.bitmap.clone());
        }

        if state.entries.len() >= self.config.max_entries {
            let victim = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i);
            match victim {
                Some(index) => {
                    state.entries[index].bitmap.close();
                    state.entries.swap_remove(index);
                    debug!(target: "pool.bitmap", "bitmap_evicted_lru");
                }
                None => {
                    // Every slot is borrowed; hand out an untracked bitmap.
                    debug!(target: "pool.bitmap", w, h, "bitmap_adhoc");
                    return Ok(ImageBitmap::with_size(w, h));
                }
            }
        }

        let bitmap = ImageBitmap::with_size(w, h);
        state.entries.push(Entry {
            bitmap: bitmap.clone(),
            width: w,
            height: h,
            in_use: true,
            last_used: Instant::now(),
            created_at: Instant::now(),
        });
        Ok(bitmap)
    }

    /// Mark a pooled bitmap idle. Untracked bitmaps are ignored.
    pub fn release(&self, bitmap: &ImageBitmap) -> bool {
        let mut state = self.lock();
        let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.bitmap.id() == bitmap.id())
        else {
            return false;
        };
        entry.in_use = false;
        entry.last_used = Instant::now();
        true
    }

    /// Close and drop idle entries older than the configured idle age.
    pub fn cleanup(&self) {
        let cutoff = self.config.max_idle_age;
        let mut state = self.lock();
        state.entries.retain(|e| {
            let stale = !e.in_use && e.last_used.elapsed() >= cutoff;
            if stale {
                e.bitmap.close();
            }
            !stale
        });
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
                    state.entries[index].bitmap.close();
                    state.entries.swap_remove(index);
                }
                None => break,
            }
        }
    }

    pub fn handle_memory_pressure(&self) {
        self.shrink(self.config.max_entries * 3 / 10);
    }

    pub fn stats(&self) -> BitmapPoolStats {
        let state = self.lock();
        let in_use = state.entries.iter().filter(|e| e.in_use).count();
        BitmapPoolStats {
            total: state.entries.len(),
            in_use,
            free: state.entries.len() - in_use,
            estimated_bytes: state
                .entries
                .iter()
                .map(|e| e.bitmap.estimated_bytes())
                .sum(),
        }
    }

    /// Close everything and refuse future acquires. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        for entry in state.entries.drain(..) {
            entry.bitmap.close();
        }
    }

    /// Age of the oldest entry, surfaced for maintenance diagnostics.
    pub fn oldest_entry_age(&self) -> Option<Duration> {
        let state = self.lock();
        state.entries.iter().map(|e| e.created_at.elapsed()).max()
    }
}
