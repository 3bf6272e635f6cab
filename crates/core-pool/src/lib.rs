//! Raster surface pools scoped to one viewer instance.
//!
//! Both pools amortize allocation the same way: entries are borrowed (never
//! owned) by page slots, idle entries are evicted LRU-first, and a
//! memory-pressure signal force-shrinks. Canvases are matched by
//! power-of-two size buckets; bitmaps by exact size with a small-slack
//! carve-out. Nothing here is shared across instances.
//!
//! Memory pressure is true when the runtime heap gauge reports a ratio
//! above [`HEAP_PRESSURE_RATIO`], or when the canvas pool's estimated
//! occupancy exceeds [`POOL_PRESSURE_BYTES`].

mod bitmap_pool;
mod canvas_pool;

pub use bitmap_pool::{BitmapPool, BitmapPoolConfig, BitmapPoolStats};
pub use canvas_pool::{CanvasPool, CanvasPoolConfig, CanvasPoolStats, bucket_size};

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Heap-used / heap-limit ratio above which the instance is considered
/// under memory pressure.
pub const HEAP_PRESSURE_RATIO: f64 = 0.75;

/// Estimated in-pool canvas bytes above which the instance is considered
/// under memory pressure.
pub const POOL_PRESSURE_BYTES: u64 = 50 * 1024 * 1024;

/// Infrastructure-level pool failures. Per-page render failures never
/// surface here.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool was destroyed")]
    Destroyed,
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Seam for the runtime's heap statistics. Real embedders wire the host
/// signal; headless environments use [`NoopGauge`].
pub trait MemoryGauge: Send + Sync {
    /// `heap_used / heap_limit`, when the runtime exposes it.
    fn heap_ratio(&self) -> Option<f64>;
}

/// Gauge for runtimes without heap statistics.
#[derive(Debug, Default)]
pub struct NoopGauge;

impl MemoryGauge for NoopGauge {
    fn heap_ratio(&self) -> Option<f64> {
        None
    }
}

/// Settable gauge used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct FixedGauge {
    ratio_bits: AtomicU64,
}

impl FixedGauge {
    pub fn new(ratio: f64) -> Self {
        let gauge = Self::default();
        gauge.set_ratio(ratio);
        gauge
    }

    pub fn set_ratio(&self, ratio: f64) {
        self.ratio_bits.store(ratio.to_bits(), Ordering::SeqCst);
    }
}

impl MemoryGauge for FixedGauge {
    fn heap_ratio(&self) -> Option<f64> {
        let bits = self.ratio_bits.load(Ordering::SeqCst);
        let ratio = f64::from_bits(bits);
        (ratio > 0.0).then_some(ratio)
    }
}

/// Combined pressure predicate over the heap gauge and pool occupancy.
pub fn memory_pressure(gauge: &dyn MemoryGauge, canvas_pool: &CanvasPool) -> bool {
    if gauge.heap_ratio().is_some_and(|r| r > HEAP_PRESSURE_RATIO) {
        return true;
    }
    canvas_pool.estimated_bytes() > POOL_PRESSURE_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_gauge_reports_only_positive_ratios() {
        let gauge = FixedGauge::default();
        assert_eq!(gauge.heap_ratio(), None);
        gauge.set_ratio(0.9);
        assert_eq!(gauge.heap_ratio(), Some(0.9));
    }

    #[test]
    fn heap_ratio_above_threshold_is_pressure() {
        let pool = CanvasPool::new(CanvasPoolConfig::default());
        assert!(!memory_pressure(&NoopGauge, &pool));
        assert!(!memory_pressure(&FixedGauge::new(0.75), &pool));
        assert!(memory_pressure(&FixedGauge::new(0.76), &pool));
    }
}
