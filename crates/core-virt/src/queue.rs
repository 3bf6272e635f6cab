//! Priority render queue.
//!
//! Contract:
//! - At most one job per page number; enqueueing an already-queued page
//!   replaces the job (fresh priority, fresh sequence number).
//! - `pop_best` returns the lowest `(priority, seq)` pair: lower priority
//!   value is more urgent, sequence breaks ties FIFO.
//! - Execution serialization is the pump's job; the queue only orders.

use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderJob {
    pub page: u32,
    pub priority: u32,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub replaced: u64,
    pub popped: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub struct RenderQueue {
    jobs: AHashMap<u32, RenderJob>,
    next_seq: u64,
    metrics: QueueMetrics,
}

/// Distance-based priority: 0 for the current page, then 1..B for the
/// buffer band, then plain distance beyond it.
pub fn priority_for(page: u32, current_page: u32) -> u32 {
    page.abs_diff(current_page)
}

impl RenderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, page: u32, priority: u32) {
        self.next_seq += 1;
        let job = RenderJob {
            page,
            priority,
            seq: self.next_seq,
        };
        if self.jobs.insert(page, job).is_some() {
            self.metrics.replaced += 1;
        } else {
            self.metrics.enqueued += 1;
        }
    }

    pub fn pop_best(&mut self) -> Option<RenderJob> {
        let best = self
            .jobs
            .values()
            .min_by_key(|j| (j.priority, j.seq))
            .copied()?;
        self.jobs.remove(&best.page);
        self.metrics.popped += 1;
        Some(best)
    }

    pub fn peek_best(&self) -> Option<RenderJob> {
        self.jobs.values().min_by_key(|j| (j.priority, j.seq)).copied()
    }

    pub fn remove(&mut self, page: u32) -> bool {
        let removed = self.jobs.remove(&page).is_some();
        if removed {
            self.metrics.dropped += 1;
        }
        removed
    }

    /// Keep only jobs the predicate accepts; the rest count as dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(&RenderJob) -> bool) {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| keep(job));
        self.metrics.dropped += (before - self.jobs.len()) as u64;
    }

    pub fn clear(&mut self) {
        self.metrics.dropped += self.jobs.len() as u64;
        self.jobs.clear();
    }

    pub fn contains(&self, page: u32) -> bool {
        self.jobs.contains_key(&page)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics
    }
}
