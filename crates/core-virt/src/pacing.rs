//! Scroll pacing: rapid-scroll detection and windowing throttle.
//!
//! Both are pure state machines over caller-supplied instants so the
//! policies are testable without a clock.

use std::time::{Duration, Instant};

/// Rapid scrolling is true while consecutive scroll events arrive closer
/// than the threshold; it decays after twice the threshold of inactivity.
#[derive(Debug)]
pub struct ScrollPacer {
    threshold: Duration,
    last_event: Option<Instant>,
    rapid_until: Option<Instant>,
}

impl ScrollPacer {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_event: None,
            rapid_until: None,
        }
    }

    /// Record a scroll event; returns whether rapid scrolling is active.
    pub fn note_scroll(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_event
            && now.saturating_duration_since(last) < self.threshold
        {
            self.rapid_until = Some(now + self.threshold * 2);
        }
        self.last_event = Some(now);
        self.is_rapid(now)
    }

    pub fn is_rapid(&self, now: Instant) -> bool {
        self.rapid_until.is_some_and(|until| now < until)
    }
}

/// Leading-edge throttle for windowing recomputation.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_allowed: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_allowed: None,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last_allowed {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_allowed = Some(now);
                true
            }
        }
    }
}
