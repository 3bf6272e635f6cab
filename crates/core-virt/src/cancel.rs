//! Aggressive cancellation policy.
//!
//! A cancellation pass classifies every slot by its distance to the
//! current page and decides three independent actions: kill the base task,
//! kill the hi-res task, drop the queued job. The current page is never
//! cancelled. When rapid scrolling and memory pressure hold at the same
//! time the conditions compose by OR, so the stricter distance limit wins.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CancelAction: u8 {
        const CANCEL_BASE   = 0b001;
        const CANCEL_HIRES  = 0b010;
        const DROP_QUEUED   = 0b100;
    }
}

/// Inputs a cancellation pass evaluates once and applies to every slot.
#[derive(Debug, Clone, Copy)]
pub struct CancelContext {
    pub current_page: u32,
    pub buffer: u32,
    pub hard_limit: u32,
    pub rapid_scrolling: bool,
    pub memory_pressure: bool,
}

impl CancelContext {
    /// Decide what to do with one slot.
    pub fn plan(&self, page: u32, visible: bool) -> CancelAction {
        if page == self.current_page {
            return CancelAction::empty();
        }
        let d = page.abs_diff(self.current_page);
        let mut actions = CancelAction::empty();

        let hires = !visible
            || d > self.hard_limit
            || (self.memory_pressure && d > 1)
            || (self.rapid_scrolling && d > self.buffer);
        if hires {
            actions |= CancelAction::CANCEL_HIRES;
        }

        let base = !visible
            || d > self.hard_limit
            || (self.rapid_scrolling && d > self.buffer)
            || (self.memory_pressure && d > self.buffer);
        if base {
            actions |= CancelAction::CANCEL_BASE;
        }

        let queued = !visible
            || d > self.hard_limit
            || (self.rapid_scrolling && d > self.buffer)
            || (self.memory_pressure && d > 1);
        if queued {
            actions |= CancelAction::DROP_QUEUED;
        }

        actions
    }

    /// Emergency policy: everything beyond the immediate neighbors goes.
    pub fn emergency_plan(&self, page: u32, visible: bool) -> CancelAction {
        if page == self.current_page {
            return CancelAction::empty();
        }
        if !visible || page.abs_diff(self.current_page) > 1 {
            CancelAction::all()
        } else {
            CancelAction::empty()
        }
    }
}
