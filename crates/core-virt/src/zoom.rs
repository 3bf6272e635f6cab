//! Zoom policy: clamping, step snapping, fit computations, and the scroll
//! anchoring formula.
//!
//! Zoom-in/out steps multiplicatively (×1.25) and snaps the result to the
//! configured step, which produces the familiar 1.0 → 1.25 → 1.5 → 2.0
//! ladder; a snap that would not move still advances by one step so the
//! controls never stall at small scales.

/// Scale bounds and granularity for one viewer instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomPolicy {
    pub min_scale: f32,
    pub max_scale: f32,
    pub step: f32,
}

impl Default for ZoomPolicy {
    fn default() -> Self {
        Self {
            min_scale: 0.25,
            max_scale: 5.0,
            step: 0.25,
        }
    }
}

const ZOOM_FACTOR: f32 = 1.25;

impl ZoomPolicy {
    /// Snap to the nearest step multiple, then clamp to the bounds.
    pub fn snap(&self, scale: f32) -> f32 {
        let snapped = (scale / self.step).round() * self.step;
        snapped.clamp(self.min_scale, self.max_scale)
    }

    pub fn zoom_in(&self, current: f32) -> f32 {
        let next = self.snap(current * ZOOM_FACTOR);
        if next <= current {
            self.snap(current + self.step)
        } else {
            next
        }
    }

    pub fn zoom_out(&self, current: f32) -> f32 {
        let next = self.snap(current / ZOOM_FACTOR);
        if next >= current {
            self.snap(current - self.step)
        } else {
            next
        }
    }

    /// Scale at which the widest page fills the viewport width (minus the
    /// page gutters).
    pub fn fit_width(&self, viewport_width: f32, gap: f32, max_page_width_at_1: f32) -> f32 {
        if max_page_width_at_1 <= 0.0 {
            return self.snap(1.0);
        }
        let available = (viewport_width - 2.0 * gap).max(1.0);
        self.snap(available / max_page_width_at_1)
    }

    /// Scale at which one full page fits the viewport box.
    pub fn fit_page(
        &self,
        viewport_width: f32,
        viewport_height: f32,
        gap: f32,
        page_width_at_1: f32,
        page_height_at_1: f32,
    ) -> f32 {
        if page_width_at_1 <= 0.0 || page_height_at_1 <= 0.0 {
            return self.snap(1.0);
        }
        let w = (viewport_width - 2.0 * gap).max(1.0) / page_width_at_1;
        let h = (viewport_height - 2.0 * gap).max(1.0) / page_height_at_1;
        self.snap(w.min(h))
    }
}

/// Scroll offset that keeps the anchor page's relative offset stable
/// across a scale change.
pub fn anchored_scroll_top(new_page_top: f32, old_offset_in_page: f32, scale_ratio: f32) -> f32 {
    (new_page_top + old_offset_in_page * scale_ratio).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_rounds_to_quarter_steps_and_clamps() {
        let policy = ZoomPolicy::default();
        assert_eq!(policy.snap(1.1), 1.0);
        assert_eq!(policy.snap(1.13), 1.25);
        assert_eq!(policy.snap(0.05), 0.25);
        assert_eq!(policy.snap(9.0), 5.0);
    }

    #[test]
    fn zoom_in_ladder_from_one_reaches_two_in_three_steps() {
        let policy = ZoomPolicy::default();
        let s1 = policy.zoom_in(1.0);
        let s2 = policy.zoom_in(s1);
        let s3 = policy.zoom_in(s2);
        assert_eq!(s1, 1.25);
        assert_eq!(s2, 1.5);
        assert_eq!(s3, 2.0);
    }

    #[test]
    fn zoom_in_never_stalls_at_small_scales() {
        let policy = ZoomPolicy::default();
        // 0.25 * 1.25 snaps back to 0.25; the step fallback must advance.
        assert_eq!(policy.zoom_in(0.25), 0.5);
    }

    #[test]
    fn zoom_out_descends_and_respects_the_floor() {
        let policy = ZoomPolicy::default();
        assert_eq!(policy.zoom_out(2.0), 1.5);
        assert_eq!(policy.zoom_out(0.5), 0.25);
        assert_eq!(policy.zoom_out(0.25), 0.25);
    }

    #[test]
    fn fit_width_uses_available_width_over_widest_page() {
        let policy = ZoomPolicy::default();
        // (960 - 30) / 612 = 1.519... -> snaps to 1.5
        assert_eq!(policy.fit_width(960.0, 15.0, 612.0), 1.5);
    }

    #[test]
    fn fit_page_takes_the_smaller_ratio() {
        let policy = ZoomPolicy::default();
        // width ratio ~1.52, height ratio (900-30)/792 ~1.10 -> 1.0 after snap
        assert_eq!(policy.fit_page(960.0, 900.0, 15.0, 612.0, 792.0), 1.0);
    }

    #[test]
    fn anchoring_scales_the_in_page_offset() {
        // Page top moved from 100 to 200 (scale doubled), offset 40 -> 80.
        assert_eq!(anchored_scroll_top(200.0, 40.0, 2.0), 280.0);
        assert_eq!(anchored_scroll_top(0.0, -10.0, 1.0), 0.0, "clamped at zero");
    }
}
