//! Page position map: vertical layout of all pages at the current scale
//! and rotation.
//!
//! Rebuilt whenever scale or rotation changes by accumulating
//! `viewport.height + gap` in page order. Center-page selection follows the
//! viewport vertical midpoint: the page whose vertical range contains it;
//! above all pages resolves to the first, below all to the last, and a
//! midpoint inside an inter-page gap to the next page below it.

use core_provider::Viewport;

/// Default separation between consecutive pages, CSS pixels.
pub const PAGE_GAP: f32 = 15.0;

#[derive(Debug, Clone, Default)]
pub struct PagePositionMap {
    tops: Vec<f32>,
    heights: Vec<f32>,
    widths: Vec<f32>,
    gap: f32,
    max_width: f32,
    content_bottom: f32,
}

impl PagePositionMap {
    /// Build from per-page viewports (index 0 is page 1).
    pub fn rebuild(gap: f32, viewports: &[Viewport]) -> Self {
        let mut tops = Vec::with_capacity(viewports.len());
        let mut heights = Vec::with_capacity(viewports.len());
        let mut widths = Vec::with_capacity(viewports.len());
        let mut cursor = gap;
        let mut max_width = 0.0f32;
        for vp in viewports {
            tops.push(cursor);
            heights.push(vp.height);
            widths.push(vp.width);
            max_width = max_width.max(vp.width);
            cursor += vp.height + gap;
        }
        Self {
            tops,
            heights,
            widths,
            gap,
            max_width,
            // cursor already includes the trailing gap.
            content_bottom: cursor,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.tops.len() as u32
    }

    pub fn page_top(&self, page: u32) -> Option<f32> {
        self.tops.get(page.checked_sub(1)? as usize).copied()
    }

    pub fn page_height(&self, page: u32) -> Option<f32> {
        self.heights.get(page.checked_sub(1)? as usize).copied()
    }

    pub fn page_width(&self, page: u32) -> Option<f32> {
        self.widths.get(page.checked_sub(1)? as usize).copied()
    }

    /// Widest page at the map's scale; cached during rebuild so fit
    /// computations stay O(1).
    pub fn max_page_width(&self) -> f32 {
        self.max_width
    }

    pub fn container_height(&self) -> f32 {
        self.content_bottom
    }

    pub fn container_width(&self) -> f32 {
        self.max_width + 2.0 * self.gap
    }

    /// Page whose vertical range contains the viewport midpoint.
    pub fn center_page(&self, scroll_top: f32, viewport_height: f32) -> u32 {
        let count = self.page_count();
        if count == 0 {
            return 1;
        }
        let midpoint = scroll_top + viewport_height / 2.0;
        for page in 1..=count {
            let index = (page - 1) as usize;
            let top = self.tops[index];
            if midpoint < top {
                // Above this page: either above all pages or inside the gap
                // preceding it.
                return page;
            }
            if midpoint <= top + self.heights[index] {
                return page;
            }
        }
        count
    }
}
