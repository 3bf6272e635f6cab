//! Page slot: the materialized record for one page in (or near) the
//! window.
//!
//! Phase transitions:
//! `Placeholder → BaseRendering → BaseRendered → HiResRendering →
//! FullyRendered`, with `Failed` reachable from any rendering phase and
//! retried on a later queue pass. Cancellation moves a rendering phase back
//! to the last stable one. Slot teardown (leaving the window) can happen in
//! any phase.
//!
//! `generation` is bumped on every teardown or scale invalidation; async
//! completions capture the generation at start and discard their results on
//! mismatch, so a recycled slot never receives a stale raster.

use std::sync::Arc;

use core_dom::{Canvas, ElementId, ImageBitmap};
use core_provider::{PageHandle, RenderControl};

use crate::overlay::{AnnotationOverlay, TextOverlay};
use crate::wrapper::WrapperHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Placeholder,
    BaseRendering,
    BaseRendered,
    HiResRendering,
    FullyRendered,
    Failed,
}

pub struct PageSlot {
    pub page_number: u32,
    pub page: Option<Arc<dyn PageHandle>>,
    pub wrapper: Option<WrapperHandle>,
    pub base_canvas: Option<Canvas>,
    pub base_canvas_el: Option<ElementId>,
    pub base_control: Option<RenderControl>,
    pub hires_container: Option<ElementId>,
    pub hires_canvas: Option<Canvas>,
    pub hires_bitmap: Option<ImageBitmap>,
    pub hires_control: Option<RenderControl>,
    pub text_overlay: Option<TextOverlay>,
    pub annotation_overlay: Option<AnnotationOverlay>,
    pub is_visible: bool,
    pub is_fully_rendered: bool,
    pub rendered_scale: Option<f32>,
    pub render_failed: bool,
    pub is_transitioning: bool,
    pub phase: SlotPhase,
    pub generation: u64,
}

impl PageSlot {
    pub fn new(page_number: u32) -> Self {
        Self {
            page_number,
            page: None,
            wrapper: None,
            base_canvas: None,
            base_canvas_el: None,
            base_control: None,
            hires_container: None,
            hires_canvas: None,
            hires_bitmap: None,
            hires_control: None,
            text_overlay: None,
            annotation_overlay: None,
            is_visible: false,
            is_fully_rendered: false,
            rendered_scale: None,
            render_failed: false,
            is_transitioning: false,
            phase: SlotPhase::Placeholder,
            generation: 0,
        }
    }

    pub fn distance_to(&self, current_page: u32) -> u32 {
        self.page_number.abs_diff(current_page)
    }

    /// Whether the base raster matches `scale` (re-render needed otherwise).
    pub fn rendered_at(&self, scale: f32) -> bool {
        self.rendered_scale
            .is_some_and(|s| (s - scale).abs() < f32::EPSILON)
    }

    pub fn has_pending_base(&self) -> bool {
        self.base_control.is_some()
    }

    pub fn has_pending_hires(&self) -> bool {
        self.hires_control.is_some()
    }

    /// Invalidate async completions targeting this slot.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }
}

impl std::fmt::Debug for PageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSlot")
            .field("page_number", &self.page_number)
            .field("phase", &self.phase)
            .field("is_visible", &self.is_visible)
            .field("is_fully_rendered", &self.is_fully_rendered)
            .field("rendered_scale", &self.rendered_scale)
            .field("render_failed", &self.render_failed)
            .field("is_transitioning", &self.is_transitioning)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fresh_slot_is_a_bare_placeholder() {
        let slot = PageSlot::new(42);
        assert_eq!(slot.phase, SlotPhase::Placeholder);
        assert!(!slot.is_fully_rendered);
        assert!(!slot.rendered_at(1.0));
        assert!(!slot.has_pending_base());
        assert!(!slot.has_pending_hires());
    }

    #[test]
    fn rendered_at_requires_an_exact_scale_match() {
        let mut slot = PageSlot::new(1);
        slot.rendered_scale = Some(1.5);
        assert!(slot.rendered_at(1.5));
        assert!(!slot.rendered_at(1.25));
        assert!(!slot.rendered_at(2.0));
    }

    #[test]
    fn distance_is_symmetric() {
        let slot = PageSlot::new(10);
        assert_eq!(slot.distance_to(13), 3);
        assert_eq!(slot.distance_to(7), 3);
        assert_eq!(slot.distance_to(10), 0);
    }
}
