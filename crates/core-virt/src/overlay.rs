//! Overlay construction: text layer for selection/search and the
//! annotation layer seam.
//!
//! Overlays are built strictly after a successful base pass and are owned
//! by their slot. Construction awaits provider content, so it can race a
//! slot teardown; the `alive` probe is consulted after every suspension
//! point and a lost race detaches the partial overlay and fails with
//! [`OverlayError::SlotDestroyed`], which callers swallow.

use std::sync::Arc;

use core_dom::{Context2d, DomError, ElementId, HostSurface};
use core_provider::{PageAnnotation, PageHandle, ProviderError};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("slot destroyed during overlay construction")]
    SlotDestroyed,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Dom(#[from] DomError),
}

/// Text layer handle: the root element plus the number of glyph boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextOverlay {
    pub root: ElementId,
    pub glyph_count: usize,
}

impl TextOverlay {
    pub fn destroy(&self, surface: &HostSurface) {
        let _ = surface.remove_subtree(self.root);
    }
}

/// Annotation layer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotationOverlay {
    pub root: ElementId,
    pub annotation_count: usize,
}

impl AnnotationOverlay {
    pub fn destroy(&self, surface: &HostSurface) {
        let _ = surface.remove_subtree(self.root);
    }
}

/// Narrow capability seam for the annotation collaborator. The core hands
/// it a positioned root element and the page's annotations; everything
/// else is the collaborator's business.
pub trait AnnotationLayerFactory: Send + Sync {
    fn build(
        &self,
        surface: &HostSurface,
        root: ElementId,
        page_number: u32,
        annotations: &[PageAnnotation],
        scale: f32,
    ) -> Result<usize, OverlayError>;
}

/// Built-in layer: one positioned box per annotation.
#[derive(Debug, Default)]
pub struct DefaultAnnotationLayer;

impl AnnotationLayerFactory for DefaultAnnotationLayer {
    fn build(
        &self,
        surface: &HostSurface,
        root: ElementId,
        page_number: u32,
        annotations: &[PageAnnotation],
        scale: f32,
    ) -> Result<usize, OverlayError> {
        for annotation in annotations {
            let el = surface.create_element("section");
            surface.set_attribute(el, "data-annotation-id", &annotation.id)?;
            surface.set_attribute(el, "data-page-number", &page_number.to_string())?;
            let [x, y, w, h] = annotation.rect;
            surface.set_style(el, "position", "absolute")?;
            surface.set_style(el, "left", &format!("{:.2}px", x * scale))?;
            surface.set_style(el, "top", &format!("{:.2}px", y * scale))?;
            surface.set_style(el, "width", &format!("{:.2}px", w * scale))?;
            surface.set_style(el, "height", &format!("{:.2}px", h * scale))?;
            surface.append_child(root, el)?;
        }
        Ok(annotations.len())
    }
}

fn overlay_root(
    surface: &HostSurface,
    wrapper: ElementId,
    class: &str,
) -> Result<ElementId, DomError> {
    let root = surface.create_element("div");
    surface.set_attribute(root, "class", class)?;
    surface.set_style(root, "position", "absolute")?;
    surface.set_style(root, "inset", "0")?;
    surface.append_child(wrapper, root)?;
    Ok(root)
}

/// Build the selection/search text layer over a rendered page.
///
/// Glyph boxes are positioned at `scale` and each receives a horizontal
/// scale correction: the ratio of the provider-reported run width to the
/// measured width of the rendered text.
pub async fn build_text_overlay(
    surface: &HostSurface,
    page: Arc<dyn PageHandle>,
    wrapper: ElementId,
    scale: f32,
    alive: impl Fn() -> bool,
) -> Result<TextOverlay, OverlayError> {
    let content = page.text_content().await?;
    if !alive() {
        return Err(OverlayError::SlotDestroyed);
    }

    let root = overlay_root(surface, wrapper, "textLayer")?;
    let mut measurer = Context2d::default();
    for item in &content.items {
        let span = surface.create_element("span");
        surface.set_style(span, "position", "absolute")?;
        surface.set_style(span, "left", &format!("{:.2}px", item.x * scale))?;
        surface.set_style(span, "top", &format!("{:.2}px", item.y * scale))?;
        surface.set_style(span, "height", &format!("{:.2}px", item.height * scale))?;
        let font_px = item.font_size * scale;
        surface.set_style(span, "font-size", &format!("{font_px:.2}px"))?;
        measurer.state_mut().font = format!("{font_px}px sans-serif");
        let measured = measurer.measure_text(&item.text);
        let target = item.width * scale;
        if measured > 0.0 && (measured - target).abs() > f32::EPSILON {
            let correction = target / measured;
            surface.set_style(span, "transform", &format!("scaleX({correction:.4})"))?;
        }
        surface.set_attribute(span, "data-text", &item.text)?;
        surface.append_child(root, span)?;
    }

    if !alive() {
        // Lost the race against teardown: undo the partial layer.
        let _ = surface.remove_subtree(root);
        return Err(OverlayError::SlotDestroyed);
    }
    trace!(target: "virt.overlay", page = page.number(), glyphs = content.items.len(), "text_overlay_built");
    Ok(TextOverlay {
        root,
        glyph_count: content.items.len(),
    })
}

/// Build the annotation layer through the collaborator seam.
pub async fn build_annotation_overlay(
    surface: &HostSurface,
    page: Arc<dyn PageHandle>,
    wrapper: ElementId,
    scale: f32,
    factory: &dyn AnnotationLayerFactory,
    alive: impl Fn() -> bool,
) -> Result<AnnotationOverlay, OverlayError> {
    let annotations = page.annotations().await?;
    if !alive() {
        return Err(OverlayError::SlotDestroyed);
    }

    let root = overlay_root(surface, wrapper, "annotationLayer")?;
    let count = match factory.build(surface, root, page.number(), &annotations, scale) {
        Ok(count) => count,
        Err(err) => {
            let _ = surface.remove_subtree(root);
            return Err(err);
        }
    };

    if !alive() {
        let _ = surface.remove_subtree(root);
        return Err(OverlayError::SlotDestroyed);
    }
    Ok(AnnotationOverlay {
        root,
        annotation_count: count,
    })
}
