//! Page virtualization and progressive rendering.
//!
//! Only a small band of pages around the viewport midpoint is ever
//! materialized. Each materialized page moves through a two-tier render
//! (instant low-resolution base pass, hi-res overlay at the true scale),
//! scheduled by a strictly-serialized priority queue and continually
//! culled by an aggressive cancellation policy driven by scroll velocity
//! and memory pressure.
//!
//! Module map:
//! - [`position`]: page layout map and center-page selection.
//! - [`wrapper`]: recycled DOM container ring.
//! - [`queue`]: priority queue with at-most-one job per page.
//! - [`pacing`]: rapid-scroll detection and windowing throttle.
//! - [`cancel`]: the three-action cancellation policy.
//! - [`slot`]: per-page materialized record and its state machine.
//! - [`overlay`]: text/annotation layer construction.
//! - [`zoom`]: scale policy, fit computations, scroll anchoring.
//! - [`virtualizer`]: the orchestrator owning all of the above.

pub mod cancel;
pub mod overlay;
pub mod pacing;
pub mod position;
pub mod queue;
pub mod slot;
pub mod virtualizer;
pub mod wrapper;
pub mod zoom;

pub use cancel::{CancelAction, CancelContext};
pub use overlay::{
    AnnotationLayerFactory, AnnotationOverlay, DefaultAnnotationLayer, OverlayError, TextOverlay,
};
pub use position::{PAGE_GAP, PagePositionMap};
pub use queue::{QueueMetrics, RenderJob, RenderQueue, priority_for};
pub use slot::{PageSlot, SlotPhase};
pub use virtualizer::{VirtError, VirtStats, Virtualizer, VirtualizerConfig, VirtualizerParams};
pub use wrapper::{WrapperHandle, WrapperPool, wrapper_capacity};
pub use zoom::{ZoomPolicy, anchored_scroll_top};
