//! Narrow host-surface abstraction consumed by the viewer core.
//!
//! The engine never talks to a real browser document. Everything it needs
//! from the host is expressed through [`HostSurface`]: element creation,
//! attribute/style setters, parent/child wiring, scroll offsets, and a
//! device pixel ratio. Raster surfaces ([`Canvas`], [`Context2d`],
//! [`ImageBitmap`]) live alongside because the pooling layer hands them to
//! page slots and must be able to verify context hygiene.
//!
//! Invariants:
//! - Element identity is arena-based; an [`ElementId`] stays valid until the
//!   element (or an ancestor) is removed from the arena.
//! - `attached(el)` is true iff the element is reachable from a registered
//!   container root. Detached elements keep their state and may be re-inserted
//!   (wrapper recycling relies on this).
//! - Setting a canvas' physical size resets its drawing context, mirroring
//!   host canvas semantics. Pool code depends on this when re-sizing.
//! - A closed [`ImageBitmap`] stays closed; drawing it is an error.

mod canvas;
mod surface;

pub use canvas::{
    Canvas, CompositeOp, Context2d, ContextState, IDENTITY, ImageBitmap, LineCap, LineJoin,
    TextAlign, TextBaseline,
};
pub use surface::{ElementId, HostSurface};

use thiserror::Error;

/// Failures at the host-surface boundary.
#[derive(Debug, Error)]
pub enum DomError {
    #[error("unknown element {0:?}")]
    UnknownElement(ElementId),
    #[error("container id {0:?} is not registered")]
    UnknownContainer(String),
    #[error("image bitmap was already closed")]
    BitmapClosed,
}

pub type DomResult<T> = Result<T, DomError>;
