//! Document Provider seam.
//!
//! The engine treats the PDF decoder as an external collaborator reachable
//! only through these traits: a [`DocumentProvider`] opens a source into a
//! [`DocumentHandle`], which hands out per-page [`PageHandle`]s. Raster work
//! happens behind [`RenderTask`]s: `(awaitable, cancel-flag)` pairs whose
//! cancellation is a token flip observed at every suspension point, never a
//! user-visible failure.
//!
//! Contract highlights:
//! - `RenderTask::cancel` is idempotent; awaiting a cancelled task yields
//!   `Err(RenderError::Cancelled)` promptly (mid-sleep work is interrupted).
//! - A task completes exactly once.
//! - Page handles are cacheable; `cleanup` releases decoder-side resources
//!   and is safe to call more than once.
//!
//! [`synthetic`] hosts a deterministic in-process provider used by the test
//! suites and the demo binary.

mod task;
mod viewport;

pub mod synthetic;

pub use task::{RenderControl, RenderTask};
pub use viewport::{Viewport, ViewportCloneOpts};

use std::sync::Arc;

use async_trait::async_trait;
use core_dom::Canvas;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Rasterization failures. `Cancelled` is the distinguished sentinel that
/// scheduling code recognizes and swallows.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render cancelled")]
    Cancelled,
    #[error("render failed: {0}")]
    Failed(String),
}

impl RenderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled)
    }
}

/// Document-level failures surfaced by the provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("document requires a password")]
    PasswordRequired,
    #[error("page {page} out of bounds (document has {count} pages)")]
    PageOutOfBounds { page: u32, count: u32 },
    #[error("document could not be decoded: {0}")]
    Corrupt(String),
    #[error("document source unavailable: {0}")]
    Unavailable(String),
}

/// Where the document bytes come from.
#[derive(Clone)]
pub enum DocumentSource {
    Url(String),
    Bytes(Arc<Vec<u8>>),
}

impl std::fmt::Debug for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            DocumentSource::Bytes(bytes) => f
                .debug_struct("Bytes")
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub loaded: u64,
    pub total: u64,
}

/// Options forwarded to [`DocumentProvider::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
    pub password: Option<String>,
    /// Byte-progress sink; providers report best-effort milestones.
    pub progress: Option<UnboundedSender<LoadProgress>>,
    /// Override for the provider's worker location, configured once per
    /// process by the embedder. Providers may ignore it.
    pub worker_src: Option<String>,
}

/// One laid-out text run at scale 1 page coordinates.
#[derive(Debug, Clone)]
pub struct TextItem {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub font_size: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TextContent {
    pub items: Vec<TextItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationKind {
    Link,
    Highlight,
    Note,
}

/// One annotation at scale 1 page coordinates (`rect` is `[x, y, w, h]`).
#[derive(Debug, Clone)]
pub struct PageAnnotation {
    pub id: String,
    pub kind: AnnotationKind,
    pub rect: [f32; 4],
}

#[async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(
        &self,
        source: DocumentSource,
        params: OpenParams,
    ) -> Result<Arc<dyn DocumentHandle>, ProviderError>;
}

#[async_trait]
pub trait DocumentHandle: Send + Sync {
    fn page_count(&self) -> u32;
    /// Fetch a page handle. `number` is 1-based.
    async fn page(&self, number: u32) -> Result<Arc<dyn PageHandle>, ProviderError>;
    fn cleanup(&self);
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    fn number(&self) -> u32;
    fn viewport(&self, scale: f32) -> Viewport;
    /// Start rasterizing into `target`. Returns immediately; completion and
    /// cancellation flow through the task.
    fn render(&self, target: &Canvas, viewport: &Viewport) -> RenderTask;
    async fn text_content(&self) -> Result<TextContent, ProviderError>;
    async fn annotations(&self) -> Result<Vec<PageAnnotation>, ProviderError>;
    fn cleanup(&self);
}
