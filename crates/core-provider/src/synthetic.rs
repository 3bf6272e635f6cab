//! Deterministic in-process provider for tests and the demo binary.
//!
//! Pages have fixed geometry (US Letter by default, optional landscape
//! interleave for mixed-size layouts), configurable render latency so
//! cancellation races are reproducible, injectable render failures, and an
//! optional password gate.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use core_dom::Canvas;
use tracing::debug;

use crate::{
    AnnotationKind, DocumentHandle, DocumentProvider, DocumentSource, LoadProgress, OpenParams,
    PageAnnotation, PageHandle, ProviderError, RenderError, RenderTask, TextContent, TextItem,
    Viewport,
};

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub page_count: u32,
    pub page_width: f32,
    pub page_height: f32,
    /// Simulated decoder latency per render pass.
    pub render_latency: Duration,
    /// Pages whose render always fails (1-based).
    pub failing_pages: HashSet<u32>,
    /// When set, `open` requires this password.
    pub password: Option<String>,
    /// When set, `open` fails as a corrupt document with this message.
    pub fail_open: Option<String>,
    pub total_bytes: u64,
    pub text_lines_per_page: u32,
    pub annotations_per_page: u32,
    /// Every k-th page is landscape (width/height swapped).
    pub landscape_every: Option<u32>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            page_count: 10,
            page_width: 612.0,
            page_height: 792.0,
            render_latency: Duration::ZERO,
            failing_pages: HashSet::new(),
            password: None,
            fail_open: None,
            total_bytes: 1 << 20,
            text_lines_per_page: 4,
            annotations_per_page: 1,
            landscape_every: None,
        }
    }
}

impl SyntheticConfig {
    pub fn with_pages(page_count: u32) -> Self {
        Self {
            page_count,
            ..Default::default()
        }
    }

    fn base_size(&self, page: u32) -> (f32, f32) {
        match self.landscape_every {
            Some(k) if k > 0 && page % k == 0 => (self.page_height, self.page_width),
            _ => (self.page_width, self.page_height),
        }
    }
}

#[derive(Debug, Default)]
pub struct SyntheticProvider {
    config: SyntheticConfig,
}

impl SyntheticProvider {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DocumentProvider for SyntheticProvider {
    async fn open(
        &self,
        source: DocumentSource,
        params: OpenParams,
    ) -> Result<Arc<dyn DocumentHandle>, ProviderError> {
        if let Some(required) = &self.config.password
            && params.password.as_deref() != Some(required.as_str())
        {
            return Err(ProviderError::PasswordRequired);
        }
        if let Some(message) = &self.config.fail_open {
            return Err(ProviderError::Corrupt(message.clone()));
        }
        if let Some(progress) = &params.progress {
            let total = self.config.total_bytes;
            for loaded in [0, total / 2, total] {
                let _ = progress.send(LoadProgress { loaded, total });
            }
        }
        debug!(target: "provider.synthetic", pages = self.config.page_count, ?source, "document_opened");
        Ok(Arc::new(SyntheticDocument {
            config: Arc::new(self.config.clone()),
            render_count: Arc::new(AtomicU64::new(0)),
            cleaned: AtomicBool::new(false),
        }))
    }
}

pub struct SyntheticDocument {
    config: Arc<SyntheticConfig>,
    /// Total successful render passes across all pages, for pool-reuse and
    /// priority assertions in tests.
    render_count: Arc<AtomicU64>,
    cleaned: AtomicBool,
}

impl SyntheticDocument {
    pub fn renders_completed(&self) -> u64 {
        self.render_count.load(Ordering::SeqCst)
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentHandle for SyntheticDocument {
    fn page_count(&self) -> u32 {
        self.config.page_count
    }

    async fn page(&self, number: u32) -> Result<Arc<dyn PageHandle>, ProviderError> {
        if number == 0 || number > self.config.page_count {
            return Err(ProviderError::PageOutOfBounds {
                page: number,
                count: self.config.page_count,
            });
        }
        Ok(Arc::new(SyntheticPage {
            number,
            config: Arc::clone(&self.config),
            render_count: Arc::clone(&self.render_count),
            cleaned: AtomicBool::new(false),
        }))
    }

    fn cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

pub struct SyntheticPage {
    number: u32,
    config: Arc<SyntheticConfig>,
    render_count: Arc<AtomicU64>,
    cleaned: AtomicBool,
}

#[async_trait]
impl PageHandle for SyntheticPage {
    fn number(&self) -> u32 {
        self.number
    }

    fn viewport(&self, scale: f32) -> Viewport {
        let (w, h) = self.config.base_size(self.number);
        Viewport::new(w * scale, h * scale, scale, 0)
    }

    fn render(&self, target: &Canvas, viewport: &Viewport) -> RenderTask {
        let latency = self.config.render_latency;
        let fails = self.config.failing_pages.contains(&self.number);
        let number = self.number;
        let canvas = target.clone();
        let (w, h) = (viewport.width, viewport.height);
        let render_count = Arc::clone(&self.render_count);
        RenderTask::spawn(move |control| async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if control.is_cancelled() {
                return Err(RenderError::Cancelled);
            }
            if fails {
                return Err(RenderError::Failed(format!(
                    "synthetic failure on page {number}"
                )));
            }
            canvas.with_context(|ctx| ctx.fill_rect(0.0, 0.0, w, h));
            render_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    async fn text_content(&self) -> Result<TextContent, ProviderError> {
        let (_, base_h) = self.config.base_size(self.number);
        let lines = self.config.text_lines_per_page;
        let leading = if lines == 0 {
            0.0
        } else {
            base_h / (lines + 1) as f32
        };
        let items = (0..lines)
            .map(|i| {
                let text = format!("Page {} line {}", self.number, i + 1);
                TextItem {
                    // Slightly wider than the nominal glyph advance so text
                    // layers exercise their width correction.
                    width: text.chars().count() as f32 * 7.0,
                    text,
                    x: 36.0,
                    y: leading * (i + 1) as f32,
                    height: 14.0,
                    font_size: 12.0,
                }
            })
            .collect();
        Ok(TextContent { items })
    }

    async fn annotations(&self) -> Result<Vec<PageAnnotation>, ProviderError> {
        Ok((0..self.config.annotations_per_page)
            .map(|i| PageAnnotation {
                id: format!("ann-{}-{}", self.number, i),
                kind: AnnotationKind::Link,
                rect: [40.0, 60.0 + 30.0 * i as f32, 120.0, 18.0],
            })
            .collect())
    }

    fn cleanup(&self) {
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_params() -> OpenParams {
        OpenParams::default()
    }

    #[tokio::test]
    async fn password_gate_rejects_missing_or_wrong_password() {
        let provider = SyntheticProvider::new(SyntheticConfig {
            password: Some("hunter2".into()),
            ..Default::default()
        });
        let err = provider
            .open(DocumentSource::Url("mem://doc".into()), open_params())
            .await
            .err()
            .expect("open must fail without password");
        assert!(matches!(err, ProviderError::PasswordRequired));

        let ok = provider
            .open(
                DocumentSource::Url("mem://doc".into()),
                OpenParams {
                    password: Some("hunter2".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn page_fetch_bounds_are_one_based() {
        let provider = SyntheticProvider::new(SyntheticConfig::with_pages(3));
        let doc = provider
            .open(DocumentSource::Url("mem://doc".into()), open_params())
            .await
            .unwrap();
        assert!(doc.page(0).await.is_err());
        assert!(doc.page(3).await.is_ok());
        assert!(matches!(
            doc.page(4).await.err().unwrap(),
            ProviderError::PageOutOfBounds { page: 4, count: 3 }
        ));
    }

    #[tokio::test]
    async fn render_paints_target_and_reports_failures() {
        let mut failing = HashSet::new();
        failing.insert(2);
        let provider = SyntheticProvider::new(SyntheticConfig {
            page_count: 3,
            failing_pages: failing,
            ..Default::default()
        });
        let doc = provider
            .open(DocumentSource::Url("mem://doc".into()), open_params())
            .await
            .unwrap();

        let page1 = doc.page(1).await.unwrap();
        let canvas = Canvas::new(612, 792);
        let vp = page1.viewport(1.0);
        page1.render(&canvas, &vp).wait().await.unwrap();
        assert_eq!(canvas.with_context(|ctx| ctx.draw_calls()), 1);

        let page2 = doc.page(2).await.unwrap();
        let err = page2
            .render(&canvas, &page2.viewport(1.0))
            .wait()
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn landscape_interleave_swaps_dimensions() {
        let provider = SyntheticProvider::new(SyntheticConfig {
            page_count: 4,
            landscape_every: Some(2),
            ..Default::default()
        });
        let doc = provider
            .open(DocumentSource::Url("mem://doc".into()), open_params())
            .await
            .unwrap();
        let portrait = doc.page(1).await.unwrap().viewport(1.0);
        let landscape = doc.page(2).await.unwrap().viewport(1.0);
        assert_eq!(portrait.width, 612.0);
        assert_eq!(landscape.width, 792.0);
        assert_eq!(landscape.height, 612.0);
    }

    #[tokio::test]
    async fn progress_milestones_cover_zero_to_total() {
        let provider = SyntheticProvider::new(SyntheticConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        provider
            .open(
                DocumentSource::Bytes(Arc::new(vec![1, 2, 3])),
                OpenParams {
                    progress: Some(tx),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.loaded, 0);
        let mut last = first;
        while let Ok(p) = rx.try_recv() {
            last = p;
        }
        assert_eq!(last.loaded, last.total);
    }
}
