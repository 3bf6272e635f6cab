//! One viewer instance and its frozen facade.
//!
//! Initialization sequence: pools → document handle → DOM scaffold inside
//! an isolated subtree → toolbar → virtualizer (buffer-ready) → `Loaded`.
//! A failure at any step tears down everything built so far and surfaces a
//! distinguished [`LoadError`]. Destruction is idempotent and releases the
//! instance's entire resource graph; the `Destroyed` event is the last
//! thing the bus ever delivers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use core_dom::{ElementId, HostSurface};
use core_events::{
    AnnotationPayload, EventBus, EventKind, EventResult, EventEnvelope, InstanceId, ListenerId,
    LoadErrorKind, ViewerEvent,
};
use core_pool::{
    BitmapPool, BitmapPoolConfig, BitmapPoolStats, CanvasPool, CanvasPoolConfig, CanvasPoolStats,
};
use core_provider::{DocumentHandle, DocumentProvider, DocumentSource, OpenParams, ProviderError};
use core_virt::{
    DefaultAnnotationLayer, VirtStats, Virtualizer, VirtualizerParams,
};
use tracing::{info, warn};

use crate::options::{DefaultToolbar, LoadOptions, Toolbar, ViewerFileConfig, resolve_virtualizer_config};
use crate::services::{
    AnnotationService, DownloadService, NoopAnnotations, NoopDownload, NoopSearch, SearchMatch,
    SearchService,
};
use crate::{LoadError, registry::Environment};

pub struct ViewerInstance {
    id: InstanceId,
    container_id: String,
    surface: HostSurface,
    document: Arc<dyn DocumentHandle>,
    /// Where the document bytes came from; handed to the download seam.
    source: DocumentSource,
    bus: EventBus,
    canvas_pool: Arc<CanvasPool>,
    bitmap_pool: Arc<BitmapPool>,
    virtualizer: Virtualizer,
    toolbar: Option<Box<dyn Toolbar>>,
    annotations: Arc<dyn AnnotationService>,
    search: Arc<dyn SearchService>,
    download: Arc<dyn DownloadService>,
    root_el: ElementId,
    destroyed: AtomicBool,
    ready: AtomicBool,
    interactive: AtomicBool,
}

impl ViewerInstance {
    /// Boot a viewer. On failure every partially constructed resource is
    /// released before the error is returned.
    pub(crate) async fn boot(
        env: &Environment,
        id: InstanceId,
        mut options: LoadOptions,
        defaults: &ViewerFileConfig,
    ) -> Result<Arc<ViewerInstance>, LoadError> {
        let surface = env.surface.clone();
        let container = surface
            .get_by_id(&options.container_id)
            .ok_or_else(|| LoadError::ContainerMissing(options.container_id.clone()))?;

        let bus = EventBus::new(id);
        let canvas_pool = Arc::new(CanvasPool::new(CanvasPoolConfig {
            device_pixel_ratio: surface.device_pixel_ratio(),
            ..Default::default()
        }));
        let bitmap_pool = Arc::new(BitmapPool::new(BitmapPoolConfig::default()));

        // Forward provider progress onto the bus for the whole open phase.
        let (progress_tx, mut progress_rx) =
            tokio::sync::mpsc::unbounded_channel::<core_provider::LoadProgress>();
        let progress_bus = bus.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                progress_bus.emit(ViewerEvent::Progress {
                    loaded: progress.loaded,
                    total: progress.total,
                });
            }
        });

        let open = env
            .provider
            .open(
                options.source.clone(),
                OpenParams {
                    password: options.password.clone(),
                    progress: Some(progress_tx),
                    worker_src: options.worker_src.clone(),
                },
            )
            .await;
        let document = match open {
            Ok(document) => document,
            Err(ProviderError::PasswordRequired) => {
                bus.emit(ViewerEvent::PasswordRequired);
                bus.emit(ViewerEvent::LoadError {
                    kind: LoadErrorKind::Password,
                    message: "document requires a password".into(),
                });
                progress_task.abort();
                bus.destroy();
                return Err(LoadError::PasswordRequired);
            }
            Err(error) => {
                bus.emit(ViewerEvent::LoadError {
                    kind: LoadErrorKind::Document,
                    message: error.to_string(),
                });
                progress_task.abort();
                bus.destroy();
                return Err(LoadError::Document(error));
            }
        };

        // Isolated subtree inside the host container.
        let root_el = surface.create_element("div");
        let toolbar_host = surface.create_element("div");
        let viewer_host = surface.create_element("div");
        let scaffold = surface
            .set_attribute(root_el, "id", &format!("vellum-{}", id.0))
            .and_then(|_| surface.set_attribute(root_el, "class", "vellumRoot"))
            .and_then(|_| surface.append_child(container, root_el))
            .and_then(|_| surface.set_attribute(toolbar_host, "class", "toolbarHost"))
            .and_then(|_| surface.append_child(root_el, toolbar_host))
            .and_then(|_| surface.set_attribute(viewer_host, "class", "viewerHost"))
            .and_then(|_| {
                surface.set_attribute(viewer_host, "id", &format!("viewerHost-{}", id.0))
            })
            .and_then(|_| surface.append_child(root_el, viewer_host));
        if let Err(error) = scaffold {
            document.cleanup();
            progress_task.abort();
            let _ = surface.remove_subtree(root_el);
            bus.destroy();
            return Err(LoadError::Internal(format!("scaffold failed: {error}")));
        }

        let toolbar: Option<Box<dyn Toolbar>> = if options.disable_toolbar {
            None
        } else {
            let toolbar_options = options.toolbar_options;
            let toolbar = options.custom_toolbar.take().unwrap_or_else(|| {
                Box::new(DefaultToolbar {
                    options: toolbar_options,
                })
            });
            if let Err(error) = toolbar.render(&surface, toolbar_host) {
                document.cleanup();
                progress_task.abort();
                let _ = surface.remove_subtree(root_el);
                bus.destroy();
                return Err(LoadError::Internal(format!("toolbar failed: {error}")));
            }
            Some(toolbar)
        };

        let config = resolve_virtualizer_config(&options, defaults);
        let virtualizer = match Virtualizer::new(VirtualizerParams {
            instance_id: id,
            surface: surface.clone(),
            host_container: viewer_host,
            document: Arc::clone(&document),
            canvas_pool: Arc::clone(&canvas_pool),
            bitmap_pool: Arc::clone(&bitmap_pool),
            bus: bus.clone(),
            gauge: Arc::clone(&env.gauge),
            annotation_layer: Arc::new(DefaultAnnotationLayer),
            config,
        })
        .await
        {
            Ok(virtualizer) => virtualizer,
            Err(error) => {
                if let Some(toolbar) = &toolbar {
                    toolbar.destroy();
                }
                document.cleanup();
                progress_task.abort();
                canvas_pool.destroy();
                bitmap_pool.destroy();
                let _ = surface.remove_subtree(root_el);
                bus.emit(ViewerEvent::LoadError {
                    kind: LoadErrorKind::Internal,
                    message: error.to_string(),
                });
                bus.destroy();
                return Err(LoadError::Internal(error.to_string()));
            }
        };
        progress_task.abort();

        let instance = Arc::new(ViewerInstance {
            id,
            container_id: options.container_id,
            surface,
            document,
            source: options.source,
            bus: bus.clone(),
            canvas_pool,
            bitmap_pool,
            virtualizer,
            toolbar,
            annotations: Arc::new(NoopAnnotations),
            search: Arc::new(NoopSearch),
            download: Arc::new(NoopDownload),
            root_el,
            destroyed: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            interactive: AtomicBool::new(false),
        });
        bus.emit(ViewerEvent::Loaded);
        info!(target: "instance", instance = %id, container = instance.container_id.as_str(), "viewer_loaded");
        Ok(instance)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear down the whole resource graph. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        if let Some(toolbar) = &self.toolbar {
            toolbar.destroy();
        }
        self.virtualizer.destroy();
        self.canvas_pool.destroy();
        self.bitmap_pool.destroy();
        self.document.cleanup();
        let _ = self.surface.remove_subtree(self.root_el);
        self.bus.emit(ViewerEvent::Destroyed);
        self.bus.destroy();
        info!(target: "instance", instance = %self.id, "viewer_destroyed");
    }
}

impl Drop for ViewerInstance {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Frozen external surface of one viewer. Cheap to clone; all state lives
/// behind the shared instance.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<ViewerInstance>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceStats {
    pub virtualizer: VirtStats,
    pub canvas_pool: CanvasPoolStats,
    pub bitmap_pool: BitmapPoolStats,
}

impl InstanceHandle {
    pub(crate) fn new(inner: Arc<ViewerInstance>) -> Self {
        Self { inner }
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.id.0
    }

    pub fn container_id(&self) -> &str {
        self.inner.container_id()
    }

    pub fn current_page(&self) -> u32 {
        self.inner.virtualizer.current_page()
    }

    pub fn total_pages(&self) -> u32 {
        self.inner.document.page_count()
    }

    pub fn current_scale(&self) -> f32 {
        self.inner.virtualizer.scale()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// The decoded document, shared read-only with collaborators.
    pub fn pdf_document(&self) -> Arc<dyn DocumentHandle> {
        Arc::clone(&self.inner.document)
    }

    pub async fn go_to_page(&self, page: u32) -> u32 {
        self.inner.virtualizer.go_to_page(page).await
    }

    pub async fn next_page(&self) -> u32 {
        let current = self.current_page();
        self.inner.virtualizer.go_to_page(current + 1).await
    }

    pub async fn previous_page(&self) -> u32 {
        let current = self.current_page();
        self.inner
            .virtualizer
            .go_to_page(current.saturating_sub(1).max(1))
            .await
    }

    pub async fn first_page(&self) -> u32 {
        self.inner.virtualizer.go_to_page(1).await
    }

    pub async fn last_page(&self) -> u32 {
        let last = self.total_pages();
        self.inner.virtualizer.go_to_page(last).await
    }

    pub async fn scroll_to(&self, offset: f32) {
        self.inner.virtualizer.handle_scroll(offset).await;
    }

    pub fn zoom_in(&self) -> f32 {
        self.inner.virtualizer.zoom_in()
    }

    pub fn zoom_out(&self) -> f32 {
        self.inner.virtualizer.zoom_out()
    }

    pub fn set_zoom(&self, scale: f32) -> f32 {
        self.inner.virtualizer.set_zoom(scale)
    }

    pub fn fit_width(&self) -> f32 {
        self.inner.virtualizer.fit_width()
    }

    pub fn fit_page(&self) -> f32 {
        self.inner.virtualizer.fit_page()
    }

    pub fn rotate(&self, deg: u16) -> u16 {
        self.inner.virtualizer.rotate(deg)
    }

    pub fn set_interactive_mode(&self, enabled: bool) {
        let was = self.inner.interactive.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            self.inner
                .bus
                .emit(ViewerEvent::InteractiveModeChanged { enabled });
        }
    }

    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Wait for the render queue to drain (test and scripting helper).
    pub async fn quiesce(&self) {
        self.inner.virtualizer.quiesce().await;
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            virtualizer: self.inner.virtualizer.stats(),
            canvas_pool: self.inner.canvas_pool.stats(),
            bitmap_pool: self.inner.bitmap_pool.stats(),
        }
    }

    pub fn events(&self) -> EventsFacade {
        EventsFacade {
            bus: self.inner.bus.clone(),
        }
    }

    pub fn annotations(&self) -> AnnotationsFacade {
        AnnotationsFacade {
            service: Arc::clone(&self.inner.annotations),
            bus: self.inner.bus.clone(),
        }
    }

    pub fn search(&self) -> SearchFacade {
        SearchFacade {
            service: Arc::clone(&self.inner.search),
        }
    }

    pub fn download(&self) -> DownloadFacade {
        DownloadFacade {
            service: Arc::clone(&self.inner.download),
            source: self.inner.source.clone(),
        }
    }
}

/// Listener registration surface.
#[derive(Clone)]
pub struct EventsFacade {
    bus: EventBus,
}

impl EventsFacade {
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&EventEnvelope) -> EventResult<()> + Send + Sync + 'static,
    ) -> ListenerId {
        self.bus.on(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.bus.off(kind, id)
    }

    pub fn remove_all(&self) {
        self.bus.remove_all();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.bus.listener_count(kind)
    }
}

/// Annotation authoring surface: delegates to the service and emits the
/// matching lifecycle events.
#[derive(Clone)]
pub struct AnnotationsFacade {
    service: Arc<dyn AnnotationService>,
    bus: EventBus,
}

impl AnnotationsFacade {
    pub fn create(&self, page: u32, kind: &str) -> String {
        self.bus.emit(ViewerEvent::DrawingStarted);
        let id = self.service.create(page, kind);
        self.bus.emit(ViewerEvent::DrawingFinished);
        self.bus.emit(ViewerEvent::AnnotationCreated(AnnotationPayload {
            annotation_id: id.clone(),
            page,
            kind: kind.to_string(),
        }));
        id
    }

    pub fn update(&self, annotation_id: &str, page: u32, kind: &str) -> bool {
        let updated = self.service.update(annotation_id);
        if updated {
            self.bus.emit(ViewerEvent::AnnotationUpdated(AnnotationPayload {
                annotation_id: annotation_id.to_string(),
                page,
                kind: kind.to_string(),
            }));
        }
        updated
    }

    pub fn delete(&self, annotation_id: &str, page: u32, kind: &str) -> bool {
        let deleted = self.service.delete(annotation_id);
        if deleted {
            self.bus.emit(ViewerEvent::AnnotationDeleted(AnnotationPayload {
                annotation_id: annotation_id.to_string(),
                page,
                kind: kind.to_string(),
            }));
        }
        deleted
    }

    pub fn select(&self, annotation_id: &str, page: u32, kind: &str) -> bool {
        let selected = self.service.select(annotation_id);
        if selected {
            self.bus.emit(ViewerEvent::AnnotationSelected(AnnotationPayload {
                annotation_id: annotation_id.to_string(),
                page,
                kind: kind.to_string(),
            }));
        } else {
            warn!(target: "instance", annotation_id, "annotation_select_rejected");
        }
        selected
    }
}

/// Search surface.
#[derive(Clone)]
pub struct SearchFacade {
    service: Arc<dyn SearchService>,
}

impl SearchFacade {
    pub fn search(&self, query: &str) -> Vec<SearchMatch> {
        self.service.search(query)
    }

    pub fn clear(&self) {
        self.service.clear();
    }
}

/// Download surface: hands the instance's document source to the host
/// download pipeline.
#[derive(Clone)]
pub struct DownloadFacade {
    service: Arc<dyn DownloadService>,
    source: DocumentSource,
}

impl DownloadFacade {
    /// Returns whether the collaborator accepted the request.
    pub fn request_download(&self, suggested_name: &str) -> bool {
        self.service.request_download(&self.source, suggested_name)
    }
}
