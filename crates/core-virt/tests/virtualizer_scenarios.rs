//! End-to-end virtualizer scenarios against the synthetic provider and the
//! in-memory host surface: cold load, scroll-through, zoom anchoring,
//! cancellation under pressure, and teardown hygiene.

use std::sync::Arc;
use std::time::Duration;

use core_dom::HostSurface;
use core_events::{EventBus, EventKind, InstanceId, ViewerEvent};
use core_pool::{BitmapPool, BitmapPoolConfig, CanvasPool, CanvasPoolConfig, FixedGauge, MemoryGauge};
use core_provider::synthetic::{SyntheticConfig, SyntheticProvider};
use core_provider::{DocumentProvider, DocumentSource, OpenParams};
use core_virt::{DefaultAnnotationLayer, Virtualizer, VirtualizerConfig, VirtualizerParams};

struct Harness {
    surface: HostSurface,
    virt: Virtualizer,
    canvas_pool: Arc<CanvasPool>,
    bus: EventBus,
    gauge: Arc<FixedGauge>,
}

async fn harness(pages: u32, config: VirtualizerConfig) -> Harness {
    let surface = HostSurface::new();
    let host = surface.register_container("host");
    let provider = SyntheticProvider::new(SyntheticConfig {
        page_count: pages,
        render_latency: Duration::from_millis(1),
        ..Default::default()
    });
    let document = provider
        .open(DocumentSource::Url("mem://doc".into()), OpenParams::default())
        .await
        .unwrap();
    let canvas_pool = Arc::new(CanvasPool::new(CanvasPoolConfig::default()));
    let bitmap_pool = Arc::new(BitmapPool::new(BitmapPoolConfig::default()));
    let bus = EventBus::new(InstanceId(1));
    let gauge = Arc::new(FixedGauge::default());
    let virt = Virtualizer::new(VirtualizerParams {
        instance_id: InstanceId(1),
        surface: surface.clone(),
        host_container: host,
        document,
        canvas_pool: Arc::clone(&canvas_pool),
        bitmap_pool,
        bus: bus.clone(),
        gauge: Arc::clone(&gauge) as Arc<dyn MemoryGauge>,
        annotation_layer: Arc::new(DefaultAnnotationLayer),
        config,
    })
    .await
    .unwrap();
    Harness {
        surface,
        virt,
        canvas_pool,
        bus,
        gauge,
    }
}

fn fast_config() -> VirtualizerConfig {
    VirtualizerConfig {
        scroll_throttle_ms: 0,
        queue_pause_ms: 0,
        sweep_interval_ms: 50,
        ..Default::default()
    }
}

#[tokio::test]
async fn cold_load_materializes_the_leading_window() {
    let h = harness(120, fast_config()).await;
    assert_eq!(h.virt.current_page(), 1);

    let stats = h.virt.stats();
    // Window [1, 1+B] at the top of the document.
    assert_eq!(stats.materialized, 4);
    assert!(stats.queued <= 4);

    h.virt.quiesce().await;
    let stats = h.virt.stats();
    assert_eq!(stats.fully_rendered_at_scale, 4);
    // data-page-number contract on every materialized wrapper.
    for page in 1..=4u32 {
        let id = format!("pageContainer-1-{page}");
        let el = h.surface.get_by_id(&id).expect("wrapper with scoped id");
        assert_eq!(
            h.surface.attribute(el, "data-page-number"),
            Some(page.to_string())
        );
    }
    assert!(h.surface.get_by_id("pageContainer-1-5").is_none());
}

#[tokio::test]
async fn window_never_exceeds_two_b_plus_one() {
    let h = harness(60, fast_config()).await;
    for scroll in [0.0f32, 2000.0, 8000.0, 20_000.0, 40_000.0] {
        h.virt.handle_scroll(scroll).await;
        let stats = h.virt.stats();
        assert!(
            stats.materialized <= 7,
            "window {} exceeds 2B+1 at scroll {scroll}",
            stats.materialized
        );
    }
}

#[tokio::test]
async fn scrolling_far_recenters_and_tears_down_old_slots() {
    let h = harness(120, fast_config()).await;
    h.virt.quiesce().await;
    let in_use_before = h.canvas_pool.stats().in_use;

    // Page 50 top offset: gap + 49 * (height + gap).
    let target_top = 15.0 + 49.0 * (792.0 + 15.0);
    h.virt.handle_scroll(target_top).await;
    h.virt.quiesce().await;

    let page = h.virt.current_page();
    assert!((49..=51).contains(&page), "centered near page 50, got {page}");
    let stats = h.virt.stats();
    assert!(stats.materialized <= 7);
    // Old wrappers must be gone from the surface.
    assert!(h.surface.get_by_id("pageContainer-1-1").is_none());
    // Borrowed canvas count returns to the window size.
    let in_use_after = h.canvas_pool.stats().in_use;
    assert!(
        in_use_after <= in_use_before.max(7),
        "pool in_use {in_use_after} leaked past the window"
    );
}

#[tokio::test]
async fn rapid_scroll_settles_with_bounded_work() {
    let h = harness(120, fast_config()).await;
    // Burst of scrolls towards page 100 well inside the rapid threshold.
    for step in 1..=20u32 {
        let top = step as f32 * (99.0 * 807.0 / 20.0);
        h.virt.handle_scroll(top).await;
    }
    h.virt.quiesce().await;

    let stats = h.virt.stats();
    assert!((97..=103).contains(&stats.current_page));
    assert!(stats.materialized <= 7);
    let pool = h.canvas_pool.stats();
    assert!(pool.in_use <= 7);
    // Recycling keeps allocation bounded even across a 100-page sweep.
    assert!(
        pool.created_total <= 24,
        "pool reuse failed: {} canvases created",
        pool.created_total
    );
    // Early pages were never left materialized.
    assert!(h.surface.get_by_id("pageContainer-1-10").is_none());
}

#[tokio::test]
async fn scroll_racing_a_scale_change_never_finishes_stale() {
    let h = harness(80, fast_config()).await;
    h.virt.quiesce().await;

    // The scroll lands immediately after the scale change starts; no render
    // may complete at the old scale afterwards.
    h.virt.set_zoom(3.0);
    h.virt.handle_scroll(30.0 * 807.0).await;
    h.virt.quiesce().await;

    let stats = h.virt.stats();
    assert_eq!(stats.scale, 3.0);
    assert_eq!(
        stats.fully_rendered_at_scale, stats.materialized,
        "every surviving render must be at the new scale"
    );
}

#[tokio::test]
async fn page_change_fires_only_on_strictly_new_pages() {
    let h = harness(40, fast_config()).await;
    let changes: Arc<std::sync::Mutex<Vec<u32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    h.bus.on(EventKind::PageChange, move |env| {
        if let ViewerEvent::PageChange { page } = env.event {
            sink.lock().unwrap().push(page);
        }
        Ok(())
    });

    // Tiny scrolls within page 1, then a jump.
    h.virt.handle_scroll(10.0).await;
    h.virt.handle_scroll(20.0).await;
    h.virt.handle_scroll(5000.0).await;
    let seen = changes.lock().unwrap().clone();
    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert_ne!(pair[0], pair[1], "consecutive PageChange must differ");
    }
}

#[tokio::test]
async fn zoom_ladder_reaches_two_and_anchors_the_top() {
    let h = harness(30, fast_config()).await;
    h.virt.quiesce().await;

    let scales: Arc<std::sync::Mutex<Vec<f32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&scales);
    h.bus.on(EventKind::ScaleChange, move |env| {
        if let ViewerEvent::ScaleChange { scale } = env.event {
            sink.lock().unwrap().push(scale);
        }
        Ok(())
    });

    assert_eq!(h.virt.zoom_in(), 1.25);
    assert_eq!(h.virt.zoom_in(), 1.5);
    assert_eq!(h.virt.zoom_in(), 2.0);
    assert_eq!(*scales.lock().unwrap(), vec![1.25, 1.5, 2.0]);

    // Anchored at page 1 top: scroll stays near zero.
    let scroll = h
        .surface
        .scroll_top(h.surface.get_by_id("viewerContainer-1").unwrap());
    assert!(scroll < 80.0, "scroll {scroll} drifted during zoom at top");

    h.virt.quiesce().await;
    let stats = h.virt.stats();
    assert_eq!(stats.scale, 2.0);
    assert_eq!(
        stats.fully_rendered_at_scale, stats.materialized,
        "visible slots re-rendered at the new scale"
    );
}

#[tokio::test]
async fn zoom_preserves_the_anchor_page_offset() {
    let h = harness(60, fast_config()).await;
    // Land on page 10 with a 200px offset into it.
    let page10_top = 15.0 + 9.0 * 807.0;
    h.virt.handle_scroll(page10_top + 200.0).await;
    h.virt.quiesce().await;
    let anchor = h.virt.current_page();

    h.virt.set_zoom(2.0);
    assert_eq!(h.virt.scale(), 2.0);
    assert_eq!(h.virt.current_page(), anchor, "anchor page survives the zoom");

    // Offset within the anchor page scales with the ratio.
    assert_eq!(anchor, 10);
    let viewport = h.surface.get_by_id("viewerContainer-1").unwrap();
    let scroll = h.surface.scroll_top(viewport);
    let expected_top = 15.0 + 9.0 * (792.0 * 2.0 + 15.0);
    let offset = scroll - expected_top;
    assert!(
        (offset - 400.0).abs() <= 1.0,
        "offset {offset} not preserved within one CSS pixel"
    );
}

#[tokio::test]
async fn hires_layer_exists_only_above_scale_one() {
    let h = harness(10, fast_config()).await;
    h.virt.quiesce().await;
    let page1 = h.surface.get_by_id("pageContainer-1-1").unwrap();
    let has_hires = |surface: &HostSurface, el| {
        surface
            .children(el)
            .iter()
            .any(|c| surface.attribute(*c, "class").as_deref() == Some("hiResLayer"))
    };
    assert!(!has_hires(&h.surface, page1), "no hi-res at scale 1.0");

    h.virt.set_zoom(2.0);
    h.virt.quiesce().await;
    let page1 = h.surface.get_by_id("pageContainer-1-1").unwrap();
    assert!(has_hires(&h.surface, page1), "hi-res overlay above scale 1");

    h.virt.set_zoom(0.5);
    h.virt.quiesce().await;
    let page1 = h.surface.get_by_id("pageContainer-1-1").unwrap();
    assert!(
        !has_hires(&h.surface, page1),
        "hi-res cleared when zooming back out"
    );
}

#[tokio::test]
async fn memory_pressure_shrinks_pools_and_queue() {
    let h = harness(120, fast_config()).await;
    h.virt.quiesce().await;
    h.virt.handle_scroll(20_000.0).await;

    // Flip the heap gauge above the pressure threshold; the sweep task
    // runs the emergency pass.
    h.gauge.set_ratio(0.9);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = h.virt.stats();
    assert!(stats.queued <= 2, "queue kept {} jobs under pressure", stats.queued);
    let pool = h.canvas_pool.stats();
    assert!(
        pool.total <= CanvasPoolConfig::default().max_entries * 3 / 10 + pool.in_use,
        "pool did not shrink under pressure: {pool:?}"
    );
}

#[tokio::test]
async fn destroy_is_idempotent_and_releases_everything() {
    let h = harness(20, fast_config()).await;
    h.virt.quiesce().await;
    assert!(h.canvas_pool.stats().in_use > 0);

    h.virt.destroy();
    h.virt.destroy();
    assert!(h.virt.is_destroyed());
    assert_eq!(h.canvas_pool.stats().in_use, 0, "all canvases returned");
    assert!(h.surface.get_by_id("viewerContainer-1").is_none());
    assert_eq!(h.virt.stats().materialized, 0);

    // Post-destroy calls are inert.
    h.virt.handle_scroll(500.0).await;
    assert_eq!(h.virt.stats().materialized, 0);
}

#[tokio::test]
async fn single_page_mode_pins_the_window() {
    let h = harness(50, VirtualizerConfig {
        single_page: Some(7),
        ..fast_config()
    })
    .await;
    h.virt.quiesce().await;

    let stats = h.virt.stats();
    assert_eq!(stats.materialized, 1);
    assert_eq!(stats.current_page, 7);
    assert!(h.surface.get_by_id("pageContainer-1-7").is_some());

    // Scrolling must not move the pinned window.
    h.virt.handle_scroll(30_000.0).await;
    let stats = h.virt.stats();
    assert_eq!(stats.materialized, 1);
    assert_eq!(stats.current_page, 7);
}

#[tokio::test]
async fn go_to_page_clamps_and_recenters() {
    let h = harness(25, fast_config()).await;
    assert_eq!(h.virt.go_to_page(999).await, 25);
    assert_eq!(h.virt.current_page(), 25);
    assert_eq!(h.virt.go_to_page(0).await, 1);
    assert_eq!(h.virt.current_page(), 1);
}

#[tokio::test]
async fn rotation_relays_out_and_rerenders() {
    let h = harness(12, fast_config()).await;
    h.virt.quiesce().await;
    let rotations: Arc<std::sync::Mutex<Vec<u16>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&rotations);
    h.bus.on(EventKind::RotationChange, move |env| {
        if let ViewerEvent::RotationChange { deg } = env.event {
            sink.lock().unwrap().push(deg);
        }
        Ok(())
    });

    assert_eq!(h.virt.rotate(90), 90);
    assert_eq!(*rotations.lock().unwrap(), vec![90]);

    h.virt.quiesce().await;
    // Wrapper boxes mirrored: width is now the portrait height.
    let page1 = h.surface.get_by_id("pageContainer-1-1").unwrap();
    assert_eq!(h.surface.style(page1, "width").as_deref(), Some("792.00px"));
    assert_eq!(h.surface.style(page1, "height").as_deref(), Some("612.00px"));
}
