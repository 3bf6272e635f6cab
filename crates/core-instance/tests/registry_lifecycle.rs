//! Registry and instance lifecycle scenarios: container uniqueness,
//! teardown semantics, load failures, and multi-instance isolation.

use std::sync::Arc;
use std::time::Duration;

use core_dom::HostSurface;
use core_events::{EventKind, ViewerEvent};
use core_instance::{
    Environment, LoadError, LoadOptions, Registry, RegistryError,
};
use core_provider::synthetic::{SyntheticConfig, SyntheticProvider};
use core_provider::DocumentSource;

fn environment(pages: u32) -> (HostSurface, Environment) {
    let surface = HostSurface::new();
    surface.register_container("viewer-a");
    surface.register_container("viewer-b");
    let provider = Arc::new(SyntheticProvider::new(SyntheticConfig {
        page_count: pages,
        render_latency: Duration::from_millis(1),
        ..Default::default()
    }));
    let env = Environment::new(surface.clone(), provider);
    (surface, env)
}

fn options(container: &str) -> LoadOptions {
    LoadOptions::new(container, DocumentSource::Url("mem://doc".into()))
}

#[tokio::test]
async fn load_boots_a_ready_viewer() {
    let (surface, env) = environment(30);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();

    assert!(handle.is_ready());
    assert!(!handle.is_destroyed());
    assert_eq!(handle.current_page(), 1);
    assert_eq!(handle.total_pages(), 30);
    assert_eq!(handle.current_scale(), 1.0);
    assert_eq!(handle.container_id(), "viewer-a");
    // Isolated subtree with instance-scoped ids.
    let id = handle.instance_id();
    assert!(surface.get_by_id(&format!("vellum-{id}")).is_some());
    assert!(surface.get_by_id(&format!("viewerContainer-{id}")).is_some());
}

#[tokio::test]
async fn second_viewer_on_same_container_is_rejected() {
    let (_surface, env) = environment(10);
    let registry = Registry::new(env);
    let _first = registry.load(options("viewer-a")).await.unwrap();

    let err = registry.load(options("viewer-a")).await.unwrap_err();
    assert!(matches!(err, RegistryError::ContainerBusy(c) if c == "viewer-a"));
}

#[tokio::test]
async fn missing_container_fails_the_load() {
    let (_surface, env) = environment(10);
    let registry = Registry::new(env);
    let err = registry.load(options("nowhere")).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Load(LoadError::ContainerMissing(c)) if c == "nowhere"
    ));
    // The failed container id is not left reserved.
    assert_eq!(registry.stats().active_instances, 0);
}

#[tokio::test]
async fn lookups_resolve_by_instance_and_container() {
    let (_surface, env) = environment(10);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();
    let id = handle.instance_id();

    assert_eq!(registry.get_by_instance(id).unwrap().instance_id(), id);
    assert_eq!(
        registry.get_by_container("viewer-a").unwrap().instance_id(),
        id
    );
    assert!(matches!(
        registry.get_by_instance(id + 99),
        Err(RegistryError::NotFound(_))
    ));
    assert!(matches!(
        registry.get_by_container("viewer-b"),
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn unload_frees_the_container_for_reuse() {
    let (surface, env) = environment(10);
    let registry = Registry::new(env);
    let first = registry.load(options("viewer-a")).await.unwrap();
    let first_id = first.instance_id();
    first.quiesce().await;

    registry.unload(first_id).unwrap();
    assert!(first.is_destroyed());
    assert!(surface.get_by_id(&format!("vellum-{first_id}")).is_none());
    assert!(matches!(
        registry.unload(first_id),
        Err(RegistryError::NotFound(_))
    ));

    // Same container, new monotonically larger id.
    let second = registry.load(options("viewer-a")).await.unwrap();
    assert!(second.instance_id() > first_id);
}

#[tokio::test]
async fn global_teardown_refuses_everything_afterwards() {
    let (_surface, env) = environment(10);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();

    registry.destroy();
    registry.destroy(); // idempotent
    assert!(handle.is_destroyed());
    assert!(registry.stats().torn_down);

    assert!(matches!(
        registry.load(options("viewer-b")).await,
        Err(RegistryError::SystemTornDown)
    ));
    assert!(matches!(
        registry.get_by_container("viewer-a"),
        Err(RegistryError::SystemTornDown)
    ));
    assert!(matches!(
        registry.unload(handle.instance_id()),
        Err(RegistryError::SystemTornDown)
    ));
}

#[tokio::test]
async fn password_protected_document_rejects_then_accepts() {
    let surface = HostSurface::new();
    surface.register_container("viewer-a");
    let provider = Arc::new(SyntheticProvider::new(SyntheticConfig {
        page_count: 5,
        password: Some("secret".into()),
        ..Default::default()
    }));
    let registry = Registry::new(Environment::new(surface, provider));

    let err = registry.load(options("viewer-a")).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Load(LoadError::PasswordRequired)
    ));

    let mut with_password = options("viewer-a");
    with_password.password = Some("secret".into());
    let handle = registry.load(with_password).await.unwrap();
    assert!(handle.is_ready());
}

#[tokio::test]
async fn corrupt_document_surfaces_a_document_error() {
    let surface = HostSurface::new();
    surface.register_container("viewer-a");
    let provider = Arc::new(SyntheticProvider::new(SyntheticConfig {
        fail_open: Some("bad xref table".into()),
        ..Default::default()
    }));
    let registry = Registry::new(Environment::new(surface, provider));

    let err = registry.load(options("viewer-a")).await.unwrap_err();
    assert!(matches!(err, RegistryError::Load(LoadError::Document(_))));
    assert_eq!(registry.stats().active_instances, 0);
}

#[tokio::test]
async fn two_instances_are_fully_isolated() {
    let (_surface, env) = environment(60);
    let registry = Registry::new(env);
    let a = registry.load(options("viewer-a")).await.unwrap();
    let b = registry.load(options("viewer-b")).await.unwrap();
    a.quiesce().await;
    b.quiesce().await;

    let b_events = Arc::new(std::sync::Mutex::new(0usize));
    let sink = Arc::clone(&b_events);
    b.events().on(EventKind::PageChange, move |_| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    let b_before = b.stats();
    // Drive A hard; B must not notice.
    a.go_to_page(40).await;
    a.set_zoom(2.0);
    a.quiesce().await;

    let b_after = b.stats();
    assert_eq!(b_after.virtualizer.current_page, b_before.virtualizer.current_page);
    assert_eq!(b_after.virtualizer.queued, 0);
    assert_eq!(
        b_after.canvas_pool.created_total,
        b_before.canvas_pool.created_total,
        "B's pool must not see A's traffic"
    );
    assert_eq!(*b_events.lock().unwrap(), 0, "no cross-instance event leak");

    // Destroying A leaves B operational.
    a.destroy();
    assert!(!b.is_destroyed());
    b.go_to_page(5).await;
    b.quiesce().await;
    assert_eq!(b.current_page(), 5);
}

#[tokio::test]
async fn navigation_helpers_clamp_at_the_edges() {
    let (_surface, env) = environment(8);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();

    assert_eq!(handle.next_page().await, 2);
    assert_eq!(handle.previous_page().await, 1);
    assert_eq!(handle.previous_page().await, 1, "clamped at the first page");
    assert_eq!(handle.last_page().await, 8);
    assert_eq!(handle.next_page().await, 8, "clamped at the last page");
    assert_eq!(handle.first_page().await, 1);
}

#[tokio::test]
async fn annotation_facade_emits_lifecycle_events() {
    let (_surface, env) = environment(5);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();

    let seen: Arc<std::sync::Mutex<Vec<&'static str>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    for (kind, label) in [
        (EventKind::DrawingStarted, "start"),
        (EventKind::DrawingFinished, "finish"),
        (EventKind::AnnotationCreated, "created"),
        (EventKind::AnnotationDeleted, "deleted"),
    ] {
        let sink = Arc::clone(&seen);
        handle.events().on(kind, move |_| {
            sink.lock().unwrap().push(label);
            Ok(())
        });
    }

    let annotations = handle.annotations();
    let id = annotations.create(3, "highlight");
    assert!(annotations.delete(&id, 3, "highlight"));
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["start", "finish", "created", "deleted"]
    );
}

#[tokio::test]
async fn download_facade_forwards_the_document_source() {
    let (_surface, env) = environment(5);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();

    // The built-in service declines every request; the call still drives
    // the seam end-to-end with the instance's own source.
    assert!(!handle.download().request_download("document.pdf"));
}

#[tokio::test]
async fn interactive_mode_emits_only_on_change() {
    let (_surface, env) = environment(5);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();

    let toggles: Arc<std::sync::Mutex<Vec<bool>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&toggles);
    handle
        .events()
        .on(EventKind::InteractiveModeChanged, move |env| {
            if let ViewerEvent::InteractiveModeChanged { enabled } = env.event {
                sink.lock().unwrap().push(enabled);
            }
            Ok(())
        });

    handle.set_interactive_mode(true);
    handle.set_interactive_mode(true); // no-op
    handle.set_interactive_mode(false);
    assert_eq!(*toggles.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn destroyed_handle_is_inert_and_destroy_is_idempotent() {
    let (_surface, env) = environment(10);
    let registry = Registry::new(env);
    let handle = registry.load(options("viewer-a")).await.unwrap();
    handle.quiesce().await;

    let destroyed: Arc<std::sync::Mutex<u32>> = Arc::new(std::sync::Mutex::new(0));
    let sink = Arc::clone(&destroyed);
    handle.events().on(EventKind::Destroyed, move |_| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    handle.destroy();
    handle.destroy();
    assert_eq!(*destroyed.lock().unwrap(), 1, "Destroyed fires exactly once");
    assert!(handle.is_destroyed());
    assert!(!handle.is_ready());
    assert_eq!(handle.stats().virtualizer.materialized, 0);
    assert_eq!(handle.stats().canvas_pool.in_use, 0);
}
