//! Per-instance event bus over a closed event vocabulary.
//!
//! Emission contract:
//! - Listeners receive an [`EventEnvelope`] carrying `{instance_id,
//!   timestamp_ms}` alongside the typed event payload.
//! - A failing listener is isolated: its error is logged and remaining
//!   listeners still run.
//! - After [`EventBus::destroy`] every registration is dropped and further
//!   `on`/`emit` calls are silently inert.
//!
//! The vocabulary is a closed sum ([`ViewerEvent`]); each variant carries a
//! typed record, never a dynamic payload.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use tracing::{debug, warn};

/// Monotonically-unique identity of one viewer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Classification carried by [`ViewerEvent::LoadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The provider rejected the document.
    Document,
    /// The document is encrypted and no valid password was supplied.
    Password,
    /// Viewer-side initialization failed after the document opened.
    Internal,
}

/// Payload for annotation lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationPayload {
    pub annotation_id: String,
    pub page: u32,
    pub kind: String,
}

/// The full per-instance event vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    Loaded,
    LoadError { kind: LoadErrorKind, message: String },
    Progress { loaded: u64, total: u64 },
    PasswordRequired,
    PageChange { page: u32 },
    ScaleChange { scale: f32 },
    RotationChange { deg: u16 },
    AnnotationSelected(AnnotationPayload),
    AnnotationCreated(AnnotationPayload),
    AnnotationUpdated(AnnotationPayload),
    AnnotationDeleted(AnnotationPayload),
    DrawingStarted,
    DrawingFinished,
    InteractiveModeChanged { enabled: bool },
    Destroyed,
}

/// Discriminant used for listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Loaded,
    LoadError,
    Progress,
    PasswordRequired,
    PageChange,
    ScaleChange,
    RotationChange,
    AnnotationSelected,
    AnnotationCreated,
    AnnotationUpdated,
    AnnotationDeleted,
    DrawingStarted,
    DrawingFinished,
    InteractiveModeChanged,
    Destroyed,
}

impl ViewerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ViewerEvent::Loaded => EventKind::Loaded,
            ViewerEvent::LoadError { .. } => EventKind::LoadError,
            ViewerEvent::Progress { .. } => EventKind::Progress,
            ViewerEvent::PasswordRequired => EventKind::PasswordRequired,
            ViewerEvent::PageChange { .. } => EventKind::PageChange,
            ViewerEvent::ScaleChange { .. } => EventKind::ScaleChange,
            ViewerEvent::RotationChange { .. } => EventKind::RotationChange,
            ViewerEvent::AnnotationSelected(_) => EventKind::AnnotationSelected,
            ViewerEvent::AnnotationCreated(_) => EventKind::AnnotationCreated,
            ViewerEvent::AnnotationUpdated(_) => EventKind::AnnotationUpdated,
            ViewerEvent::AnnotationDeleted(_) => EventKind::AnnotationDeleted,
            ViewerEvent::DrawingStarted => EventKind::DrawingStarted,
            ViewerEvent::DrawingFinished => EventKind::DrawingFinished,
            ViewerEvent::InteractiveModeChanged { .. } => EventKind::InteractiveModeChanged,
            ViewerEvent::Destroyed => EventKind::Destroyed,
        }
    }
}

/// What listeners actually receive.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub instance_id: InstanceId,
    pub timestamp_ms: u64,
    pub event: ViewerEvent,
}

/// Listener callback result; errors are logged, never propagated.
pub type EventResult<T> = anyhow::Result<T>;

type Listener = Arc<dyn Fn(&EventEnvelope) -> EventResult<()> + Send + Sync>;

/// Registration handle returned by [`EventBus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct BusInner {
    listeners: AHashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_listener: u64,
    destroyed: bool,
}

/// Event bus scoped to exactly one viewer instance. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    instance_id: InstanceId,
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            inner: Arc::new(Mutex::new(BusInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Register a listener for one event kind. After destroy the returned
    /// id refers to nothing (registration is silently dropped).
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&EventEnvelope) -> EventResult<()> + Send + Sync + 'static,
    ) -> ListenerId {
        let mut inner = self.lock();
        inner.next_listener += 1;
        let id = ListenerId(inner.next_listener);
        if inner.destroyed {
            return id;
        }
        inner
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove one registration. Returns whether anything was removed.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        before != list.len()
    }

    pub fn remove_all(&self) {
        self.lock().listeners.clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().listeners.get(&kind).map_or(0, Vec::len)
    }

    pub fn total_listener_count(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    /// Deliver `event` to every listener registered for its kind. Listener
    /// callbacks run outside the bus lock, so re-entrant `on`/`off` from a
    /// listener is allowed.
    pub fn emit(&self, event: ViewerEvent) {
        let kind = event.kind();
        let targets: Vec<(ListenerId, Listener)> = {
            let inner = self.lock();
            if inner.destroyed {
                return;
            }
            inner.listeners.get(&kind).cloned().unwrap_or_default()
        };
        let envelope = EventEnvelope {
            instance_id: self.instance_id,
            timestamp_ms: now_ms(),
            event,
        };
        debug!(
            target: "events",
            instance = %self.instance_id,
            ?kind,
            listeners = targets.len(),
            "emit"
        );
        for (id, listener) in targets {
            if let Err(error) = listener(&envelope) {
                warn!(
                    target: "events",
                    instance = %self.instance_id,
                    ?kind,
                    listener = id.0,
                    %error,
                    "listener_failed"
                );
            }
        }
    }

    /// Drop every registration and refuse future ones. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.destroyed = true;
        inner.listeners.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_listener(counter: Arc<AtomicUsize>) -> impl Fn(&EventEnvelope) -> EventResult<()> {
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn envelope_carries_instance_identity_and_payload() {
        let bus = EventBus::new(InstanceId(7));
        let seen: Arc<Mutex<Vec<EventEnvelope>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(EventKind::PageChange, move |env| {
            sink.lock().unwrap().push(env.clone());
            Ok(())
        });

        bus.emit(ViewerEvent::PageChange { page: 12 });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].instance_id, InstanceId(7));
        assert!(seen[0].timestamp_ms > 0);
        assert_eq!(seen[0].event, ViewerEvent::PageChange { page: 12 });
    }

    #[test]
    fn failing_listener_does_not_starve_the_rest() {
        let bus = EventBus::new(InstanceId(1));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::Loaded, |_| anyhow::bail!("listener exploded"));
        bus.on(EventKind::Loaded, counter_listener(Arc::clone(&counter)));
        bus.on(EventKind::Loaded, counter_listener(Arc::clone(&counter)));

        bus.emit(ViewerEvent::Loaded);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn off_removes_exactly_one_registration() {
        let bus = EventBus::new(InstanceId(1));
        let counter = Arc::new(AtomicUsize::new(0));
        let keep = bus.on(EventKind::ScaleChange, counter_listener(Arc::clone(&counter)));
        let drop_me = bus.on(EventKind::ScaleChange, counter_listener(Arc::clone(&counter)));

        assert!(bus.off(EventKind::ScaleChange, drop_me));
        assert!(
            !bus.off(EventKind::ScaleChange, drop_me),
            "second off is a no-op"
        );
        bus.emit(ViewerEvent::ScaleChange { scale: 1.5 });
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(bus.off(EventKind::ScaleChange, keep));
        assert_eq!(bus.total_listener_count(), 0);
    }

    #[test]
    fn listeners_only_receive_their_kind() {
        let bus = EventBus::new(InstanceId(1));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::Progress, counter_listener(Arc::clone(&counter)));

        bus.emit(ViewerEvent::Loaded);
        bus.emit(ViewerEvent::Destroyed);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        bus.emit(ViewerEvent::Progress {
            loaded: 10,
            total: 100,
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroyed_bus_is_silently_inert() {
        let bus = EventBus::new(InstanceId(1));
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::Loaded, counter_listener(Arc::clone(&counter)));

        bus.destroy();
        bus.destroy(); // idempotent
        assert!(bus.is_destroyed());
        assert_eq!(bus.total_listener_count(), 0);

        bus.on(EventKind::Loaded, counter_listener(Arc::clone(&counter)));
        bus.emit(ViewerEvent::Loaded);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_off_from_a_listener_does_not_deadlock() {
        let bus = EventBus::new(InstanceId(1));
        let bus_clone = bus.clone();
        let id_cell: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
        let cell = Arc::clone(&id_cell);
        let id = bus.on(EventKind::Loaded, move |_| {
            if let Some(id) = *cell.lock().unwrap() {
                bus_clone.off(EventKind::Loaded, id);
            }
            Ok(())
        });
        *id_cell.lock().unwrap() = Some(id);

        bus.emit(ViewerEvent::Loaded);
        assert_eq!(bus.listener_count(EventKind::Loaded), 0);
    }
}
