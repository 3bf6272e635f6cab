//! In-memory element tree behind the narrow host surface.
//!
//! The embedder registers host containers up front; the engine then only
//! ever creates elements, wires children, and mutates attributes, styles,
//! and scroll offsets. Lookup by DOM id covers the `get(id)` contract the
//! overlay collaborators rely on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ahash::AHashMap;
use tracing::trace;

use crate::{DomError, DomResult};

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque arena key for one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

#[derive(Debug)]
struct ElementNode {
    tag: String,
    attributes: AHashMap<String, String>,
    styles: AHashMap<String, String>,
    children: Vec<ElementId>,
    parent: Option<ElementId>,
    scroll_top: f32,
    is_root: bool,
}

impl ElementNode {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attributes: AHashMap::new(),
            styles: AHashMap::new(),
            children: Vec::new(),
            parent: None,
            scroll_top: 0.0,
            is_root: false,
        }
    }
}

#[derive(Debug)]
struct SurfaceInner {
    nodes: AHashMap<ElementId, ElementNode>,
    by_dom_id: AHashMap<String, ElementId>,
    device_pixel_ratio: f32,
}

/// Handle to the host element tree. Clones share the same tree; the handle
/// is `Send + Sync` so engine tasks can mutate the surface directly.
#[derive(Debug, Clone)]
pub struct HostSurface {
    inner: Arc<Mutex<SurfaceInner>>,
}

impl Default for HostSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSurface {
    pub fn new() -> Self {
        Self::with_device_pixel_ratio(1.0)
    }

    pub fn with_device_pixel_ratio(dpr: f32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SurfaceInner {
                nodes: AHashMap::new(),
                by_dom_id: AHashMap::new(),
                device_pixel_ratio: dpr,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn device_pixel_ratio(&self) -> f32 {
        self.lock().device_pixel_ratio
    }

    /// Register a host container root (the embedder owns these). The id is
    /// indexed for `get_by_id`; the element counts as attached.
    pub fn register_container(&self, dom_id: &str) -> ElementId {
        let mut inner = self.lock();
        let id = ElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed));
        let mut node = ElementNode::new("div");
        node.is_root = true;
        node.attributes.insert("id".into(), dom_id.into());
        inner.nodes.insert(id, node);
        inner.by_dom_id.insert(dom_id.to_string(), id);
        trace!(target: "dom", dom_id, ?id, "container_registered");
        id
    }

    pub fn create_element(&self, tag: &str) -> ElementId {
        let mut inner = self.lock();
        let id = ElementId(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed));
        inner.nodes.insert(id, ElementNode::new(tag));
        id
    }

    pub fn get_by_id(&self, dom_id: &str) -> Option<ElementId> {
        self.lock().by_dom_id.get(dom_id).copied()
    }

    pub fn tag(&self, el: ElementId) -> DomResult<String> {
        let inner = self.lock();
        inner
            .nodes
            .get(&el)
            .map(|n| n.tag.clone())
            .ok_or(DomError::UnknownElement(el))
    }

    pub fn set_attribute(&self, el: ElementId, name: &str, value: &str) -> DomResult<()> {
        let mut inner = self.lock();
        if !inner.nodes.contains_key(&el) {
            return Err(DomError::UnknownElement(el));
        }
        if name == "id" {
            // Re-point the id index; a previous id on this element is
            // released first.
            let previous = inner
                .nodes
                .get(&el)
                .and_then(|n| n.attributes.get("id").cloned());
            if let Some(previous) = previous
                && inner.by_dom_id.get(&previous) == Some(&el)
            {
                inner.by_dom_id.remove(&previous);
            }
            inner.by_dom_id.insert(value.to_string(), el);
        }
        if let Some(node) = inner.nodes.get_mut(&el) {
            node.attributes.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }

    pub fn attribute(&self, el: ElementId, name: &str) -> Option<String> {
        let inner = self.lock();
        inner.nodes.get(&el).and_then(|n| n.attributes.get(name).cloned())
    }

    /// Drop all attributes except a root's registered id. A non-root id is
    /// also released from the lookup index (wrapper recycling depends on
    /// stale page ids resolving to nothing).
    pub fn clear_attributes(&self, el: ElementId) -> DomResult<()> {
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&el).ok_or(DomError::UnknownElement(el))?;
        let keep_id = node.is_root.then(|| node.attributes.get("id").cloned()).flatten();
        let drop_id = (!node.is_root)
            .then(|| node.attributes.get("id").cloned())
            .flatten();
        node.attributes.clear();
        if let Some(dom_id) = keep_id {
            node.attributes.insert("id".into(), dom_id);
        }
        if let Some(dom_id) = drop_id
            && inner.by_dom_id.get(&dom_id) == Some(&el)
        {
            inner.by_dom_id.remove(&dom_id);
        }
        Ok(())
    }

    pub fn set_style(&self, el: ElementId, name: &str, value: &str) -> DomResult<()> {
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&el).ok_or(DomError::UnknownElement(el))?;
        node.styles.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn style(&self, el: ElementId, name: &str) -> Option<String> {
        let inner = self.lock();
        inner.nodes.get(&el).and_then(|n| n.styles.get(name).cloned())
    }

    pub fn clear_styles(&self, el: ElementId) -> DomResult<()> {
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&el).ok_or(DomError::UnknownElement(el))?;
        node.styles.clear();
        Ok(())
    }

    pub fn append_child(&self, parent: ElementId, child: ElementId) -> DomResult<()> {
        let mut inner = self.lock();
        if !inner.nodes.contains_key(&parent) {
            return Err(DomError::UnknownElement(parent));
        }
        if !inner.nodes.contains_key(&child) {
            return Err(DomError::UnknownElement(child));
        }
        if let Some(old_parent) = inner.nodes.get(&child).and_then(|n| n.parent)
            && let Some(node) = inner.nodes.get_mut(&old_parent)
        {
            node.children.retain(|c| *c != child);
        }
        if let Some(node) = inner.nodes.get_mut(&parent) {
            node.children.push(child);
        }
        if let Some(node) = inner.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Unlink from the parent without destroying the element.
    pub fn detach(&self, el: ElementId) -> DomResult<()> {
        let mut inner = self.lock();
        let parent = inner
            .nodes
            .get(&el)
            .ok_or(DomError::UnknownElement(el))?
            .parent;
        if let Some(parent) = parent
            && let Some(node) = inner.nodes.get_mut(&parent)
        {
            node.children.retain(|c| *c != el);
        }
        if let Some(node) = inner.nodes.get_mut(&el) {
            node.parent = None;
        }
        Ok(())
    }

    /// Remove and destroy every descendant of `el` (the element itself stays).
    pub fn remove_children(&self, el: ElementId) -> DomResult<()> {
        let mut inner = self.lock();
        let children = inner
            .nodes
            .get_mut(&el)
            .ok_or(DomError::UnknownElement(el))?
            .children
            .split_off(0);
        for child in children {
            remove_subtree_locked(&mut inner, child);
        }
        Ok(())
    }

    /// Remove `el` and its whole subtree from the arena.
    pub fn remove_subtree(&self, el: ElementId) -> DomResult<()> {
        let mut inner = self.lock();
        let parent = inner
            .nodes
            .get(&el)
            .ok_or(DomError::UnknownElement(el))?
            .parent;
        if let Some(parent) = parent
            && let Some(node) = inner.nodes.get_mut(&parent)
        {
            node.children.retain(|c| *c != el);
        }
        remove_subtree_locked(&mut inner, el);
        trace!(target: "dom", ?el, "subtree_removed");
        Ok(())
    }

    pub fn children(&self, el: ElementId) -> Vec<ElementId> {
        let inner = self.lock();
        inner.nodes.get(&el).map(|n| n.children.clone()).unwrap_or_default()
    }

    pub fn parent(&self, el: ElementId) -> Option<ElementId> {
        self.lock().nodes.get(&el).and_then(|n| n.parent)
    }

    pub fn exists(&self, el: ElementId) -> bool {
        self.lock().nodes.contains_key(&el)
    }

    /// True iff the element is reachable from a registered container root.
    pub fn is_attached(&self, el: ElementId) -> bool {
        let inner = self.lock();
        let mut cursor = Some(el);
        while let Some(current) = cursor {
            match inner.nodes.get(&current) {
                None => return false,
                Some(node) if node.is_root => return true,
                Some(node) => cursor = node.parent,
            }
        }
        false
    }

    pub fn set_scroll_top(&self, el: ElementId, value: f32) -> DomResult<()> {
        let mut inner = self.lock();
        let node = inner.nodes.get_mut(&el).ok_or(DomError::UnknownElement(el))?;
        node.scroll_top = value.max(0.0);
        Ok(())
    }

    pub fn scroll_top(&self, el: ElementId) -> f32 {
        self.lock().nodes.get(&el).map(|n| n.scroll_top).unwrap_or(0.0)
    }

    /// Number of live elements, used by teardown assertions in tests.
    pub fn element_count(&self) -> usize {
        self.lock().nodes.len()
    }
}

fn remove_subtree_locked(inner: &mut SurfaceInner, el: ElementId) {
    let Some(node) = inner.nodes.remove(&el) else {
        return;
    };
    if let Some(dom_id) = node.attributes.get("id")
        && inner.by_dom_id.get(dom_id) == Some(&el)
    {
        inner.by_dom_id.remove(dom_id);
    }
    for child in node.children {
        remove_subtree_locked(inner, child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_follows_parent_chain_to_a_root() {
        let surface = HostSurface::new();
        let root = surface.register_container("host");
        let wrapper = surface.create_element("div");
        let canvas = surface.create_element("canvas");

        assert!(!surface.is_attached(wrapper));
        surface.append_child(root, wrapper).unwrap();
        surface.append_child(wrapper, canvas).unwrap();
        assert!(surface.is_attached(canvas));

        surface.detach(wrapper).unwrap();
        assert!(!surface.is_attached(canvas), "detached subtree must not count");
        assert!(surface.exists(canvas), "detach keeps elements alive");
    }

    #[test]
    fn id_attribute_is_indexed_and_released_on_removal() {
        let surface = HostSurface::new();
        let root = surface.register_container("host");
        let page = surface.create_element("div");
        surface.append_child(root, page).unwrap();
        surface.set_attribute(page, "id", "pageContainer-1-4").unwrap();

        assert_eq!(surface.get_by_id("pageContainer-1-4"), Some(page));
        surface.remove_subtree(page).unwrap();
        assert_eq!(surface.get_by_id("pageContainer-1-4"), None);
        assert!(surface.get_by_id("host").is_some());
    }

    #[test]
    fn remove_children_destroys_descendants_only() {
        let surface = HostSurface::new();
        let root = surface.register_container("host");
        let a = surface.create_element("div");
        let b = surface.create_element("span");
        surface.append_child(root, a).unwrap();
        surface.append_child(a, b).unwrap();

        surface.remove_children(a).unwrap();
        assert!(surface.exists(a));
        assert!(!surface.exists(b));
        assert!(surface.children(a).is_empty());
    }

    #[test]
    fn scroll_top_clamps_negative_values() {
        let surface = HostSurface::new();
        let root = surface.register_container("host");
        surface.set_scroll_top(root, -25.0).unwrap();
        assert_eq!(surface.scroll_top(root), 0.0);
        surface.set_scroll_top(root, 480.5).unwrap();
        assert_eq!(surface.scroll_top(root), 480.5);
    }

    #[test]
    fn reparenting_moves_the_child_between_parents() {
        let surface = HostSurface::new();
        let a = surface.create_element("div");
        let b = surface.create_element("div");
        let child = surface.create_element("canvas");
        surface.append_child(a, child).unwrap();
        surface.append_child(b, child).unwrap();
        assert!(surface.children(a).is_empty());
        assert_eq!(surface.children(b), vec![child]);
        assert_eq!(surface.parent(child), Some(b));
    }
}
