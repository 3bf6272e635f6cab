//! Fixed-size ring of recycled page container elements.
//!
//! The ring holds at most `min(page_count, 2 * initial_visible + 5)`
//! elements. When every slot is borrowed, `get` creates a transient element
//! that lives outside the pool and is destroyed on release instead of
//! recycled.

use core_dom::{ElementId, HostSurface};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapperHandle {
    pub element: ElementId,
    pub transient: bool,
}

#[derive(Debug)]
struct WrapperSlot {
    element: ElementId,
    in_use: bool,
}

#[derive(Debug)]
pub struct WrapperPool {
    surface: HostSurface,
    slots: Vec<WrapperSlot>,
    max_wrappers: usize,
    transient_created: u64,
}

/// Ring capacity rule.
pub fn wrapper_capacity(page_count: u32, initial_visible: u32) -> usize {
    (page_count as usize).min(2 * initial_visible as usize + 5)
}

impl WrapperPool {
    pub fn new(surface: HostSurface, max_wrappers: usize) -> Self {
        Self {
            surface,
            slots: Vec::new(),
            max_wrappers: max_wrappers.max(1),
            transient_created: 0,
        }
    }

    pub fn get(&mut self) -> WrapperHandle {
        if let Some(slot) = self.slots.iter_mut().find(|s| !s.in_use) {
            slot.in_use = true;
            return WrapperHandle {
                element: slot.element,
                transient: false,
            };
        }
        let element = self.surface.create_element("div");
        if self.slots.len() < self.max_wrappers {
            self.slots.push(WrapperSlot {
                element,
                in_use: true,
            });
            WrapperHandle {
                element,
                transient: false,
            }
        } else {
            self.transient_created += 1;
            trace!(target: "virt.wrapper", total = self.transient_created, "transient_wrapper");
            WrapperHandle {
                element,
                transient: true,
            }
        }
    }

    /// Scrub and recycle a wrapper. Transient wrappers are destroyed.
    pub fn release(&mut self, handle: WrapperHandle) {
        if handle.transient {
            let _ = self.surface.remove_subtree(handle.element);
            return;
        }
        let _ = self.surface.remove_children(handle.element);
        let _ = self.surface.clear_attributes(handle.element);
        let _ = self.surface.clear_styles(handle.element);
        let _ = self.surface.detach(handle.element);
        if let Some(slot) = self.slots.iter_mut().find(|s| s.element == handle.element) {
            slot.in_use = false;
        }
    }

    /// Destroy every pooled element.
    pub fn destroy(&mut self) {
        for slot in self.slots.drain(..) {
            let _ = self.surface.remove_subtree(slot.element);
        }
    }

    pub fn pooled(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    pub fn transient_created(&self) -> u64 {
        self.transient_created
    }
}
