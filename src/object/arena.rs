//!
//! Slot allocator backing every [`Handle`], independent of which process
//! owns it.
//!
//! The arena is owned by a kernel instance and shared (`Rc`) with everything
//! that creates or destroys handles, so several kernels can coexist in one
//! test binary.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::object::dispatcher::KernelObject;
use crate::object::handle::{new_base_value, Handle, HANDLE_INDEX_MASK};
use crate::types::{Rights, KOID_INVALID};

struct Slot {
    /// Base value of the most recent tenant; seeds the next generation.
    last_value: Option<u32>,
    handle: Weak<Handle>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
    outstanding: usize,
}

pub struct HandleTableArena {
    slots: RefCell<Slots>,
    max_handles: usize,
    high_handle_count: usize,
}

impl HandleTableArena {
    pub fn new(max_handles: usize, high_handle_count: usize) -> Self {
        debug_assert!(max_handles <= HANDLE_INDEX_MASK as usize + 1);
        HandleTableArena {
            slots: RefCell::new(Slots::default()),
            max_handles,
            high_handle_count,
        }
    }

    /// Number of live handles.
    pub fn outstanding(&self) -> usize {
        self.slots.borrow().outstanding
    }

    /// Allocates a handle for `object`. `what` names the allocation in logs.
    ///
    /// Returns `None` once the ceiling is reached; callers report `NO_MEMORY`.
    pub(crate) fn alloc(&self, object: KernelObject, rights: Rights, what: &str) -> Option<Rc<Handle>> {
        let handle = {
            let mut slots = self.slots.borrow_mut();
            if slots.outstanding >= self.max_handles {
                warn!(
                    what,
                    outstanding = slots.outstanding,
                    "could not allocate handle"
                );
                return None;
            }
            slots.outstanding += 1;
            if slots.outstanding > self.high_handle_count {
                warn!(
                    outstanding = slots.outstanding,
                    high = self.high_handle_count,
                    "high handle count"
                );
            }

            let index = match slots.free.pop() {
                Some(index) => index,
                None => {
                    let index = slots.entries.len() as u32;
                    slots.entries.push(Slot { last_value: None, handle: Weak::new() });
                    index
                }
            };
            let slot = &mut slots.entries[index as usize];
            debug_assert!(slot.handle.upgrade().is_none(), "handle slot already in use");
            let base_value = new_base_value(index, slot.last_value);
            let handle = Rc::new(Handle::new(object, rights, base_value));
            slot.last_value = Some(base_value);
            slot.handle = Rc::downgrade(&handle);
            handle
        };

        handle.dispatcher().base().increment_handle_count();
        Some(handle)
    }

    /// Resolves a base value to its live handle. Stale generations resolve to `None`.
    pub(crate) fn lookup(&self, base_value: u32) -> Option<Rc<Handle>> {
        let slots = self.slots.borrow();
        let slot = slots.entries.get((base_value & HANDLE_INDEX_MASK) as usize)?;
        let handle = slot.handle.upgrade()?;
        (handle.base_value() == base_value).then_some(handle)
    }

    /// Reclaims a handle's slot and drops its reference on the dispatcher.
    pub(crate) fn delete(&self, handle: &Handle) {
        // Stale values may still point at this slot; they are rejected by
        // the table id check, so it must already be cleared.
        assert_eq!(
            handle.handle_table_id(),
            KOID_INVALID,
            "deleting a handle still owned by a table"
        );

        {
            let mut slots = self.slots.borrow_mut();
            let index = handle.index();
            if let Some(slot) = slots.entries.get_mut(index as usize) {
                slot.handle = Weak::new();
            }
            slots.free.push(index);
            slots.outstanding -= 1;
        }

        let object = handle.dispatcher();
        object.base().cancel_observers(handle.base_value());
        if object.base().decrement_handle_count() {
            debug!(koid = object.koid(), kind = ?object.obj_type(), "last handle released");
            object.as_dispatcher().on_zero_handles();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::dispatcher::Dispatcher;
    use crate::object::port::PortDispatcher;
    use crate::rights;

    fn port_object() -> KernelObject {
        PortDispatcher::create().0.release().into_object()
    }

    #[test]
    fn alloc_and_lookup() {
        let arena = HandleTableArena::new(8, 7);
        let handle = arena.alloc(port_object(), rights::READ, "test").expect("alloc");
        let found = arena.lookup(handle.base_value()).expect("live");
        assert!(Rc::ptr_eq(&handle, &found));
        assert_eq!(arena.outstanding(), 1);
        arena.delete(&handle);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn reused_slot_rejects_stale_value() {
        let arena = HandleTableArena::new(8, 7);
        let object = port_object();
        let first = arena.alloc(object.clone(), rights::READ, "test").expect("alloc");
        let stale = first.base_value();
        arena.delete(&first);
        drop(first);

        let second = arena.alloc(object, rights::READ, "test").expect("alloc");
        assert_eq!(second.index(), stale & HANDLE_INDEX_MASK);
        assert!(arena.lookup(stale).is_none());
        assert!(arena.lookup(second.base_value()).is_some());
        arena.delete(&second);
    }

    #[test]
    fn ceiling_is_enforced() {
        let arena = HandleTableArena::new(2, 1);
        let object = port_object();
        let a = arena.alloc(object.clone(), 0, "test").expect("alloc");
        let b = arena.alloc(object.clone(), 0, "test").expect("alloc");
        assert!(arena.alloc(object.clone(), 0, "test").is_none());
        arena.delete(&a);
        let c = arena.alloc(object, 0, "test").expect("slot freed");
        arena.delete(&b);
        arena.delete(&c);
    }

    #[test]
    #[should_panic(expected = "still owned by a table")]
    fn deleting_owned_handle_is_fatal() {
        let arena = HandleTableArena::new(2, 1);
        let handle = arena.alloc(port_object(), 0, "test").expect("alloc");
        handle.set_handle_table_id(4096);
        arena.delete(&handle);
    }
}
