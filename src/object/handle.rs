//!
//! Handles and the ownership wrappers around them.
//!
//! A dispatcher starts life inside a [`KernelHandle`], which only the kernel
//! holds. Once the object is fully set up, the kernel handle is upgraded into
//! a [`HandleOwner`]: an arena-backed [`Handle`] carrying rights, owned by
//! exactly one handle table or message at a time.

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

use crate::error::{KernelResult, Status};
use crate::object::arena::HandleTableArena;
use crate::object::dispatcher::{Dispatcher, KernelObject};
use crate::rights;
use crate::types::{Koid, ObjType, Rights, KOID_INVALID};

/// Number of live handles the arena can index.
pub const MAX_HANDLE_COUNT: usize = 256 * 1024;

// base_value bit fields:
//   [31..30] must be zero
//   [29..18] generation
//   [17..0]  arena index
pub const HANDLE_RESERVED_BITS: u32 = 2;
pub const HANDLE_INDEX_MASK: u32 = MAX_HANDLE_COUNT as u32 - 1;
pub const HANDLE_GENERATION_SHIFT: u32 = MAX_HANDLE_COUNT.trailing_zeros();
pub const HANDLE_RESERVED_BITS_MASK: u32 =
    ((1 << HANDLE_RESERVED_BITS) - 1) << (32 - HANDLE_RESERVED_BITS);
pub const HANDLE_GENERATION_MASK: u32 = !HANDLE_INDEX_MASK & !HANDLE_RESERVED_BITS_MASK;

const _: () = assert!(MAX_HANDLE_COUNT.is_power_of_two());
const _: () = assert!(HANDLE_GENERATION_MASK >> HANDLE_GENERATION_SHIFT >= 255);
const _: () = assert!(HANDLE_GENERATION_MASK & HANDLE_INDEX_MASK == 0);

/// Computes the base value for a slot, bumping the generation of its previous tenant.
pub(crate) fn new_base_value(index: u32, old_value: Option<u32>) -> u32 {
    debug_assert_eq!(index & !HANDLE_INDEX_MASK, 0);
    let old_generation = match old_value {
        Some(old) => {
            debug_assert_eq!(old & HANDLE_INDEX_MASK, index);
            (old & HANDLE_GENERATION_MASK) >> HANDLE_GENERATION_SHIFT
        }
        None => 0,
    };
    let generation = ((old_generation + 1) << HANDLE_GENERATION_SHIFT) & HANDLE_GENERATION_MASK;
    index | generation
}

/// How a specific process refers to a specific dispatcher.
pub struct Handle {
    object: KernelObject,
    rights: Rights,
    handle_table_id: Cell<Koid>,
    base_value: u32,
}

impl Handle {
    pub(crate) fn new(object: KernelObject, rights: Rights, base_value: u32) -> Self {
        debug_assert_eq!(base_value & HANDLE_RESERVED_BITS_MASK, 0);
        Handle {
            object,
            rights,
            handle_table_id: Cell::new(KOID_INVALID),
            base_value,
        }
    }

    /// Upgrades a kernel-held dispatcher to its first user-visible handle.
    pub fn make<T: Dispatcher>(
        kernel_handle: KernelHandle<T>,
        rights: Rights,
        arena: &Rc<HandleTableArena>,
    ) -> KernelResult<HandleOwner> {
        let object = kernel_handle.dispatcher().clone().into_object();
        let handle = arena.alloc(object, rights, "new").ok_or(Status::NoMemory)?;
        // The arena now accounts for the object; the kernel handle must not
        // run the zero-handles hook on drop.
        kernel_handle.release();
        Ok(HandleOwner::new(handle, Rc::clone(arena)))
    }

    /// Creates another handle to the same dispatcher.
    ///
    /// `rights` is either `SAME_RIGHTS` or a subset of the source's rights,
    /// otherwise `INVALID_ARGS`. The `DUPLICATE` right is checked by callers.
    pub fn dup(
        source: &Handle,
        rights: Rights,
        arena: &Rc<HandleTableArena>,
    ) -> KernelResult<HandleOwner> {
        let rights = rights::resolve(rights, source.rights).ok_or(Status::InvalidArgs)?;
        let handle = arena
            .alloc(source.object.clone(), rights, "duplicate")
            .ok_or(Status::NoMemory)?;
        Ok(HandleOwner::new(handle, Rc::clone(arena)))
    }

    pub fn dispatcher(&self) -> &KernelObject {
        &self.object
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    pub fn has_rights(&self, rights: Rights) -> bool {
        rights::sufficient(self.rights, rights)
    }

    pub fn obj_type(&self) -> ObjType {
        self.object.obj_type()
    }

    /// Koid of the process whose table owns this handle, or `KOID_INVALID`.
    pub fn handle_table_id(&self) -> Koid {
        self.handle_table_id.get()
    }

    pub(crate) fn set_handle_table_id(&self, koid: Koid) {
        self.handle_table_id.set(koid);
        self.object.as_dispatcher().set_owner(koid);
    }

    /// Arena index plus generation; the handle table mixes this into the
    /// value user code sees.
    pub fn base_value(&self) -> u32 {
        self.base_value
    }

    pub fn index(&self) -> u32 {
        self.base_value & HANDLE_INDEX_MASK
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("object", &self.object)
            .field("rights", &format_args!("{:#x}", self.rights))
            .field("handle_table_id", &self.handle_table_id.get())
            .field("base_value", &format_args!("{:#x}", self.base_value))
            .finish()
    }
}

/// Sole owner of a live [`Handle`]. Dropping it returns the handle to the arena.
pub struct HandleOwner {
    handle: Rc<Handle>,
    arena: Rc<HandleTableArena>,
}

impl HandleOwner {
    pub(crate) fn new(handle: Rc<Handle>, arena: Rc<HandleTableArena>) -> Self {
        HandleOwner { handle, arena }
    }

    pub fn handle(&self) -> &Rc<Handle> {
        &self.handle
    }
}

impl Deref for HandleOwner {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for HandleOwner {
    fn drop(&mut self) {
        self.arena.delete(&self.handle);
    }
}

impl fmt::Debug for HandleOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.handle, f)
    }
}

/// A dispatcher owned by the kernel before any handle to it exists.
///
/// If it is dropped without being upgraded through [`Handle::make`], the
/// dispatcher's `on_zero_handles` hook runs, so half-built objects (a channel
/// endpoint whose peer never got a handle, say) are still torn down.
pub struct KernelHandle<T: Dispatcher> {
    dispatcher: Rc<T>,
    released: bool,
}

impl<T: Dispatcher> KernelHandle<T> {
    pub fn new(dispatcher: Rc<T>) -> Self {
        KernelHandle { dispatcher, released: false }
    }

    pub fn dispatcher(&self) -> &Rc<T> {
        &self.dispatcher
    }

    /// Gives up kernel ownership without running the zero-handles hook.
    pub fn release(mut self) -> Rc<T> {
        self.released = true;
        Rc::clone(&self.dispatcher)
    }
}

impl<T: Dispatcher> Drop for KernelHandle<T> {
    fn drop(&mut self) {
        if !self.released {
            self.dispatcher.on_zero_handles();
        }
    }
}
