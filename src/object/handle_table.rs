//!
//! Per-process handle table: the only place a raw handle value is turned
//! back into a [`Handle`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rand_core::{OsRng, RngCore};

use crate::error::{KernelResult, Status};
use crate::object::arena::HandleTableArena;
use crate::object::dispatcher::{Dispatcher, KernelObject};
use crate::object::handle::{Handle, HandleOwner, HANDLE_RESERVED_BITS};
use crate::types::{HandleValue, Koid, Rights, HANDLE_FIXED_BITS_MASK, KOID_INVALID};

const HANDLE_MUST_BE_ONE_MASK: u32 = (1 << HANDLE_RESERVED_BITS) - 1;
const _: () = assert!(HANDLE_MUST_BE_ONE_MASK == HANDLE_FIXED_BITS_MASK);

pub struct HandleTable {
    process_koid: Koid,
    /// XOR mask applied to base values. The low reserved bits are always clear.
    mixer: u32,
    handles: RefCell<HashMap<u32, HandleOwner>>,
    arena: Rc<HandleTableArena>,
}

impl HandleTable {
    pub fn new(process_koid: Koid, arena: Rc<HandleTableArena>) -> Self {
        Self::with_mixer(process_koid, arena, OsRng.next_u32())
    }

    pub(crate) fn with_mixer(process_koid: Koid, arena: Rc<HandleTableArena>, secret: u32) -> Self {
        HandleTable {
            process_koid,
            mixer: secret << HANDLE_RESERVED_BITS,
            handles: RefCell::new(HashMap::new()),
            arena,
        }
    }

    pub fn process_koid(&self) -> Koid {
        self.process_koid
    }

    pub fn arena(&self) -> &Rc<HandleTableArena> {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.handles.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a handle to the value given to user code.
    pub fn map_handle_to_value(&self, handle: &Handle) -> HandleValue {
        let base_value = handle.base_value();
        debug_assert_eq!(base_value >> (32 - HANDLE_RESERVED_BITS), 0);
        ((base_value << HANDLE_RESERVED_BITS) | HANDLE_MUST_BE_ONE_MASK) ^ self.mixer
    }

    fn map_value_to_base(&self, value: HandleValue) -> Option<u32> {
        if value & HANDLE_MUST_BE_ONE_MASK != HANDLE_MUST_BE_ONE_MASK {
            return None;
        }
        Some((value ^ self.mixer) >> HANDLE_RESERVED_BITS)
    }

    /// Takes ownership of a handle and returns its user-visible value.
    pub fn add_handle(&self, owner: HandleOwner) -> HandleValue {
        owner.set_handle_table_id(self.process_koid);
        let value = self.map_handle_to_value(&owner);
        self.handles.borrow_mut().insert(owner.base_value(), owner);
        value
    }

    /// Resolves a value to a handle owned by this table.
    ///
    /// Values that do not decode, point at a dead or reused slot, or belong
    /// to another process's table all fail with `BAD_HANDLE`.
    pub fn get_handle_locked(&self, value: HandleValue) -> KernelResult<Rc<Handle>> {
        let handle = self
            .map_value_to_base(value)
            .and_then(|base_value| self.arena.lookup(base_value))
            .ok_or(Status::BadHandle)?;
        if handle.handle_table_id() != self.process_koid {
            return Err(Status::BadHandle);
        }
        Ok(handle)
    }

    /// Detaches a handle from the table without destroying it.
    pub fn remove_handle(&self, value: HandleValue) -> KernelResult<HandleOwner> {
        let handle = self.get_handle_locked(value)?;
        self.remove_handle_locked(&handle).ok_or(Status::BadHandle)
    }

    pub fn remove_handle_locked(&self, handle: &Handle) -> Option<HandleOwner> {
        let owner = self.handles.borrow_mut().remove(&handle.base_value())?;
        owner.set_handle_table_id(KOID_INVALID);
        Some(owner)
    }

    /// Looks up a typed dispatcher, checking that the handle holds `rights`.
    pub fn get_dispatcher_with_rights<T: Dispatcher>(
        &self,
        value: HandleValue,
        rights: Rights,
    ) -> KernelResult<Rc<T>> {
        let handle = self.get_handle_locked(value)?;
        let dispatcher = T::downcast(handle.dispatcher()).ok_or(Status::WrongType)?;
        if !handle.has_rights(rights) {
            return Err(Status::AccessDenied);
        }
        Ok(dispatcher)
    }

    /// Like [`get_dispatcher_with_rights`](Self::get_dispatcher_with_rights)
    /// for operations that accept any object type.
    pub fn get_object_with_rights(&self, value: HandleValue, rights: Rights) -> KernelResult<KernelObject> {
        let handle = self.get_handle_locked(value)?;
        if !handle.has_rights(rights) {
            return Err(Status::AccessDenied);
        }
        Ok(handle.dispatcher().clone())
    }

    /// Detaches every handle. The caller drops them once no table borrow is held.
    pub(crate) fn clear(&self) -> Vec<HandleOwner> {
        let owners: Vec<HandleOwner> = self.handles.borrow_mut().drain().map(|(_, owner)| owner).collect();
        for owner in &owners {
            owner.set_handle_table_id(KOID_INVALID);
        }
        owners
    }
}

impl Drop for HandleTable {
    fn drop(&mut self) {
        drop(self.clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::channel::ChannelDispatcher;
    use crate::object::job::JobDispatcher;
    use crate::object::port::PortDispatcher;
    use crate::rights;

    fn arena() -> Rc<HandleTableArena> {
        Rc::new(HandleTableArena::new(64, 56))
    }

    fn port_owner(arena: &Rc<HandleTableArena>, rights: Rights) -> HandleOwner {
        let (port, _) = PortDispatcher::create();
        Handle::make(port, rights, arena).expect("make")
    }

    #[test]
    fn values_carry_fixed_low_bits() {
        let arena = arena();
        let table = HandleTable::new(2000, Rc::clone(&arena));
        for _ in 0..8 {
            let value = table.add_handle(port_owner(&arena, rights::READ));
            assert_eq!(value & HANDLE_FIXED_BITS_MASK, HANDLE_FIXED_BITS_MASK);
        }
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn lookup_round_trips_rights_and_dispatcher() {
        let arena = arena();
        let table = HandleTable::new(2001, Rc::clone(&arena));
        let owner = port_owner(&arena, rights::READ | rights::WRITE);
        let koid = owner.dispatcher().koid();
        let value = table.add_handle(owner);

        let handle = table.get_handle_locked(value).expect("lookup");
        assert_eq!(handle.rights(), rights::READ | rights::WRITE);
        assert_eq!(handle.dispatcher().koid(), koid);
        assert_eq!(handle.handle_table_id(), 2001);
    }

    #[test]
    fn malformed_values_are_bad_handles() {
        let arena = arena();
        let table = HandleTable::new(2002, Rc::clone(&arena));
        let value = table.add_handle(port_owner(&arena, rights::READ));
        assert_eq!(table.get_handle_locked(value & !1).err(), Some(Status::BadHandle));
        assert_eq!(table.get_handle_locked(0).err(), Some(Status::BadHandle));
        assert_eq!(table.get_handle_locked(value ^ (0x1234 << 2)).err(), Some(Status::BadHandle));
    }

    #[test]
    fn foreign_values_fail_closed() {
        let arena = arena();
        let a = HandleTable::with_mixer(3000, Rc::clone(&arena), 0x1111);
        let b = HandleTable::with_mixer(3001, Rc::clone(&arena), 0x1111);
        let value = a.add_handle(port_owner(&arena, rights::READ));
        // Same mixer on purpose: the table id check alone must reject it.
        assert_eq!(b.get_handle_locked(value).err(), Some(Status::BadHandle));
        assert!(a.get_handle_locked(value).is_ok());
    }

    #[test]
    fn removed_handle_no_longer_resolves() {
        let arena = arena();
        let table = HandleTable::new(2003, Rc::clone(&arena));
        let value = table.add_handle(port_owner(&arena, rights::READ));
        let owner = table.remove_handle(value).expect("remove");
        assert_eq!(owner.handle_table_id(), KOID_INVALID);
        assert_eq!(table.get_handle_locked(value).err(), Some(Status::BadHandle));
        assert_eq!(table.remove_handle(value).err(), Some(Status::BadHandle));
        drop(owner);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn typed_lookup_checks_type_then_rights() {
        let arena = arena();
        let table = HandleTable::new(2004, Rc::clone(&arena));
        let value = table.add_handle(port_owner(&arena, rights::READ));

        assert!(table.get_dispatcher_with_rights::<PortDispatcher>(value, rights::READ).is_ok());
        assert_eq!(
            table.get_dispatcher_with_rights::<PortDispatcher>(value, rights::WRITE).err(),
            Some(Status::AccessDenied)
        );
        assert_eq!(
            table.get_dispatcher_with_rights::<JobDispatcher>(value, rights::READ).err(),
            Some(Status::WrongType)
        );
        assert_eq!(
            table.get_dispatcher_with_rights::<ChannelDispatcher>(value, rights::NONE).err(),
            Some(Status::WrongType)
        );
    }

    #[test]
    fn dropping_table_releases_every_handle() {
        let arena = arena();
        let table = HandleTable::new(2005, Rc::clone(&arena));
        table.add_handle(port_owner(&arena, rights::READ));
        table.add_handle(port_owner(&arena, rights::READ));
        assert_eq!(arena.outstanding(), 2);
        drop(table);
        assert_eq!(arena.outstanding(), 0);
    }
}
