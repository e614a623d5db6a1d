use std::rc::Rc;

use proptest::prelude::*;
use capsule_kernel::error::Status;
use capsule_kernel::object::{Dispatcher, Handle, HandleOwner, HandleTable, HandleTableArena, PortDispatcher};
use capsule_kernel::rights::{self, SAME_RIGHTS};

fn arena() -> Rc<HandleTableArena> {
    Rc::new(HandleTableArena::new(1024, 1000))
}

fn port(arena: &Rc<HandleTableArena>, rights: u32) -> (Rc<PortDispatcher>, HandleOwner) {
    let (kernel_handle, _) = PortDispatcher::create();
    let dispatcher = Rc::clone(kernel_handle.dispatcher());
    let owner = Handle::make(kernel_handle, rights, arena).expect("make");
    (dispatcher, owner)
}

#[derive(Debug, Clone)]
enum Op {
    Dup(usize, u32),
    Close(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<usize>(), prop_oneof![Just(SAME_RIGHTS), any::<u32>()]).prop_map(|(i, r)| Op::Dup(i, r)),
        any::<usize>().prop_map(Op::Close),
    ]
}

proptest! {
    /// add_handle then get_handle_locked yields the same rights and dispatcher.
    #[test]
    fn prop_handle_round_trip(r in 0u32..(1 << 21), count in 1usize..16) {
        let arena = arena();
        let table = HandleTable::new(5000, Rc::clone(&arena));
        for _ in 0..count {
            let (dispatcher, owner) = port(&arena, r);
            let value = table.add_handle(owner);
            let handle = table.get_handle_locked(value).expect("lookup");
            prop_assert_eq!(handle.rights(), r);
            prop_assert_eq!(handle.dispatcher().koid(), dispatcher.koid());
            prop_assert_eq!(handle.handle_table_id(), 5000);
        }
    }

    /// dup succeeds iff the request is SAME_RIGHTS or a subset, and never escalates.
    #[test]
    fn prop_dup_rights_are_monotonic(have in any::<u32>(), requested in any::<u32>()) {
        let arena = arena();
        let (_, source) = port(&arena, have & !SAME_RIGHTS);
        let have = source.rights();
        match Handle::dup(&source, requested, &arena) {
            Ok(dup) => {
                prop_assert!(requested == SAME_RIGHTS || rights::is_subset(requested, have));
                prop_assert!(rights::is_subset(dup.rights(), have));
            }
            Err(status) => {
                prop_assert_eq!(status, Status::InvalidArgs);
                prop_assert!(requested != SAME_RIGHTS && !rights::is_subset(requested, have));
            }
        }
    }

    /// handle_count always equals the number of live handles.
    #[test]
    fn prop_handle_count_is_conserved(ops in proptest::collection::vec(op(), 0..64)) {
        let arena = arena();
        let (dispatcher, first) = port(&arena, rights::defaults::PORT);
        let mut live = vec![first];
        for op in ops {
            match op {
                Op::Dup(i, r) if !live.is_empty() => {
                    let source = &live[i % live.len()];
                    if let Ok(dup) = Handle::dup(source, r, &arena) {
                        live.push(dup);
                    }
                }
                Op::Close(i) if !live.is_empty() => {
                    let index = i % live.len();
                    drop(live.swap_remove(index));
                }
                _ => {}
            }
            prop_assert_eq!(dispatcher.base().handle_count() as usize, live.len());
            prop_assert_eq!(arena.outstanding(), live.len());
        }
        drop(live);
        prop_assert_eq!(dispatcher.base().handle_count(), 0);
    }

    /// A value from one table never resolves in another, whatever the mixers.
    #[test]
    fn prop_cross_table_isolation(count in 1usize..32) {
        let arena = arena();
        let a = HandleTable::new(6000, Rc::clone(&arena));
        let b = HandleTable::new(6001, Rc::clone(&arena));
        let mut values = Vec::new();
        for _ in 0..count {
            values.push(a.add_handle(port(&arena, rights::READ).1));
            b.add_handle(port(&arena, rights::READ).1);
        }
        for value in values {
            prop_assert!(a.get_handle_locked(value).is_ok());
            prop_assert_eq!(b.get_handle_locked(value).err(), Some(Status::BadHandle));
        }
    }
}
