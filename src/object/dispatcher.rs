//!
//! Base kernel object state shared by every dispatcher, and the closed set
//! of dispatcher kinds a handle can refer to.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{KernelResult, Status};
use crate::koid;
use crate::object::channel::ChannelDispatcher;
use crate::object::job::JobDispatcher;
use crate::object::port::{PortDispatcher, PortPacket};
use crate::object::process::ProcessDispatcher;
use crate::types::{Koid, ObjType, Rights, Signals, KOID_INVALID};

/// A one-shot registration made by `object_wait_async`.
pub(crate) struct SignalObserver {
    pub(crate) port: Weak<PortDispatcher>,
    pub(crate) key: u64,
    pub(crate) trigger: Signals,
    /// Base value of the handle the wait was registered through.
    pub(crate) handle: u32,
}

impl SignalObserver {
    fn deliver(self, observed: Signals) {
        if let Some(port) = self.port.upgrade() {
            port.queue(PortPacket::signal_one(self.key, self.trigger, observed));
        }
    }
}

/// State every kernel object carries.
pub struct DispatcherBase {
    koid: Koid,
    handle_count: Cell<u32>,
    signals: Cell<Signals>,
    observers: RefCell<Vec<SignalObserver>>,
    changed: Notify,
}

impl DispatcherBase {
    pub fn new(initial_signals: Signals) -> Self {
        DispatcherBase {
            koid: koid::generate(),
            handle_count: Cell::new(0),
            signals: Cell::new(initial_signals),
            observers: RefCell::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    pub fn koid(&self) -> Koid {
        self.koid
    }

    pub fn handle_count(&self) -> u32 {
        self.handle_count.get()
    }

    pub fn signals(&self) -> Signals {
        self.signals.get()
    }

    pub(crate) fn increment_handle_count(&self) {
        self.handle_count.set(self.handle_count.get() + 1);
    }

    /// Returns `true` when the last handle went away.
    pub(crate) fn decrement_handle_count(&self) -> bool {
        let count = self.handle_count.get();
        assert!(count > 0, "handle count underflow on koid {}", self.koid);
        self.handle_count.set(count - 1);
        count == 1
    }

    pub fn raise_signals(&self, set: Signals) {
        self.update_signals(0, set);
    }

    pub fn clear_signals(&self, clear: Signals) {
        self.update_signals(clear, 0);
    }

    /// Clears then sets signal bits. Observers and waiters are only woken
    /// when the signal state actually changes.
    pub fn update_signals(&self, clear: Signals, set: Signals) {
        let previous = self.signals.get();
        let current = (previous & !clear) | set;
        if current == previous {
            return;
        }
        self.signals.set(current);

        let fired: Vec<SignalObserver> = {
            let mut observers = self.observers.borrow_mut();
            let (fired, kept) = observers
                .drain(..)
                .partition(|observer| observer.trigger & current != 0);
            *observers = kept;
            fired
        };
        for observer in fired {
            observer.deliver(current);
        }
        self.changed.notify_waiters();
    }

    /// Registers a one-shot observer. Fires immediately when already satisfied.
    pub(crate) fn add_observer(&self, observer: SignalObserver) {
        let current = self.signals.get();
        if observer.trigger & current != 0 {
            observer.deliver(current);
        } else {
            self.observers.borrow_mut().push(observer);
        }
    }

    /// Drops observers registered through the handle with this base value.
    pub(crate) fn cancel_observers(&self, handle: u32) {
        let canceled: Vec<SignalObserver> = {
            let mut observers = self.observers.borrow_mut();
            let (canceled, kept) = observers
                .drain(..)
                .partition(|observer| observer.handle == handle);
            *observers = kept;
            canceled
        };
        drop(canceled);
    }

    /// Waits until `satisfied` accepts the signal state or the deadline passes.
    pub async fn wait_until(
        &self,
        satisfied: impl Fn(Signals) -> bool,
        deadline: Option<Instant>,
    ) -> KernelResult<Signals> {
        loop {
            let current = self.signals.get();
            if satisfied(current) {
                return Ok(current);
            }
            let changed = self.changed.notified();
            match deadline {
                None => changed.await,
                Some(at) => {
                    if tokio::time::timeout_at(at, changed).await.is_err() {
                        return Err(Status::TimedOut);
                    }
                }
            }
        }
    }
}

/// Behavior common to all kernel objects.
pub trait Dispatcher {
    fn base(&self) -> &DispatcherBase;

    fn obj_type(&self) -> ObjType;

    fn koid(&self) -> Koid {
        self.base().koid()
    }

    /// The peer koid for channels, the parent koid for jobs and processes.
    fn related_koid(&self) -> Koid {
        KOID_INVALID
    }

    /// Records which process currently holds the object.
    fn set_owner(&self, _owner: Koid) {}

    /// Runs once the last handle to the object has been released.
    fn on_zero_handles(&self) {}

    fn default_rights() -> Rights
    where
        Self: Sized;

    fn downcast(object: &KernelObject) -> Option<Rc<Self>>
    where
        Self: Sized;

    fn into_object(self: Rc<Self>) -> KernelObject
    where
        Self: Sized;
}

/// Reference to any dispatcher a handle can point at.
#[derive(Clone)]
pub enum KernelObject {
    Channel(Rc<ChannelDispatcher>),
    Job(Rc<JobDispatcher>),
    Process(Rc<ProcessDispatcher>),
    Port(Rc<PortDispatcher>),
}

impl KernelObject {
    pub fn as_dispatcher(&self) -> &dyn Dispatcher {
        match self {
            KernelObject::Channel(channel) => channel.as_ref(),
            KernelObject::Job(job) => job.as_ref(),
            KernelObject::Process(process) => process.as_ref(),
            KernelObject::Port(port) => port.as_ref(),
        }
    }

    pub fn base(&self) -> &DispatcherBase {
        self.as_dispatcher().base()
    }

    pub fn koid(&self) -> Koid {
        self.base().koid()
    }

    pub fn obj_type(&self) -> ObjType {
        self.as_dispatcher().obj_type()
    }

    pub fn as_channel(&self) -> Option<&Rc<ChannelDispatcher>> {
        match self {
            KernelObject::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&Rc<JobDispatcher>> {
        match self {
            KernelObject::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&Rc<ProcessDispatcher>> {
        match self {
            KernelObject::Process(process) => Some(process),
            _ => None,
        }
    }

    pub fn as_port(&self) -> Option<&Rc<PortDispatcher>> {
        match self {
            KernelObject::Port(port) => Some(port),
            _ => None,
        }
    }
}

impl fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelObject")
            .field("type", &self.obj_type())
            .field("koid", &self.koid())
            .finish()
    }
}
