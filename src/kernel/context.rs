//! The calling process, passed explicitly to every syscall.

use std::fmt;
use std::rc::Rc;

use crate::kernel::core::Kernel;
use crate::object::{Dispatcher, HandleTable, HandleTableArena, ProcessDispatcher};
use crate::types::{Koid, TASK_RETCODE_SYSCALL_KILL};

/// Identifies which process a syscall is made on behalf of.
///
/// Each running instance receives its own context, so interleaved processes
/// always resolve handles against their own tables. The syscall surface is
/// implemented on this type (see `kernel::syscalls`).
#[derive(Clone)]
pub struct ProcessContext {
    kernel: Rc<Kernel>,
    process: Rc<ProcessDispatcher>,
    host: Option<Rc<HostLease>>,
}

/// Kills a host process once every context driving it is gone.
struct HostLease(Rc<ProcessDispatcher>);

impl Drop for HostLease {
    fn drop(&mut self) {
        self.0.kill(TASK_RETCODE_SYSCALL_KILL);
    }
}

impl ProcessContext {
    pub(crate) fn new(kernel: Rc<Kernel>, process: Rc<ProcessDispatcher>) -> Self {
        ProcessContext { kernel, process, host: None }
    }

    pub(crate) fn host(kernel: Rc<Kernel>, process: Rc<ProcessDispatcher>) -> Self {
        let lease = Rc::new(HostLease(Rc::clone(&process)));
        ProcessContext { kernel, process, host: Some(lease) }
    }

    pub fn kernel(&self) -> &Rc<Kernel> {
        &self.kernel
    }

    pub fn process(&self) -> &Rc<ProcessDispatcher> {
        &self.process
    }

    pub fn koid(&self) -> Koid {
        self.process.koid()
    }

    pub fn handle_table(&self) -> &HandleTable {
        self.process.handle_table()
    }

    pub(crate) fn arena(&self) -> &Rc<HandleTableArena> {
        self.kernel.arena()
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process", &self.process.koid())
            .field("name", &self.process.name())
            .field("host", &self.host.is_some())
            .finish()
    }
}
