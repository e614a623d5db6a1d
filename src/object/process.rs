//!
//! Processes and the execution backends that drive them.
//!
//! A process owns one [`HandleTable`] and one [`ProcessInstance`]. Starting
//! it queues the instance as a task on the kernel; the process stays RUNNING until
//! the instance returns, the process exits through a syscall, or it is
//! killed.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{KernelResult, Status};
use crate::kernel::{Kernel, ProcessContext};
use crate::object::arena::HandleTableArena;
use crate::object::dispatcher::{Dispatcher, DispatcherBase, KernelObject};
use crate::object::handle::KernelHandle;
use crate::object::handle_table::HandleTable;
use crate::object::job::{truncate_name, JobDispatcher};
use crate::rights;
use crate::types::{signals, HandleValue, Koid, ObjType, Rights, TASK_RETCODE_SYSCALL_KILL};

pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A kernel-native program, looked up by entry name when a native process runs.
pub type NativeProgram = Rc<dyn Fn(ProcessContext, HandleValue) -> LocalBoxFuture<'static, i64>>;

/// A sandboxed execution environment (a WebAssembly engine, typically) that
/// exposes the syscall surface to the code it runs.
pub trait WasmBackend {
    /// Loads and links the program. An error fails the process start.
    fn initialize(&mut self, ctx: ProcessContext) -> LocalBoxFuture<'_, KernelResult<()>>;

    /// Runs the exported `entry` with the bootstrap handle, returning the exit code.
    fn run<'a>(&'a mut self, ctx: ProcessContext, entry: &'a str, arg1: HandleValue) -> LocalBoxFuture<'a, i64>;
}

/// Builds a backend for a newly created process, given its name.
pub type WasmBackendFactory = Rc<dyn Fn(&str) -> Box<dyn WasmBackend>>;

/// The closed set of execution backends.
pub enum ProcessInstance {
    /// Runs the native program registered under the entry name.
    Native,
    Wasm(Box<dyn WasmBackend>),
}

impl ProcessInstance {
    async fn initialize(&mut self, ctx: &ProcessContext) -> KernelResult<()> {
        match self {
            ProcessInstance::Native => Ok(()),
            ProcessInstance::Wasm(backend) => backend.initialize(ctx.clone()).await,
        }
    }

    async fn run(&mut self, ctx: ProcessContext, entry: &str, arg1: HandleValue) -> i64 {
        match self {
            ProcessInstance::Native => {
                let program = ctx.kernel().program(entry);
                match program {
                    Some(program) => program(ctx, arg1).await,
                    None => {
                        warn!(entry, "no native program registered for entry");
                        -1
                    }
                }
            }
            ProcessInstance::Wasm(backend) => backend.run(ctx, entry, arg1).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Created, not yet started.
    Initial,
    Running,
    /// Tearing down its handle table.
    Dying,
    Dead,
}

pub struct ProcessDispatcher {
    base: DispatcherBase,
    name: String,
    job: Weak<JobDispatcher>,
    job_koid: Koid,
    handle_table: HandleTable,
    state: Cell<ProcessState>,
    instance: RefCell<Option<ProcessInstance>>,
    return_code: Cell<Option<i64>>,
    task: RefCell<Option<AbortHandle>>,
}

impl ProcessDispatcher {
    /// Creates a process under `job`. Fails with `BAD_STATE` if the job no
    /// longer accepts children.
    pub fn create(
        job: &Rc<JobDispatcher>,
        name: &str,
        instance: ProcessInstance,
        arena: &Rc<HandleTableArena>,
    ) -> KernelResult<(KernelHandle<Self>, Rights)> {
        let base = DispatcherBase::new(signals::NONE);
        let handle_table = HandleTable::new(base.koid(), Rc::clone(arena));
        let process = Rc::new(ProcessDispatcher {
            base,
            name: truncate_name(name),
            job: Rc::downgrade(job),
            job_koid: job.koid(),
            handle_table,
            state: Cell::new(ProcessState::Initial),
            instance: RefCell::new(Some(instance)),
            return_code: Cell::new(None),
            task: RefCell::new(None),
        });
        let kernel_handle = KernelHandle::new(Rc::clone(&process));
        if !job.add_child_process(&process) {
            return Err(Status::BadState);
        }
        debug!(koid = process.koid(), job = job.koid(), name = %process.name, "process created");
        Ok((kernel_handle, Self::default_rights()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn handle_table(&self) -> &HandleTable {
        &self.handle_table
    }

    pub fn job(&self) -> Option<Rc<JobDispatcher>> {
        self.job.upgrade()
    }

    /// Exit code, once the process is dead.
    pub fn return_code(&self) -> Option<i64> {
        self.return_code.get()
    }

    /// Queues the instance as a task on the kernel.
    ///
    /// Returns as soon as the task is queued; the instance runs to completion
    /// while the kernel is driven. `arg2` is opaque to the kernel.
    pub fn start(
        self: &Rc<Self>,
        kernel: &Rc<Kernel>,
        entry: &str,
        arg1: HandleValue,
        arg2: u64,
    ) -> KernelResult<()> {
        if self.state.get() != ProcessState::Initial {
            return Err(Status::BadState);
        }
        let mut instance = self.instance.borrow_mut().take().ok_or(Status::BadState)?;
        self.state.set(ProcessState::Running);

        let ctx = ProcessContext::new(Rc::clone(kernel), Rc::clone(self));
        let process = Rc::clone(self);
        let entry = entry.to_string();
        debug!(koid = self.koid(), entry = %entry, arg1, arg2, "process starting");

        let task = kernel.spawn_task(async move {
            let code = match instance.initialize(&ctx).await {
                Ok(()) => instance.run(ctx, &entry, arg1).await,
                Err(status) => {
                    warn!(koid = process.koid(), %status, "process instance failed to initialize");
                    i64::from(status.into_raw())
                }
            };
            process.finish(code);
        });
        *self.task.borrow_mut() = Some(task);
        Ok(())
    }

    /// Marks a process as running without spawning anything, for callers
    /// that drive syscalls on its behalf from outside the kernel.
    pub(crate) fn attach_host(&self) -> KernelResult<()> {
        if self.state.get() != ProcessState::Initial {
            return Err(Status::BadState);
        }
        self.instance.borrow_mut().take();
        self.state.set(ProcessState::Running);
        Ok(())
    }

    /// Terminates the process with `code`. Its task, if still running, is
    /// abandoned at its next suspension point.
    pub fn exit(&self, code: i64) {
        self.finish(code);
    }

    pub fn kill(&self, code: i64) {
        if matches!(self.state.get(), ProcessState::Initial | ProcessState::Running) {
            self.finish(code);
        }
    }

    /// Resolves with the exit code once the process is dead.
    pub async fn wait_terminated(&self) -> i64 {
        // Without a deadline the wait cannot time out.
        let _ = self
            .base
            .wait_until(|s| s & signals::PROCESS_TERMINATED != 0, None)
            .await;
        self.return_code.get().unwrap_or(TASK_RETCODE_SYSCALL_KILL)
    }

    fn finish(&self, code: i64) {
        if matches!(self.state.get(), ProcessState::Dying | ProcessState::Dead) {
            return;
        }
        self.state.set(ProcessState::Dying);
        self.return_code.set(Some(code));

        let task = self.task.borrow_mut().take();
        if let Some(task) = task {
            task.abort();
        }
        let instance = self.instance.borrow_mut().take();
        drop(instance);

        let handles = self.handle_table.clear();
        debug!(koid = self.koid(), code, closed = handles.len(), "process exiting");
        drop(handles);

        self.state.set(ProcessState::Dead);
        self.base.raise_signals(signals::PROCESS_TERMINATED);
        if let Some(job) = self.job.upgrade() {
            job.remove_child_process(self.koid());
        }
    }
}

impl Dispatcher for ProcessDispatcher {
    fn base(&self) -> &DispatcherBase {
        &self.base
    }

    fn obj_type(&self) -> ObjType {
        ObjType::Process
    }

    fn related_koid(&self) -> Koid {
        self.job_koid
    }

    fn on_zero_handles(&self) {
        // A process nobody can reach will never be started.
        if self.state.get() == ProcessState::Initial {
            self.finish(TASK_RETCODE_SYSCALL_KILL);
        }
    }

    fn default_rights() -> Rights {
        rights::defaults::PROCESS
    }

    fn downcast(object: &KernelObject) -> Option<Rc<Self>> {
        object.as_process().cloned()
    }

    fn into_object(self: Rc<Self>) -> KernelObject {
        KernelObject::Process(self)
    }
}
