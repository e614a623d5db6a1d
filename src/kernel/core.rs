//!
//! The kernel instance: the handle arena, the root of the job tree, the
//! native program registry and the monotonic clock.
//!
//! A `Kernel` is always held in an `Rc`; running processes keep a clone in
//! their [`ProcessContext`]. Process instances run as tasks on the kernel's
//! own `LocalSet`, which makes progress only while [`Kernel::run`] or
//! [`Kernel::run_until`] is being awaited.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::{AbortHandle, LocalSet};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::kernel::context::ProcessContext;
use crate::object::{
    Dispatcher, Handle, HandleOwner, HandleTableArena, JobDispatcher, KernelHandle, LocalBoxFuture,
    NativeProgram, ProcessDispatcher, ProcessInstance, WasmBackendFactory,
};
use crate::types::{signals, HandleValue, Time, TIME_INFINITE};
use crate::userboot;

pub struct Kernel {
    config: KernelConfig,
    arena: Rc<HandleTableArena>,
    root_job: Rc<JobDispatcher>,
    /// The kernel's own handle to the root job; userboot duplicates it.
    root_job_handle: HandleOwner,
    programs: RefCell<HashMap<String, NativeProgram>>,
    wasm_backend: RefCell<Option<WasmBackendFactory>>,
    tasks: LocalSet,
    boot: Instant,
}

impl Kernel {
    /// Creates a kernel with the default configuration.
    pub fn new() -> KernelResult<Rc<Self>> {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> KernelResult<Rc<Self>> {
        config.validate()?;
        let arena = Rc::new(HandleTableArena::new(config.max_handles, config.high_handle_count()));
        let root_job = JobDispatcher::create_root();
        let root_job_handle = Handle::make(
            KernelHandle::new(Rc::clone(&root_job)),
            JobDispatcher::default_rights(),
            &arena,
        )?;
        debug!(max_handles = config.max_handles, root_job = root_job.koid(), "kernel constructed");
        Ok(Rc::new(Kernel {
            config,
            arena,
            root_job,
            root_job_handle,
            programs: RefCell::new(HashMap::new()),
            wasm_backend: RefCell::new(None),
            tasks: LocalSet::new(),
            boot: Instant::now(),
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn arena(&self) -> &Rc<HandleTableArena> {
        &self.arena
    }

    pub fn root_job(&self) -> &Rc<JobDispatcher> {
        &self.root_job
    }

    pub fn root_job_handle(&self) -> &Handle {
        &self.root_job_handle
    }

    /// Registers a native program under an entry name.
    pub fn register_program<F, Fut>(&self, entry: impl Into<String>, program: F)
    where
        F: Fn(ProcessContext, HandleValue) -> Fut + 'static,
        Fut: Future<Output = i64> + 'static,
    {
        let program: NativeProgram =
            Rc::new(move |ctx: ProcessContext, arg: HandleValue| -> LocalBoxFuture<'static, i64> {
                Box::pin(program(ctx, arg))
            });
        self.programs.borrow_mut().insert(entry.into(), program);
    }

    pub fn program(&self, entry: &str) -> Option<NativeProgram> {
        self.programs.borrow().get(entry).cloned()
    }

    /// Makes `process_create` build Wasm-backed processes.
    pub fn set_wasm_backend_factory(&self, factory: WasmBackendFactory) {
        *self.wasm_backend.borrow_mut() = Some(factory);
    }

    pub(crate) fn new_instance(&self, name: &str) -> ProcessInstance {
        match self.wasm_backend.borrow().as_ref() {
            Some(factory) => ProcessInstance::Wasm(factory(name)),
            None => ProcessInstance::Native,
        }
    }

    /// Nanoseconds since the kernel was constructed.
    pub fn clock_monotonic(&self) -> Time {
        i64::try_from(self.boot.elapsed().as_nanos()).unwrap_or(TIME_INFINITE)
    }

    /// Converts a deadline on the kernel clock to a timer instant.
    /// `TIME_INFINITE` means no deadline.
    pub(crate) fn deadline_instant(&self, deadline: Time) -> Option<Instant> {
        if deadline == TIME_INFINITE {
            return None;
        }
        let offset = Duration::from_nanos(u64::try_from(deadline).unwrap_or(0));
        self.boot.checked_add(offset)
    }

    /// Queues a process task. It first runs once the kernel is driven.
    pub(crate) fn spawn_task<F>(&self, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + 'static,
    {
        self.tasks.spawn_local(task).abort_handle()
    }

    /// Awaits `fut` while driving the kernel's process tasks.
    ///
    /// Needs a tokio runtime with the time driver enabled. Must not be
    /// called from inside a process task.
    pub async fn run_until<F: Future>(&self, fut: F) -> F::Output {
        self.tasks.run_until(fut).await
    }

    /// Creates a process under the root job that is driven from outside the
    /// kernel rather than by a spawned instance.
    ///
    /// The process stays RUNNING while any clone of the returned context is
    /// alive and is killed when the last one is dropped.
    pub fn create_host_process(self: &Rc<Self>, name: &str) -> KernelResult<ProcessContext> {
        let (process, _) =
            ProcessDispatcher::create(&self.root_job, name, ProcessInstance::Native, &self.arena)?;
        let process = process.release();
        process.attach_host()?;
        Ok(ProcessContext::host(Rc::clone(self), process))
    }

    /// Boots the first process and drives the kernel until the root job has
    /// no children left. Live host processes count as children.
    pub async fn run(self: &Rc<Self>) -> KernelResult<()> {
        let process = userboot::init(self)?;
        info!(koid = process.koid(), "userboot started");

        self.run_until(self.root_job.base().wait_until(
            |s| s & signals::JOB_NO_CHILDREN == signals::JOB_NO_CHILDREN,
            None,
        ))
        .await?;
        info!(code = ?process.return_code(), "root job has no children left");
        Ok(())
    }
}
