//!
//! Jobs: the containment tree processes live in.
//!
//! Children are held strongly by their job; the link back to a parent is
//! weak, so the tree never forms an ownership cycle.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::error::{KernelResult, Status};
use crate::object::dispatcher::{Dispatcher, DispatcherBase, KernelObject};
use crate::object::handle::KernelHandle;
use crate::object::process::ProcessDispatcher;
use crate::rights;
use crate::types::{signals, Koid, ObjType, Rights, KOID_INVALID, MAX_NAME_LEN, TASK_RETCODE_SYSCALL_KILL};

/// Depth limit of the job tree, counted from the root.
pub const ROOT_JOB_MAX_HEIGHT: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Killing,
    Dead,
}

struct JobChildren {
    jobs: Vec<Rc<JobDispatcher>>,
    procs: Vec<Rc<ProcessDispatcher>>,
    state: JobState,
}

pub struct JobDispatcher {
    base: DispatcherBase,
    parent: Option<Weak<JobDispatcher>>,
    parent_koid: Koid,
    max_height: u32,
    name: String,
    children: RefCell<JobChildren>,
}

pub(crate) fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

impl JobDispatcher {
    fn new(parent: Option<&Rc<JobDispatcher>>, max_height: u32, name: &str) -> Self {
        JobDispatcher {
            base: DispatcherBase::new(signals::JOB_NO_CHILDREN),
            parent: parent.map(Rc::downgrade),
            parent_koid: parent.map_or(KOID_INVALID, |p| p.koid()),
            max_height,
            name: truncate_name(name),
            children: RefCell::new(JobChildren {
                jobs: Vec::new(),
                procs: Vec::new(),
                state: JobState::Ready,
            }),
        }
    }

    pub fn create_root() -> Rc<Self> {
        let root = Rc::new(Self::new(None, ROOT_JOB_MAX_HEIGHT, "root"));
        debug!(koid = root.koid(), "root job created");
        root
    }

    /// Creates a child job one level below `parent`.
    ///
    /// Fails with `OUT_OF_RANGE` when `parent` is at the depth limit and
    /// `BAD_STATE` when it no longer accepts children.
    pub fn create(parent: &Rc<JobDispatcher>, name: &str) -> KernelResult<(KernelHandle<Self>, Rights)> {
        if parent.max_height == 0 {
            return Err(Status::OutOfRange);
        }
        let job = Rc::new(Self::new(Some(parent), parent.max_height - 1, name));
        let kernel_handle = KernelHandle::new(Rc::clone(&job));
        if !parent.add_child_job(&job) {
            return Err(Status::BadState);
        }
        debug!(koid = job.koid(), parent = parent.koid(), "job created");
        Ok((kernel_handle, Self::default_rights()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_height(&self) -> u32 {
        self.max_height
    }

    pub fn parent(&self) -> Option<Rc<JobDispatcher>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn state(&self) -> JobState {
        self.children.borrow().state
    }

    pub fn child_jobs(&self) -> Vec<Rc<JobDispatcher>> {
        self.children.borrow().jobs.clone()
    }

    pub fn child_processes(&self) -> Vec<Rc<ProcessDispatcher>> {
        self.children.borrow().procs.clone()
    }

    pub fn add_child_job(&self, job: &Rc<JobDispatcher>) -> bool {
        {
            let mut children = self.children.borrow_mut();
            if children.state != JobState::Ready {
                return false;
            }
            children.jobs.push(Rc::clone(job));
        }
        self.base.clear_signals(signals::JOB_NO_JOBS);
        true
    }

    pub fn add_child_process(&self, process: &Rc<ProcessDispatcher>) -> bool {
        {
            let mut children = self.children.borrow_mut();
            if children.state != JobState::Ready {
                return false;
            }
            children.procs.push(Rc::clone(process));
        }
        self.base.clear_signals(signals::JOB_NO_PROCESSES);
        true
    }

    pub(crate) fn remove_child_process(&self, koid: Koid) {
        let (removed, now_empty) = {
            let mut children = self.children.borrow_mut();
            let removed = children
                .procs
                .iter()
                .position(|p| p.koid() == koid)
                .map(|index| children.procs.remove(index));
            (removed, children.procs.is_empty())
        };
        if removed.is_some() && now_empty {
            self.base.raise_signals(signals::JOB_NO_PROCESSES);
        }
        drop(removed);
        self.maybe_finish();
    }

    pub(crate) fn remove_child_job(&self, koid: Koid) {
        let (removed, now_empty) = {
            let mut children = self.children.borrow_mut();
            let removed = children
                .jobs
                .iter()
                .position(|j| j.koid() == koid)
                .map(|index| children.jobs.remove(index));
            (removed, children.jobs.is_empty())
        };
        if removed.is_some() && now_empty {
            self.base.raise_signals(signals::JOB_NO_JOBS);
        }
        drop(removed);
        self.maybe_finish();
    }

    /// Kills every process and job below this one. The job stops accepting
    /// children immediately and is DEAD once the last child is gone.
    pub fn kill(&self) {
        let (jobs, procs) = {
            let mut children = self.children.borrow_mut();
            if children.state != JobState::Ready {
                return;
            }
            children.state = JobState::Killing;
            (children.jobs.clone(), children.procs.clone())
        };
        debug!(koid = self.koid(), jobs = jobs.len(), procs = procs.len(), "killing job");

        for process in procs {
            process.kill(TASK_RETCODE_SYSCALL_KILL);
        }
        for job in jobs {
            job.kill();
        }
        self.maybe_finish();
    }

    /// Moves to DEAD when the job has no children and is either being
    /// killed or no longer reachable through any handle.
    fn maybe_finish(&self) {
        {
            let mut children = self.children.borrow_mut();
            let childless = children.jobs.is_empty() && children.procs.is_empty();
            let finishing = match children.state {
                JobState::Killing => true,
                JobState::Ready => self.base.handle_count() == 0 && self.parent.is_some(),
                JobState::Dead => false,
            };
            if !(childless && finishing) {
                return;
            }
            children.state = JobState::Dead;
        }
        debug!(koid = self.koid(), "job dead");
        self.base.raise_signals(signals::JOB_TERMINATED);
        if let Some(parent) = self.parent() {
            parent.remove_child_job(self.koid());
        }
    }
}

impl Dispatcher for JobDispatcher {
    fn base(&self) -> &DispatcherBase {
        &self.base
    }

    fn obj_type(&self) -> ObjType {
        ObjType::Job
    }

    fn related_koid(&self) -> Koid {
        self.parent_koid
    }

    fn on_zero_handles(&self) {
        self.maybe_finish();
    }

    fn default_rights() -> Rights {
        rights::defaults::JOB
    }

    fn downcast(object: &KernelObject) -> Option<Rc<Self>> {
        object.as_job().cloned()
    }

    fn into_object(self: Rc<Self>) -> KernelObject {
        KernelObject::Job(self)
    }
}
