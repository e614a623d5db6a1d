//!
//! Builds the first process and hands it its initial capabilities.
//!
//! This is the one place handles are created for a process without going
//! through duplicate or transfer: the kernel makes a handle to the new
//! process, duplicates its own root-job handle, and ships both in a
//! bootstrap message on a fresh channel. The process receives the other
//! end of that channel as its start argument.

pub mod message;

use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::object::{ChannelDispatcher, Dispatcher, Handle, MessagePacket, ProcessDispatcher};
use crate::rights;
use crate::types::{KOID_INVALID, TASK_RETCODE_SYSCALL_KILL};

pub use self::message::BootstrapMessage;

/// Index of the process's own handle in the bootstrap message.
pub const PROC_SELF: usize = 0;
/// Index of the root-job handle in the bootstrap message.
pub const ROOT_JOB: usize = 1;
pub const HANDLE_COUNT: usize = 2;

const PROCESS_NAME: &str = "userboot";

/// Creates and starts the first process under the root job. It runs once
/// the kernel is driven.
pub fn init(kernel: &Rc<Kernel>) -> KernelResult<Rc<ProcessDispatcher>> {
    let arena = kernel.arena();
    let payload = BootstrapMessage {
        handle_info: vec![
            message::handle_info(message::PA_PROC_SELF, 0),
            message::handle_info(message::PA_JOB_DEFAULT, 0),
        ],
        args: kernel.config().userboot_args.clone(),
    }
    .encode()?;

    let (process_handle, process_rights) = ProcessDispatcher::create(
        kernel.root_job(),
        PROCESS_NAME,
        kernel.new_instance(PROCESS_NAME),
        arena,
    )?;
    let process = Rc::clone(process_handle.dispatcher());

    let mut handles = Vec::with_capacity(HANDLE_COUNT);
    handles.push(Handle::make(process_handle, process_rights, arena)?);
    handles.push(Handle::dup(kernel.root_job_handle(), rights::SAME_RIGHTS, arena)?);
    debug_assert_eq!(handles.len(), HANDLE_COUNT);
    let msg = MessagePacket::create(payload, handles)?;

    let (user_end, kernel_end, channel_rights) = ChannelDispatcher::create();
    kernel_end.dispatcher().write(KOID_INVALID, msg)?;
    let user_owner = Handle::make(user_end, channel_rights, arena)?;
    let bootstrap = process.handle_table().add_handle(user_owner);
    // The kernel keeps no end of the channel.
    drop(kernel_end);

    let entry = kernel.config().userboot_entry.as_str();
    debug!(koid = process.koid(), entry, bootstrap, "starting userboot");
    if let Err(status) = process.start(kernel, entry, bootstrap, 0) {
        // The process holds the only reference to its own handle, inside
        // the unread message; killing it breaks that cycle.
        warn!(%status, "userboot failed to start");
        process.kill(TASK_RETCODE_SYSCALL_KILL);
        return Err(status);
    }
    info!(koid = process.koid(), entry, "userboot: process launched");
    Ok(process)
}
