//!
//! The syscall surface.
//!
//! Every entry point resolves handle values against the calling process's
//! table, checks rights, and delegates to the target dispatcher. Failures
//! are reported as [`Status`]; `status_of` turns a result into the raw code
//! a sandboxed caller expects.

use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{status_of, KernelResult, ReadError, Status};
use crate::kernel::context::ProcessContext;
use crate::object::dispatcher::SignalObserver;
use crate::object::message_packet::TXID_SIZE;
use crate::object::{
    ChannelDispatcher, Dispatcher, Handle, HandleOwner, JobDispatcher, KernelObject, MessagePacket,
    PacketPayload, PortDispatcher, PortPacket, ProcessDispatcher, ProcessState,
};
use crate::rights;
use crate::types::{
    signals, HandleBasicInfo, HandleDisposition, HandleInfo, HandleOp, HandleValue, ObjType, Rights,
    Signals, Time, CHANNEL_MAX_MSG_BYTES, CHANNEL_MAX_MSG_HANDLES, CHANNEL_READ_MAY_DISCARD,
    HANDLE_INVALID, TASK_RETCODE_SYSCALL_KILL,
};

/// A message read from a channel, its handles already installed in the
/// reader's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub bytes: Vec<u8>,
    pub handles: Vec<HandleValue>,
}

/// Like [`ChannelMessage`], with the type and rights of each received handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessageEtc {
    pub bytes: Vec<u8>,
    pub handles: Vec<HandleInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTopic {
    HandleBasic,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub return_code: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectInfo {
    HandleBasic(HandleBasicInfo),
    Process(ProcessInfo),
}

impl ProcessContext {
    // Handles

    /// Closing `HANDLE_INVALID` is a no-op.
    pub fn sys_handle_close(&self, handle: HandleValue) -> KernelResult<()> {
        if handle == HANDLE_INVALID {
            return Ok(());
        }
        let owner = self.handle_table().remove_handle(handle)?;
        drop(owner);
        Ok(())
    }

    pub fn sys_handle_duplicate(&self, handle: HandleValue, rights: Rights) -> KernelResult<HandleValue> {
        if !rights::is_valid_mask(rights) {
            return Err(Status::InvalidArgs);
        }
        let table = self.handle_table();
        let source = table.get_handle_locked(handle)?;
        if !source.has_rights(rights::DUPLICATE) {
            return Err(Status::AccessDenied);
        }
        let owner = Handle::dup(&source, rights, self.arena())?;
        Ok(table.add_handle(owner))
    }

    /// Swaps `handle` for a new one with `rights`. No `DUPLICATE` right is needed.
    pub fn sys_handle_replace(&self, handle: HandleValue, rights: Rights) -> KernelResult<HandleValue> {
        if !rights::is_valid_mask(rights) {
            return Err(Status::InvalidArgs);
        }
        let table = self.handle_table();
        let source = table.get_handle_locked(handle)?;
        let replacement = Handle::dup(&source, rights, self.arena())?;
        let value = table.add_handle(replacement);
        // The replacement is installed first so the object never sees zero handles.
        let old = table.remove_handle_locked(&source);
        drop(old);
        Ok(value)
    }

    // Objects

    pub fn sys_object_get_info(&self, handle: HandleValue, topic: InfoTopic) -> KernelResult<ObjectInfo> {
        let handle = self.handle_table().get_handle_locked(handle)?;
        let object = handle.dispatcher();
        match topic {
            InfoTopic::HandleBasic => Ok(ObjectInfo::HandleBasic(HandleBasicInfo {
                koid: object.koid(),
                rights: handle.rights(),
                obj_type: object.obj_type(),
                related_koid: object.as_dispatcher().related_koid(),
            })),
            InfoTopic::Process => {
                let process = object.as_process().ok_or(Status::WrongType)?;
                if !handle.has_rights(rights::INSPECT) {
                    return Err(Status::AccessDenied);
                }
                Ok(ObjectInfo::Process(ProcessInfo {
                    state: process.state(),
                    return_code: process.return_code(),
                }))
            }
        }
    }

    /// Waits until any of `signals` is asserted on the object, returning the
    /// observed signal state.
    pub async fn sys_object_wait_one(
        &self,
        handle: HandleValue,
        signals: Signals,
        deadline: Time,
    ) -> KernelResult<Signals> {
        let object = self.handle_table().get_object_with_rights(handle, rights::WAIT)?;
        let deadline = self.kernel().deadline_instant(deadline);
        object.base().wait_until(|s| s & signals != 0, deadline).await
    }

    /// Arms a one-shot observer: the next time any of `signals` is asserted
    /// on the object, a signal packet with `key` is queued on `port`.
    pub fn sys_object_wait_async(
        &self,
        handle: HandleValue,
        port: HandleValue,
        key: u64,
        signals: Signals,
        options: u32,
    ) -> KernelResult<()> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let table = self.handle_table();
        let target = table.get_handle_locked(handle)?;
        if !target.has_rights(rights::WAIT) {
            return Err(Status::AccessDenied);
        }
        let port = table.get_dispatcher_with_rights::<PortDispatcher>(port, rights::WRITE)?;
        target.dispatcher().base().add_observer(SignalObserver {
            port: Rc::downgrade(&port),
            key,
            trigger: signals,
            handle: target.base_value(),
        });
        Ok(())
    }

    // Channels

    pub fn sys_channel_create(&self, options: u32) -> KernelResult<(HandleValue, HandleValue)> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let (end0, end1, rights) = ChannelDispatcher::create();
        let owner0 = Handle::make(end0, rights, self.arena())?;
        let owner1 = Handle::make(end1, rights, self.arena())?;
        let table = self.handle_table();
        Ok((table.add_handle(owner0), table.add_handle(owner1)))
    }

    /// Writes `bytes` and moves `handles` to the peer. The handles are
    /// consumed whether or not the write succeeds.
    pub fn sys_channel_write(
        &self,
        handle: HandleValue,
        options: u32,
        bytes: &[u8],
        handles: &[HandleValue],
    ) -> KernelResult<()> {
        let mut dispositions: Vec<HandleDisposition> =
            handles.iter().map(|&h| HandleDisposition::moving(h)).collect();
        self.sys_channel_write_etc(handle, options, bytes, &mut dispositions)
    }

    /// Disposition-based write. Each entry's `result` is filled in; the
    /// first failing entry's status is returned. Move-mode handles are
    /// consumed even when the write fails.
    pub fn sys_channel_write_etc(
        &self,
        handle: HandleValue,
        options: u32,
        bytes: &[u8],
        dispositions: &mut [HandleDisposition],
    ) -> KernelResult<()> {
        if options != 0 {
            self.discard_moved_handles(dispositions);
            return Err(Status::InvalidArgs);
        }
        let channel = match self.write_target(handle, bytes, dispositions.len()) {
            Ok(channel) => channel,
            Err(status) => {
                self.discard_moved_handles(dispositions);
                return Err(status);
            }
        };
        let msg = self.build_message(&channel, bytes, dispositions)?;
        channel.write(self.koid(), msg)
    }

    pub fn sys_channel_read(
        &self,
        handle: HandleValue,
        options: u32,
        max_bytes: u32,
        max_handles: u32,
    ) -> Result<ChannelMessage, ReadError> {
        let msg = self.sys_channel_read_etc(handle, options, max_bytes, max_handles)?;
        Ok(ChannelMessage {
            bytes: msg.bytes,
            handles: msg.handles.iter().map(|info| info.handle).collect(),
        })
    }

    pub fn sys_channel_read_etc(
        &self,
        handle: HandleValue,
        options: u32,
        max_bytes: u32,
        max_handles: u32,
    ) -> Result<ChannelMessageEtc, ReadError> {
        if options & !CHANNEL_READ_MAY_DISCARD != 0 {
            return Err(Status::InvalidArgs.into());
        }
        let channel = self
            .handle_table()
            .get_dispatcher_with_rights::<ChannelDispatcher>(handle, rights::READ)?;
        let may_discard = options & CHANNEL_READ_MAY_DISCARD != 0;
        let msg = channel.read(self.koid(), max_bytes, max_handles, may_discard)?;
        Ok(self.accept_message(msg))
    }

    /// Writes a request and waits for the reply carrying the same
    /// kernel-generated transaction id. The first four bytes of `bytes` are
    /// overwritten with that id.
    pub async fn sys_channel_call(
        &self,
        handle: HandleValue,
        deadline: Time,
        bytes: &[u8],
        handles: &[HandleValue],
    ) -> KernelResult<ChannelMessage> {
        let mut dispositions: Vec<HandleDisposition> =
            handles.iter().map(|&h| HandleDisposition::moving(h)).collect();
        let channel = match self.write_target(handle, bytes, dispositions.len()) {
            Ok(_) if bytes.len() < TXID_SIZE => Err(Status::InvalidArgs),
            target => target,
        };
        let channel = match channel {
            Ok(channel) => channel,
            Err(status) => {
                self.discard_moved_handles(&dispositions);
                return Err(status);
            }
        };
        let msg = self.build_message(&channel, bytes, &mut dispositions)?;
        let (txid, reply) = channel.begin_call(self.koid(), msg)?;
        trace!(koid = channel.koid(), txid, "call issued");

        let outcome = match self.kernel().deadline_instant(deadline) {
            None => reply.await,
            Some(at) => match tokio::time::timeout_at(at, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    channel.cancel_call(txid);
                    return Err(Status::TimedOut);
                }
            },
        };
        let msg = outcome.map_err(|_| Status::Canceled)??;
        let msg = self.accept_message(msg);
        Ok(ChannelMessage {
            bytes: msg.bytes,
            handles: msg.handles.iter().map(|info| info.handle).collect(),
        })
    }

    fn write_target(
        &self,
        handle: HandleValue,
        bytes: &[u8],
        num_handles: usize,
    ) -> KernelResult<Rc<ChannelDispatcher>> {
        if num_handles > CHANNEL_MAX_MSG_HANDLES as usize {
            return Err(Status::OutOfRange);
        }
        let channel = self
            .handle_table()
            .get_dispatcher_with_rights::<ChannelDispatcher>(handle, rights::WRITE)?;
        if bytes.len() > CHANNEL_MAX_MSG_BYTES as usize {
            return Err(Status::OutOfRange);
        }
        Ok(channel)
    }

    fn discard_moved_handles(&self, dispositions: &[HandleDisposition]) {
        let table = self.handle_table();
        for disposition in dispositions.iter().filter(|d| d.operation == HandleOp::Move) {
            if let Ok(owner) = table.remove_handle(disposition.handle) {
                drop(owner);
            }
        }
    }

    /// Collects the handles for a message, processing every entry and
    /// latching the first failure.
    fn build_message(
        &self,
        channel: &Rc<ChannelDispatcher>,
        bytes: &[u8],
        dispositions: &mut [HandleDisposition],
    ) -> KernelResult<MessagePacket> {
        let mut owners = Vec::with_capacity(dispositions.len());
        let mut first_error = None;
        for disposition in dispositions.iter_mut() {
            let taken = self.take_handle(channel, disposition);
            disposition.result = status_of(&taken);
            match taken {
                Ok(owner) => owners.push(owner),
                Err(status) => {
                    first_error.get_or_insert(status);
                }
            }
        }
        if let Some(status) = first_error {
            debug!(koid = channel.koid(), %status, "handle transfer rejected");
            drop(owners);
            return Err(status);
        }
        MessagePacket::create(bytes.to_vec(), owners)
    }

    fn take_handle(
        &self,
        channel: &Rc<ChannelDispatcher>,
        disposition: &HandleDisposition,
    ) -> KernelResult<HandleOwner> {
        let table = self.handle_table();
        let handle = table.get_handle_locked(disposition.handle)?;
        let checked = check_transfer(channel, &handle, disposition);
        match disposition.operation {
            HandleOp::Move => {
                let owner = table.remove_handle_locked(&handle).ok_or(Status::BadHandle)?;
                let rights = checked?;
                if rights == owner.rights() {
                    Ok(owner)
                } else {
                    Handle::dup(&owner, rights, self.arena())
                }
            }
            HandleOp::Duplicate => Handle::dup(&handle, checked?, self.arena()),
        }
    }

    fn accept_message(&self, msg: MessagePacket) -> ChannelMessageEtc {
        let table = self.handle_table();
        let (bytes, owners) = msg.into_parts();
        let handles = owners
            .into_iter()
            .map(|owner| {
                let obj_type = owner.obj_type();
                let rights = owner.rights();
                HandleInfo { handle: table.add_handle(owner), obj_type, rights }
            })
            .collect();
        ChannelMessageEtc { bytes, handles }
    }

    // Jobs and processes

    pub fn sys_job_create(&self, parent: HandleValue, options: u32) -> KernelResult<HandleValue> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let parent = self
            .handle_table()
            .get_dispatcher_with_rights::<JobDispatcher>(parent, rights::MANAGE_JOB)?;
        let (job, rights) = JobDispatcher::create(&parent, "")?;
        let owner = Handle::make(job, rights, self.arena())?;
        Ok(self.handle_table().add_handle(owner))
    }

    pub fn sys_process_create(&self, job: HandleValue, name: &str, options: u32) -> KernelResult<HandleValue> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let job = self
            .handle_table()
            .get_dispatcher_with_rights::<JobDispatcher>(job, rights::MANAGE_PROCESS)?;
        let instance = self.kernel().new_instance(name);
        let (process, rights) = ProcessDispatcher::create(&job, name, instance, self.arena())?;
        let owner = Handle::make(process, rights, self.arena())?;
        Ok(self.handle_table().add_handle(owner))
    }

    /// Starts `process` at `entry`, moving `arg1` into its table.
    ///
    /// `arg1` leaves the caller's table on every path; if the start fails it
    /// is closed.
    pub fn sys_process_start(
        &self,
        process: HandleValue,
        entry: &str,
        arg1: HandleValue,
        arg2: u64,
    ) -> KernelResult<()> {
        let table = self.handle_table();
        let arg = match arg1 {
            HANDLE_INVALID => None,
            value => Some(table.remove_handle(value)?),
        };
        let process = table.get_dispatcher_with_rights::<ProcessDispatcher>(process, rights::WRITE)?;
        if matches!(&arg, Some(owner) if !owner.has_rights(rights::TRANSFER)) {
            return Err(Status::AccessDenied);
        }

        let arg_value = match arg {
            Some(owner) => process.handle_table().add_handle(owner),
            None => HANDLE_INVALID,
        };
        if let Err(status) = process.start(self.kernel(), entry, arg_value, arg2) {
            if arg_value != HANDLE_INVALID {
                if let Ok(owner) = process.handle_table().remove_handle(arg_value) {
                    drop(owner);
                }
            }
            return Err(status);
        }
        Ok(())
    }

    /// Ends the calling process.
    pub fn sys_process_exit(&self, retcode: i64) {
        self.process().exit(retcode);
    }

    pub fn sys_task_kill(&self, handle: HandleValue) -> KernelResult<()> {
        let object = self.handle_table().get_object_with_rights(handle, rights::DESTROY)?;
        match object {
            KernelObject::Process(process) => process.kill(TASK_RETCODE_SYSCALL_KILL),
            KernelObject::Job(job) => job.kill(),
            _ => return Err(Status::WrongType),
        }
        Ok(())
    }

    // Ports

    pub fn sys_port_create(&self, options: u32) -> KernelResult<HandleValue> {
        if options != 0 {
            return Err(Status::InvalidArgs);
        }
        let (port, rights) = PortDispatcher::create();
        let owner = Handle::make(port, rights, self.arena())?;
        Ok(self.handle_table().add_handle(owner))
    }

    /// Queues a user packet. Signal packets are reserved for the kernel.
    pub fn sys_port_queue(&self, port: HandleValue, packet: &PortPacket) -> KernelResult<()> {
        let port = self
            .handle_table()
            .get_dispatcher_with_rights::<PortDispatcher>(port, rights::WRITE)?;
        if !matches!(packet.payload, PacketPayload::User(_)) {
            return Err(Status::InvalidArgs);
        }
        port.queue(*packet);
        Ok(())
    }

    /// Returns the oldest packet, waiting for one until `deadline`.
    pub async fn sys_port_wait(&self, port: HandleValue, deadline: Time) -> KernelResult<PortPacket> {
        let port = self
            .handle_table()
            .get_dispatcher_with_rights::<PortDispatcher>(port, rights::READ)?;
        let deadline = self.kernel().deadline_instant(deadline);
        loop {
            if let Some(packet) = port.dequeue() {
                return Ok(packet);
            }
            port.base()
                .wait_until(|s| s & signals::PORT_READABLE != 0, deadline)
                .await?;
        }
    }

    // Time

    pub fn sys_clock_get_monotonic(&self) -> Time {
        self.kernel().clock_monotonic()
    }
}

/// Validates one disposition against the handle it names, returning the
/// rights the transferred handle will carry.
fn check_transfer(
    channel: &Rc<ChannelDispatcher>,
    handle: &Handle,
    disposition: &HandleDisposition,
) -> KernelResult<Rights> {
    if handle.dispatcher().koid() == channel.koid() {
        return Err(Status::NotSupported);
    }
    if disposition.obj_type != ObjType::None && disposition.obj_type != handle.obj_type() {
        return Err(Status::WrongType);
    }
    if !handle.has_rights(rights::TRANSFER) {
        return Err(Status::AccessDenied);
    }
    if disposition.operation == HandleOp::Duplicate && !handle.has_rights(rights::DUPLICATE) {
        return Err(Status::AccessDenied);
    }
    rights::resolve(disposition.rights, handle.rights()).ok_or(Status::InvalidArgs)
}
