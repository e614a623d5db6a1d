//!
//! Channel endpoints: a peered, ordered queue of [`MessagePacket`]s with
//! call/response correlation.
//!
//! Each endpoint owns the queue of messages written *to* it by its peer.
//! Messages whose transaction id lies in the kernel-generated range may be
//! handed straight to a matching call waiter instead of being queued.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{KernelResult, ReadError, Status};
use crate::object::dispatcher::{Dispatcher, DispatcherBase, KernelObject};
use crate::object::handle::KernelHandle;
use crate::object::message_packet::{MessagePacket, TXID_SIZE};
use crate::rights;
use crate::types::{signals, Koid, ObjType, Rights, Txid, KOID_INVALID};

/// Transaction ids at or above this value are allocated by `channel_call`.
pub const MIN_KERNEL_GENERATED_TXID: Txid = 0x8000_0000;

pub fn is_kernel_generated_txid(txid: Txid) -> bool {
    txid >= MIN_KERNEL_GENERATED_TXID
}

pub(crate) type CallReply = KernelResult<MessagePacket>;

struct MessageWaiter {
    txid: Txid,
    reply: oneshot::Sender<CallReply>,
}

#[derive(Default)]
struct ChannelState {
    messages: VecDeque<MessagePacket>,
    waiters: Vec<MessageWaiter>,
    max_message_count: usize,
    next_txid: Txid,
    peer_has_closed: bool,
}

impl ChannelState {
    fn allocate_txid(&mut self) -> Txid {
        loop {
            let txid = MIN_KERNEL_GENERATED_TXID | (self.next_txid & !MIN_KERNEL_GENERATED_TXID);
            self.next_txid = self.next_txid.wrapping_add(1);
            if !self.waiters.iter().any(|waiter| waiter.txid == txid) {
                return txid;
            }
        }
    }
}

pub struct ChannelDispatcher {
    base: DispatcherBase,
    peer: RefCell<Option<Weak<ChannelDispatcher>>>,
    peer_koid: Cell<Koid>,
    owner: Cell<Koid>,
    state: RefCell<ChannelState>,
}

impl ChannelDispatcher {
    /// Creates a linked pair of endpoints, both kernel-owned.
    pub fn create() -> (KernelHandle<Self>, KernelHandle<Self>, Rights) {
        let end0 = Rc::new(Self::new());
        let end1 = Rc::new(Self::new());
        end0.init_peer(&end1);
        end1.init_peer(&end0);
        debug!(koid0 = end0.koid(), koid1 = end1.koid(), "channel created");
        (KernelHandle::new(end0), KernelHandle::new(end1), Self::default_rights())
    }

    fn new() -> Self {
        ChannelDispatcher {
            base: DispatcherBase::new(signals::CHANNEL_WRITABLE),
            peer: RefCell::new(None),
            peer_koid: Cell::new(KOID_INVALID),
            owner: Cell::new(KOID_INVALID),
            state: RefCell::new(ChannelState::default()),
        }
    }

    fn init_peer(&self, peer: &Rc<ChannelDispatcher>) {
        let mut link = self.peer.borrow_mut();
        assert!(link.is_none(), "channel peer linked twice");
        *link = Some(Rc::downgrade(peer));
        self.peer_koid.set(peer.koid());
    }

    pub fn peer(&self) -> Option<Rc<ChannelDispatcher>> {
        self.peer.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn peer_koid(&self) -> Koid {
        self.peer_koid.get()
    }

    /// Koid of the process whose table holds this endpoint, or `KOID_INVALID`.
    pub fn owner(&self) -> Koid {
        self.owner.get()
    }

    /// Messages waiting to be read from this endpoint.
    pub fn message_count(&self) -> usize {
        self.state.borrow().messages.len()
    }

    pub fn max_message_count(&self) -> usize {
        self.state.borrow().max_message_count
    }

    /// Writes to the peer. `owner` is the writing process's koid, or
    /// `KOID_INVALID` when the kernel itself writes.
    pub fn write(&self, owner: Koid, msg: MessagePacket) -> KernelResult<()> {
        if owner != self.owner.get() {
            return Err(Status::BadHandle);
        }
        let peer = self.peer().ok_or(Status::PeerClosed)?;

        if let Some(msg) = peer.try_write_to_message_waiter(msg) {
            peer.write_self(msg);
        }
        Ok(())
    }

    fn write_self(&self, msg: MessagePacket) {
        trace!(koid = self.koid(), bytes = msg.data_size(), handles = msg.num_handles(), "message queued");
        {
            let mut state = self.state.borrow_mut();
            state.messages.push_back(msg);
            let size = state.messages.len();
            if size > state.max_message_count {
                state.max_message_count = size;
            }
        }
        self.base.raise_signals(signals::CHANNEL_READABLE);
    }

    /// Hands `msg` to a call waiter expecting its txid. Gives it back when
    /// no waiter takes it.
    fn try_write_to_message_waiter(&self, msg: MessagePacket) -> Option<MessagePacket> {
        let txid = msg.txid();
        if !is_kernel_generated_txid(txid) {
            return Some(msg);
        }

        let waiter = {
            let mut state = self.state.borrow_mut();
            match state.waiters.iter().position(|waiter| waiter.txid == txid) {
                Some(index) => state.waiters.swap_remove(index),
                None => return Some(msg),
            }
        };
        trace!(koid = self.koid(), txid, "reply delivered to waiter");
        match waiter.reply.send(Ok(msg)) {
            Ok(()) => None,
            // The caller stopped waiting; queue the reply like any other message.
            Err(reply) => reply.ok(),
        }
    }

    /// Reads the message at the head of the queue.
    ///
    /// If the message exceeds `max_bytes` or `max_handles` the read fails with
    /// `BUFFER_TOO_SMALL` and the message stays queued, unless `may_discard`
    /// is set, in which case it is dropped.
    pub fn read(
        &self,
        owner: Koid,
        max_bytes: u32,
        max_handles: u32,
        may_discard: bool,
    ) -> Result<MessagePacket, ReadError> {
        if owner != self.owner.get() {
            return Err(Status::BadHandle.into());
        }

        let (popped, actual_bytes, actual_handles, now_empty) = {
            let mut state = self.state.borrow_mut();
            let (actual_bytes, actual_handles) = match state.messages.front() {
                Some(front) => (front.data_size(), front.num_handles()),
                None if state.peer_has_closed => return Err(Status::PeerClosed.into()),
                None => return Err(Status::ShouldWait.into()),
            };
            let too_small = actual_bytes > max_bytes || actual_handles > max_handles;
            if too_small && !may_discard {
                return Err(ReadError { status: Status::BufferTooSmall, actual_bytes, actual_handles });
            }
            let popped = state.messages.pop_front().map(|msg| (msg, too_small));
            (popped, actual_bytes, actual_handles, state.messages.is_empty())
        };

        if now_empty {
            self.base.clear_signals(signals::CHANNEL_READABLE);
        }

        match popped {
            Some((msg, false)) => Ok(msg),
            Some((discarded, true)) => {
                debug!(koid = self.koid(), actual_bytes, "discarding oversized message");
                drop(discarded);
                Err(ReadError { status: Status::BufferTooSmall, actual_bytes, actual_handles })
            }
            None => Err(Status::ShouldWait.into()),
        }
    }

    /// Stamps a fresh kernel txid into `msg`, registers a waiter for the
    /// reply on this endpoint and writes the request to the peer.
    pub(crate) fn begin_call(
        &self,
        owner: Koid,
        mut msg: MessagePacket,
    ) -> KernelResult<(Txid, oneshot::Receiver<CallReply>)> {
        if (msg.data_size() as usize) < TXID_SIZE {
            return Err(Status::InvalidArgs);
        }

        let (reply, receiver) = oneshot::channel();
        let txid = {
            let mut state = self.state.borrow_mut();
            let txid = state.allocate_txid();
            state.waiters.push(MessageWaiter { txid, reply });
            txid
        };
        msg.set_txid(txid);

        if let Err(status) = self.write(owner, msg) {
            self.cancel_call(txid);
            return Err(status);
        }
        Ok((txid, receiver))
    }

    /// Withdraws a call waiter, for calls that time out.
    pub(crate) fn cancel_call(&self, txid: Txid) {
        let removed = {
            let mut state = self.state.borrow_mut();
            state
                .waiters
                .iter()
                .position(|waiter| waiter.txid == txid)
                .map(|index| state.waiters.swap_remove(index))
        };
        drop(removed);
    }

    fn on_peer_zero_handles(&self) {
        self.peer.borrow_mut().take();
        let waiters = {
            let mut state = self.state.borrow_mut();
            state.peer_has_closed = true;
            std::mem::take(&mut state.waiters)
        };
        self.base
            .update_signals(signals::CHANNEL_WRITABLE, signals::CHANNEL_PEER_CLOSED);
        for waiter in waiters {
            let _ = waiter.reply.send(Err(Status::PeerClosed));
        }
    }
}

impl Dispatcher for ChannelDispatcher {
    fn base(&self) -> &DispatcherBase {
        &self.base
    }

    fn obj_type(&self) -> ObjType {
        ObjType::Channel
    }

    fn related_koid(&self) -> Koid {
        self.peer_koid.get()
    }

    fn set_owner(&self, owner: Koid) {
        // Moving into a message passes KOID_INVALID; only the move into a
        // new table matters.
        if owner == KOID_INVALID {
            return;
        }
        self.owner.set(owner);
    }

    fn on_zero_handles(&self) {
        let peer = self.peer.borrow_mut().take().and_then(|peer| peer.upgrade());
        let (messages, waiters) = {
            let mut state = self.state.borrow_mut();
            (std::mem::take(&mut state.messages), std::mem::take(&mut state.waiters))
        };
        debug!(koid = self.koid(), discarded = messages.len(), "channel endpoint closed");
        drop(waiters);
        drop(messages);

        if let Some(peer) = peer {
            peer.on_peer_zero_handles();
        }
    }

    fn default_rights() -> Rights {
        rights::defaults::CHANNEL
    }

    fn downcast(object: &KernelObject) -> Option<Rc<Self>> {
        object.as_channel().cloned()
    }

    fn into_object(self: Rc<Self>) -> KernelObject {
        KernelObject::Channel(self)
    }
}
