//! Ports: FIFO queues of packets, fed by user code and by signal observers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::OK;
use crate::object::dispatcher::{Dispatcher, DispatcherBase, KernelObject};
use crate::object::handle::KernelHandle;
use crate::rights;
use crate::types::{signals, ObjType, Rights, Signals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketPayload {
    /// Queued through `port_queue`.
    User([u64; 4]),
    /// Queued by a one-shot `object_wait_async` observer.
    SignalOne {
        trigger: Signals,
        observed: Signals,
        count: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPacket {
    pub key: u64,
    pub status: i32,
    pub payload: PacketPayload,
}

impl PortPacket {
    pub fn user(key: u64, data: [u64; 4]) -> Self {
        PortPacket { key, status: OK, payload: PacketPayload::User(data) }
    }

    pub fn signal_one(key: u64, trigger: Signals, observed: Signals) -> Self {
        PortPacket {
            key,
            status: OK,
            payload: PacketPayload::SignalOne { trigger, observed, count: 1 },
        }
    }
}

pub struct PortDispatcher {
    base: DispatcherBase,
    packets: RefCell<VecDeque<PortPacket>>,
}

impl PortDispatcher {
    pub fn create() -> (KernelHandle<Self>, Rights) {
        let port = Rc::new(PortDispatcher {
            base: DispatcherBase::new(signals::NONE),
            packets: RefCell::new(VecDeque::new()),
        });
        (KernelHandle::new(port), Self::default_rights())
    }

    pub fn queue(&self, packet: PortPacket) {
        trace!(koid = self.koid(), key = packet.key, "port packet queued");
        self.packets.borrow_mut().push_back(packet);
        self.base.raise_signals(signals::PORT_READABLE);
    }

    /// Pops the oldest packet, if any.
    pub fn dequeue(&self) -> Option<PortPacket> {
        let (packet, now_empty) = {
            let mut packets = self.packets.borrow_mut();
            let packet = packets.pop_front();
            (packet, packets.is_empty())
        };
        if now_empty {
            self.base.clear_signals(signals::PORT_READABLE);
        }
        packet
    }

    pub fn len(&self) -> usize {
        self.packets.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Dispatcher for PortDispatcher {
    fn base(&self) -> &DispatcherBase {
        &self.base
    }

    fn obj_type(&self) -> ObjType {
        ObjType::Port
    }

    fn default_rights() -> Rights {
        rights::defaults::PORT
    }

    fn downcast(object: &KernelObject) -> Option<Rc<Self>> {
        object.as_port().cloned()
    }

    fn into_object(self: Rc<Self>) -> KernelObject {
        KernelObject::Port(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_fifo_and_track_readable() {
        let port = PortDispatcher::create().0.release();
        assert!(port.is_empty());
        port.queue(PortPacket::user(1, [1, 0, 0, 0]));
        port.queue(PortPacket::signal_one(2, signals::OBJECT_READABLE, signals::OBJECT_READABLE));
        assert_eq!(port.base().signals(), signals::PORT_READABLE);

        assert_eq!(port.dequeue().map(|p| p.key), Some(1));
        let second = port.dequeue().expect("second packet");
        assert_eq!(
            second.payload,
            PacketPayload::SignalOne { trigger: signals::OBJECT_READABLE, observed: signals::OBJECT_READABLE, count: 1 }
        );
        assert_eq!(port.base().signals(), signals::NONE);
        assert!(port.dequeue().is_none());
    }

    #[test]
    fn packets_serialize_for_inspection() {
        let packet = PortPacket::user(9, [1, 2, 3, 4]);
        let json = serde_json::to_string(&packet).expect("serialize");
        let back: PortPacket = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, packet);
    }
}
