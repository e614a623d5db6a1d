//! Kernel objects, handles and the tables that hold them.

pub mod arena;
pub mod channel;
pub mod dispatcher;
pub mod handle;
pub mod handle_table;
pub mod job;
pub mod message_packet;
pub mod port;
pub mod process;

pub use arena::HandleTableArena;
pub use channel::ChannelDispatcher;
pub use dispatcher::{Dispatcher, DispatcherBase, KernelObject};
pub use handle::{Handle, HandleOwner, KernelHandle};
pub use handle_table::HandleTable;
pub use job::{JobDispatcher, JobState};
pub use message_packet::MessagePacket;
pub use port::{PacketPayload, PortDispatcher, PortPacket};
pub use process::{
    LocalBoxFuture, NativeProgram, ProcessDispatcher, ProcessInstance, ProcessState, WasmBackend,
    WasmBackendFactory,
};
