pub mod context;
pub mod core;
pub mod syscalls;


pub use self::context::ProcessContext;
pub use self::core::Kernel;
pub use self::syscalls::{ChannelMessage, ChannelMessageEtc, InfoTopic, ObjectInfo, ProcessInfo};
