#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(deprecated)]

//!
//! Capsule is a user-space capability kernel.
//!
//! It models kernel objects (channels, jobs, processes and ports) that are
//! only reachable through handles: unforgeable, per-process references that
//! carry a rights mask. Processes are cooperative tasks on a single-threaded
//! tokio runtime and talk to the kernel exclusively through the `sys_*`
//! entry points on [`ProcessContext`].

// Scalar aliases, constants, signal bits and syscall records.
pub mod types;

// Rights bits and the subset algebra used by duplicate and transfer.
pub mod rights;

// Status codes.
pub mod error;

pub mod koid;

pub mod config;

// Dispatchers, handles, the arena and per-process handle tables.
pub mod object;

// The kernel instance and its syscall surface.
pub mod kernel;

pub mod userboot;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use config::KernelConfig;
pub use error::{KernelResult, ReadError, Status};
pub use kernel::{Kernel, ProcessContext};
