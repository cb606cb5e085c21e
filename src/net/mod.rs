//! Asynchronous network I/O
//!
//! A single-threaded select reactor plus the block-level contract it exposes
//! upward: connection handles, I/O buffers and completion events.

pub mod addr;
mod buffer;
mod conn;
mod fdset;
mod reactor;

pub use addr::resolve_target;
pub use buffer::{IoBuffer, IoOp};
pub use reactor::{
    ConnHandle, IoCallback, IoEvent, OpenFlags, Reactor, ReactorConfig, ReactorStats,
};
