//! Messaging primitives: the in-process mailbox registry and the
//! cast/call/collect request layer built on top of it.

pub mod registry;
pub mod rpc;

pub use registry::{Network, Pid};
pub use rpc::{ipn, Caller, Gather, Ref};
