//! The user-facing state-machine contract, the per-replica serial wrapper
//! that owns an instance of it, and the in-tree reference machines.

pub mod echo;
pub mod kvs;
pub mod traits;
pub mod wrapper;

pub use traits::{CmdOutcome, StateMachine, StopReason};
pub use wrapper::Wrapper;
