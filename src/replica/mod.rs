//! The replica process model shared by every protocol: the configuration
//! value, the message envelopes, the protocol callback surface, and the
//! kernel actor that drives them.

pub mod config;
pub mod kernel;
pub mod message;
pub mod protocol;

pub use config::{Config, ProtocolArgs, ProtocolKind, ReadSrc};
pub use kernel::{Replica, Seed};
