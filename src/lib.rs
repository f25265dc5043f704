//! # Summary
//!
//! This crate turns a user-supplied deterministic state machine into a
//! fault-tolerant, reconfigurable **replicated object**. A client interacts
//! with the object as if it were a single state machine; the library
//! distributes commands across a set of replica actors under one of four
//! interchangeable protocols (single, primary/backup, chain, quorum) and
//! lets the replica set be changed at runtime (add, remove, fork, relocate)
//! without disrupting service.
//!
//! # Usage
//!
//! Implement the [`StateMachine`] trait for your application, then use the
//! operations in [`object`] to spawn and drive a replica group:
//!
//! ```no_run
//! use std::time::Duration;
//! use replisome::machine::kvs::{Kvs, KvsCmd, KvsReply};
//! use replisome::net::{Caller, Network};
//! use replisome::replica::config::{ProtocolArgs, ProtocolKind};
//! use replisome::object;
//!
//! let net: Network<Kvs> = Network::new();
//! let mut caller = Caller::new(&net, "client");
//! let retry = Duration::from_millis(100);
//!
//! let conf = object::new(
//!     &net,
//!     &mut caller,
//!     ProtocolKind::Quorum,
//!     ProtocolArgs::quorum(Some(2), Some(2), false),
//!     (),
//!     &["a", "b", "c"],
//!     retry,
//! )
//! .unwrap();
//!
//! let put = KvsCmd::Put { key: "k".into(), value: "1".into() };
//! assert!(matches!(
//!     object::invoke(&net, &mut caller, &conf, put, retry),
//!     Ok(KvsReply::Stored)
//! ));
//! ```
//!
//! # Model
//!
//! Everything is a shared-nothing actor with a private mailbox: each replica
//! owns one state-machine instance, the current configuration, and the
//! protocol's private state, and handles one message at a time. All
//! coordination is message passing over the in-process [`net::Network`];
//! delivery is FIFO per pair of mailboxes and lossy only when a mailbox has
//! been killed or partitioned away.
//!
//! There is no persistent log, no durable storage, and no leader election:
//! recovery from crashes is bounded by the chosen protocol's redundancy, and
//! a configuration change is an explicit administrative act carried out by
//! [`object::reconfigure`].

pub mod fault;
pub mod machine;
pub mod net;
pub mod object;
pub mod protocols;
pub mod replica;

pub use crate::fault::Fault;
pub use crate::machine::traits::{CmdOutcome, StateMachine, StopReason};
pub use crate::net::{Caller, Network, Pid, Ref};
pub use crate::replica::config::{Config, ProtocolArgs, ProtocolKind, ReadSrc};
