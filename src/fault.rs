//! Error kinds surfaced by the library.
//!
//! Faults travel inside reply envelopes, so they are plain serializable
//! values rather than wrappers around source errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything that can go wrong between a client and a replica group.
///
/// Protocol handlers recover silently from late or duplicate peer traffic;
/// only the kinds below are ever surfaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum Fault {
    /// A response collection exhausted its timeout.
    #[error("timed out waiting for responses")]
    Timeout,

    /// The configuration lists no (live) replicas to route to.
    #[error("configuration lists no replicas")]
    NoReplicas,

    /// Read and write quorums do not overlap.
    #[error("read/write quorums do not overlap: r {r} + w {w} <= n {n}")]
    BadQuorum { r: usize, w: usize, n: usize },

    /// The state machine does not recognise the command.
    #[error("state machine does not recognise the command")]
    UnknownCommand,

    /// The replica does not hold the configuration the message was routed
    /// under. Refresh the configuration and retry.
    #[error("replica does not hold the addressed configuration")]
    NotInConfiguration,

    /// The destination replica has stopped or crashed.
    #[error("replica is stopped")]
    ReplicaStopped,
}
