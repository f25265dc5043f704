//! Everything that travels between mailboxes.
//!
//! One envelope shape for all actors: `{tag, from, body}`, where the body
//! is either a request or a reply. Client commands and peer traffic carry
//! the configuration version they were issued under, so replicas can fence
//! stale traffic and park messages from the future.

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::fault::Fault;
use crate::machine::traits::{StateMachine, StopReason};
use crate::net::registry::Pid;
use crate::net::rpc::Ref;
use crate::replica::config::{Config, ProtocolKind};

/// What a client ultimately receives for a command: the machine's reply
/// verbatim, or a fault.
pub type CmdReply<S> = Result<<S as StateMachine>::Response, Fault>;

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Envelope<S: StateMachine> {
    pub tag: Ref,
    pub from: Pid,
    pub body: Body<S>,
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub enum Body<S: StateMachine> {
    Req(Request<S>),
    Reply(Reply<S>),
}

/// Quorum access class of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

/// Requests a replica accepts.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub enum Request<S: StateMachine> {
    /// A routed client command (single, primary/backup, chain).
    Cmd { version: u64, cmd: S::Command },

    /// A client command wrapped with its quorum access class; the
    /// receiving replica acts as coordinator.
    QuorumCmd {
        version: u64,
        access: Access,
        cmd: S::Command,
    },

    /// Protocol-internal peer traffic.
    Peer(PeerMsg<S>),

    /// Install a configuration (two-stage multicast from the admin side).
    Reconfigure(Config),

    GetConf,

    /// Serialize machine + protocol state.
    Export,

    /// Restore machine + protocol state from an exported snapshot.
    Import(Vec<u8>),

    /// Materialise a new replica on `node`, seeded from this one's state.
    /// `part` selects a partitioned export when set.
    Fork { node: String, part: Option<String> },

    Stop(StopReason),
}

/// Peer-to-peer protocol messages.
///
/// Every variant carries the sender's configuration version; receivers
/// drop lower versions silently and park higher ones.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub enum PeerMsg<S: StateMachine> {
    /// Primary → backup: apply command number `num`.
    Replicate {
        version: u64,
        num: u64,
        cmd: S::Command,
    },

    /// Backup → primary: command number `num` has been applied here.
    Stabilized { version: u64, num: u64 },

    /// Chain: command flowing from the head toward the tail, carrying its
    /// own reply address so in-flight commands survive reconfiguration.
    Down {
        version: u64,
        tag: Ref,
        client: Pid,
        cmd: S::Command,
    },

    /// Quorum coordinator → peer: execute and acknowledge.
    QuorumExec {
        version: u64,
        tag: Ref,
        access: Access,
        cmd: S::Command,
    },

    /// Quorum peer → coordinator: executed, with the peer's update count
    /// for version reconciliation. `result` is `None` when the machine
    /// produced no reply.
    QuorumStable {
        version: u64,
        tag: Ref,
        count: u64,
        result: Option<CmdReply<S>>,
    },
}

impl<S: StateMachine> Request<S> {
    /// The configuration version this request was issued under, when it
    /// carries one.
    pub fn version(&self) -> Option<u64> {
        match self {
            Request::Cmd { version, .. } | Request::QuorumCmd { version, .. } => Some(*version),
            Request::Peer(peer) => Some(peer.version()),
            _ => None,
        }
    }

    /// Whether this is a client-facing request (as opposed to peer or
    /// control traffic). Client requests get a fault reply when fenced;
    /// peer traffic is dropped silently.
    pub fn is_client(&self) -> bool {
        matches!(self, Request::Cmd { .. } | Request::QuorumCmd { .. })
    }
}

impl<S: StateMachine> PeerMsg<S> {
    pub fn version(&self) -> u64 {
        match self {
            PeerMsg::Replicate { version, .. }
            | PeerMsg::Stabilized { version, .. }
            | PeerMsg::Down { version, .. }
            | PeerMsg::QuorumExec { version, .. }
            | PeerMsg::QuorumStable { version, .. } => *version,
        }
    }
}

/// Replies a replica sends back.
#[derive(Derivative)]
#[derivative(
    Clone(bound = ""),
    Debug(bound = ""),
    PartialEq(bound = "S::Response: PartialEq")
)]
pub enum Reply<S: StateMachine> {
    /// The machine's answer to a command, verbatim, or a fault.
    Cmd(CmdReply<S>),
    Conf(Config),
    /// Acknowledgement of a reconfigure; carries the version now held.
    Reconfigured { version: u64 },
    Exported(Vec<u8>),
    Imported,
    Forked(Pid),
    Stopped,
}

/// Serialized replica state: the machine blob plus the protocol's
/// flattened private state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub sm: Vec<u8>,
    pub kind: Option<ProtocolKind>,
    pub protocol: Vec<u8>,
}

impl Snapshot {
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("snapshot serialization should not fail")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
