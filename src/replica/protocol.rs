//! The protocol callback surface and its dispatch.
//!
//! Each replication protocol implements [`Replication`]; the kernel holds
//! the protocol's private state behind the [`ProtocolState`] tagged enum
//! and dispatches every callback through it. Protocol state is opaque to
//! the kernel: it is produced by `init_replica`, carried across
//! reconfigurations by `update_state`, and flattened by `export`.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::fault::Fault;
use crate::machine::traits::StateMachine;
use crate::machine::wrapper::{send_cmd_reply, Wrapper};
use crate::net::registry::{Network, Pid};
use crate::net::rpc::Ref;
use crate::protocols::chain::Chain;
use crate::protocols::primary_backup::PrimaryBackup;
use crate::protocols::quorum::Quorum;
use crate::protocols::single::Single;
use crate::replica::config::{Config, ProtocolKind};
use crate::replica::message::{Body, CmdReply, Envelope, PeerMsg, Reply, Request, Snapshot};

/// What a protocol handler did with a message.
pub enum Directive<S: StateMachine> {
    /// Handled; the kernel moves on.
    Consumed,
    /// Not protocol traffic; the kernel's built-in handlers take it.
    NoMatch(Envelope<S>),
}

/// Everything a protocol handler may touch while processing one message:
/// its own identity, the transport, the current configuration, and the
/// machine wrapper. Owned exclusively by the replica actor.
pub struct ReplicaCtx<'a, S: StateMachine> {
    pub me: Pid,
    pub net: &'a Network<S>,
    pub conf: &'a Config,
    pub sm: &'a mut Wrapper<S>,
}

impl<'a, S: StateMachine> ReplicaCtx<'a, S> {
    pub fn version(&self) -> u64 {
        self.conf.version
    }

    /// Fire a peer message under a fresh token. Returns whether the
    /// destination mailbox still exists, so callers can report the crash
    /// to their `handle_failure`.
    pub fn send_peer(&self, dst: Pid, msg: PeerMsg<S>) -> bool {
        self.net.send(
            dst,
            Envelope {
                tag: Ref::fresh(),
                from: self.me,
                body: Body::Req(Request::Peer(msg)),
            },
        )
    }

    pub fn reply(&self, tag: Ref, client: Pid, reply: Reply<S>) {
        self.net.send(
            client,
            Envelope {
                tag,
                from: self.me,
                body: Body::Reply(reply),
            },
        );
    }

    pub fn reply_cmd(&self, tag: Ref, client: Pid, reply: CmdReply<S>) {
        self.reply(tag, client, Reply::Cmd(reply));
    }

    /// Forward a command outcome to the client, observing `noreply`.
    pub fn reply_outcome(
        &self,
        tag: Ref,
        client: Pid,
        out: Result<Option<S::Response>, Fault>,
    ) {
        send_cmd_reply(self.net, self.me, tag, client, out);
    }
}

/// The callback set every replication protocol provides.
pub trait Replication<S: StateMachine>: Sized {
    fn kind() -> ProtocolKind;

    /// Fresh protocol state for a replica binding to `conf`.
    fn init_replica(me: Pid, conf: &Config) -> Self;

    /// Carry existing state into a new configuration.
    fn update_state(&mut self, me: Pid, conf: &Config);

    /// Handle one inbound message, or hand it back for the kernel's
    /// built-in handlers.
    fn handle_msg(&mut self, cx: &mut ReplicaCtx<'_, S>, env: Envelope<S>) -> Directive<S>;

    /// A peer's mailbox is gone. The default policy is to mask: keep the
    /// configuration and state unchanged and let timeouts or client
    /// retries absorb the loss until an administrative reconfiguration.
    fn handle_failure(&mut self, _me: Pid, _conf: &Config, _failed: Pid) {}

    /// Which control requests this protocol intercepts in `handle_msg`
    /// instead of leaving them to the kernel.
    fn overloads(_req: &Request<S>) -> bool {
        false
    }

    /// Periodic timer while the mailbox is idle.
    fn on_tick(&mut self, _cx: &mut ReplicaCtx<'_, S>) {}

    /// Flatten the protocol's private state (unstable tables, counters).
    fn export(&self) -> Vec<u8>;

    fn import(bytes: &[u8]) -> Result<Self, bincode::Error>;
}

/// Protocol state as the kernel holds it: a tagged variant per protocol,
/// plus `Unbound` for a replica that has not yet received its first
/// configuration (fresh spawn or fork).
pub enum ProtocolState<S: StateMachine> {
    Unbound,
    Single(Single),
    PrimaryBackup(PrimaryBackup<S>),
    Chain(Chain<S>),
    Quorum(Quorum<S>),
}

impl<S: StateMachine> ProtocolState<S> {
    pub fn init(kind: ProtocolKind, me: Pid, conf: &Config) -> Self {
        match kind {
            ProtocolKind::Single => {
                ProtocolState::Single(<Single as Replication<S>>::init_replica(me, conf))
            }
            ProtocolKind::PrimaryBackup => {
                ProtocolState::PrimaryBackup(PrimaryBackup::init_replica(me, conf))
            }
            ProtocolKind::Chain => ProtocolState::Chain(Chain::init_replica(me, conf)),
            ProtocolKind::Quorum => ProtocolState::Quorum(Quorum::init_replica(me, conf)),
        }
    }

    pub fn is_unbound(&self) -> bool {
        matches!(self, ProtocolState::Unbound)
    }

    pub fn update_state(&mut self, me: Pid, conf: &Config) {
        match self {
            ProtocolState::Unbound => {}
            ProtocolState::Single(p) => Replication::<S>::update_state(p, me, conf),
            ProtocolState::PrimaryBackup(p) => p.update_state(me, conf),
            ProtocolState::Chain(p) => p.update_state(me, conf),
            ProtocolState::Quorum(p) => p.update_state(me, conf),
        }
    }

    pub fn handle_msg(&mut self, cx: &mut ReplicaCtx<'_, S>, env: Envelope<S>) -> Directive<S> {
        match self {
            ProtocolState::Unbound => Directive::NoMatch(env),
            ProtocolState::Single(p) => p.handle_msg(cx, env),
            ProtocolState::PrimaryBackup(p) => p.handle_msg(cx, env),
            ProtocolState::Chain(p) => p.handle_msg(cx, env),
            ProtocolState::Quorum(p) => p.handle_msg(cx, env),
        }
    }

    pub fn handle_failure(&mut self, me: Pid, conf: &Config, failed: Pid) {
        match self {
            ProtocolState::Unbound => {}
            ProtocolState::Single(p) => Replication::<S>::handle_failure(p, me, conf, failed),
            ProtocolState::PrimaryBackup(p) => p.handle_failure(me, conf, failed),
            ProtocolState::Chain(p) => p.handle_failure(me, conf, failed),
            ProtocolState::Quorum(p) => p.handle_failure(me, conf, failed),
        }
    }

    pub fn overloads(&self, req: &Request<S>) -> bool {
        match self {
            ProtocolState::Unbound => false,
            ProtocolState::Single(_) => <Single as Replication<S>>::overloads(req),
            ProtocolState::PrimaryBackup(_) => PrimaryBackup::<S>::overloads(req),
            ProtocolState::Chain(_) => Chain::<S>::overloads(req),
            ProtocolState::Quorum(_) => Quorum::<S>::overloads(req),
        }
    }

    pub fn on_tick(&mut self, cx: &mut ReplicaCtx<'_, S>) {
        match self {
            ProtocolState::Unbound => {}
            ProtocolState::Single(p) => Replication::<S>::on_tick(p, cx),
            ProtocolState::PrimaryBackup(p) => p.on_tick(cx),
            ProtocolState::Chain(p) => p.on_tick(cx),
            ProtocolState::Quorum(p) => p.on_tick(cx),
        }
    }

    /// Flatten into a [`Snapshot`] half: the kind tag plus the state blob.
    pub fn export(&self) -> (Option<ProtocolKind>, Vec<u8>) {
        match self {
            ProtocolState::Unbound => (None, Vec::new()),
            ProtocolState::Single(p) => {
                (Some(ProtocolKind::Single), Replication::<S>::export(p))
            }
            ProtocolState::PrimaryBackup(p) => (Some(ProtocolKind::PrimaryBackup), p.export()),
            ProtocolState::Chain(p) => (Some(ProtocolKind::Chain), p.export()),
            ProtocolState::Quorum(p) => (Some(ProtocolKind::Quorum), p.export()),
        }
    }

    pub fn import(
        kind: Option<ProtocolKind>,
        bytes: &[u8],
    ) -> Result<Self, bincode::Error> {
        Ok(match kind {
            None => ProtocolState::Unbound,
            Some(ProtocolKind::Single) => {
                ProtocolState::Single(<Single as Replication<S>>::import(bytes)?)
            }
            Some(ProtocolKind::PrimaryBackup) => {
                ProtocolState::PrimaryBackup(PrimaryBackup::import(bytes)?)
            }
            Some(ProtocolKind::Chain) => ProtocolState::Chain(Chain::import(bytes)?),
            Some(ProtocolKind::Quorum) => ProtocolState::Quorum(Quorum::import(bytes)?),
        })
    }

    /// Build the full replica snapshot (machine + protocol state).
    pub fn snapshot(&self, sm: &Wrapper<S>, part: Option<&str>) -> Snapshot {
        let (kind, protocol) = self.export();
        let sm_bytes = match part {
            Some(tag) => sm.export_part(tag),
            None => sm.export(),
        };
        Snapshot {
            sm: sm_bytes,
            kind,
            protocol,
        }
    }
}

/// Bounded memory of recent replies keyed by request token.
///
/// Because `call` retransmits indefinitely, a replica must treat a
/// duplicate token as one logical request: the first completed reply is
/// cached here and retransmissions are answered from the cache instead of
/// re-running the command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyCache<T> {
    cap: usize,
    entries: HashMap<Ref, T>,
    order: VecDeque<Ref>,
}

impl<T> Default for ReplyCache<T> {
    fn default() -> Self {
        ReplyCache::new(1024)
    }
}

impl<T> ReplyCache<T> {
    pub fn new(cap: usize) -> Self {
        ReplyCache {
            cap: cap.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, tag: Ref, value: T) {
        if self.entries.insert(tag, value).is_none() {
            self.order.push_back(tag);
            if self.order.len() > self.cap {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    pub fn get(&self, tag: &Ref) -> Option<&T> {
        self.entries.get(tag)
    }

    pub fn contains(&self, tag: &Ref) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
