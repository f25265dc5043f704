//! Quorum replication.
//!
//! Any replica may coordinate a command: it gathers `r - 1` (reads) or
//! `w - 1` (writes) peer acknowledgements on top of its own execution,
//! reconciling results by each peer's update count so the client sees the
//! freshest value any quorum member held. Writes reaching a write quorum
//! stay visible to every read quorum by the `r + w > n` overlap condition
//! enforced when the configuration is built.
//!
//! Peers execute reads as shadow executions (side effects suppressed) and
//! may repeat them on retransmission; writes are idempotent per ref: the
//! acknowledgement is cached and the update count is never bumped twice
//! for the same ref.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::machine::traits::StateMachine;
use crate::machine::wrapper::outcome_to_reply;
use crate::net::registry::Pid;
use crate::net::rpc::Ref;
use crate::replica::config::{Config, ProtocolKind};
use crate::replica::message::{Access, Body, CmdReply, Envelope, PeerMsg, Request};
use crate::replica::protocol::{Directive, ReplicaCtx, ReplyCache, Replication};

/// How long a coordinator waits for a quorum before answering the client
/// with a timeout and retiring the pending op.
const OP_TIMEOUT: Duration = Duration::from_secs(2);

fn now() -> Instant {
    Instant::now()
}

/// Coordinator-side record of a command still gathering its quorum.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub(crate) struct PendingOp<S: StateMachine> {
    client: Pid,
    access: Access,
    cmd: S::Command,
    /// Acknowledgements still needed for the quorum.
    rem_responses: usize,
    /// Peers that have not answered at all; the record is dropped when
    /// this reaches zero.
    rem_replicas: usize,
    /// Greatest update count seen so far, and the result that came with
    /// it. Ties keep the earlier result.
    max_count: u64,
    max_result: Option<CmdReply<S>>,
    /// The client has been answered; the record only lingers to absorb
    /// the remaining acknowledgements.
    done: bool,
    #[serde(skip, default = "now")]
    born: Instant,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct Quorum<S: StateMachine> {
    /// Mutations applied here, for version reconciliation.
    pub(crate) updates_count: u64,
    /// Pending ops this replica is coordinating, keyed by the client ref.
    pub(crate) unstable: HashMap<Ref, PendingOp<S>>,
    /// Peer-side memory of acknowledged writes: `(count, result)` per
    /// ref, so duplicate writes are answered without re-applying.
    write_acks: ReplyCache<(u64, Option<CmdReply<S>>)>,
    /// Coordinator-side memory of completed client refs.
    replies: ReplyCache<Option<CmdReply<S>>>,
}

impl<S: StateMachine> Quorum<S> {
    fn coordinate(
        &mut self,
        cx: &mut ReplicaCtx<'_, S>,
        tag: Ref,
        client: Pid,
        access: Access,
        cmd: S::Command,
    ) {
        if let Some(cached) = self.replies.get(&tag) {
            if let Some(reply) = cached.clone() {
                cx.reply_cmd(tag, client, reply);
            }
            return;
        }
        if self.unstable.contains_key(&tag) {
            // Retransmission of an op still gathering its quorum.
            return;
        }

        let qsize = match access {
            Access::Read => cx.conf.read_quorum(),
            Access::Write => cx.conf.write_quorum(),
        };

        if qsize <= 1 {
            // Fast path: no peers involved, no pending record.
            if access == Access::Write {
                self.updates_count += 1;
            }
            let out = cx.sm.do_cmd(&cmd, true);
            self.replies.insert(tag, outcome_to_reply::<S>(out.clone()));
            cx.reply_outcome(tag, client, out);
            return;
        }

        let others: Vec<Pid> = cx
            .conf
            .replicas
            .iter()
            .copied()
            .filter(|&p| p != cx.me)
            .collect();
        self.unstable.insert(
            tag,
            PendingOp {
                client,
                access,
                cmd: cmd.clone(),
                rem_responses: qsize - 1,
                rem_replicas: others.len(),
                max_count: 0,
                max_result: None,
                done: false,
                born: Instant::now(),
            },
        );

        let version = cx.version();
        for peer in others {
            let delivered = cx.send_peer(
                peer,
                PeerMsg::QuorumExec {
                    version,
                    tag,
                    access,
                    cmd: cmd.clone(),
                },
            );
            if !delivered {
                self.handle_failure(cx.me, cx.conf, peer);
            }
        }
    }

    /// Peer side: execute on behalf of a coordinator and acknowledge with
    /// the local update count.
    fn execute_for(
        &mut self,
        cx: &mut ReplicaCtx<'_, S>,
        coord: Pid,
        tag: Ref,
        access: Access,
        cmd: S::Command,
    ) {
        let version = cx.version();
        let (count, result) = match access {
            Access::Read => {
                // Shadow execution: compute, suppress side effects. Safe
                // to repeat on retransmission.
                let out = cx.sm.do_cmd(&cmd, false);
                (self.updates_count, outcome_to_reply::<S>(out))
            }
            Access::Write => {
                if let Some((count, result)) = self.write_acks.get(&tag) {
                    (*count, result.clone())
                } else {
                    self.updates_count += 1;
                    let out = cx.sm.do_cmd(&cmd, true);
                    let result = outcome_to_reply::<S>(out);
                    self.write_acks
                        .insert(tag, (self.updates_count, result.clone()));
                    (self.updates_count, result)
                }
            }
        };
        cx.send_peer(
            coord,
            PeerMsg::QuorumStable {
                version,
                tag,
                count,
                result,
            },
        );
    }

    /// Coordinator side: a peer acknowledged `tag`.
    fn stabilized(
        &mut self,
        cx: &mut ReplicaCtx<'_, S>,
        tag: Ref,
        count: u64,
        result: Option<CmdReply<S>>,
    ) {
        let Some(op) = self.unstable.get_mut(&tag) else {
            debug!("coordinator {}: late quorum ack for {:?}", cx.me, tag);
            return;
        };

        if count > op.max_count {
            op.max_count = count;
            if let Some(result) = result {
                op.max_result = Some(result);
            }
        }
        op.rem_replicas = op.rem_replicas.saturating_sub(1);
        let settled = op.rem_replicas == 0;

        let mut finished = false;
        if !op.done && op.rem_responses > 0 {
            op.rem_responses -= 1;
            if op.rem_responses == 0 {
                op.done = true;
                finished = true;
            }
        }

        if finished {
            let client = op.client;
            let access = op.access;
            let cmd = op.cmd.clone();
            let max_count = op.max_count;
            let max_result = op.max_result.clone();

            // Quorum reached: execute locally with effects enabled, then
            // answer with whichever result carries the greater count
            // (the read-repair-by-version rule).
            let my_count = match access {
                Access::Write => {
                    self.updates_count += 1;
                    self.updates_count
                }
                Access::Read => self.updates_count + 1,
            };
            let my_result = outcome_to_reply::<S>(cx.sm.do_cmd(&cmd, true));
            let winner = if my_count > max_count {
                my_result
            } else {
                max_result.or(my_result)
            };
            if let Some(ref reply) = winner {
                cx.reply_cmd(tag, client, reply.clone());
            }
            self.replies.insert(tag, winner);
        }

        if settled {
            self.unstable.remove(&tag);
        }
    }

    /// Retire pending ops whose quorum never arrived. Ops that already
    /// answered the client are dropped silently.
    fn expire(&mut self, cx: &mut ReplicaCtx<'_, S>) {
        let overdue: Vec<(Ref, Pid, bool)> = self
            .unstable
            .iter()
            .filter(|(_, op)| op.born.elapsed() >= OP_TIMEOUT)
            .map(|(&tag, op)| (tag, op.client, op.done))
            .collect();
        for (tag, client, done) in overdue {
            self.unstable.remove(&tag);
            if !done {
                debug!("coordinator {}: quorum op {:?} timed out", cx.me, tag);
                cx.reply_cmd(tag, client, Err(crate::fault::Fault::Timeout));
            }
        }
    }
}

impl<S: StateMachine> Replication<S> for Quorum<S> {
    fn kind() -> ProtocolKind {
        ProtocolKind::Quorum
    }

    fn init_replica(_me: Pid, _conf: &Config) -> Self {
        Quorum {
            updates_count: 0,
            unstable: HashMap::new(),
            write_acks: ReplyCache::default(),
            replies: ReplyCache::default(),
        }
    }

    /// Quorum sizes and the peer set are derived from the current
    /// configuration; the pending table and update count carry over.
    fn update_state(&mut self, _me: Pid, _conf: &Config) {}

    fn handle_msg(&mut self, cx: &mut ReplicaCtx<'_, S>, env: Envelope<S>) -> Directive<S> {
        let Envelope { tag, from, body } = env;
        match body {
            Body::Req(Request::QuorumCmd { access, cmd, .. }) => {
                self.coordinate(cx, tag, from, access, cmd);
                Directive::Consumed
            }
            Body::Req(Request::Peer(PeerMsg::QuorumExec {
                tag, access, cmd, ..
            })) => {
                self.execute_for(cx, from, tag, access, cmd);
                Directive::Consumed
            }
            Body::Req(Request::Peer(PeerMsg::QuorumStable {
                tag, count, result, ..
            })) => {
                self.stabilized(cx, tag, count, result);
                Directive::Consumed
            }
            body => Directive::NoMatch(Envelope { tag, from, body }),
        }
    }

    fn on_tick(&mut self, cx: &mut ReplicaCtx<'_, S>) {
        self.expire(cx);
    }

    fn export(&self) -> Vec<u8> {
        bincode::serialize(self).expect("quorum state serialization should not fail")
    }

    fn import(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
