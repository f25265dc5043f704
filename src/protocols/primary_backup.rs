//! Primary/backup replication.
//!
//! The first replica in the configuration is the primary, the rest are
//! backups. Mutations are accepted only by the primary: it assigns a
//! monotonically increasing command number, replicates to every backup,
//! and applies locally, then answers the client, once all backups have
//! stabilized the command. Backups apply in arrival order, which is the
//! command-number order because delivery is FIFO per link.
//!
//! Non-mutating commands are executed wherever the configured `read_src`
//! routed them; reads served by a backup may trail the primary by the
//! in-flight window.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::machine::traits::StateMachine;
use crate::machine::wrapper::outcome_to_reply;
use crate::net::registry::Pid;
use crate::net::rpc::Ref;
use crate::replica::config::{Config, ProtocolKind};
use crate::replica::message::{Body, CmdReply, Envelope, PeerMsg, Request};
use crate::replica::protocol::{Directive, ReplicaCtx, ReplyCache, Replication};

/// A mutation waiting for the full backup set to stabilize it.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub(crate) struct PendingCmd<S: StateMachine> {
    /// Backups that have acknowledged this command number.
    acked: HashSet<Pid>,
    tag: Ref,
    client: Pid,
    cmd: S::Command,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct PrimaryBackup<S: StateMachine> {
    /// Primary-side table of unacknowledged mutations, ordered by command
    /// number so completion applies them in dispatch order.
    pub(crate) unstable: BTreeMap<u64, PendingCmd<S>>,
    /// Mutations fully applied here.
    pub(crate) stable_count: u64,
    /// Next command number to assign (primary) or expect (backup).
    pub(crate) next_cmd_num: u64,
    /// Completed refs, for answering client retransmissions.
    replies: ReplyCache<Option<CmdReply<S>>>,
}

impl<S: StateMachine> PrimaryBackup<S> {
    fn client_cmd(
        &mut self,
        cx: &mut ReplicaCtx<'_, S>,
        tag: Ref,
        client: Pid,
        version: u64,
        cmd: S::Command,
    ) {
        if !S::is_mutating(&cmd) {
            cx.sm.do_send(cx.net, cx.me, tag, client, &cmd, true);
            return;
        }

        let Some(primary) = cx.conf.head() else { return };
        if primary != cx.me {
            // Routed here by a stale view of the configuration; the
            // primary replies to the client directly.
            debug!("backup {} forwarding mutation to primary {}", cx.me, primary);
            cx.net.send(
                primary,
                Envelope {
                    tag,
                    from: client,
                    body: Body::Req(Request::Cmd { version, cmd }),
                },
            );
            return;
        }

        // Retransmissions: answer completed refs from the cache,
        // re-drive in-flight ones.
        if let Some(cached) = self.replies.get(&tag) {
            if let Some(reply) = cached.clone() {
                cx.reply_cmd(tag, client, reply);
            }
            return;
        }
        if let Some((&num, pending)) = self.unstable.iter().find(|(_, p)| p.tag == tag) {
            let cmd = pending.cmd.clone();
            self.replicate_to_backups(cx, num, &cmd);
            return;
        }

        let num = self.next_cmd_num;
        self.next_cmd_num += 1;

        if cx.conf.n() == 1 {
            // No backups: apply and answer synchronously.
            let out = cx.sm.do_cmd(&cmd, true);
            self.stable_count += 1;
            self.replies.insert(tag, outcome_to_reply::<S>(out.clone()));
            cx.reply_outcome(tag, client, out);
            return;
        }

        self.unstable.insert(
            num,
            PendingCmd {
                acked: HashSet::new(),
                tag,
                client,
                cmd: cmd.clone(),
            },
        );
        self.replicate_to_backups(cx, num, &cmd);
    }

    fn replicate_to_backups(&mut self, cx: &mut ReplicaCtx<'_, S>, num: u64, cmd: &S::Command) {
        let version = cx.version();
        let backups: Vec<Pid> = cx.conf.replicas[1..].to_vec();
        for backup in backups {
            let delivered = cx.send_peer(
                backup,
                PeerMsg::Replicate {
                    version,
                    num,
                    cmd: cmd.clone(),
                },
            );
            if !delivered {
                self.handle_failure(cx.me, cx.conf, backup);
            }
        }
    }

    /// Backup side: apply and acknowledge.
    fn replicate(&mut self, cx: &mut ReplicaCtx<'_, S>, primary: Pid, num: u64, cmd: S::Command) {
        let version = cx.version();
        if num < self.next_cmd_num {
            // Already applied (primary is re-driving): acknowledge again.
            cx.send_peer(primary, PeerMsg::Stabilized { version, num });
            return;
        }
        if num > self.next_cmd_num {
            debug!(
                "backup {} jumping from command {} to {}",
                cx.me, self.next_cmd_num, num
            );
        }
        let _ = cx.sm.do_cmd(&cmd, true);
        self.next_cmd_num = num + 1;
        self.stable_count = num + 1;
        cx.send_peer(primary, PeerMsg::Stabilized { version, num });
    }

    /// Primary side: a backup has applied command `num`.
    fn stabilized(&mut self, cx: &mut ReplicaCtx<'_, S>, backup: Pid, num: u64) {
        let Some(pending) = self.unstable.get_mut(&num) else {
            debug!("primary {}: late stabilize for command {}", cx.me, num);
            return;
        };
        pending.acked.insert(backup);
        self.complete_ready(cx);
    }

    /// Apply, answer, and retire every leading unstable command whose full
    /// current backup set has acknowledged it. Also run on tick so a
    /// shrinking reconfiguration releases commands that were waiting on
    /// removed backups.
    fn complete_ready(&mut self, cx: &mut ReplicaCtx<'_, S>) {
        let backups: Vec<Pid> = cx.conf.replicas[1..].to_vec();
        loop {
            let Some((&num, pending)) = self.unstable.iter().next() else {
                break;
            };
            if !backups.iter().all(|b| pending.acked.contains(b)) {
                break;
            }
            let Some(pending) = self.unstable.remove(&num) else {
                break;
            };
            let out = cx.sm.do_cmd(&pending.cmd, true);
            self.stable_count += 1;
            self.replies
                .insert(pending.tag, outcome_to_reply::<S>(out.clone()));
            cx.reply_outcome(pending.tag, pending.client, out);
        }
    }
}

impl<S: StateMachine> Replication<S> for PrimaryBackup<S> {
    fn kind() -> ProtocolKind {
        ProtocolKind::PrimaryBackup
    }

    fn init_replica(_me: Pid, _conf: &Config) -> Self {
        PrimaryBackup {
            unstable: BTreeMap::new(),
            stable_count: 0,
            next_cmd_num: 0,
            replies: ReplyCache::default(),
        }
    }

    /// Roles are derived from the replica order of the current
    /// configuration; the unstable table and counters carry over.
    fn update_state(&mut self, _me: Pid, _conf: &Config) {}

    fn handle_msg(&mut self, cx: &mut ReplicaCtx<'_, S>, env: Envelope<S>) -> Directive<S> {
        let Envelope { tag, from, body } = env;
        match body {
            Body::Req(Request::Cmd { version, cmd }) => {
                self.client_cmd(cx, tag, from, version, cmd);
                Directive::Consumed
            }
            Body::Req(Request::Peer(PeerMsg::Replicate { num, cmd, .. })) => {
                self.replicate(cx, from, num, cmd);
                Directive::Consumed
            }
            Body::Req(Request::Peer(PeerMsg::Stabilized { num, .. })) => {
                self.stabilized(cx, from, num);
                Directive::Consumed
            }
            body => Directive::NoMatch(Envelope { tag, from, body }),
        }
    }

    fn on_tick(&mut self, cx: &mut ReplicaCtx<'_, S>) {
        self.complete_ready(cx);
    }

    fn export(&self) -> Vec<u8> {
        bincode::serialize(self).expect("primary/backup state serialization should not fail")
    }

    fn import(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
