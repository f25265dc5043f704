//! Chain replication.
//!
//! Replicas form a totally ordered chain. Mutations enter at the head,
//! are applied by each replica in turn, and the tail answers the client.
//! Reads are served by the tail, or by any replica when the configuration
//! opts into sloppy reads. Commands in transit carry their own reply
//! address, so they complete even while the chain is being rewritten by a
//! reconfiguration.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::machine::traits::StateMachine;
use crate::machine::wrapper::outcome_to_reply;
use crate::net::registry::Pid;
use crate::net::rpc::{ipn, Ref};
use crate::replica::config::{Config, ProtocolKind};
use crate::replica::message::{Body, CmdReply, Envelope, PeerMsg, Request};
use crate::replica::protocol::{Directive, ReplicaCtx, ReplyCache, Replication};

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct Chain<S: StateMachine> {
    /// Position in the chain, rebuilt from the configuration on every
    /// reconfigure.
    index: usize,
    prev: Option<Pid>,
    next: Option<Pid>,
    /// Refs already applied here; the tail also remembers the reply it
    /// sent. A retransmission re-drives forwarding without re-applying.
    applied: ReplyCache<Option<CmdReply<S>>>,
}

impl<S: StateMachine> Chain<S> {
    fn rebuild_links(&mut self, me: Pid, conf: &Config) {
        let (index, prev, next) = ipn(me, &conf.replicas).unwrap_or((0, None, None));
        self.index = index;
        self.prev = prev;
        self.next = next;
    }

    fn is_head(&self) -> bool {
        self.prev.is_none()
    }

    fn is_tail(&self) -> bool {
        self.next.is_none()
    }

    fn client_cmd(
        &mut self,
        cx: &mut ReplicaCtx<'_, S>,
        tag: Ref,
        client: Pid,
        version: u64,
        cmd: S::Command,
    ) {
        if !S::is_mutating(&cmd) {
            if self.is_tail() || cx.conf.sloppy_reads() {
                cx.sm.do_send(cx.net, cx.me, tag, client, &cmd, true);
            } else if let Some(tail) = cx.conf.tail() {
                // Strict reads belong to the tail; preserve the client as
                // the reply address.
                cx.net.send(
                    tail,
                    Envelope {
                        tag,
                        from: client,
                        body: Body::Req(Request::Cmd { version, cmd }),
                    },
                );
            }
            return;
        }

        if !self.is_head() {
            if let Some(head) = cx.conf.head() {
                debug!("chain replica {} forwarding mutation to head {}", cx.me, head);
                cx.net.send(
                    head,
                    Envelope {
                        tag,
                        from: client,
                        body: Body::Req(Request::Cmd { version, cmd }),
                    },
                );
            }
            return;
        }

        self.accept(cx, tag, client, cmd);
    }

    /// Apply at this link and either forward down or, at the tail,
    /// answer the client.
    fn accept(&mut self, cx: &mut ReplicaCtx<'_, S>, tag: Ref, client: Pid, cmd: S::Command) {
        if let Some(done) = self.applied.get(&tag) {
            // Retransmission: never re-apply. The tail answers from its
            // memory; inner links push the command onward again in case
            // the first pass was lost downstream.
            if self.is_tail() {
                if let Some(reply) = done.clone() {
                    cx.reply_cmd(tag, client, reply);
                }
            } else {
                self.forward(cx, tag, client, cmd);
            }
            return;
        }

        let out = cx.sm.do_cmd(&cmd, true);
        if self.is_tail() {
            let reply = outcome_to_reply::<S>(out);
            if let Some(ref r) = reply {
                cx.reply_cmd(tag, client, r.clone());
            }
            self.applied.insert(tag, reply);
        } else {
            self.applied.insert(tag, None);
            self.forward(cx, tag, client, cmd);
        }
    }

    fn forward(&mut self, cx: &mut ReplicaCtx<'_, S>, tag: Ref, client: Pid, cmd: S::Command) {
        let Some(next) = self.next else { return };
        let delivered = cx.send_peer(
            next,
            PeerMsg::Down {
                version: cx.version(),
                tag,
                client,
                cmd,
            },
        );
        if !delivered {
            self.handle_failure(cx.me, cx.conf, next);
        }
    }
}

impl<S: StateMachine> Replication<S> for Chain<S> {
    fn kind() -> ProtocolKind {
        ProtocolKind::Chain
    }

    fn init_replica(me: Pid, conf: &Config) -> Self {
        let mut chain = Chain {
            index: 0,
            prev: None,
            next: None,
            applied: ReplyCache::default(),
        };
        chain.rebuild_links(me, conf);
        chain
    }

    fn update_state(&mut self, me: Pid, conf: &Config) {
        self.rebuild_links(me, conf);
    }

    fn handle_msg(&mut self, cx: &mut ReplicaCtx<'_, S>, env: Envelope<S>) -> Directive<S> {
        let Envelope { tag, from, body } = env;
        match body {
            Body::Req(Request::Cmd { version, cmd }) => {
                self.client_cmd(cx, tag, from, version, cmd);
                Directive::Consumed
            }
            Body::Req(Request::Peer(PeerMsg::Down {
                tag, client, cmd, ..
            })) => {
                self.accept(cx, tag, client, cmd);
                Directive::Consumed
            }
            body => Directive::NoMatch(Envelope { tag, from, body }),
        }
    }

    fn export(&self) -> Vec<u8> {
        bincode::serialize(self).expect("chain state serialization should not fail")
    }

    fn import(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
