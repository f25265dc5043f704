//! The replica actor.
//!
//! One thread per replica, blocking on its mailbox with a periodic tick.
//! Each inbound message is offered to the protocol's `handle_msg`; what
//! the protocol does not consume falls through to the built-in handlers
//! shared by every protocol (reconfigure, get_conf, stop, export, import,
//! fork).
//!
//! A replica is spawned unbound (it learns its configuration from its
//! first `reconfigure`) and parks client traffic until then. Messages
//! stamped with a higher configuration version than the replica holds are
//! parked the same way; stale peer traffic is dropped and stale client
//! commands are refused.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::fault::Fault;
use crate::machine::traits::{StateMachine, StopReason};
use crate::machine::wrapper::Wrapper;
use crate::net::registry::{Network, Pid};
use crate::replica::config::Config;
use crate::replica::message::{Body, Envelope, Reply, Request, Snapshot};
use crate::net::rpc::Ref;
use crate::replica::protocol::{Directive, ProtocolState, ReplicaCtx};

/// Idle interval between protocol timer callbacks.
const TICK: Duration = Duration::from_millis(50);

/// Upper bound on messages parked while unbound or ahead of the local
/// configuration version.
const PARK_LIMIT: usize = 1024;

/// What a replica starts from.
pub enum Seed<S: StateMachine> {
    /// A brand-new machine built from its init args.
    Fresh(S::Args),
    /// State shipped from another replica (fork, relocation).
    Import(Snapshot),
}

enum Flow {
    Continue,
    Exit(StopReason),
}

pub struct Replica<S: StateMachine> {
    me: Pid,
    net: Network<S>,
    rx: Receiver<Envelope<S>>,
    sm: Wrapper<S>,
    conf: Option<Config>,
    proto: ProtocolState<S>,
    parked: VecDeque<Envelope<S>>,
}

impl<S: StateMachine> Replica<S> {
    /// Spawn a replica actor on the named node and return its address.
    ///
    /// The replica waits, unbound, for its first `reconfigure`.
    pub fn spawn(net: &Network<S>, node: &str, seed: Seed<S>) -> Pid {
        let (me, rx) = net.bind(node);
        let net = net.clone();
        thread::Builder::new()
            .name(format!("replica-{}", me))
            .spawn(move || {
                let (sm, proto) = match seed {
                    Seed::Fresh(args) => (Wrapper::init(args), ProtocolState::Unbound),
                    Seed::Import(snap) => {
                        let sm = Wrapper::from_export(&snap.sm);
                        let proto = match ProtocolState::import(snap.kind, &snap.protocol) {
                            Ok(proto) => proto,
                            Err(err) => {
                                warn!("replica {}: undecodable protocol state in seed: {}", me, err);
                                ProtocolState::Unbound
                            }
                        };
                        (sm, proto)
                    }
                };
                Replica {
                    me,
                    net,
                    rx,
                    sm,
                    conf: None,
                    proto,
                    parked: VecDeque::new(),
                }
                .run();
            })
            .expect("failed to spawn replica thread");
        me
    }

    fn run(mut self) {
        debug!("replica {} up", self.me);
        let reason = loop {
            match self.rx.recv_timeout(TICK) {
                Ok(env) => match self.dispatch(env) {
                    Flow::Continue => {}
                    Flow::Exit(reason) => break Some(reason),
                },
                Err(RecvTimeoutError::Timeout) => self.tick(),
                Err(RecvTimeoutError::Disconnected) => {
                    // Mailbox closed underneath us: treated as a crash, no
                    // machine shutdown hook.
                    debug!("replica {} mailbox closed", self.me);
                    break None;
                }
            }
        };
        self.net.unregister(self.me);
        if let Some(reason) = reason {
            self.sm.stop(reason);
        }
        debug!("replica {} down", self.me);
    }

    fn dispatch(&mut self, env: Envelope<S>) -> Flow {
        if matches!(env.body, Body::Reply(_)) {
            // Replicas never issue calls of their own.
            debug!("replica {}: dropping stray reply", self.me);
            return Flow::Continue;
        }

        // Unbound: serve the minimal control set, park the rest until the
        // first reconfigure binds us.
        if self.conf.is_none() {
            return match &env.body {
                Body::Req(Request::Reconfigure(_))
                | Body::Req(Request::Stop(_))
                | Body::Req(Request::Import(_))
                | Body::Req(Request::Export) => self.builtin(env),
                _ => {
                    self.park(env);
                    Flow::Continue
                }
            };
        }

        // Version fence.
        let current = self.conf.as_ref().map(|c| c.version).unwrap_or(0);
        if let Body::Req(req) = &env.body {
            if let Some(v) = req.version() {
                if v < current {
                    if req.is_client() {
                        self.refuse(&env);
                    } else {
                        debug!(
                            "replica {}: dropping peer message from version {} (at {})",
                            self.me, v, current
                        );
                    }
                    return Flow::Continue;
                }
                if v > current {
                    self.park(env);
                    return Flow::Continue;
                }
            }
        }

        // Protocol traffic, and any control request the protocol
        // overloads, goes to the protocol first.
        let for_protocol = match &env.body {
            Body::Req(req) => {
                matches!(
                    req,
                    Request::Cmd { .. } | Request::QuorumCmd { .. } | Request::Peer(_)
                ) || self.proto.overloads(req)
            }
            Body::Reply(_) => false,
        };
        let env = if for_protocol {
            match self.offer(env) {
                None => return Flow::Continue,
                Some(env) => env,
            }
        } else {
            env
        };

        self.builtin(env)
    }

    /// Hand a message to the protocol; `None` means it was consumed.
    fn offer(&mut self, env: Envelope<S>) -> Option<Envelope<S>> {
        let Replica {
            me,
            net,
            sm,
            conf,
            proto,
            ..
        } = self;
        let conf = conf.as_ref()?;
        let mut cx = ReplicaCtx {
            me: *me,
            net,
            conf,
            sm,
        };
        match proto.handle_msg(&mut cx, env) {
            Directive::Consumed => None,
            Directive::NoMatch(env) => Some(env),
        }
    }

    fn tick(&mut self) {
        let Replica {
            me,
            net,
            sm,
            conf,
            proto,
            ..
        } = self;
        let Some(conf) = conf.as_ref() else { return };
        let mut cx = ReplicaCtx {
            me: *me,
            net,
            conf,
            sm,
        };
        proto.on_tick(&mut cx);
    }

    fn builtin(&mut self, env: Envelope<S>) -> Flow {
        let Envelope { tag, from, body } = env;
        let req = match body {
            Body::Req(req) => req,
            Body::Reply(_) => return Flow::Continue,
        };
        match req {
            Request::Reconfigure(new_conf) => self.reconfigure(tag, from, new_conf),
            Request::GetConf => {
                if let Some(conf) = &self.conf {
                    self.send_reply(tag, from, Reply::Conf(conf.clone()));
                }
                Flow::Continue
            }
            Request::Stop(reason) => {
                info!("replica {} stopping: {:?}", self.me, reason);
                self.send_reply(tag, from, Reply::Stopped);
                Flow::Exit(reason)
            }
            Request::Export => {
                let snap = self.proto.snapshot(&self.sm, None);
                self.send_reply(tag, from, Reply::Exported(snap.serialize()));
                Flow::Continue
            }
            Request::Import(bytes) => {
                match Snapshot::deserialize(&bytes) {
                    Ok(snap) => {
                        self.sm.import(&snap.sm);
                        match ProtocolState::import(snap.kind, &snap.protocol) {
                            Ok(proto) => self.proto = proto,
                            Err(err) => {
                                warn!(
                                    "replica {}: undecodable protocol state in import: {}",
                                    self.me, err
                                );
                            }
                        }
                        self.send_reply(tag, from, Reply::Imported);
                    }
                    Err(err) => {
                        warn!("replica {}: undecodable snapshot: {}", self.me, err);
                        self.send_reply(tag, from, Reply::Cmd(Err(Fault::UnknownCommand)));
                    }
                }
                Flow::Continue
            }
            Request::Fork { node, part } => {
                let snap = self.proto.snapshot(&self.sm, part.as_deref());
                let child = Replica::spawn(&self.net, &node, Seed::Import(snap));
                info!("replica {} forked {} onto {}", self.me, child, node);
                self.send_reply(tag, from, Reply::Forked(child));
                Flow::Continue
            }
            // Protocol traffic the protocol did not recognise (e.g. a
            // command reaching a replica that plays no role for it).
            Request::Cmd { .. } | Request::QuorumCmd { .. } | Request::Peer(_) => {
                debug!("replica {}: unroutable protocol message dropped", self.me);
                Flow::Continue
            }
        }
    }

    fn reconfigure(&mut self, tag: Ref, from: Pid, new_conf: Config) -> Flow {
        if let Some(cur) = &self.conf {
            if new_conf.version <= cur.version {
                // Duplicate or stale reconfigure: acknowledge idempotently.
                let version = cur.version;
                self.send_reply(tag, from, Reply::Reconfigured { version });
                return Flow::Continue;
            }
        }

        if self.proto.is_unbound() {
            self.proto = ProtocolState::init(new_conf.protocol, self.me, &new_conf);
        } else {
            self.proto.update_state(self.me, &new_conf);
        }

        let staying = new_conf.contains(self.me);
        let version = new_conf.version;
        info!(
            "replica {} installing configuration v{} ({} replicas{})",
            self.me,
            version,
            new_conf.n(),
            if staying { "" } else { ", leaving" }
        );
        self.conf = Some(new_conf);
        self.send_reply(tag, from, Reply::Reconfigured { version });

        if !staying {
            return Flow::Exit(StopReason::Reconfiguration);
        }

        // Replay everything parked while unbound or ahead of us.
        let parked: Vec<Envelope<S>> = self.parked.drain(..).collect();
        for env in parked {
            if let Flow::Exit(reason) = self.dispatch(env) {
                return Flow::Exit(reason);
            }
        }
        Flow::Continue
    }

    fn park(&mut self, env: Envelope<S>) {
        if self.parked.len() >= PARK_LIMIT {
            warn!("replica {}: park buffer full, dropping oldest", self.me);
            self.parked.pop_front();
        }
        self.parked.push_back(env);
    }

    fn refuse(&self, env: &Envelope<S>) {
        self.net.send(
            env.from,
            Envelope {
                tag: env.tag,
                from: self.me,
                body: Body::Reply(Reply::Cmd(Err(Fault::NotInConfiguration))),
            },
        );
    }

    fn send_reply(&self, tag: Ref, to: Pid, reply: Reply<S>) {
        self.net.send(
            to,
            Envelope {
                tag,
                from: self.me,
                body: Body::Reply(reply),
            },
        );
    }
}
