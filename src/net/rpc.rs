//! Request/response layer: unique request tokens, async cast/collect,
//! synchronous call with retransmission, and parallel multicall.
//!
//! Retransmission is idempotent per [`Ref`]: a retried request reuses its
//! original token, and recipients treat a duplicate token as one logical
//! request (the protocols deduplicate via their unstable tables and reply
//! caches).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fault::Fault;
use crate::machine::traits::StateMachine;
use crate::net::registry::{Network, Pid};
use crate::replica::message::{Body, Envelope, Reply, Request};

static NEXT_REF: AtomicU64 = AtomicU64::new(1);

/// Globally unique request token.
///
/// Drawn from a process-wide counter, so a `Ref` is never reused for the
/// lifetime of the process. `(Ref, client)` is the reply key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref(u64);

impl Ref {
    pub fn fresh() -> Ref {
        Ref(NEXT_REF.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Outcome of a multi-response collection.
#[derive(Clone, Debug)]
pub enum Gather<T> {
    /// The requested number of responses arrived.
    Complete(Vec<T>),
    /// The timeout fired first; these are the responses so far.
    Timeout(Vec<T>),
}

impl<T> Gather<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Gather::Complete(_))
    }

    pub fn into_responses(self) -> Vec<T> {
        match self {
            Gather::Complete(v) | Gather::Timeout(v) => v,
        }
    }
}

/// Chain utility: index, predecessor, and successor of `me` in `chain`.
///
/// `None` stands for the boundary: the head has no predecessor, the tail
/// no successor. Returns `None` outright when `me` is not in the chain.
pub fn ipn(me: Pid, chain: &[Pid]) -> Option<(usize, Option<Pid>, Option<Pid>)> {
    let index = chain.iter().position(|&p| p == me)?;
    let prev = if index == 0 { None } else { Some(chain[index - 1]) };
    let next = chain.get(index + 1).copied();
    Some((index, prev, next))
}

/// Upper bound on buffered stray envelopes (late replies to abandoned
/// requests); oldest are discarded past this point.
const STASH_LIMIT: usize = 4096;

/// A client-side mailbox with selective receive.
///
/// Replicas reply to the `Pid` a request was sent from, so anything that
/// issues requests (clients, collectors, the admin operations in
/// [`crate::object`]) owns a `Caller`. Envelopes that arrive while the
/// caller is waiting for a different token are stashed and examined first
/// on the next collect.
pub struct Caller<S: StateMachine> {
    net: Network<S>,
    me: Pid,
    rx: Receiver<Envelope<S>>,
    stash: VecDeque<Envelope<S>>,
    rotation: usize,
}

impl<S: StateMachine> Caller<S> {
    pub fn new(net: &Network<S>, node: &str) -> Self {
        let (me, rx) = net.bind(node);
        Caller {
            net: net.clone(),
            me,
            rx,
            stash: VecDeque::new(),
            rotation: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.me
    }

    /// Round-robin position used by shuffled coordinator selection.
    pub(crate) fn rotate(&mut self, n: usize) -> usize {
        let slot = self.rotation % n.max(1);
        self.rotation = self.rotation.wrapping_add(1);
        slot
    }

    /// Fire-and-forget send under a fresh token.
    pub fn cast(&mut self, dst: Pid, req: Request<S>) -> Ref {
        let tag = Ref::fresh();
        self.recast(tag, dst, req);
        tag
    }

    /// Retransmit a request under its original token.
    pub fn recast(&mut self, tag: Ref, dst: Pid, req: Request<S>) -> bool {
        self.net.send(
            dst,
            Envelope {
                tag,
                from: self.me,
                body: Body::Req(req),
            },
        )
    }

    /// Send the same request to every destination under one token.
    ///
    /// Late responses stay attributable: every reply envelope carries the
    /// responder's `Pid`.
    pub fn multicast(&mut self, dsts: &[Pid], req: Request<S>) -> (Ref, Vec<Pid>)
    where
        Request<S>: Clone,
    {
        let tag = Ref::fresh();
        for &dst in dsts {
            self.recast(tag, dst, req.clone());
        }
        (tag, dsts.to_vec())
    }

    /// Wait for one reply matching `tag`.
    pub fn collect(&mut self, tag: Ref, timeout: Duration) -> Result<(Pid, Reply<S>), Fault> {
        let deadline = Instant::now() + timeout;
        if let Some(hit) = self.take_stashed(tag) {
            return Ok(hit);
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(env) => match env.body {
                    Body::Reply(reply) if env.tag == tag => return Ok((env.from, reply)),
                    _ => self.stash(env),
                },
                Err(RecvTimeoutError::Timeout) => return Err(Fault::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(Fault::ReplicaStopped),
            }
        }
    }

    /// Gather up to `want` replies matching `tag`, one per responder.
    pub fn collect_many(
        &mut self,
        tag: Ref,
        want: usize,
        timeout: Duration,
    ) -> Gather<(Pid, Reply<S>)> {
        let deadline = Instant::now() + timeout;
        let mut got: Vec<(Pid, Reply<S>)> = Vec::new();
        let mut seen: HashSet<Pid> = HashSet::new();
        while got.len() < want {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.collect(tag, remaining) {
                Ok((from, reply)) => {
                    // A retransmitted reply from the same responder counts once.
                    if seen.insert(from) {
                        got.push((from, reply));
                    }
                }
                Err(_) => return Gather::Timeout(got),
            }
        }
        Gather::Complete(got)
    }

    pub fn collect_any(&mut self, tag: Ref, timeout: Duration) -> Gather<(Pid, Reply<S>)> {
        self.collect_many(tag, 1, timeout)
    }

    pub fn collect_all(
        &mut self,
        tag: Ref,
        expected: usize,
        timeout: Duration,
    ) -> Gather<(Pid, Reply<S>)> {
        self.collect_many(tag, expected, timeout)
    }

    /// Synchronous call: retransmit every `retry` until a matching reply
    /// arrives.
    ///
    /// There is no timeout; the only early exit is the destination
    /// mailbox ceasing to exist, which surfaces as
    /// [`Fault::ReplicaStopped`] so the caller can re-route.
    pub fn call(&mut self, dst: Pid, req: Request<S>, retry: Duration) -> Result<Reply<S>, Fault>
    where
        Request<S>: Clone,
    {
        let tag = Ref::fresh();
        loop {
            if !self.recast(tag, dst, req.clone()) {
                return Err(Fault::ReplicaStopped);
            }
            match self.collect(tag, retry) {
                Ok((_, reply)) => return Ok(reply),
                Err(Fault::Timeout) => continue,
                Err(fault) => return Err(fault),
            }
        }
    }

    /// Parallel call: a spawned collector issues the request to every
    /// destination, retransmitting to non-responders each `retry` window,
    /// and hands back once `want` replies have arrived.
    ///
    /// Destinations that die mid-call are dropped from the outstanding
    /// set; if too few remain to ever reach `want`, the partial set is
    /// returned as [`Gather::Timeout`].
    pub fn multicall(
        &mut self,
        dsts: &[Pid],
        req: Request<S>,
        want: usize,
        retry: Duration,
    ) -> Gather<(Pid, Reply<S>)>
    where
        Request<S>: Clone,
    {
        let net = self.net.clone();
        let node = self.net.node_of(self.me).unwrap_or_default();
        let dsts = dsts.to_vec();
        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            let mut collector = Caller::new(&net, &node);
            let gathered = collector.run_collector(&dsts, req, want, retry);
            let _ = done_tx.send(gathered);
        });
        match done_rx.recv() {
            Ok(gathered) => gathered,
            Err(_) => Gather::Timeout(Vec::new()),
        }
    }

    /// `multicall` degenerated to the first response.
    pub fn anycall(
        &mut self,
        dsts: &[Pid],
        req: Request<S>,
        retry: Duration,
    ) -> Gather<(Pid, Reply<S>)>
    where
        Request<S>: Clone,
    {
        self.multicall(dsts, req, 1, retry)
    }

    fn run_collector(
        &mut self,
        dsts: &[Pid],
        req: Request<S>,
        want: usize,
        retry: Duration,
    ) -> Gather<(Pid, Reply<S>)>
    where
        Request<S>: Clone,
    {
        let (tag, _) = self.multicast(dsts, req.clone());
        let mut outstanding: HashSet<Pid> = dsts.iter().copied().collect();
        let mut got: Vec<(Pid, Reply<S>)> = Vec::new();
        loop {
            if got.len() >= want {
                return Gather::Complete(got);
            }
            match self.collect_many(tag, want - got.len(), retry) {
                Gather::Complete(more) | Gather::Timeout(more) => {
                    for (from, reply) in more {
                        if outstanding.remove(&from) {
                            got.push((from, reply));
                        }
                    }
                }
            }
            if got.len() >= want {
                return Gather::Complete(got);
            }
            outstanding.retain(|&p| self.net.is_up(p));
            if got.len() + outstanding.len() < want {
                return Gather::Timeout(got);
            }
            for &dst in &outstanding {
                self.recast(tag, dst, req.clone());
            }
        }
    }

    fn take_stashed(&mut self, tag: Ref) -> Option<(Pid, Reply<S>)> {
        let at = self.stash.iter().position(|env| {
            env.tag == tag && matches!(env.body, Body::Reply(_))
        })?;
        let env = self.stash.remove(at)?;
        match env.body {
            Body::Reply(reply) => Some((env.from, reply)),
            Body::Req(_) => None,
        }
    }

    fn stash(&mut self, env: Envelope<S>) {
        if self.stash.len() >= STASH_LIMIT {
            self.stash.pop_front();
        }
        self.stash.push_back(env);
    }
}

impl<S: StateMachine> Drop for Caller<S> {
    fn drop(&mut self) {
        self.net.unregister(self.me);
    }
}
