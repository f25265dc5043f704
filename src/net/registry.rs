//! In-process mailbox registry.
//!
//! Every actor (replica, client caller, multicall collector) binds a
//! mailbox here and is addressed by the [`Pid`] the registry hands out.
//! Delivery is FIFO per ordered pair of mailboxes (one crossbeam channel
//! per receiver) and lossy only under crash or partition.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::machine::traits::StateMachine;
use crate::replica::message::Envelope;

/// Address of a registered mailbox.
///
/// Plain 64-bit identity so it can live inside exported protocol tables
/// and travel in snapshots between replicas.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(u64);

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

struct Entry<S: StateMachine> {
    tx: Sender<Envelope<S>>,
    node: String,
    /// Partition switch: while false, delivery to/from this mailbox is
    /// silently dropped. The mailbox itself stays registered.
    connected: Arc<AtomicBool>,
}

/// Clonable handle over the shared mailbox registry.
///
/// `send` distinguishes two failure modes the way a real transport would:
/// a *dead* target (no mailbox: a crash) fails fast with `false`, while a
/// *partitioned* target silently swallows the message and reports `true`,
/// because a sender cannot observe a partition.
pub struct Network<S: StateMachine> {
    procs: Arc<Mutex<HashMap<Pid, Entry<S>>>>,
    next_pid: Arc<AtomicU64>,
}

impl<S: StateMachine> Clone for Network<S> {
    fn clone(&self) -> Self {
        Network {
            procs: Arc::clone(&self.procs),
            next_pid: Arc::clone(&self.next_pid),
        }
    }
}

impl<S: StateMachine> Default for Network<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StateMachine> Network<S> {
    pub fn new() -> Self {
        Network {
            procs: Arc::new(Mutex::new(HashMap::new())),
            next_pid: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a fresh mailbox on the named node.
    ///
    /// The node label records placement; all mailboxes live in this
    /// process regardless.
    pub fn bind(&self, node: &str) -> (Pid, Receiver<Envelope<S>>) {
        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded();
        let entry = Entry {
            tx,
            node: node.to_string(),
            connected: Arc::new(AtomicBool::new(true)),
        };
        self.procs
            .lock()
            .expect("mailbox registry poisoned")
            .insert(pid, entry);
        (pid, rx)
    }

    /// Deliver an envelope to `to`.
    ///
    /// Returns `false` only when the target mailbox no longer exists; a
    /// partitioned endpoint drops the message but still reports `true`.
    pub fn send(&self, to: Pid, env: Envelope<S>) -> bool {
        let (tx, deliver) = {
            let procs = self.procs.lock().expect("mailbox registry poisoned");
            let Some(entry) = procs.get(&to) else {
                return false;
            };
            let target_up = entry.connected.load(Ordering::SeqCst);
            let sender_up = procs
                .get(&env.from)
                .map(|e| e.connected.load(Ordering::SeqCst))
                .unwrap_or(true);
            (entry.tx.clone(), target_up && sender_up)
        };
        if !deliver {
            debug!("dropping envelope for partitioned endpoint {}", to);
            return true;
        }
        if tx.send(env).is_err() {
            // Receiver is gone without unregistering: the actor crashed.
            self.unregister(to);
            return false;
        }
        true
    }

    /// Close a mailbox. The owning actor's next receive reports
    /// disconnection, which it treats as a crash.
    pub fn kill(&self, pid: Pid) {
        self.unregister(pid);
    }

    pub fn unregister(&self, pid: Pid) {
        self.procs
            .lock()
            .expect("mailbox registry poisoned")
            .remove(&pid);
    }

    /// Partition a mailbox away: messages to and from it are dropped
    /// until [`Network::reconnect`].
    pub fn disconnect(&self, pid: Pid) {
        if let Some(entry) = self
            .procs
            .lock()
            .expect("mailbox registry poisoned")
            .get(&pid)
        {
            entry.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn reconnect(&self, pid: Pid) {
        if let Some(entry) = self
            .procs
            .lock()
            .expect("mailbox registry poisoned")
            .get(&pid)
        {
            entry.connected.store(true, Ordering::SeqCst);
        }
    }

    /// Whether a mailbox is still registered (it may be partitioned).
    pub fn is_up(&self, pid: Pid) -> bool {
        self.procs
            .lock()
            .expect("mailbox registry poisoned")
            .contains_key(&pid)
    }

    /// Node label the mailbox was bound on.
    pub fn node_of(&self, pid: Pid) -> Option<String> {
        self.procs
            .lock()
            .expect("mailbox registry poisoned")
            .get(&pid)
            .map(|e| e.node.clone())
    }

    /// Subset of `pids` whose mailboxes are still registered.
    pub fn alive(&self, pids: &[Pid]) -> Vec<Pid> {
        let procs = self.procs.lock().expect("mailbox registry poisoned");
        pids.iter()
            .copied()
            .filter(|p| procs.contains_key(p))
            .collect()
    }
}
