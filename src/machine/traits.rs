//! The core contract for replicable state machines.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Outcome of handling one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmdOutcome<R> {
    /// Answer the client with `R`.
    Reply(R),
    /// The command was applied but produces no reply; the client is not
    /// answered at all.
    NoReply,
    /// The machine does not recognise the command. Surfaced to the client
    /// as an unknown-command fault.
    UndefinedOp,
}

/// Why a state machine is being shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Ordinary stop requested by an operator.
    Normal,
    /// The replica was dropped from a configuration that does not
    /// include it.
    Reconfiguration,
    /// Torn down by a test harness.
    Testing,
}

/// A deterministic state machine that can be replicated.
///
/// # Laws
///
/// 1. `handle_cmd` MUST be deterministic: the same `(state, cmd)` always
///    produces the same outcome and successor state.
/// 2. `is_mutating` MUST be a pure function of the command alone.
/// 3. `import(export(s))` MUST behave indistinguishably from `s`.
/// 4. With `side_effects = false`, `handle_cmd` computes as usual but
///    suppresses externally visible effects (used for shadow execution
///    during quorum reads).
///
/// A panic inside `handle_cmd` is fatal to the hosting replica: the
/// replica thread unwinds and the rest of the group treats it as a crash.
pub trait StateMachine: Send + Sized + 'static {
    /// Commands ship between replicas inside replication traffic and
    /// exported unstable tables, hence the serde bounds.
    type Command: Clone + Send + Debug + Serialize + DeserializeOwned + 'static;
    type Response: Clone + Send + Debug + Serialize + DeserializeOwned + 'static;
    type Args: Clone + Send + 'static;

    fn init(args: Self::Args) -> Self;

    fn handle_cmd(&mut self, cmd: &Self::Command, side_effects: bool) -> CmdOutcome<Self::Response>;

    fn is_mutating(cmd: &Self::Command) -> bool;

    /// Serialize the entire state.
    fn export(&self) -> Vec<u8>;

    /// Partitioned export: serialize only the slice of state selected by
    /// `tag`. Machines that are not partitioned export everything.
    fn export_part(&self, _tag: &str) -> Vec<u8> {
        self.export()
    }

    /// Rebuild state from an `export`ed blob.
    fn import(bytes: &[u8]) -> Self;

    /// Final hook before the machine is discarded.
    fn stop(self, _reason: StopReason) {}
}
