//! Reference machine: echo.
//!
//! Replies with whatever it was sent and counts how many mutations it has
//! observed, which makes replication visible in tests.

use serde::{Deserialize, Serialize};

use crate::machine::traits::{CmdOutcome, StateMachine};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Echo {
    pub seen: u64,
}

impl StateMachine for Echo {
    type Command = String;
    type Response = String;
    type Args = ();

    fn init(_args: ()) -> Self {
        Echo::default()
    }

    fn handle_cmd(&mut self, cmd: &String, _side_effects: bool) -> CmdOutcome<String> {
        self.seen += 1;
        CmdOutcome::Reply(cmd.clone())
    }

    fn is_mutating(_cmd: &String) -> bool {
        true
    }

    fn export(&self) -> Vec<u8> {
        bincode::serialize(self).expect("echo state serialization should not fail")
    }

    fn import(bytes: &[u8]) -> Self {
        bincode::deserialize(bytes).unwrap_or_default()
    }
}
