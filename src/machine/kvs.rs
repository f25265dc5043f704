//! Reference machine: a string-keyed key/value store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::machine::traits::{CmdOutcome, StateMachine};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvsCmd {
    Put { key: String, value: String },
    Get { key: String },
    Del { key: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvsReply {
    Stored,
    Value(Option<String>),
    Deleted(bool),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Kvs {
    entries: HashMap<String, String>,
}

impl Kvs {
    pub fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateMachine for Kvs {
    type Command = KvsCmd;
    type Response = KvsReply;
    type Args = ();

    fn init(_args: ()) -> Self {
        Kvs::default()
    }

    fn handle_cmd(&mut self, cmd: &KvsCmd, _side_effects: bool) -> CmdOutcome<KvsReply> {
        match cmd {
            KvsCmd::Put { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                CmdOutcome::Reply(KvsReply::Stored)
            }
            KvsCmd::Get { key } => {
                CmdOutcome::Reply(KvsReply::Value(self.entries.get(key).cloned()))
            }
            KvsCmd::Del { key } => {
                CmdOutcome::Reply(KvsReply::Deleted(self.entries.remove(key).is_some()))
            }
        }
    }

    fn is_mutating(cmd: &KvsCmd) -> bool {
        matches!(cmd, KvsCmd::Put { .. } | KvsCmd::Del { .. })
    }

    fn export(&self) -> Vec<u8> {
        bincode::serialize(self).expect("kvs state serialization should not fail")
    }

    /// Partitioned export: only keys with the given prefix.
    fn export_part(&self, tag: &str) -> Vec<u8> {
        let slice = Kvs {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| k.starts_with(tag))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        bincode::serialize(&slice).expect("kvs state serialization should not fail")
    }

    fn import(bytes: &[u8]) -> Self {
        bincode::deserialize(bytes).unwrap_or_default()
    }
}
