//! Serial gateway to the user state machine.
//!
//! Each replica owns exactly one `Wrapper`, and a replica handles one
//! message at a time, so access to the machine is serialised by
//! construction; the wrapper is inlined into the replica actor rather
//! than run as a second task.

use crate::fault::Fault;
use crate::machine::traits::{CmdOutcome, StateMachine, StopReason};
use crate::net::registry::{Network, Pid};
use crate::net::rpc::Ref;
use crate::replica::message::{Body, Envelope, Reply};

pub struct Wrapper<S: StateMachine> {
    sm: S,
}

impl<S: StateMachine> Wrapper<S> {
    pub fn init(args: S::Args) -> Self {
        Wrapper { sm: S::init(args) }
    }

    pub fn from_export(bytes: &[u8]) -> Self {
        Wrapper {
            sm: S::import(bytes),
        }
    }

    /// Run one command, returning the reply to forward (if any).
    ///
    /// `Ok(None)` is the machine's `noreply`: the command was handled but
    /// the client gets nothing.
    pub fn do_cmd(
        &mut self,
        cmd: &S::Command,
        side_effects: bool,
    ) -> Result<Option<S::Response>, Fault> {
        match self.sm.handle_cmd(cmd, side_effects) {
            CmdOutcome::Reply(r) => Ok(Some(r)),
            CmdOutcome::NoReply => Ok(None),
            CmdOutcome::UndefinedOp => Err(Fault::UnknownCommand),
        }
    }

    /// Direct-reply form: run the command and send `{tag, reply}` to
    /// `client` on behalf of `me`. A `noreply` outcome sends nothing.
    pub fn do_send(
        &mut self,
        net: &Network<S>,
        me: Pid,
        tag: Ref,
        client: Pid,
        cmd: &S::Command,
        side_effects: bool,
    ) {
        let out = self.do_cmd(cmd, side_effects);
        send_cmd_reply(net, me, tag, client, out);
    }

    pub fn export(&self) -> Vec<u8> {
        self.sm.export()
    }

    pub fn export_part(&self, tag: &str) -> Vec<u8> {
        self.sm.export_part(tag)
    }

    pub fn import(&mut self, bytes: &[u8]) {
        self.sm = S::import(bytes);
    }

    pub fn get_state(&self) -> &S {
        &self.sm
    }

    pub fn set_state(&mut self, sm: S) {
        self.sm = sm;
    }

    pub fn stop(self, reason: StopReason) {
        self.sm.stop(reason);
    }
}

/// Flatten a command outcome into the reply to put on the wire:
/// `None` is the machine's `noreply`.
pub fn outcome_to_reply<S: StateMachine>(
    out: Result<Option<S::Response>, Fault>,
) -> Option<Result<S::Response, Fault>> {
    match out {
        Ok(Some(r)) => Some(Ok(r)),
        Ok(None) => None,
        Err(f) => Some(Err(f)),
    }
}

/// Send a command outcome to a client, observing `noreply`.
pub fn send_cmd_reply<S: StateMachine>(
    net: &Network<S>,
    me: Pid,
    tag: Ref,
    client: Pid,
    out: Result<Option<S::Response>, Fault>,
) {
    let payload = match out {
        Ok(Some(r)) => Ok(r),
        Ok(None) => return,
        Err(f) => Err(f),
    };
    net.send(
        client,
        Envelope {
            tag,
            from: me,
            body: Body::Reply(Reply::Cmd(payload)),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::kvs::{Kvs, KvsCmd, KvsReply};

    /// Machine that only understands "ping".
    struct Picky;

    impl StateMachine for Picky {
        type Command = String;
        type Response = String;
        type Args = ();

        fn init(_args: ()) -> Self {
            Picky
        }

        fn handle_cmd(&mut self, cmd: &String, _side_effects: bool) -> CmdOutcome<String> {
            if cmd == "ping" {
                CmdOutcome::Reply("pong".into())
            } else {
                CmdOutcome::UndefinedOp
            }
        }

        fn is_mutating(_cmd: &String) -> bool {
            false
        }

        fn export(&self) -> Vec<u8> {
            Vec::new()
        }

        fn import(_bytes: &[u8]) -> Self {
            Picky
        }
    }

    #[test]
    fn undefined_op_surfaces_as_unknown_command() {
        let mut w: Wrapper<Picky> = Wrapper::init(());
        assert_eq!(w.do_cmd(&"ping".to_string(), true), Ok(Some("pong".into())));
        assert_eq!(
            w.do_cmd(&"zap".to_string(), true),
            Err(Fault::UnknownCommand)
        );
    }

    #[test]
    fn do_cmd_maps_outcomes() {
        let mut w: Wrapper<Kvs> = Wrapper::init(());
        let put = KvsCmd::Put {
            key: "a".into(),
            value: "1".into(),
        };
        assert_eq!(w.do_cmd(&put, true), Ok(Some(KvsReply::Stored)));
        let get = KvsCmd::Get { key: "a".into() };
        assert_eq!(
            w.do_cmd(&get, true),
            Ok(Some(KvsReply::Value(Some("1".into()))))
        );
    }

    #[test]
    fn import_restores_exported_state() {
        let mut w: Wrapper<Kvs> = Wrapper::init(());
        let put = KvsCmd::Put {
            key: "k".into(),
            value: "v".into(),
        };
        w.do_cmd(&put, true).unwrap();

        let mut restored: Wrapper<Kvs> = Wrapper::from_export(&w.export());
        let get = KvsCmd::Get { key: "k".into() };
        assert_eq!(
            restored.do_cmd(&get, true),
            Ok(Some(KvsReply::Value(Some("v".into()))))
        );
    }
}
