//! The trivial one-replica protocol.
//!
//! Establishes the callback shape: every command is executed and answered
//! locally, everything else belongs to the kernel.

use crate::machine::traits::StateMachine;
use crate::net::registry::Pid;
use crate::replica::config::{Config, ProtocolKind};
use crate::replica::message::{Body, Envelope, Request};
use crate::replica::protocol::{Directive, ReplicaCtx, Replication};

pub struct Single;

impl<S: StateMachine> Replication<S> for Single {
    fn kind() -> ProtocolKind {
        ProtocolKind::Single
    }

    fn init_replica(_me: Pid, _conf: &Config) -> Self {
        Single
    }

    fn update_state(&mut self, _me: Pid, _conf: &Config) {}

    fn handle_msg(&mut self, cx: &mut ReplicaCtx<'_, S>, env: Envelope<S>) -> Directive<S> {
        let Envelope { tag, from, body } = env;
        match body {
            Body::Req(Request::Cmd { cmd, .. }) => {
                cx.sm.do_send(cx.net, cx.me, tag, from, &cmd, true);
                Directive::Consumed
            }
            body => Directive::NoMatch(Envelope { tag, from, body }),
        }
    }

    fn export(&self) -> Vec<u8> {
        Vec::new()
    }

    fn import(_bytes: &[u8]) -> Result<Self, bincode::Error> {
        Ok(Single)
    }
}
