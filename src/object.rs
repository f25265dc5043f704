//! Public operations on a replicated object.
//!
//! A client holds a [`Config`] and drives the object through these
//! functions; the configuration names the protocol, and the protocol
//! decides where each command is routed. Reconfiguration flows through
//! the same channels as ordinary commands.

use std::any::type_name;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::fault::Fault;
use crate::machine::traits::{StateMachine, StopReason};
use crate::net::registry::{Network, Pid};
use crate::net::rpc::{Caller, Gather, Ref};
use crate::replica::config::{Config, ProtocolArgs, ProtocolKind, ReadSrc};
use crate::replica::kernel::{Replica, Seed};
use crate::replica::message::{Access, Reply, Request};

/// Spawn one replica per node, bind them into a version-1 configuration,
/// and return it.
pub fn new<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    protocol: ProtocolKind,
    args: ProtocolArgs,
    sm_args: S::Args,
    nodes: &[&str],
    retry: Duration,
) -> Result<Config, Fault> {
    if nodes.is_empty() {
        return Err(Fault::NoReplicas);
    }
    let replicas: Vec<Pid> = nodes
        .iter()
        .map(|node| Replica::spawn(net, node, Seed::Fresh(sm_args.clone())))
        .collect();
    let conf = match Config::first(protocol, sm_name::<S>(), replicas.clone(), args) {
        Ok(conf) => conf,
        Err(fault) => {
            for pid in replicas {
                caller.cast(pid, Request::Stop(StopReason::Normal));
            }
            return Err(fault);
        }
    };
    push_conf(net, caller, &conf, &conf.replicas, retry)?;
    Ok(conf)
}

/// The `do` operation: route a command by protocol, call the chosen
/// replica, and hand back the machine's reply.
///
/// Re-routes when the target crashes or a quorum coordinator gives up, so
/// the call survives any failure the protocol's redundancy covers.
pub fn invoke<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    cmd: S::Command,
    retry: Duration,
) -> Result<S::Response, Fault> {
    loop {
        let (dst, req) = route(net, caller, conf, &cmd)?;
        match caller.call(dst, req, retry) {
            Ok(Reply::Cmd(Ok(resp))) => return Ok(resp),
            Ok(Reply::Cmd(Err(Fault::Timeout))) => continue,
            Ok(Reply::Cmd(Err(fault))) => return Err(fault),
            Ok(other) => {
                debug!("unexpected reply to command: {:?}", other);
                continue;
            }
            Err(Fault::ReplicaStopped) => continue,
            Err(fault) => return Err(fault),
        }
    }
}

/// Asynchronous form of [`invoke`]: route and send, return the token.
/// The caller picks the response up later with [`Caller::collect`].
pub fn cast<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    cmd: S::Command,
) -> Result<Ref, Fault> {
    let (dst, req) = route(net, caller, conf, &cmd)?;
    Ok(caller.cast(dst, req))
}

/// Atomically replace the replica set: build the `version + 1`
/// configuration and notify the union of the old and new sets. Replicas
/// dropped by the new configuration stop themselves after acknowledging.
pub fn reconfigure<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    new_replicas: Vec<Pid>,
    retry: Duration,
) -> Result<Config, Fault> {
    let next = conf.successor(new_replicas);
    // A growing replica set can invalidate explicit quorum sizes; that is
    // warned about (inside validate) but does not block the swap, since
    // membership change is the only remedy for a failed replica.
    match next.validate() {
        Ok(()) | Err(Fault::BadQuorum { .. }) => {}
        Err(fault) => return Err(fault),
    }
    let mut union = conf.replicas.clone();
    for &pid in &next.replicas {
        if !union.contains(&pid) {
            union.push(pid);
        }
    }
    push_conf(net, caller, &next, &union, retry)?;
    Ok(next)
}

/// Stop the replica at `index` with an explicit reason, then reconfigure
/// the remainder into the successor configuration.
pub fn stop_replica<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    index: usize,
    reason: StopReason,
    retry: Duration,
) -> Result<Config, Fault> {
    let Some(&victim) = conf.replicas.get(index) else {
        return Err(Fault::NotInConfiguration);
    };
    let remaining: Vec<Pid> = conf
        .replicas
        .iter()
        .copied()
        .filter(|&pid| pid != victim)
        .collect();
    match caller.call(victim, Request::Stop(reason), retry) {
        Ok(_) | Err(Fault::ReplicaStopped) => {}
        Err(fault) => return Err(fault),
    }
    // The stop is acknowledged just before the victim leaves the
    // registry; wait it out so the reconfigure below only counts
    // replicas that can still answer.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while net.is_up(victim) && std::time::Instant::now() < deadline {
        std::thread::yield_now();
    }
    reconfigure(net, caller, conf, remaining, retry)
}

/// Materialise a new, unbound replica on `node`, seeded from the replica
/// at `index` (machine state plus the protocol's private tables). `part`
/// selects a partitioned export. The new replica joins a configuration
/// only through a subsequent [`reconfigure`].
pub fn fork_replica<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    index: usize,
    node: &str,
    part: Option<&str>,
    retry: Duration,
) -> Result<Pid, Fault> {
    let Some(&source) = conf.replicas.get(index) else {
        return Err(Fault::NotInConfiguration);
    };
    match caller.call(
        source,
        Request::Fork {
            node: node.to_string(),
            part: part.map(str::to_string),
        },
        retry,
    )? {
        Reply::Forked(pid) => Ok(pid),
        other => {
            debug!("unexpected reply to fork: {:?}", other);
            Err(Fault::Timeout)
        }
    }
}

/// Ask a replica for the configuration it currently holds.
pub fn get_conf<S: StateMachine>(
    _net: &Network<S>,
    caller: &mut Caller<S>,
    pid: Pid,
    retry: Duration,
) -> Result<Config, Fault> {
    match caller.call(pid, Request::GetConf, retry)? {
        Reply::Conf(conf) => Ok(conf),
        other => {
            debug!("unexpected reply to get_conf: {:?}", other);
            Err(Fault::Timeout)
        }
    }
}

/// The protocol's client-side `cast`: pick the target replica for a
/// command and wrap it the way the protocol expects.
fn route<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    cmd: &S::Command,
) -> Result<(Pid, Request<S>), Fault> {
    let alive = net.alive(&conf.replicas);
    if alive.is_empty() {
        return Err(Fault::NoReplicas);
    }
    let version = conf.version;
    let mutating = S::is_mutating(cmd);

    let routed = match conf.protocol {
        ProtocolKind::Single => (
            alive[0],
            Request::Cmd {
                version,
                cmd: cmd.clone(),
            },
        ),
        ProtocolKind::PrimaryBackup => {
            let target = if mutating {
                prefer(conf.head(), &alive)
            } else {
                match conf.read_src() {
                    ReadSrc::Primary => prefer(conf.head(), &alive),
                    ReadSrc::Backup => {
                        let backups: Vec<Pid> = alive
                            .iter()
                            .copied()
                            .filter(|&p| Some(p) != conf.head())
                            .collect();
                        if backups.is_empty() {
                            prefer(conf.head(), &alive)
                        } else {
                            random_of(&backups)
                        }
                    }
                    ReadSrc::Random => random_of(&alive),
                }
            };
            (
                target,
                Request::Cmd {
                    version,
                    cmd: cmd.clone(),
                },
            )
        }
        ProtocolKind::Chain => {
            let target = if mutating {
                prefer(conf.head(), &alive)
            } else if conf.sloppy_reads() {
                random_of(&alive)
            } else {
                prefer(conf.tail(), &alive)
            };
            (
                target,
                Request::Cmd {
                    version,
                    cmd: cmd.clone(),
                },
            )
        }
        ProtocolKind::Quorum => {
            let access = if mutating { Access::Write } else { Access::Read };
            let coordinator = if conf.shuffle() {
                alive[caller.rotate(alive.len())]
            } else {
                alive[0]
            };
            (
                coordinator,
                Request::QuorumCmd {
                    version,
                    access,
                    cmd: cmd.clone(),
                },
            )
        }
    };
    Ok(routed)
}

fn prefer(preferred: Option<Pid>, alive: &[Pid]) -> Pid {
    preferred.filter(|p| alive.contains(p)).unwrap_or(alive[0])
}

fn random_of(pids: &[Pid]) -> Pid {
    pids[rand::thread_rng().gen_range(0..pids.len())]
}

fn sm_name<S>() -> String {
    type_name::<S>()
        .rsplit("::")
        .next()
        .unwrap_or("machine")
        .to_string()
}

fn push_conf<S: StateMachine>(
    net: &Network<S>,
    caller: &mut Caller<S>,
    conf: &Config,
    targets: &[Pid],
    retry: Duration,
) -> Result<(), Fault> {
    let live = net.alive(targets);
    if live.is_empty() {
        return Err(Fault::NoReplicas);
    }
    let want = live.len();
    match caller.multicall(&live, Request::Reconfigure(conf.clone()), want, retry) {
        Gather::Complete(_) => Ok(()),
        Gather::Timeout(_) => Err(Fault::Timeout),
    }
}
