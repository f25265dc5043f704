//! Whole-group scenario tests.
//!
//! Each test spawns real replica actors over the in-process network and
//! drives them through the public operations, covering the replication
//! protocols, reconfiguration, fork, and the boundary behaviours.

use std::thread;
use std::time::{Duration, Instant};

use crate::fault::Fault;
use crate::machine::echo::Echo;
use crate::machine::kvs::{Kvs, KvsCmd, KvsReply};
use crate::machine::traits::{StateMachine, StopReason};
use crate::net::{Caller, Network, Pid};
use crate::object;
use crate::protocols::primary_backup::PrimaryBackup;
use crate::protocols::quorum::Quorum;
use crate::replica::config::{ProtocolArgs, ProtocolKind, ReadSrc};
use crate::replica::message::{Access, PeerMsg, Reply, Request, Snapshot};
use crate::replica::protocol::Replication;

const RETRY: Duration = Duration::from_millis(50);

/// Route replica logs through the test harness; opt in with RUST_LOG.
fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn put(key: &str, value: &str) -> KvsCmd {
    KvsCmd::Put {
        key: key.into(),
        value: value.into(),
    }
}

fn get(key: &str) -> KvsCmd {
    KvsCmd::Get { key: key.into() }
}

fn value(v: &str) -> KvsReply {
    KvsReply::Value(Some(v.into()))
}

/// Export a replica and decode the machine half of its snapshot.
fn machine_of<S: StateMachine>(caller: &mut Caller<S>, pid: Pid) -> S {
    let Ok(Reply::Exported(bytes)) = caller.call(pid, Request::Export, RETRY) else {
        panic!("replica {} did not export", pid);
    };
    let snap = Snapshot::deserialize(&bytes).unwrap();
    S::import(&snap.sm)
}

/// Export a replica and decode the protocol half of its snapshot.
fn protocol_of<S: StateMachine, P: Replication<S>>(caller: &mut Caller<S>, pid: Pid) -> P {
    let Ok(Reply::Exported(bytes)) = caller.call(pid, Request::Export, RETRY) else {
        panic!("replica {} did not export", pid);
    };
    let snap = Snapshot::deserialize(&bytes).unwrap();
    assert_eq!(snap.kind, Some(P::kind()));
    P::import(&snap.protocol).unwrap()
}

fn wait_down<S: StateMachine>(net: &Network<S>, pid: Pid) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while net.is_up(pid) {
        assert!(Instant::now() < deadline, "replica {} did not terminate", pid);
        thread::sleep(Duration::from_millis(10));
    }
}

/// Primary/backup object over echo: one mutation is observed once by
/// every replica, and the client gets the machine's reply verbatim.
#[test]
fn pb_replicates_one_mutation_everywhere() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::defaults(ProtocolKind::PrimaryBackup),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    assert_eq!(conf.version, 1);

    let reply = object::invoke(&net, &mut caller, &conf, "hi".to_string(), RETRY).unwrap();
    assert_eq!(reply, "hi");

    for &pid in &conf.replicas {
        assert_eq!(machine_of::<Echo>(&mut caller, pid).seen, 1);
    }
}

/// Stopping a replica bumps the version, terminates it, and the object
/// keeps serving.
#[test]
fn stop_replica_bumps_version_and_keeps_serving() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::defaults(ProtocolKind::PrimaryBackup),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    object::invoke(&net, &mut caller, &conf, "hi".to_string(), RETRY).unwrap();

    let dropped = conf.replicas[2];
    let conf2 =
        object::stop_replica(&net, &mut caller, &conf, 2, StopReason::Testing, RETRY).unwrap();
    assert_eq!(conf2.version, conf.version + 1);
    assert_eq!(conf2.replicas.len(), 2);
    wait_down(&net, dropped);

    let reply = object::invoke(&net, &mut caller, &conf2, "hi2".to_string(), RETRY).unwrap();
    assert_eq!(reply, "hi2");
    for &pid in &conf2.replicas {
        assert_eq!(machine_of::<Echo>(&mut caller, pid).seen, 2);
    }
}

/// Quorum with r = w = 2 over three replicas: a write survives the loss
/// of any one replica, including the default coordinator.
#[test]
fn quorum_read_survives_replica_loss() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Quorum,
        ProtocolArgs::quorum(Some(2), Some(2), false),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();

    let reply = object::invoke(&net, &mut caller, &conf, put("k", "1"), RETRY).unwrap();
    assert_eq!(reply, KvsReply::Stored);

    // Kill the coordinator itself; the client re-routes.
    net.kill(conf.replicas[0]);
    let reply = object::invoke(&net, &mut caller, &conf, get("k"), RETRY).unwrap();
    assert_eq!(reply, value("1"));
}

/// A forked replica joins the configuration and participates.
#[test]
fn fork_joins_quorum() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Quorum,
        ProtocolArgs::quorum(Some(2), Some(2), false),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    object::invoke(&net, &mut caller, &conf, put("k", "1"), RETRY).unwrap();

    let forked = object::fork_replica(&net, &mut caller, &conf, 1, "node-x", None, RETRY).unwrap();

    // The fork starts unbound: it binds on the reconfigure below.
    let mut replicas = vec![forked];
    replicas.extend(conf.replicas.iter().copied());
    let conf2 = object::reconfigure(&net, &mut caller, &conf, replicas, RETRY).unwrap();
    assert_eq!(conf2.version, conf.version + 1);

    // The forked replica now coordinates reads and already holds the
    // written state.
    let reply = object::invoke(&net, &mut caller, &conf2, get("k"), RETRY).unwrap();
    assert_eq!(reply, value("1"));
    let held = object::get_conf(&net, &mut caller, forked, RETRY).unwrap();
    assert_eq!(held.version, conf2.version);

    let reply = object::invoke(&net, &mut caller, &conf2, put("k", "2"), RETRY).unwrap();
    assert_eq!(reply, KvsReply::Stored);
    assert_eq!(
        machine_of::<Kvs>(&mut caller, forked).get("k"),
        Some(&"2".to_string())
    );
}

/// The fork carries the machine state and the protocol's private tables.
#[test]
fn fork_copies_machine_and_unstable_tables() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Quorum,
        ProtocolArgs::defaults(ProtocolKind::Quorum),
        (),
        &["a", "b"],
        RETRY,
    )
    .unwrap();
    object::invoke(&net, &mut caller, &conf, put("k", "1"), RETRY).unwrap();

    let forked = object::fork_replica(&net, &mut caller, &conf, 0, "node-x", None, RETRY).unwrap();
    let bound = conf.successor(vec![forked]);
    caller
        .call(forked, Request::Reconfigure(bound), RETRY)
        .unwrap();

    let source: Quorum<Kvs> = protocol_of(&mut caller, conf.replicas[0]);
    let copy: Quorum<Kvs> = protocol_of(&mut caller, forked);
    assert_eq!(copy.updates_count, source.updates_count);
    assert_eq!(copy.unstable.len(), source.unstable.len());
    assert_eq!(
        machine_of::<Kvs>(&mut caller, forked).get("k"),
        Some(&"1".to_string())
    );
}

/// Primary/backup with backup reads: once a mutation has been answered,
/// every replica has applied it, so a backup read observes it.
#[test]
fn pb_backup_reads_observe_settled_mutations() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::primary_backup(ReadSrc::Backup),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();

    for (k, v) in [("x", "1"), ("y", "2"), ("x", "3")] {
        object::invoke(&net, &mut caller, &conf, put(k, v), RETRY).unwrap();
    }

    // Reads are routed to a random backup; the value is settled.
    for _ in 0..4 {
        let reply = object::invoke(&net, &mut caller, &conf, get("x"), RETRY).unwrap();
        assert_eq!(reply, value("3"));
    }

    // All replicas applied the mutations in the same order: same state.
    for &pid in &conf.replicas {
        let kvs = machine_of::<Kvs>(&mut caller, pid);
        assert_eq!(kvs.get("x"), Some(&"3".to_string()));
        assert_eq!(kvs.get("y"), Some(&"2".to_string()));
    }
}

/// Chain of three: kill the middle link, reconfigure to a two-chain, and
/// the next command succeeds from the new tail.
#[test]
fn chain_survives_middle_crash_after_reconfigure() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Chain,
        ProtocolArgs::defaults(ProtocolKind::Chain),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    object::invoke(&net, &mut caller, &conf, put("k", "1"), RETRY).unwrap();

    let (head, middle, tail) = (conf.replicas[0], conf.replicas[1], conf.replicas[2]);
    net.kill(middle);
    let conf2 = object::reconfigure(&net, &mut caller, &conf, vec![head, tail], RETRY).unwrap();

    let reply = object::invoke(&net, &mut caller, &conf2, get("k"), RETRY).unwrap();
    assert_eq!(reply, value("1"));
    let reply = object::invoke(&net, &mut caller, &conf2, put("k", "2"), RETRY).unwrap();
    assert_eq!(reply, KvsReply::Stored);
    let reply = object::invoke(&net, &mut caller, &conf2, get("k"), RETRY).unwrap();
    assert_eq!(reply, value("2"));
}

/// Strict chain reads come from the tail; sloppy reads may come from
/// anywhere and still observe settled mutations.
#[test]
fn chain_reads_strict_and_sloppy() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Chain,
        ProtocolArgs::Chain { sloppy_reads: true },
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    object::invoke(&net, &mut caller, &conf, put("k", "1"), RETRY).unwrap();

    for _ in 0..4 {
        let reply = object::invoke(&net, &mut caller, &conf, get("k"), RETRY).unwrap();
        assert_eq!(reply, value("1"));
    }
}

/// The read-repair rule: a stale coordinator answers a read with the
/// freshest result any quorum member produced.
#[test]
fn quorum_read_repair_prefers_freshest_result() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Quorum,
        ProtocolArgs::quorum(Some(2), Some(2), false),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    let stale = conf.replicas[2];

    // Partition one replica away so it misses the write.
    net.disconnect(stale);
    object::invoke(&net, &mut caller, &conf, put("k", "new"), RETRY).unwrap();
    net.reconnect(stale);

    // Force the stale replica to coordinate the read.
    let tag = caller.cast(
        stale,
        Request::QuorumCmd {
            version: conf.version,
            access: Access::Read,
            cmd: get("k"),
        },
    );
    let (_, reply) = caller.collect(tag, Duration::from_secs(2)).unwrap();
    let Reply::Cmd(Ok(reply)) = reply else {
        panic!("read failed: {:?}", reply);
    };
    assert_eq!(reply, value("new"));
}

/// Duplicate write messages (one ref, retransmitted) are idempotent at a
/// peer: applied once, acknowledged twice.
#[test]
fn quorum_duplicate_write_is_idempotent() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Quorum,
        ProtocolArgs::defaults(ProtocolKind::Quorum),
        (),
        &["a", "b", "c"],
        RETRY,
    )
    .unwrap();
    let peer = conf.replicas[1];

    let exec = Request::Peer(PeerMsg::QuorumExec {
        version: conf.version,
        tag: crate::net::Ref::fresh(),
        access: Access::Write,
        cmd: put("k", "1"),
    });
    let first = caller.cast(peer, exec.clone());
    caller.recast(first, peer, exec);

    // Delivery to the peer is FIFO from this caller, so by the time the
    // export below is answered both transmissions have been handled,
    // and the write applied once.
    let state: Quorum<Kvs> = protocol_of(&mut caller, peer);
    assert_eq!(state.updates_count, 1);
    assert_eq!(
        machine_of::<Kvs>(&mut caller, peer).get("k"),
        Some(&"1".to_string())
    );
}

/// A primary retransmission is answered from the reply cache without
/// re-running the command.
#[test]
fn pb_duplicate_command_not_reapplied() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::defaults(ProtocolKind::PrimaryBackup),
        (),
        &["a", "b"],
        RETRY,
    )
    .unwrap();
    let primary = conf.replicas[0];

    let req = Request::Cmd {
        version: conf.version,
        cmd: "once".to_string(),
    };
    let tag = caller.cast(primary, req.clone());
    let (_, first) = caller.collect(tag, Duration::from_secs(2)).unwrap();
    assert!(matches!(first, Reply::Cmd(Ok(ref s)) if s == "once"));

    caller.recast(tag, primary, req);
    let (_, second) = caller.collect(tag, Duration::from_secs(2)).unwrap();
    assert!(matches!(second, Reply::Cmd(Ok(ref s)) if s == "once"));

    assert_eq!(machine_of::<Echo>(&mut caller, primary).seen, 1);
}

/// Quorum degenerated to one replica takes the fast path: no pending
/// record is ever allocated.
#[test]
fn quorum_singleton_fast_path() {
    trace_init();
    let net: Network<Kvs> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Quorum,
        ProtocolArgs::quorum(Some(1), Some(1), false),
        (),
        &["a"],
        RETRY,
    )
    .unwrap();

    let reply = object::invoke(&net, &mut caller, &conf, put("k", "1"), RETRY).unwrap();
    assert_eq!(reply, KvsReply::Stored);
    let reply = object::invoke(&net, &mut caller, &conf, get("k"), RETRY).unwrap();
    assert_eq!(reply, value("1"));

    let state: Quorum<Kvs> = protocol_of(&mut caller, conf.replicas[0]);
    assert!(state.unstable.is_empty());
    assert_eq!(state.updates_count, 1);
}

/// Primary/backup with no backups answers synchronously from the primary.
#[test]
fn pb_without_backups_is_synchronous() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::defaults(ProtocolKind::PrimaryBackup),
        (),
        &["a"],
        RETRY,
    )
    .unwrap();

    let reply = object::invoke(&net, &mut caller, &conf, "solo".to_string(), RETRY).unwrap();
    assert_eq!(reply, "solo");

    let state: PrimaryBackup<Echo> = protocol_of(&mut caller, conf.replicas[0]);
    assert!(state.unstable.is_empty());
    assert_eq!(state.stable_count, 1);
    assert_eq!(state.next_cmd_num, 1);
}

/// Reconfiguring to the same replica set is a membership no-op but still
/// increments the version, twice for twice.
#[test]
fn reconfigure_same_set_increments_version() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Single,
        ProtocolArgs::Single,
        (),
        &["a"],
        RETRY,
    )
    .unwrap();

    let once =
        object::reconfigure(&net, &mut caller, &conf, conf.replicas.clone(), RETRY).unwrap();
    let twice =
        object::reconfigure(&net, &mut caller, &once, once.replicas.clone(), RETRY).unwrap();
    assert_eq!(twice.version, conf.version + 2);
    assert_eq!(twice.replicas, conf.replicas);

    let reply = object::invoke(&net, &mut caller, &twice, "still".to_string(), RETRY).unwrap();
    assert_eq!(reply, "still");
}

/// The protocol state round-trips through export and import.
#[test]
fn protocol_state_round_trips() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::defaults(ProtocolKind::PrimaryBackup),
        (),
        &["a", "b"],
        RETRY,
    )
    .unwrap();
    for cmd in ["one", "two", "three"] {
        object::invoke(&net, &mut caller, &conf, cmd.to_string(), RETRY).unwrap();
    }

    let state: PrimaryBackup<Echo> = protocol_of(&mut caller, conf.replicas[0]);
    let copy = PrimaryBackup::<Echo>::import(&Replication::<Echo>::export(&state)).unwrap();
    assert_eq!(copy.stable_count, state.stable_count);
    assert_eq!(copy.next_cmd_num, state.next_cmd_num);
    assert_eq!(copy.unstable.len(), state.unstable.len());
}

/// The asynchronous form: cast returns a token, collect picks up the
/// reply.
#[test]
fn cast_and_collect_round_trip() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::PrimaryBackup,
        ProtocolArgs::defaults(ProtocolKind::PrimaryBackup),
        (),
        &["a", "b"],
        RETRY,
    )
    .unwrap();

    let tag = object::cast(&net, &mut caller, &conf, "later".to_string()).unwrap();
    let (_, reply) = caller.collect(tag, Duration::from_secs(2)).unwrap();
    assert!(matches!(reply, Reply::Cmd(Ok(ref s)) if s == "later"));
}

/// An old configuration handle is refused once the group has moved on.
#[test]
fn stale_configuration_is_refused() {
    trace_init();
    let net: Network<Echo> = Network::new();
    let mut caller = Caller::new(&net, "client");
    let conf = object::new(
        &net,
        &mut caller,
        ProtocolKind::Single,
        ProtocolArgs::Single,
        (),
        &["a"],
        RETRY,
    )
    .unwrap();
    let _next =
        object::reconfigure(&net, &mut caller, &conf, conf.replicas.clone(), RETRY).unwrap();

    let err = object::invoke(&net, &mut caller, &conf, "late".to_string(), RETRY);
    assert_eq!(err, Err(Fault::NotInConfiguration));
}
