//! The configuration value: the immutable descriptor of a replicated
//! object that travels with every message.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fault::Fault;
use crate::net::registry::Pid;

/// Tag of the replication protocol driving a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    Single,
    PrimaryBackup,
    Chain,
    Quorum,
}

/// Where primary/backup serves non-mutating commands from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadSrc {
    /// Always the primary (default; reads are never stale).
    Primary,
    /// A random backup; may trail the primary by the in-flight window.
    Backup,
    /// Any replica.
    Random,
}

/// Protocol-specific options, validated against the replica count when a
/// configuration is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProtocolArgs {
    Single,
    PrimaryBackup {
        read_src: ReadSrc,
    },
    Chain {
        /// Allow any replica to serve reads instead of only the tail.
        sloppy_reads: bool,
    },
    Quorum {
        /// Read quorum size; defaults to a majority.
        read_quorum: Option<usize>,
        /// Write quorum size; defaults to a majority.
        write_quorum: Option<usize>,
        /// Rotate the coordinator across replicas instead of always using
        /// the first.
        shuffle: bool,
    },
}

impl ProtocolArgs {
    /// The default options for a protocol.
    pub fn defaults(kind: ProtocolKind) -> ProtocolArgs {
        match kind {
            ProtocolKind::Single => ProtocolArgs::Single,
            ProtocolKind::PrimaryBackup => ProtocolArgs::PrimaryBackup {
                read_src: ReadSrc::Primary,
            },
            ProtocolKind::Chain => ProtocolArgs::Chain {
                sloppy_reads: false,
            },
            ProtocolKind::Quorum => ProtocolArgs::Quorum {
                read_quorum: None,
                write_quorum: None,
                shuffle: false,
            },
        }
    }

    pub fn quorum(
        read_quorum: Option<usize>,
        write_quorum: Option<usize>,
        shuffle: bool,
    ) -> ProtocolArgs {
        ProtocolArgs::Quorum {
            read_quorum,
            write_quorum,
            shuffle,
        }
    }

    pub fn primary_backup(read_src: ReadSrc) -> ProtocolArgs {
        ProtocolArgs::PrimaryBackup { read_src }
    }

    fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolArgs::Single => ProtocolKind::Single,
            ProtocolArgs::PrimaryBackup { .. } => ProtocolKind::PrimaryBackup,
            ProtocolArgs::Chain { .. } => ProtocolKind::Chain,
            ProtocolArgs::Quorum { .. } => ProtocolKind::Quorum,
        }
    }
}

/// Majority quorum for `n` replicas.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Immutable descriptor of a replicated object.
///
/// Reconfiguration never mutates a configuration in place; it produces a
/// [`Config::successor`] with `version + 1`. Replica order is protocol
/// significant: the head is the primary in primary/backup and the chain
/// head in chain replication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub protocol: ProtocolKind,
    /// Informative name of the replicated machine's type.
    pub sm_module: String,
    pub replicas: Vec<Pid>,
    /// Strictly monotonic across the life of a configuration lineage.
    pub version: u64,
    pub args: ProtocolArgs,
    /// Set only when wrapped by an external partitioning layer.
    pub shard_agent: Option<Pid>,
}

impl Config {
    /// Build the version-1 configuration, validating the args.
    pub fn first(
        protocol: ProtocolKind,
        sm_module: String,
        replicas: Vec<Pid>,
        args: ProtocolArgs,
    ) -> Result<Config, Fault> {
        let conf = Config {
            protocol,
            sm_module,
            replicas,
            version: 1,
            args,
            shard_agent: None,
        };
        conf.validate()?;
        Ok(conf)
    }

    /// The `version + 1` descendant with a new replica set.
    pub fn successor(&self, replicas: Vec<Pid>) -> Config {
        Config {
            replicas,
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), Fault> {
        if self.replicas.is_empty() {
            return Err(Fault::NoReplicas);
        }
        if self.args.kind() != self.protocol {
            warn!(
                "configuration args {:?} do not belong to protocol {:?}; using defaults",
                self.args, self.protocol
            );
        }
        if self.protocol == ProtocolKind::Quorum {
            let (r, w, n) = (self.read_quorum(), self.write_quorum(), self.n());
            if r + w <= n {
                warn!("quorums do not overlap: r {} + w {} <= n {}", r, w, n);
                return Err(Fault::BadQuorum { r, w, n });
            }
        }
        Ok(())
    }

    pub fn n(&self) -> usize {
        self.replicas.len()
    }

    pub fn head(&self) -> Option<Pid> {
        self.replicas.first().copied()
    }

    pub fn tail(&self) -> Option<Pid> {
        self.replicas.last().copied()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.replicas.contains(&pid)
    }

    /// Resolved read quorum size.
    pub fn read_quorum(&self) -> usize {
        match &self.args {
            ProtocolArgs::Quorum {
                read_quorum: Some(r),
                ..
            } => *r,
            _ => majority(self.n()),
        }
    }

    /// Resolved write quorum size.
    pub fn write_quorum(&self) -> usize {
        match &self.args {
            ProtocolArgs::Quorum {
                write_quorum: Some(w),
                ..
            } => *w,
            _ => majority(self.n()),
        }
    }

    pub fn shuffle(&self) -> bool {
        matches!(self.args, ProtocolArgs::Quorum { shuffle: true, .. })
    }

    pub fn read_src(&self) -> ReadSrc {
        match self.args {
            ProtocolArgs::PrimaryBackup { read_src } => read_src,
            _ => ReadSrc::Primary,
        }
    }

    pub fn sloppy_reads(&self) -> bool {
        matches!(self.args, ProtocolArgs::Chain { sloppy_reads: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::echo::Echo;
    use crate::net::registry::Network;

    fn pids(n: usize) -> Vec<Pid> {
        let net: Network<Echo> = Network::new();
        (0..n).map(|_| net.bind("node").0).collect()
    }

    #[test]
    fn successor_bumps_version_only() {
        let conf = Config::first(
            ProtocolKind::Chain,
            "Echo".into(),
            pids(3),
            ProtocolArgs::defaults(ProtocolKind::Chain),
        )
        .unwrap();
        let next = conf.successor(conf.replicas.clone());
        assert_eq!(next.version, conf.version + 1);
        assert_eq!(next.replicas, conf.replicas);
        let after = next.successor(next.replicas.clone());
        assert_eq!(after.version, conf.version + 2);
    }

    #[test]
    fn quorum_defaults_are_majorities() {
        let conf = Config::first(
            ProtocolKind::Quorum,
            "Echo".into(),
            pids(5),
            ProtocolArgs::defaults(ProtocolKind::Quorum),
        )
        .unwrap();
        assert_eq!(conf.read_quorum(), 3);
        assert_eq!(conf.write_quorum(), 3);
    }

    #[test]
    fn overlapping_quorums_required() {
        let bad = Config::first(
            ProtocolKind::Quorum,
            "Echo".into(),
            pids(3),
            ProtocolArgs::quorum(Some(1), Some(2), false),
        );
        assert_eq!(bad, Err(Fault::BadQuorum { r: 1, w: 2, n: 3 }));

        let ok = Config::first(
            ProtocolKind::Quorum,
            "Echo".into(),
            pids(3),
            ProtocolArgs::quorum(Some(2), Some(2), false),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn empty_replica_set_rejected() {
        let none = Config::first(
            ProtocolKind::Single,
            "Echo".into(),
            Vec::new(),
            ProtocolArgs::Single,
        );
        assert_eq!(none, Err(Fault::NoReplicas));
    }
}
