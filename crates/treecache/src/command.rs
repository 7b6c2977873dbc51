//! Commands routed through the invocation pipeline and across the cluster.
//!
//! Every API call and every replicated message is one of these values;
//! dispatch is a single `match`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::fqn::{Fqn, Segment};
use crate::node::{DataMap, NodeSnapshot};
use crate::types::{Address, GlobalTransaction};

/// A cache operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Read one value.
    Get {
        /// Target node.
        fqn: Fqn,
        /// Key to read.
        key: String,
    },
    /// Read the whole data map.
    GetData {
        /// Target node.
        fqn: Fqn,
    },
    /// Read the data map's keys.
    GetKeys {
        /// Target node.
        fqn: Fqn,
    },
    /// Read the names of a node's children.
    GetChildrenNames {
        /// Target node.
        fqn: Fqn,
    },
    /// Check whether a node (or one of its keys) exists.
    Exists {
        /// Target node.
        fqn: Fqn,
        /// Key to check, if any.
        key: Option<String>,
    },
    /// Store one value, creating the node if needed.
    Put {
        /// Target node.
        fqn: Fqn,
        /// Key to write.
        key: String,
        /// Value to write.
        value: String,
    },
    /// Store several values, creating the node if needed.
    PutData {
        /// Target node.
        fqn: Fqn,
        /// Values to write.
        data: DataMap,
        /// Clear existing data first.
        erase: bool,
    },
    /// Remove one key.
    RemoveKey {
        /// Target node.
        fqn: Fqn,
        /// Key to remove.
        key: String,
    },
    /// Remove all data of a node, keeping the node.
    RemoveData {
        /// Target node.
        fqn: Fqn,
    },
    /// Remove a node and its subtree.
    RemoveNode {
        /// Target node.
        fqn: Fqn,
    },
    /// Drop a node from memory without touching peers.
    Evict {
        /// Target node.
        fqn: Fqn,
    },
    /// First phase of a replicated transaction.
    Prepare {
        /// Transaction being prepared.
        gtx: GlobalTransaction,
        /// Modifications to replay, in order.
        modifications: Vec<Command>,
        /// Member the transaction originated on.
        origin: Address,
        /// Commit immediately after replay.
        one_phase: bool,
    },
    /// Second phase: make the transaction's changes permanent.
    Commit {
        /// Transaction to commit.
        gtx: GlobalTransaction,
    },
    /// Second phase: undo the transaction's changes.
    Rollback {
        /// Transaction to roll back.
        gtx: GlobalTransaction,
    },
    /// A batch of independent commands from the replication queue.
    Replicate {
        /// Commands in enqueue order.
        commands: Vec<Command>,
    },
    /// Request a snapshot of a subtree.
    GetPartialState {
        /// Root of the requested subtree.
        fqn: Fqn,
        /// How long the source may wait for locks, in milliseconds.
        timeout_ms: u64,
        /// Break conflicting locks if they cannot be acquired in time.
        force: bool,
    },
}

impl Command {
    /// Target node of a data command.
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            Command::Get { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::Exists { fqn, .. }
            | Command::Put { fqn, .. }
            | Command::PutData { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::RemoveData { fqn }
            | Command::RemoveNode { fqn }
            | Command::Evict { fqn }
            | Command::GetPartialState { fqn, .. } => Some(fqn),
            Command::Prepare { modifications, .. } => {
                modifications.first().and_then(Command::fqn)
            }
            Command::Commit { .. } | Command::Rollback { .. } | Command::Replicate { .. } => None,
        }
    }

    /// Transaction a control command refers to.
    pub fn gtx(&self) -> Option<GlobalTransaction> {
        match self {
            Command::Prepare { gtx, .. } | Command::Commit { gtx } | Command::Rollback { gtx } => {
                Some(*gtx)
            }
            _ => None,
        }
    }

    /// True for commands that change the tree and are replicated.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Put { .. }
                | Command::PutData { .. }
                | Command::RemoveKey { .. }
                | Command::RemoveData { .. }
                | Command::RemoveNode { .. }
        )
    }

    /// True for read-only data commands.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::Get { .. }
                | Command::GetData { .. }
                | Command::GetKeys { .. }
                | Command::GetChildrenNames { .. }
                | Command::Exists { .. }
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::GetData { .. } => "get_data",
            Command::GetKeys { .. } => "get_keys",
            Command::GetChildrenNames { .. } => "get_children_names",
            Command::Exists { .. } => "exists",
            Command::Put { .. } => "put",
            Command::PutData { .. } => "put_data",
            Command::RemoveKey { .. } => "remove_key",
            Command::RemoveData { .. } => "remove_data",
            Command::RemoveNode { .. } => "remove_node",
            Command::Evict { .. } => "evict",
            Command::Prepare { .. } => "prepare",
            Command::Commit { .. } => "commit",
            Command::Rollback { .. } => "rollback",
            Command::Replicate { .. } => "replicate",
            Command::GetPartialState { .. } => "get_partial_state",
        }
    }

    /// Copy of this command with every target path passed through `f`.
    /// Paths for which `f` returns `None` are left unchanged.
    pub fn map_fqn(&self, f: &impl Fn(&Fqn) -> Option<Fqn>) -> Command {
        let remap = |fqn: &Fqn| f(fqn).unwrap_or_else(|| fqn.clone());
        match self {
            Command::Get { fqn, key } => Command::Get {
                fqn: remap(fqn),
                key: key.clone(),
            },
            Command::GetData { fqn } => Command::GetData { fqn: remap(fqn) },
            Command::GetKeys { fqn } => Command::GetKeys { fqn: remap(fqn) },
            Command::GetChildrenNames { fqn } => Command::GetChildrenNames { fqn: remap(fqn) },
            Command::Exists { fqn, key } => Command::Exists {
                fqn: remap(fqn),
                key: key.clone(),
            },
            Command::Put { fqn, key, value } => Command::Put {
                fqn: remap(fqn),
                key: key.clone(),
                value: value.clone(),
            },
            Command::PutData { fqn, data, erase } => Command::PutData {
                fqn: remap(fqn),
                data: data.clone(),
                erase: *erase,
            },
            Command::RemoveKey { fqn, key } => Command::RemoveKey {
                fqn: remap(fqn),
                key: key.clone(),
            },
            Command::RemoveData { fqn } => Command::RemoveData { fqn: remap(fqn) },
            Command::RemoveNode { fqn } => Command::RemoveNode { fqn: remap(fqn) },
            Command::Evict { fqn } => Command::Evict { fqn: remap(fqn) },
            Command::GetPartialState {
                fqn,
                timeout_ms,
                force,
            } => Command::GetPartialState {
                fqn: remap(fqn),
                timeout_ms: *timeout_ms,
                force: *force,
            },
            Command::Prepare {
                gtx,
                modifications,
                origin,
                one_phase,
            } => Command::Prepare {
                gtx: *gtx,
                modifications: modifications.iter().map(|m| m.map_fqn(f)).collect(),
                origin: *origin,
                one_phase: *one_phase,
            },
            Command::Replicate { commands } => Command::Replicate {
                commands: commands.iter().map(|c| c.map_fqn(f)).collect(),
            },
            Command::Commit { .. } | Command::Rollback { .. } => self.clone(),
        }
    }

    /// Invalidation form of a write: evict the target on peers instead of
    /// applying data. Non-writes are returned unchanged.
    pub fn to_invalidation(&self) -> Command {
        match (self.is_write(), self.fqn()) {
            (true, Some(fqn)) => Command::Evict { fqn: fqn.clone() },
            _ => self.clone(),
        }
    }
}

/// Result of a command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// No result.
    Unit,
    /// A single (possibly absent) value; also the previous value of a write.
    Value(Option<String>),
    /// A whole data map, absent if the node does not exist.
    Data(Option<DataMap>),
    /// A key set, absent if the node does not exist.
    Keys(Option<BTreeSet<String>>),
    /// Child names, absent if the node does not exist.
    Names(Option<BTreeSet<Segment>>),
    /// Boolean outcome (exists, removed, evicted).
    Bool(bool),
    /// Subtree snapshot, absent if the source has none to give.
    State(Option<NodeSnapshot>),
}

impl Reply {
    /// Extracts a single value.
    pub fn into_value(self) -> Option<String> {
        match self {
            Reply::Value(v) => v,
            _ => None,
        }
    }

    /// Extracts a data map.
    pub fn into_data(self) -> Option<DataMap> {
        match self {
            Reply::Data(d) => d,
            _ => None,
        }
    }

    /// Extracts a key set.
    pub fn into_keys(self) -> Option<BTreeSet<String>> {
        match self {
            Reply::Keys(k) => k,
            _ => None,
        }
    }

    /// Extracts child names.
    pub fn into_names(self) -> Option<BTreeSet<Segment>> {
        match self {
            Reply::Names(n) => n,
            _ => None,
        }
    }

    /// Extracts a boolean outcome.
    pub fn into_bool(self) -> bool {
        matches!(self, Reply::Bool(true))
    }

    /// Extracts a state snapshot.
    pub fn into_state(self) -> Option<NodeSnapshot> {
        match self {
            Reply::State(s) => s,
            _ => None,
        }
    }
}
