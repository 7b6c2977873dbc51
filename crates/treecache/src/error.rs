//! Error types for cache operations.

use std::time::Duration;

use thiserror::Error;

use crate::fqn::Fqn;
use crate::types::GlobalTransaction;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error variants surfaced by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The operation targeted a path with no backing node.
    #[error("node {fqn} does not exist")]
    NodeNotExists {
        /// Path that was looked up.
        fqn: Fqn,
    },

    /// A lock could not be acquired before its deadline.
    #[error("{lock} lock on {fqn} for {owner} timed out after {waited:?}")]
    Timeout {
        /// Node whose lock was requested.
        fqn: Fqn,
        /// Owner that requested the lock.
        owner: String,
        /// Requested lock kind ("read" or "write").
        lock: &'static str,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Lock protocol violation, e.g. an upgrade that would deadlock.
    #[error("locking error on {fqn}: {reason}")]
    Locking {
        /// Node whose lock was involved.
        fqn: Fqn,
        /// Description of the violation.
        reason: String,
    },

    /// `activate_region` was called on a subtree that already holds data.
    #[error("region {fqn} is not empty")]
    RegionNotEmpty {
        /// Root of the region.
        fqn: Fqn,
    },

    /// A region registration overlaps an existing region.
    #[error("region {fqn} conflicts with existing region {existing}")]
    RegionNameConflict {
        /// Region that was being registered.
        fqn: Fqn,
        /// Region already registered.
        existing: Fqn,
    },

    /// A target member was suspected dead during a synchronous call.
    #[error("member {member} suspected during synchronous call")]
    Suspected {
        /// Address of the suspected member.
        member: String,
    },

    /// A synchronous replication call failed or returned divergent responses.
    #[error("replication failed: {0}")]
    Replication(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A path index was out of range.
    #[error("index {index} out of range for path of length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of segments in the path.
        len: usize,
    },

    /// State for a subtree could not be obtained from any peer.
    #[error("state transfer for {fqn} failed: {reason}")]
    StateTransfer {
        /// Subtree whose state was requested.
        fqn: Fqn,
        /// Why the transfer failed.
        reason: String,
    },

    /// A listener refused a change in its pre-event callback.
    #[error("change to {fqn} vetoed by listener: {reason}")]
    Vetoed {
        /// Node that was about to change.
        fqn: Fqn,
        /// Reason given by the listener.
        reason: String,
    },

    /// The transaction has no entry in the transaction table.
    #[error("transaction {0} not found")]
    TransactionNotFound(GlobalTransaction),

    /// The operation is not valid in the current lifecycle state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The persistent backing store failed.
    #[error("cache loader error: {0}")]
    Loader(String),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Returns true for lock and state-transfer deadline failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::Timeout { .. })
    }

    pub(crate) fn node_not_exists(fqn: &Fqn) -> Self {
        CacheError::NodeNotExists { fqn: fqn.clone() }
    }

    pub(crate) fn locking(fqn: &Fqn, reason: impl Into<String>) -> Self {
        CacheError::Locking {
            fqn: fqn.clone(),
            reason: reason.into(),
        }
    }
}
