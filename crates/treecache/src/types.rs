use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a cluster member as seen by the group transport
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(u64);

impl Address {
    /// Creates a new Address from a raw u64 value
    pub fn new(id: u64) -> Self {
        Address(id)
    }

    /// Returns the raw u64 value of this address
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Cluster-unique transaction identity: the origin member plus a local counter.
///
/// Compared by value, so every member that learns about a transaction refers
/// to the same identity regardless of which local transaction represents it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransaction {
    address: Address,
    id: u64,
}

impl GlobalTransaction {
    /// Creates a global transaction originating at `address`
    pub fn new(address: Address, id: u64) -> Self {
        Self { address, id }
    }

    /// Member the transaction originated on
    pub fn address(&self) -> Address {
        self.address
    }

    /// Counter value on the origin member
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GTX:{}:{}", self.address, self.id)
    }
}

/// Identity of a transaction local to this member
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalTxId(u64);

impl LocalTxId {
    /// Creates a new LocalTxId from a raw u64 value
    pub fn new(id: u64) -> Self {
        LocalTxId(id)
    }

    /// Returns the raw u64 value of this id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LocalTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}
