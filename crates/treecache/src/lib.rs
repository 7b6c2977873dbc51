#![warn(missing_docs)]

//! TreeCache: clustered, transactional, hierarchical in-memory cache
//!
//! Data lives in a tree of named nodes, each holding a string map and
//! guarded by its own reader/writer lock. Every call runs through an
//! interceptor pipeline (transactions, replication, locking, backing store)
//! before it touches the tree. Members of a group keep their trees in sync
//! by replication, and subtrees ("regions") can be activated and
//! inactivated independently with partial state transfer.

pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod fqn;
pub mod loader;
pub mod loader_interceptor;
pub mod lock;
pub mod lock_interceptor;
pub mod membership;
pub mod node;
pub mod notify;
pub mod optimistic;
pub mod optimistic_interceptor;
pub mod pipeline;
pub mod region;
pub mod repl_interceptor;
pub mod repl_queue;
pub mod state_transfer;
pub mod transport;
pub mod tree;
pub mod tx_interceptor;
pub mod txn_table;
pub mod types;

pub use cache::{CacheInner, Invocation, Transaction, TreeCache, TreeCacheBuilder};
pub use command::{Command, Reply};
pub use config::{
    BuddyReplicationConfig, CacheConfig, CacheLoaderConfig, CacheMode, LockBreakingConfig,
    NodeLockingScheme, ReplicationQueueConfig, StateTransferConfig,
};
pub use error::{CacheError, CacheResult};
pub use fqn::{Fqn, PathWireFormat, Segment};
pub use loader::{CacheLoader, InMemoryCacheLoader};
pub use lock::{IsolationLevel, LockOwner, LockType, NodeLock};
pub use node::{DataMap, NodeKind, NodeSnapshot, TreeNode};
pub use notify::{CacheEvent, CacheListener, RecordingListener};
pub use pipeline::{Interceptor, InvocationContext, InvocationOptions};
pub use region::{RegionStatus, BUDDY_BACKUP_ROOT};
pub use transport::{LocalGroup, LocalTransport, MessageHandler, Reachability, Transport};
pub use txn_table::{ReleaseOrder, TxStatus};
pub use types::{Address, GlobalTransaction, LocalTxId};
