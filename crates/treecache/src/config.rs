//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::fqn::PathWireFormat;
use crate::lock::IsolationLevel;

/// How changes travel to other members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheMode {
    /// No replication.
    #[default]
    Local,
    /// Replicate data without waiting for peers.
    ReplAsync,
    /// Replicate data and wait for every peer.
    ReplSync,
    /// Evict touched nodes on peers without waiting.
    InvalidationAsync,
    /// Evict touched nodes on peers and wait.
    InvalidationSync,
}

impl CacheMode {
    /// True unless the mode is `Local`.
    pub fn is_clustered(&self) -> bool {
        !matches!(self, CacheMode::Local)
    }

    /// True for modes that wait for peers.
    pub fn is_synchronous(&self) -> bool {
        matches!(self, CacheMode::ReplSync | CacheMode::InvalidationSync)
    }

    /// True for invalidation modes.
    pub fn is_invalidation(&self) -> bool {
        matches!(
            self,
            CacheMode::InvalidationAsync | CacheMode::InvalidationSync
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Local => "LOCAL",
            CacheMode::ReplAsync => "REPL_ASYNC",
            CacheMode::ReplSync => "REPL_SYNC",
            CacheMode::InvalidationAsync => "INVALIDATION_ASYNC",
            CacheMode::InvalidationSync => "INVALIDATION_SYNC",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LOCAL" => Ok(CacheMode::Local),
            "REPL_ASYNC" => Ok(CacheMode::ReplAsync),
            "REPL_SYNC" => Ok(CacheMode::ReplSync),
            "INVALIDATION_ASYNC" => Ok(CacheMode::InvalidationAsync),
            "INVALIDATION_SYNC" => Ok(CacheMode::InvalidationSync),
            other => Err(CacheError::Configuration(format!(
                "unknown cache mode '{}'",
                other
            ))),
        }
    }
}

/// Concurrency control for nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeLockingScheme {
    /// Per-node locks held to transaction end.
    #[default]
    Pessimistic,
    /// Versioned nodes validated at commit.
    Optimistic,
}

impl FromStr for NodeLockingScheme {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PESSIMISTIC" => Ok(NodeLockingScheme::Pessimistic),
            "OPTIMISTIC" => Ok(NodeLockingScheme::Optimistic),
            other => Err(CacheError::Configuration(format!(
                "unknown node locking scheme '{}'",
                other
            ))),
        }
    }
}

/// Batching of asynchronous replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationQueueConfig {
    /// Route asynchronous replication through the queue.
    pub enabled: bool,
    /// Timer flush interval in milliseconds; 0 disables the timer.
    pub interval_ms: u64,
    /// Queue length that triggers an immediate flush.
    pub max_elements: usize,
}

impl Default for ReplicationQueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 5000,
            max_elements: 1000,
        }
    }
}

/// Partial state transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateTransferConfig {
    /// Timeout of the first attempt in milliseconds; doubled per attempt.
    pub timeout_ms: u64,
    /// Number of attempts; the last one breaks conflicting locks.
    pub attempts: u32,
    /// Fetch the root state from peers when the cache starts.
    pub fetch_on_startup: bool,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            attempts: 3,
            fetch_on_startup: true,
        }
    }
}

/// Breaking locks of transactions whose origin left the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockBreakingConfig {
    /// Attempts to roll back a transaction that is still completing.
    pub attempts: u32,
    /// Pause between attempts in milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for LockBreakingConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            retry_interval_ms: 10,
        }
    }
}

/// Buddy replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuddyReplicationConfig {
    /// Replicate to buddies only.
    pub enabled: bool,
    /// Number of members after this one that receive its data.
    pub num_buddies: usize,
}

impl Default for BuddyReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            num_buddies: 1,
        }
    }
}

/// Backing store behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLoaderConfig {
    /// Write nodes to the store only on eviction, and remove them on load.
    pub passivation: bool,
    /// Include the store's contents when serving state to peers.
    pub fetch_persistent_state: bool,
}

/// Full cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cluster.
    pub cluster_name: String,
    /// Replication mode.
    pub cache_mode: CacheMode,
    /// Isolation level of node locks.
    pub isolation_level: IsolationLevel,
    /// Pessimistic or optimistic nodes.
    pub node_locking_scheme: NodeLockingScheme,
    /// Lock acquisition timeout in milliseconds; 0 waits forever.
    pub lock_acquisition_timeout_ms: u64,
    /// Timeout for synchronous replication calls in milliseconds.
    pub sync_repl_timeout_ms: u64,
    /// Write-lock the parent when inserting or removing a child.
    pub lock_parent_for_child_insert_remove: bool,
    /// Queue for asynchronous replication.
    pub replication_queue: ReplicationQueueConfig,
    /// Partial state transfer.
    pub state_transfer: StateTransferConfig,
    /// Lock breaking on membership change.
    pub lock_breaking: LockBreakingConfig,
    /// Start every region inactive; replication for a subtree is ignored
    /// until its region is activated.
    pub inactive_on_startup: bool,
    /// Buddy replication.
    pub buddy_replication: BuddyReplicationConfig,
    /// Backing store.
    pub cache_loader: CacheLoaderConfig,
    /// Path layout for [`crate::Fqn::encode`] callers that follow the cache.
    pub path_wire_format: PathWireFormat,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::from("TreeCache-Cluster"),
            cache_mode: CacheMode::Local,
            isolation_level: IsolationLevel::RepeatableRead,
            node_locking_scheme: NodeLockingScheme::Pessimistic,
            lock_acquisition_timeout_ms: 10_000,
            sync_repl_timeout_ms: 15_000,
            lock_parent_for_child_insert_remove: false,
            replication_queue: ReplicationQueueConfig::default(),
            state_transfer: StateTransferConfig::default(),
            lock_breaking: LockBreakingConfig::default(),
            inactive_on_startup: false,
            buddy_replication: BuddyReplicationConfig::default(),
            cache_loader: CacheLoaderConfig::default(),
            path_wire_format: PathWireFormat::LengthPrefixed,
        }
    }
}

impl CacheConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> CacheResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CacheConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| CacheError::Configuration(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| CacheError::Configuration(e.to_string()))?,
            _ => {
                return Err(CacheError::Configuration(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the cache cannot run with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.state_transfer.attempts == 0 {
            return Err(CacheError::Configuration(
                "state_transfer.attempts must be at least 1".into(),
            ));
        }
        if self.replication_queue.enabled && self.replication_queue.max_elements == 0 {
            return Err(CacheError::Configuration(
                "replication_queue.max_elements must be at least 1".into(),
            ));
        }
        if self.replication_queue.enabled && self.cache_mode.is_synchronous() {
            return Err(CacheError::Configuration(format!(
                "replication queue cannot be used with {}",
                self.cache_mode
            )));
        }
        if self.buddy_replication.enabled && self.buddy_replication.num_buddies == 0 {
            return Err(CacheError::Configuration(
                "buddy_replication.num_buddies must be at least 1".into(),
            ));
        }
        if self.buddy_replication.enabled && self.cache_mode.is_invalidation() {
            return Err(CacheError::Configuration(
                "buddy replication requires a REPL_* cache mode".into(),
            ));
        }
        Ok(())
    }

    /// Lock acquisition timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquisition_timeout_ms)
    }

    /// Synchronous replication timeout.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_repl_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_mode, CacheMode::Local);
        assert_eq!(config.isolation_level, IsolationLevel::RepeatableRead);
        assert_eq!(config.node_locking_scheme, NodeLockingScheme::Pessimistic);
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.lock_breaking.attempts, 10);
        assert_eq!(config.state_transfer.attempts, 3);
        assert!(!config.replication_queue.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("repl_sync".parse::<CacheMode>().unwrap(), CacheMode::ReplSync);
        assert_eq!(
            "INVALIDATION-ASYNC".parse::<CacheMode>().unwrap(),
            CacheMode::InvalidationAsync
        );
        assert!(matches!(
            "REPL_LAZY".parse::<CacheMode>(),
            Err(CacheError::Configuration(_))
        ));
        assert_eq!(
            "optimistic".parse::<NodeLockingScheme>().unwrap(),
            NodeLockingScheme::Optimistic
        );
        assert!("MVCC".parse::<NodeLockingScheme>().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
cluster_name = "test"
cache_mode = "REPL_ASYNC"
isolation_level = "SERIALIZABLE"
lock_acquisition_timeout_ms = 250

[replication_queue]
enabled = true
interval_ms = 100
max_elements = 5
            "#
        )
        .unwrap();

        let config = CacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_name, "test");
        assert_eq!(config.cache_mode, CacheMode::ReplAsync);
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.replication_queue.max_elements, 5);
        assert_eq!(config.state_transfer, StateTransferConfig::default());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "cache_mode": "INVALIDATION_SYNC",
                "node_locking_scheme": "OPTIMISTIC",
                "lock_breaking": {{ "attempts": 3 }}
            }}"#
        )
        .unwrap();

        let config = CacheConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache_mode, CacheMode::InvalidationSync);
        assert_eq!(config.node_locking_scheme, NodeLockingScheme::Optimistic);
        assert_eq!(config.lock_breaking.attempts, 3);
        assert_eq!(config.lock_breaking.retry_interval_ms, 10);
    }

    #[test]
    fn test_from_file_rejects_bad_values() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "cache_mode = \"REPL_LAZY\"").unwrap();
        assert!(matches!(
            CacheConfig::from_file(file.path()),
            Err(CacheError::Configuration(_))
        ));

        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "cache_mode: LOCAL").unwrap();
        assert!(CacheConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_queue_with_sync_mode() {
        let config = CacheConfig {
            cache_mode: CacheMode::ReplSync,
            replication_queue: ReplicationQueueConfig {
                enabled: true,
                ..ReplicationQueueConfig::default()
            },
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
