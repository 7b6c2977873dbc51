//! Common test utilities for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use treecache::{CacheConfig, CacheMode, LocalGroup, StateTransferConfig, TreeCache};

/// Configuration with short timeouts for fast tests.
pub fn config(mode: CacheMode) -> CacheConfig {
    CacheConfig {
        cache_mode: mode,
        lock_acquisition_timeout_ms: 500,
        sync_repl_timeout_ms: 1_000,
        state_transfer: StateTransferConfig {
            timeout_ms: 200,
            attempts: 2,
            fetch_on_startup: true,
        },
        ..CacheConfig::default()
    }
}

/// Members of one in-process group, in join order.
pub struct TestCluster {
    pub group: Arc<LocalGroup>,
    pub caches: Vec<TreeCache>,
}

impl TestCluster {
    /// Starts `size` members sharing `config`.
    pub fn new(size: usize, config: CacheConfig) -> Self {
        let group = LocalGroup::new();
        let mut cluster = Self {
            group,
            caches: Vec::new(),
        };
        for _ in 0..size {
            cluster.join(config.clone());
        }
        cluster
    }

    /// Starts one more member with `config` and returns its index.
    pub fn join(&mut self, config: CacheConfig) -> usize {
        let cache = TreeCache::builder(config)
            .transport(self.group.transport())
            .build()
            .expect("build cache");
        cache.start().expect("start cache");
        self.caches.push(cache);
        self.caches.len() - 1
    }

    pub fn cache(&self, index: usize) -> &TreeCache {
        &self.caches[index]
    }

    pub fn stop(&self) {
        for cache in &self.caches {
            cache.stop();
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
