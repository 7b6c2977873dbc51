//! The cache facade.
//!
//! [`TreeCache`] is a cheap handle over shared state. Every call becomes a
//! [`Command`] run through the invocation pipeline; inbound replication
//! arrives through the [`MessageHandler`] implementation and is gated by
//! region status before it reaches the same pipeline.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, Reply};
use crate::config::{CacheConfig, NodeLockingScheme};
use crate::error::{CacheError, CacheResult};
use crate::fqn::{Fqn, Segment};
use crate::loader::CacheLoader;
use crate::lock::{LockOwner, LockType};
use crate::membership::Membership;
use crate::node::{DataMap, NodeKind, NodeSnapshot, TreeNode};
use crate::notify::{CacheEvent, CacheListener, Notifier};
use crate::pipeline::{InvocationContext, InvocationOptions, Pipeline};
use crate::region::{buddy_backup_root, reconcile_queue, Gate, RegionManager, RegionStatus, BUDDY_BACKUP_ROOT};
use crate::repl_queue::ReplicationQueue;
use crate::state_transfer::{fetch_state, generate_state, overlay_persistent, RetrySchedule};
use crate::transport::{MessageHandler, Transport};
use crate::tree::DataTree;
use crate::txn_table::{ReleaseOrder, TransactionTable};
use crate::types::{Address, GlobalTransaction, LocalTxId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// State shared by every handle to one cache.
pub struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) local_address: Address,
    pub(crate) tree: DataTree,
    pub(crate) txs: TransactionTable,
    pub(crate) notifier: Notifier,
    pub(crate) regions: RegionManager,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) loader: Option<Arc<dyn CacheLoader>>,
    pub(crate) queue: Option<ReplicationQueue>,
    pub(crate) membership: Membership,
    pub(crate) pipeline: Pipeline,
    lifecycle: Mutex<Lifecycle>,
}

impl CacheInner {
    fn check_usable(&self) -> CacheResult<()> {
        if *self.lifecycle.lock() == Lifecycle::Stopped {
            return Err(CacheError::IllegalState("cache is stopped".into()));
        }
        Ok(())
    }

    fn apply_remote(&self, command: Command) -> CacheResult<Reply> {
        let mut ctx = InvocationContext::remote();
        self.pipeline.invoke(self, &mut ctx, command)
    }

    /// Members other than this one, in view order.
    fn peers(&self) -> Vec<Address> {
        self.membership
            .members()
            .into_iter()
            .filter(|m| *m != self.local_address)
            .collect()
    }

    fn schedule(&self) -> RetrySchedule {
        RetrySchedule::new(
            Duration::from_millis(self.config.state_transfer.timeout_ms),
            self.config.state_transfer.attempts,
        )
    }

    /// Fetches the state of `fqn` from the peers and grafts it into the tree.
    /// Returns true if any state was received.
    fn fetch_and_integrate(&self, fqn: &Fqn) -> CacheResult<bool> {
        let Some(transport) = &self.transport else {
            return Ok(false);
        };
        let state = fetch_state(transport.as_ref(), &self.peers(), fqn, self.schedule())?;
        match state {
            Some(state) => {
                self.integrate(fqn, &state);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn integrate(&self, fqn: &Fqn, state: &NodeSnapshot) {
        self.tree.restore_subtree(fqn, state);
        tracing::info!(%fqn, nodes = state.node_count(), "integrated state");
    }

    /// Serves a state request from a peer.
    fn partial_state(&self, fqn: &Fqn, timeout: Duration, force: bool) -> CacheResult<Reply> {
        if !self.regions.is_active(fqn) {
            tracing::debug!(%fqn, "region not active, no state to give");
            return Ok(Reply::State(None));
        }
        let mut state = generate_state(&self.tree, fqn, timeout, force, |node| self.break_locks_below(node))?;
        if self.config.cache_loader.fetch_persistent_state {
            if let Some(loader) = &self.loader {
                if state.is_some() || loader.exists(fqn)? {
                    overlay_persistent(state.get_or_insert_with(NodeSnapshot::default), loader.as_ref(), fqn)?;
                }
            }
        }
        Ok(Reply::State(state.filter(|s| !s.is_empty())))
    }

    /// Clears every lock in the subtree of `node`: transactions holding
    /// one are rolled back, thread owners lose theirs.
    fn break_locks_below(&self, node: &Arc<TreeNode>) {
        let mut stack = vec![node.clone()];
        while let Some(node) = stack.pop() {
            stack.extend(node.children());
            if !node.has_lock() {
                continue;
            }
            for owner in node.lock().owners() {
                match owner {
                    LockOwner::Transaction(gtx) if self.txs.contains(&gtx) => {
                        tracing::warn!(fqn = %node.fqn(), %gtx, "rolling back lock holder for state transfer");
                        let mut ctx = InvocationContext::remote().with_transaction(gtx, self.txs.get_local(&gtx));
                        ctx.options.cache_mode_local = true;
                        if let Err(e) = self.pipeline.invoke(self, &mut ctx, Command::Rollback { gtx }) {
                            tracing::warn!(%gtx, error = %e, "rollback for state transfer failed");
                        }
                        node.release(&owner);
                    }
                    owner => {
                        tracing::warn!(fqn = %node.fqn(), %owner, "releasing lock for state transfer");
                        node.release(&owner);
                    }
                }
            }
        }
    }

    /// Evicts the subtree at `fqn` bottom-up while holding write locks on
    /// it and on its parent.
    fn evict_subtree(&self, fqn: &Fqn) -> CacheResult<()> {
        let Some(node) = self.tree.find_node(fqn, false) else {
            return Ok(());
        };
        let owner = LockOwner::current_thread();
        let timeout = self.config.lock_timeout();
        let mut locked = Vec::new();
        if !fqn.is_root() {
            if let Some(parent) = self.tree.find_node(&fqn.parent(), false) {
                if parent.acquire(owner, LockType::Write, timeout)? {
                    locked.push(parent);
                }
            }
        }
        let result = node
            .acquire_all(owner, LockType::Write, timeout)
            .and_then(|acquired| {
                locked.extend(acquired);
                let mut paths: Vec<Fqn> = Vec::new();
                let mut stack = vec![node.clone()];
                while let Some(n) = stack.pop() {
                    stack.extend(n.children());
                    paths.push(n.fqn().clone());
                }
                paths.sort_by_key(|p| std::cmp::Reverse(p.len()));
                let options = InvocationOptions {
                    cache_mode_local: true,
                    ..InvocationOptions::default()
                };
                for path in paths {
                    let mut ctx = InvocationContext::local(options.clone());
                    self.pipeline.invoke(self, &mut ctx, Command::Evict { fqn: path })?;
                }
                Ok(())
            });
        for node in locked.iter().rev() {
            node.release(&owner);
        }
        result
    }
}

impl MessageHandler for CacheInner {
    fn handle(&self, from: Address, command: Command) -> CacheResult<Reply> {
        self.check_usable()?;
        let target = match &command {
            Command::GetPartialState {
                fqn,
                timeout_ms,
                force,
            } => return self.partial_state(fqn, Duration::from_millis(*timeout_ms), *force),
            Command::Replicate { commands } => {
                for c in commands {
                    if let Err(e) = self.handle(from, c.clone()) {
                        tracing::warn!(%from, command = c.name(), error = %e, "replicated command failed");
                    }
                }
                return Ok(Reply::Unit);
            }
            Command::Commit { gtx } | Command::Rollback { gtx } => {
                if self.regions.queue_outcome(from, *gtx, &command) {
                    return Ok(Reply::Unit);
                }
                None
            }
            Command::Prepare { modifications, .. } => modifications.first().and_then(|m| m.fqn()).cloned(),
            c => c.fqn().cloned(),
        };
        if let Some(fqn) = target {
            match self.regions.gate(from, &fqn, &command) {
                Gate::Apply => {}
                Gate::Queued => {
                    tracing::trace!(%from, %fqn, command = command.name(), "queued for activating region");
                    return Ok(Reply::Unit);
                }
                Gate::Drop => {
                    tracing::trace!(%from, %fqn, command = command.name(), "dropped for inactive region");
                    return Ok(Reply::Unit);
                }
            }
        }
        self.apply_remote(command)
    }

    fn view_accepted(&self, members: Vec<Address>) {
        self.membership.view_changed(self, members);
    }
}

/// Builds a [`TreeCache`].
pub struct TreeCacheBuilder {
    config: CacheConfig,
    transport: Option<Arc<dyn Transport>>,
    loader: Option<Arc<dyn CacheLoader>>,
    listeners: Vec<Arc<dyn CacheListener>>,
}

impl TreeCacheBuilder {
    /// Group transport; required by every clustered mode.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Backing store.
    pub fn loader(mut self, loader: Arc<dyn CacheLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Listener registered before the cache starts.
    pub fn listener(mut self, listener: Arc<dyn CacheListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validates the configuration and assembles the cache.
    pub fn build(self) -> CacheResult<TreeCache> {
        let config = self.config;
        config.validate()?;
        if config.cache_mode.is_clustered() && self.transport.is_none() {
            return Err(CacheError::Configuration(format!(
                "{} requires a transport",
                config.cache_mode
            )));
        }
        let local_address = self
            .transport
            .as_ref()
            .map(|t| t.local_address())
            .unwrap_or_else(|| Address::new(0));
        let kind = match config.node_locking_scheme {
            NodeLockingScheme::Pessimistic => NodeKind::Standard,
            NodeLockingScheme::Optimistic => NodeKind::Versioned(0),
        };
        let queue = match &self.transport {
            Some(transport) if config.replication_queue.enabled => Some(ReplicationQueue::new(
                transport.clone(),
                Duration::from_millis(config.replication_queue.interval_ms),
                config.replication_queue.max_elements,
                config.sync_timeout(),
            )),
            _ => None,
        };
        let notifier = Notifier::new();
        for listener in self.listeners {
            notifier.add_listener(listener);
        }
        let num_buddies = if config.buddy_replication.enabled {
            config.buddy_replication.num_buddies
        } else {
            0
        };

        let inner = CacheInner {
            tree: DataTree::new(kind, config.isolation_level),
            txs: TransactionTable::new(),
            notifier,
            regions: RegionManager::new(config.inactive_on_startup),
            transport: self.transport,
            loader: self.loader,
            queue,
            membership: Membership::new(local_address, num_buddies),
            pipeline: Pipeline::new(config.node_locking_scheme),
            lifecycle: Mutex::new(Lifecycle::Created),
            local_address,
            config,
        };
        tracing::debug!(
            address = %local_address,
            mode = %inner.config.cache_mode,
            chain = ?inner.pipeline.names(),
            "built cache"
        );
        Ok(TreeCache {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to a cache. Clones share the same cache.
#[derive(Clone)]
pub struct TreeCache {
    inner: Arc<CacheInner>,
}

impl TreeCache {
    /// Starts building a cache with `config`.
    pub fn builder(config: CacheConfig) -> TreeCacheBuilder {
        TreeCacheBuilder {
            config,
            transport: None,
            loader: None,
            listeners: Vec::new(),
        }
    }

    pub(crate) fn inner(&self) -> &CacheInner {
        &self.inner
    }

    /// Active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// This member's address (`member-0` without a transport).
    pub fn local_address(&self) -> Address {
        self.inner.local_address
    }

    /// Joins the group, starts the replication queue and, unless regions
    /// start inactive, fetches the initial state. Calling it on a started
    /// cache does nothing.
    pub fn start(&self) -> CacheResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Started {
                return Ok(());
            }
            *lifecycle = Lifecycle::Started;
        }
        if let Some(queue) = &self.inner.queue {
            queue.start();
        }
        if let Some(transport) = &self.inner.transport {
            let handler: Arc<dyn MessageHandler> = self.inner.clone();
            transport.connect(Arc::downgrade(&handler))?;
            let config = &self.inner.config;
            if config.state_transfer.fetch_on_startup && !config.inactive_on_startup {
                self.inner.fetch_and_integrate(&Fqn::root())?;
            }
        }
        tracing::info!(
            address = %self.inner.local_address,
            mode = %self.inner.config.cache_mode,
            "cache started"
        );
        if let Err(e) = self.inner.notifier.notify(CacheEvent::CacheStarted) {
            tracing::warn!(error = %e, "start listener failed");
        }
        Ok(())
    }

    /// Flushes the replication queue and leaves the group. Calling it on a
    /// stopped cache does nothing.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Started {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        if let Some(queue) = &self.inner.queue {
            queue.stop();
        }
        if let Some(transport) = &self.inner.transport {
            transport.disconnect();
        }
        tracing::info!(address = %self.inner.local_address, "cache stopped");
        if let Err(e) = self.inner.notifier.notify(CacheEvent::CacheStopped) {
            tracing::warn!(error = %e, "stop listener failed");
        }
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Started
    }

    /// Calls with default options outside any transaction.
    pub fn invocation(&self) -> Invocation<'_> {
        self.with_options(InvocationOptions::default())
    }

    /// Calls with `options` outside any transaction.
    pub fn with_options(&self, options: InvocationOptions) -> Invocation<'_> {
        Invocation {
            cache: self,
            options,
            tx: None,
        }
    }

    /// Starts a local transaction bound to a fresh global transaction.
    pub fn begin(&self) -> Transaction {
        let txs = &self.inner.txs;
        let gtx = txs.new_global(self.inner.local_address);
        let local = txs.new_local();
        txs.create_entry(gtx, Some(local), false);
        tracing::debug!(%gtx, %local, "began transaction");
        Transaction {
            cache: self.clone(),
            gtx,
            local,
            completed: false,
        }
    }

    /// Value of `key` at `fqn`.
    pub fn get(&self, fqn: &Fqn, key: &str) -> CacheResult<Option<String>> {
        self.invocation().get(fqn, key)
    }

    /// Copy of the data at `fqn`.
    pub fn get_data(&self, fqn: &Fqn) -> CacheResult<Option<DataMap>> {
        self.invocation().get_data(fqn)
    }

    /// Keys at `fqn`.
    pub fn keys(&self, fqn: &Fqn) -> CacheResult<Option<BTreeSet<String>>> {
        self.invocation().keys(fqn)
    }

    /// Names of the children of `fqn`.
    pub fn children_names(&self, fqn: &Fqn) -> CacheResult<Option<BTreeSet<Segment>>> {
        self.invocation().children_names(fqn)
    }

    /// True if a node exists at `fqn`.
    pub fn exists(&self, fqn: &Fqn) -> CacheResult<bool> {
        self.invocation().exists(fqn)
    }

    /// True if `key` exists at `fqn`.
    pub fn exists_key(&self, fqn: &Fqn, key: &str) -> CacheResult<bool> {
        self.invocation().exists_key(fqn, key)
    }

    /// Stores `value` under `key` at `fqn`, creating the path. Returns the
    /// previous value.
    pub fn put(&self, fqn: &Fqn, key: impl Into<String>, value: impl Into<String>) -> CacheResult<Option<String>> {
        self.invocation().put(fqn, key, value)
    }

    /// Merges `data` into the node at `fqn`.
    pub fn put_all(&self, fqn: &Fqn, data: DataMap) -> CacheResult<()> {
        self.invocation().put_all(fqn, data)
    }

    /// Replaces the data at `fqn`.
    pub fn replace_data(&self, fqn: &Fqn, data: DataMap) -> CacheResult<()> {
        self.invocation().replace_data(fqn, data)
    }

    /// Removes `key` at `fqn`, returning its value.
    pub fn remove(&self, fqn: &Fqn, key: &str) -> CacheResult<Option<String>> {
        self.invocation().remove(fqn, key)
    }

    /// Clears the data at `fqn`.
    pub fn remove_data(&self, fqn: &Fqn) -> CacheResult<()> {
        self.invocation().remove_data(fqn)
    }

    /// Removes the node at `fqn` and its subtree.
    pub fn remove_node(&self, fqn: &Fqn) -> CacheResult<bool> {
        self.invocation().remove_node(fqn)
    }

    /// Evicts the node at `fqn` from memory on this member only.
    pub fn evict(&self, fqn: &Fqn) -> CacheResult<bool> {
        self.invocation().evict(fqn)
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.inner.notifier.add_listener(listener);
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) -> bool {
        self.inner.notifier.remove_listener(listener)
    }

    /// Registers a region at `fqn` with an optional serialization scope.
    pub fn register_region(&self, fqn: &Fqn, scope: Option<String>) -> CacheResult<()> {
        self.inner.regions.register(fqn, scope)
    }

    /// Status of the region containing `fqn`.
    pub fn region_status(&self, fqn: &Fqn) -> RegionStatus {
        self.inner.regions.status_of(fqn)
    }

    /// Activates the region at `fqn`: fetches its state from the peers,
    /// applies replication queued meanwhile, then starts applying
    /// replication directly.
    ///
    /// Fails with [`CacheError::RegionNotEmpty`] if the subtree already
    /// holds data. On any failure the region goes back to inactive.
    pub fn activate_region(&self, fqn: &Fqn) -> CacheResult<()> {
        let inner = &self.inner;
        inner.check_usable()?;
        if inner.regions.status_of(fqn) == RegionStatus::Active && inner.regions.get(fqn).is_some() {
            tracing::debug!(%fqn, "region already active");
            return Ok(());
        }
        if let Some(node) = inner.tree.find_node(fqn, false) {
            if node.has_data() || node.has_children() {
                return Err(CacheError::RegionNotEmpty { fqn: fqn.clone() });
            }
        }
        inner.regions.get_or_create(fqn)?;
        inner.regions.set_status(fqn, RegionStatus::Queuing)?;

        let activated = inner.fetch_and_integrate(fqn).and_then(|_| loop {
            let queued = inner.regions.drain_or_activate(fqn)?;
            if queued.is_empty() {
                break Ok(());
            }
            for (from, command) in reconcile_queue(queued) {
                if let Err(e) = inner.apply_remote(command) {
                    tracing::warn!(%fqn, %from, error = %e, "queued command failed");
                }
            }
        });
        match activated {
            Ok(()) => {
                tracing::info!(%fqn, "activated region");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%fqn, error = %e, "region activation failed");
                if let Err(reset) = inner.regions.set_status(fqn, RegionStatus::Inactive) {
                    tracing::warn!(%fqn, error = %reset, "could not reset region");
                }
                Err(e)
            }
        }
    }

    /// Inactivates the region at `fqn`: replication for it is ignored from
    /// now on and its subtree, including buddy backups of it, is evicted.
    pub fn inactivate_region(&self, fqn: &Fqn) -> CacheResult<()> {
        let inner = &self.inner;
        inner.check_usable()?;
        inner.regions.get_or_create(fqn)?;
        inner.regions.set_status(fqn, RegionStatus::Inactive)?;
        inner.evict_subtree(fqn)?;

        if inner.config.buddy_replication.enabled {
            let owners = inner
                .tree
                .children_names(&Fqn::from_name(BUDDY_BACKUP_ROOT))
                .unwrap_or_default();
            for owner in owners {
                let backup = Fqn::from_relative(&Fqn::from_segments([Segment::from(BUDDY_BACKUP_ROOT), owner]), fqn);
                inner.evict_subtree(&backup)?;
            }
        }
        tracing::info!(%fqn, "inactivated region");
        Ok(())
    }

    /// Node at `fqn`, optionally including tombstoned nodes.
    pub fn find_node(&self, fqn: &Fqn, include_removed: bool) -> Option<Arc<TreeNode>> {
        self.inner.tree.find_node(fqn, include_removed)
    }

    /// Indented rendering of the tree.
    pub fn print_details(&self) -> String {
        self.inner.tree.print_details()
    }

    /// Number of nodes, excluding the root.
    pub fn number_of_nodes(&self) -> usize {
        self.inner.tree.number_of_nodes()
    }

    /// Number of locks currently held.
    pub fn number_of_locks_held(&self) -> usize {
        self.inner.tree.root().number_of_locks_held()
    }

    /// Number of key/value pairs in the tree.
    pub fn number_of_attributes(&self) -> usize {
        self.inner.tree.root().number_of_attributes()
    }

    /// Number of transactions in flight.
    pub fn transaction_count(&self) -> usize {
        self.inner.txs.len()
    }

    /// Members of the current view.
    pub fn members(&self) -> Vec<Address> {
        self.inner.membership.members()
    }

    /// Coordinator of the current view.
    pub fn coordinator(&self) -> Option<Address> {
        self.inner.membership.coordinator()
    }

    /// True if this member coordinates the group.
    pub fn is_coordinator(&self) -> bool {
        self.inner.membership.is_coordinator()
    }

    /// This member's buddy group.
    pub fn buddies(&self) -> Vec<Address> {
        self.inner.membership.buddies()
    }

    /// Path under which peers keep this member's backups.
    pub fn buddy_backup_root(&self) -> Fqn {
        buddy_backup_root(self.inner.local_address)
    }

    /// Sends everything waiting in the replication queue now. Returns the
    /// number of commands sent.
    pub fn flush_replication_queue(&self) -> usize {
        self.inner.queue.as_ref().map_or(0, |q| q.flush())
    }

    /// Commands waiting in the replication queue.
    pub fn replication_queue_len(&self) -> usize {
        self.inner.queue.as_ref().map_or(0, |q| q.len())
    }

    /// Encodes `fqn` in the configured wire format.
    pub fn encode_fqn(&self, fqn: &Fqn) -> CacheResult<Vec<u8>> {
        fqn.encode(self.inner.config.path_wire_format)
    }

    /// Decodes a path in the configured wire format.
    pub fn decode_fqn(&self, bytes: &[u8]) -> CacheResult<Fqn> {
        Fqn::decode(bytes, self.inner.config.path_wire_format)
    }
}

/// A series of calls sharing options and, optionally, a transaction.
pub struct Invocation<'a> {
    cache: &'a TreeCache,
    options: InvocationOptions,
    tx: Option<(GlobalTransaction, LocalTxId)>,
}

impl Invocation<'_> {
    fn run(&self, command: Command) -> CacheResult<Reply> {
        let inner = &self.cache.inner;
        inner.check_usable()?;
        let mut ctx = InvocationContext::local(self.options.clone());
        if let Some((gtx, local)) = self.tx {
            ctx = ctx.with_transaction(gtx, Some(local));
        }
        inner.pipeline.invoke(inner, &mut ctx, command)
    }

    /// Value of `key` at `fqn`.
    pub fn get(&self, fqn: &Fqn, key: &str) -> CacheResult<Option<String>> {
        self.run(Command::Get {
            fqn: fqn.clone(),
            key: key.to_string(),
        })
        .map(Reply::into_value)
    }

    /// Copy of the data at `fqn`.
    pub fn get_data(&self, fqn: &Fqn) -> CacheResult<Option<DataMap>> {
        self.run(Command::GetData { fqn: fqn.clone() })
            .map(Reply::into_data)
    }

    /// Keys at `fqn`.
    pub fn keys(&self, fqn: &Fqn) -> CacheResult<Option<BTreeSet<String>>> {
        self.run(Command::GetKeys { fqn: fqn.clone() })
            .map(Reply::into_keys)
    }

    /// Names of the children of `fqn`.
    pub fn children_names(&self, fqn: &Fqn) -> CacheResult<Option<BTreeSet<Segment>>> {
        self.run(Command::GetChildrenNames { fqn: fqn.clone() })
            .map(Reply::into_names)
    }

    /// True if a node exists at `fqn`.
    pub fn exists(&self, fqn: &Fqn) -> CacheResult<bool> {
        self.run(Command::Exists {
            fqn: fqn.clone(),
            key: None,
        })
        .map(Reply::into_bool)
    }

    /// True if `key` exists at `fqn`.
    pub fn exists_key(&self, fqn: &Fqn, key: &str) -> CacheResult<bool> {
        self.run(Command::Exists {
            fqn: fqn.clone(),
            key: Some(key.to_string()),
        })
        .map(Reply::into_bool)
    }

    /// Stores `value` under `key` at `fqn`. Returns the previous value.
    pub fn put(&self, fqn: &Fqn, key: impl Into<String>, value: impl Into<String>) -> CacheResult<Option<String>> {
        self.run(Command::Put {
            fqn: fqn.clone(),
            key: key.into(),
            value: value.into(),
        })
        .map(Reply::into_value)
    }

    /// Merges `data` into the node at `fqn`.
    pub fn put_all(&self, fqn: &Fqn, data: DataMap) -> CacheResult<()> {
        self.run(Command::PutData {
            fqn: fqn.clone(),
            data,
            erase: false,
        })
        .map(|_| ())
    }

    /// Replaces the data at `fqn`.
    pub fn replace_data(&self, fqn: &Fqn, data: DataMap) -> CacheResult<()> {
        self.run(Command::PutData {
            fqn: fqn.clone(),
            data,
            erase: true,
        })
        .map(|_| ())
    }

    /// Removes `key` at `fqn`, returning its value.
    pub fn remove(&self, fqn: &Fqn, key: &str) -> CacheResult<Option<String>> {
        self.run(Command::RemoveKey {
            fqn: fqn.clone(),
            key: key.to_string(),
        })
        .map(Reply::into_value)
    }

    /// Clears the data at `fqn`.
    pub fn remove_data(&self, fqn: &Fqn) -> CacheResult<()> {
        self.run(Command::RemoveData { fqn: fqn.clone() })
            .map(|_| ())
    }

    /// Removes the node at `fqn` and its subtree.
    pub fn remove_node(&self, fqn: &Fqn) -> CacheResult<bool> {
        self.run(Command::RemoveNode { fqn: fqn.clone() })
            .map(Reply::into_bool)
    }

    /// Evicts the node at `fqn` from memory on this member only.
    pub fn evict(&self, fqn: &Fqn) -> CacheResult<bool> {
        self.run(Command::Evict { fqn: fqn.clone() })
            .map(Reply::into_bool)
    }
}

/// A local transaction. Dropping it without completing rolls it back.
pub struct Transaction {
    cache: TreeCache,
    gtx: GlobalTransaction,
    local: LocalTxId,
    completed: bool,
}

impl Transaction {
    /// Global identity of the transaction.
    pub fn gtx(&self) -> GlobalTransaction {
        self.gtx
    }

    /// Local identity of the transaction.
    pub fn local(&self) -> LocalTxId {
        self.local
    }

    /// Calls made inside this transaction.
    pub fn cache(&self) -> Invocation<'_> {
        self.with_options(InvocationOptions::default())
    }

    /// Calls with `options` made inside this transaction.
    pub fn with_options(&self, options: InvocationOptions) -> Invocation<'_> {
        Invocation {
            cache: &self.cache,
            options,
            tx: Some((self.gtx, self.local)),
        }
    }

    /// Commits, releasing locks oldest first.
    pub fn commit(self) -> CacheResult<()> {
        self.commit_with_order(ReleaseOrder::Fifo)
    }

    /// Commits, releasing locks in `order`.
    pub fn commit_with_order(mut self, order: ReleaseOrder) -> CacheResult<()> {
        self.complete(Command::Commit { gtx: self.gtx }, order)
    }

    /// Rolls back every change made in the transaction.
    pub fn rollback(mut self) -> CacheResult<()> {
        self.complete(Command::Rollback { gtx: self.gtx }, ReleaseOrder::Fifo)
    }

    fn complete(&mut self, command: Command, order: ReleaseOrder) -> CacheResult<()> {
        self.completed = true;
        let inner = &self.cache.inner;
        let options = InvocationOptions {
            release_order: order,
            ..InvocationOptions::default()
        };
        let mut ctx = InvocationContext::local(options).with_transaction(self.gtx, Some(self.local));
        inner.pipeline.invoke(inner, &mut ctx, command).map(|_| ())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        tracing::debug!(gtx = %self.gtx, "transaction dropped without completion, rolling back");
        if let Err(e) = self.complete(Command::Rollback { gtx: self.gtx }, ReleaseOrder::Fifo) {
            tracing::warn!(gtx = %self.gtx, error = %e, "rollback on drop failed");
        }
    }
}
