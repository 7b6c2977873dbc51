//! Group membership as seen by the cache.
//!
//! Tracks the current view, its coordinator and this member's buddy group,
//! and breaks the locks of transactions whose originating member left.
//! View changes are serialized by a lock-breaking mutex. The view itself
//! sits behind its own mutex, so coordinator and buddy lookups never wait
//! for lock breaking.

use parking_lot::Mutex;
use std::thread;

use crate::cache::CacheInner;
use crate::command::Command;
use crate::lock::LockOwner;
use crate::notify::CacheEvent;
use crate::pipeline::InvocationContext;
use crate::txn_table::ReleaseOrder;
use crate::types::{Address, GlobalTransaction};

#[derive(Debug, Default)]
struct ViewState {
    members: Vec<Address>,
    buddies: Vec<Address>,
}

/// Current membership view.
pub struct Membership {
    local: Address,
    num_buddies: usize,
    state: Mutex<ViewState>,
    breaking: Mutex<()>,
}

impl Membership {
    /// Creates an empty view for `local`.
    pub fn new(local: Address, num_buddies: usize) -> Self {
        Self {
            local,
            num_buddies,
            state: Mutex::new(ViewState::default()),
            breaking: Mutex::new(()),
        }
    }

    /// Members in view order.
    pub fn members(&self) -> Vec<Address> {
        self.state.lock().members.clone()
    }

    /// First member of the view.
    pub fn coordinator(&self) -> Option<Address> {
        self.state.lock().members.first().copied()
    }

    /// True if this member coordinates the group.
    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(self.local)
    }

    /// Members holding backups of this member's data.
    pub fn buddies(&self) -> Vec<Address> {
        self.state.lock().buddies.clone()
    }

    /// Installs `members` and breaks the locks of transactions that
    /// originated on members no longer present.
    pub(crate) fn view_changed(&self, cache: &CacheInner, members: Vec<Address>) {
        let breaking = self.breaking.lock();
        let departed: Vec<Address> = {
            let mut state = self.state.lock();
            let departed = state
                .members
                .iter()
                .copied()
                .filter(|m| !members.contains(m))
                .collect();
            state.buddies = buddies_of(&members, self.local, self.num_buddies);
            state.members = members.clone();
            departed
        };
        tracing::info!(
            members = members.len(),
            coordinator = ?members.first(),
            departed = departed.len(),
            "installed view"
        );

        if !departed.is_empty() {
            break_locks(cache, &departed);
        }
        drop(breaking);

        if let Err(e) = cache.notifier.notify(CacheEvent::ViewChanged { members }) {
            tracing::warn!(error = %e, "view change listener failed");
        }
    }
}

/// The `count` members after `local` in view order, wrapping around.
pub fn buddies_of(members: &[Address], local: Address, count: usize) -> Vec<Address> {
    let Some(pos) = members.iter().position(|m| *m == local) else {
        return Vec::new();
    };
    members
        .iter()
        .cycle()
        .skip(pos + 1)
        .take(members.len().saturating_sub(1))
        .take(count)
        .copied()
        .collect()
}

/// Rolls back or force-releases every transaction that originated on one
/// of `departed`, then releases any lock such a transaction still owns.
fn break_locks(cache: &CacheInner, departed: &[Address]) {
    let orphaned: Vec<GlobalTransaction> = cache
        .txs
        .transactions()
        .into_iter()
        .filter(|gtx| departed.contains(&gtx.address()))
        .collect();
    for gtx in orphaned {
        if !wait_while_completing(cache, gtx) {
            tracing::warn!(%gtx, "transaction still completing, releasing its locks");
        } else if let Some(local) = cache.txs.get_local(&gtx) {
            let mut ctx = InvocationContext::remote().with_transaction(gtx, Some(local));
            ctx.options.cache_mode_local = true;
            match cache.pipeline.invoke(cache, &mut ctx, Command::Rollback { gtx }) {
                Ok(_) => tracing::info!(%gtx, "rolled back transaction of departed member"),
                Err(e) => tracing::warn!(%gtx, error = %e, "rollback of orphaned transaction failed"),
            }
            continue;
        }
        if let Some(entry) = cache.txs.remove(&gtx) {
            let owner = LockOwner::Transaction(gtx);
            for node in entry.lock().take_locks(ReleaseOrder::Fifo) {
                node.release(&owner);
            }
        }
    }

    for node in cache.tree.all_nodes() {
        if !node.has_lock() {
            continue;
        }
        for owner in node.lock().owners() {
            if let LockOwner::Transaction(gtx) = owner {
                if departed.contains(&gtx.address()) {
                    tracing::warn!(fqn = %node.fqn(), %gtx, "breaking lock of departed member");
                    node.release(&owner);
                }
            }
        }
    }
}

/// Waits while `gtx` is committing or rolling back. Returns false if it is
/// still completing after the configured attempts.
fn wait_while_completing(cache: &CacheInner, gtx: GlobalTransaction) -> bool {
    let config = &cache.config.lock_breaking;
    for attempt in 0..config.attempts {
        let completing = match cache.txs.get(&gtx) {
            Some(entry) => entry.lock().status().is_completing(),
            None => return true,
        };
        if !completing {
            return true;
        }
        tracing::debug!(%gtx, attempt, "waiting for completing transaction");
        thread::sleep(std::time::Duration::from_millis(config.retry_interval_ms));
    }
    false
}
