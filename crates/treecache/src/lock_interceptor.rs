//! Pessimistic node locking.
//!
//! Reads take read locks on the path down to the target. Writes read-lock
//! ancestors and write-lock the target, creating missing nodes on the way
//! while holding the locks that guard them. Removal write-locks the whole
//! subtree. Locks belong to the transaction when there is one, otherwise to
//! the calling thread for the duration of the call.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::error::CacheResult;
use crate::fqn::Fqn;
use crate::lock::{LockOwner, LockType};
use crate::node::TreeNode;
use crate::pipeline::{ensure_child, record_locks, revive_if_removed, Interceptor, InvocationContext, Next};

/// Acquires node locks before a command reaches the tree.
pub struct LockInterceptor;

impl Interceptor for LockInterceptor {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let timeout = ctx
            .options
            .lock_timeout
            .unwrap_or_else(|| cache.config.lock_timeout());
        let owner = ctx.owner();
        let mut acquired = Vec::new();

        let locked = match &command {
            Command::Get { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::Exists { fqn, .. } => lock_path(cache, fqn, owner, LockType::Read, timeout, &mut acquired),
            Command::Put { fqn, .. } | Command::PutData { fqn, .. } => {
                lock_for_write(cache, ctx, fqn, owner, timeout, &mut acquired)
            }
            Command::RemoveKey { fqn, .. } | Command::RemoveData { fqn } | Command::Evict { fqn } => {
                lock_path(cache, fqn, owner, LockType::Write, timeout, &mut acquired)
            }
            Command::RemoveNode { fqn } => lock_for_removal(cache, fqn, owner, timeout, &mut acquired),
            _ => Ok(()),
        };
        // Locks taken before a failure are still owned; recording them lets
        // the transaction or the call release them.
        record_locks(cache, ctx, acquired)?;

        if let Err(e) = locked {
            if e.is_timeout() && ctx.options.fail_silently && command.is_write() {
                tracing::debug!(command = command.name(), error = %e, "lock timeout ignored");
                return Ok(Reply::Unit);
            }
            return Err(e);
        }
        next.invoke(cache, ctx, command)
    }
}

fn take(
    node: &Arc<TreeNode>,
    owner: LockOwner,
    lock_type: LockType,
    timeout: Duration,
    acquired: &mut Vec<Arc<TreeNode>>,
) -> CacheResult<()> {
    if node.acquire(owner, lock_type, timeout)? {
        acquired.push(node.clone());
    }
    Ok(())
}

/// Read-locks every existing ancestor of `fqn` and locks the target with
/// `target_type`. Tombstoned nodes are locked like live ones so callers
/// wait for the transaction that removed them.
fn lock_path(
    cache: &CacheInner,
    fqn: &Fqn,
    owner: LockOwner,
    target_type: LockType,
    timeout: Duration,
    acquired: &mut Vec<Arc<TreeNode>>,
) -> CacheResult<()> {
    let mut node = cache.tree.root().clone();
    for name in fqn.segments() {
        take(&node, owner, LockType::Read, timeout, acquired)?;
        node = match node.child(name) {
            Some(child) => child,
            None => return Ok(()),
        };
    }
    take(&node, owner, target_type, timeout, acquired)
}

/// Locks the path to `fqn` for a write, creating missing nodes.
fn lock_for_write(
    cache: &CacheInner,
    ctx: &InvocationContext,
    fqn: &Fqn,
    owner: LockOwner,
    timeout: Duration,
    acquired: &mut Vec<Arc<TreeNode>>,
) -> CacheResult<()> {
    let segments = fqn.segments();
    let mut node = cache.tree.root().clone();
    let root_type = if segments.is_empty() {
        LockType::Write
    } else {
        LockType::Read
    };
    take(&node, owner, root_type, timeout, acquired)?;

    for (depth, name) in segments.iter().enumerate() {
        let target = depth + 1 == segments.len();
        let child = loop {
            let inserting = node.child(name).map_or(true, |c| c.is_marked_for_removal());
            if inserting && cache.config.lock_parent_for_child_insert_remove {
                take(&node, owner, LockType::Write, timeout, acquired)?;
            }
            let child = ensure_child(cache, ctx, &node, name)?;
            let lock_type = if target || child.is_marked_for_removal() {
                LockType::Write
            } else {
                LockType::Read
            };
            take(&child, owner, lock_type, timeout, acquired)?;

            let attached = node.child(name).is_some_and(|c| Arc::ptr_eq(&c, &child));
            if attached {
                break child;
            }
            // Reaped by a committing transaction while we waited.
            if let Some(pos) = acquired.iter().rposition(|n| Arc::ptr_eq(n, &child)) {
                acquired.remove(pos);
                child.release(&owner);
            }
        };
        if child.is_marked_for_removal() {
            take(&child, owner, LockType::Write, timeout, acquired)?;
            revive_if_removed(cache, ctx, &child)?;
        }
        node = child;
    }
    Ok(())
}

/// Read-locks the ancestors of `fqn` and write-locks its whole subtree.
fn lock_for_removal(
    cache: &CacheInner,
    fqn: &Fqn,
    owner: LockOwner,
    timeout: Duration,
    acquired: &mut Vec<Arc<TreeNode>>,
) -> CacheResult<()> {
    let mut node = cache.tree.root().clone();
    let segments = fqn.segments();
    for (depth, name) in segments.iter().enumerate() {
        let parent_type = if depth + 1 == segments.len() && cache.config.lock_parent_for_child_insert_remove {
            LockType::Write
        } else {
            LockType::Read
        };
        take(&node, owner, parent_type, timeout, acquired)?;
        node = match node.child(name) {
            Some(child) => child,
            None => return Ok(()),
        };
    }
    acquired.extend(node.acquire_all(owner, LockType::Write, timeout)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TreeCache;
    use crate::config::CacheConfig;
    use crate::error::CacheError;
    use std::sync::Barrier;
    use std::thread;

    fn cache(timeout_ms: u64) -> TreeCache {
        let config = CacheConfig {
            lock_acquisition_timeout_ms: timeout_ms,
            ..CacheConfig::default()
        };
        TreeCache::builder(config).build().unwrap()
    }

    #[test]
    fn test_thread_locks_released_after_call() {
        let cache = cache(100);
        cache.put(&Fqn::parse("/a/b"), "k", "v").unwrap();
        assert_eq!(cache.number_of_locks_held(), 0);
    }

    #[test]
    fn test_transaction_holds_write_lock_until_commit() {
        let cache = cache(100);
        let tx = cache.begin();
        tx.cache().put(&Fqn::parse("/a"), "k", "v").unwrap();
        let a = cache.inner().tree.find_node(&Fqn::parse("/a"), false).unwrap();
        assert!(a.lock().is_write_locked());
        tx.commit().unwrap();
        assert!(!a.lock().is_locked());
    }

    #[test]
    fn test_same_node_write_times_out() {
        let cache = cache(50);
        let tx = cache.begin();
        tx.cache().put(&Fqn::parse("/a"), "k", "1").unwrap();

        let other = cache.clone();
        let result = thread::spawn(move || other.put(&Fqn::parse("/a"), "k", "2"))
            .join()
            .unwrap();
        match result {
            Err(CacheError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        tx.commit().unwrap();
        assert_eq!(cache.get(&Fqn::parse("/a"), "k").unwrap(), Some("1".into()));
    }

    #[test]
    fn test_disjoint_writers_do_not_block() {
        let cache = cache(2_000);
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["/x/one", "/x/two"]
            .into_iter()
            .map(|path| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let tx = cache.begin();
                    tx.cache().put(&Fqn::parse(path), "k", "v").unwrap();
                    barrier.wait();
                    tx.commit().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            cache.children_names(&Fqn::parse("/x")).unwrap().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_fail_silently_swallows_timeout() {
        let cache = cache(30);
        let tx = cache.begin();
        tx.cache().put(&Fqn::parse("/a"), "k", "1").unwrap();
        let other = cache.clone();
        let result = thread::spawn(move || {
            let options = crate::pipeline::InvocationOptions {
                fail_silently: true,
                ..Default::default()
            };
            other.with_options(options).put(&Fqn::parse("/a"), "k", "2")
        })
        .join()
        .unwrap();
        assert_eq!(result.unwrap(), None);
        tx.rollback().unwrap();
    }

    #[test]
    fn test_removal_locks_subtree() {
        let cache = cache(100);
        cache.put(&Fqn::parse("/a/b/c"), "k", "v").unwrap();
        let tx = cache.begin();
        assert!(tx.cache().remove_node(&Fqn::parse("/a/b")).unwrap());
        let c = cache
            .inner()
            .tree
            .find_node(&Fqn::parse("/a/b/c"), true)
            .unwrap();
        assert!(c.lock().is_write_locked());
        assert!(c.is_marked_for_removal());
        tx.commit().unwrap();
        assert!(cache.inner().tree.find_node(&Fqn::parse("/a/b"), true).is_none());
    }
}
