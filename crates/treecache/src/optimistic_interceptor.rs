//! Optimistic locking stage.
//!
//! Transactional reads and writes are served from the transaction's
//! [`Workspace`](crate::optimistic::Workspace); the tree is only touched at
//! prepare (lock and validate) and commit (apply).

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::error::CacheResult;
use crate::fqn::Fqn;
use crate::notify::CacheEvent;
use crate::optimistic::AppliedChange;
use crate::pipeline::{record_locks, Interceptor, InvocationContext, Next};
use crate::txn_table::EntryRef;

/// Routes transactional commands through per-transaction workspaces.
pub struct OptimisticInterceptor;

impl Interceptor for OptimisticInterceptor {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let Some(gtx) = ctx.gtx else {
            return next.invoke(cache, ctx, command);
        };
        let entry = cache.txs.entry(&gtx)?;
        let tree = &cache.tree;

        if let Some(fqn) = command.fqn() {
            if command.is_read() && self.needs_load(cache, ctx, &entry, fqn) {
                return next.invoke(cache, ctx, command);
            }
        }

        match command {
            Command::Get { fqn, key } => {
                Ok(Reply::Value(entry.lock().workspace_mut().get(tree, &fqn, &key)))
            }
            Command::GetData { fqn } => Ok(Reply::Data(
                entry
                    .lock()
                    .workspace_mut()
                    .load(tree, &fqn)
                    .map(|n| n.data().clone()),
            )),
            Command::GetKeys { fqn } => Ok(Reply::Keys(
                entry
                    .lock()
                    .workspace_mut()
                    .load(tree, &fqn)
                    .map(|n| n.data().keys().cloned().collect()),
            )),
            Command::GetChildrenNames { fqn } => Ok(Reply::Names(
                entry.lock().workspace_mut().children_names(tree, &fqn),
            )),
            Command::Exists { fqn, key } => {
                let mut entry = entry.lock();
                let exists = match entry.workspace_mut().load(tree, &fqn) {
                    Some(node) => key.map_or(true, |k| node.data().contains_key(&k)),
                    None => false,
                };
                Ok(Reply::Bool(exists))
            }
            Command::Put { fqn, key, value } => {
                let mut entry = entry.lock();
                let node = entry.workspace_mut().write(tree, &fqn);
                Ok(Reply::Value(node.data_mut().insert(key, value)))
            }
            Command::PutData { fqn, data, erase } => {
                let mut entry = entry.lock();
                let node = entry.workspace_mut().write(tree, &fqn).data_mut();
                if erase {
                    node.clear();
                }
                node.extend(data);
                Ok(Reply::Unit)
            }
            Command::RemoveKey { fqn, key } => {
                let mut entry = entry.lock();
                let ws = entry.workspace_mut();
                if ws.load(tree, &fqn).is_none() {
                    return Ok(Reply::Value(None));
                }
                Ok(Reply::Value(ws.write(tree, &fqn).data_mut().remove(&key)))
            }
            Command::RemoveData { fqn } => {
                let mut entry = entry.lock();
                let ws = entry.workspace_mut();
                if ws.load(tree, &fqn).is_some() {
                    ws.write(tree, &fqn).data_mut().clear();
                }
                Ok(Reply::Unit)
            }
            Command::RemoveNode { fqn } => {
                Ok(Reply::Bool(entry.lock().workspace_mut().delete(tree, &fqn)))
            }
            Command::Prepare { .. } => {
                let workspace = entry.lock().workspace().clone();
                let timeout = ctx
                    .options
                    .lock_timeout
                    .unwrap_or_else(|| cache.config.lock_timeout());
                let locked = workspace.prepare(tree, ctx.owner(), timeout)?;
                record_locks(cache, ctx, locked)?;
                next.invoke(cache, ctx, command)
            }
            Command::Commit { .. } => {
                let workspace = std::mem::take(entry.lock().workspace_mut());
                let applied = workspace.apply(tree);
                tracing::debug!(%gtx, changes = applied.len(), "applied workspace");
                if !ctx.options.suppress_notifications {
                    for (fqn, change) in applied {
                        self.announce(cache, ctx, fqn, change);
                    }
                }
                next.invoke(cache, ctx, command)
            }
            Command::Rollback { .. } => {
                entry.lock().workspace_mut().clear();
                next.invoke(cache, ctx, command)
            }
            command => next.invoke(cache, ctx, command),
        }
    }
}

impl OptimisticInterceptor {
    /// True when a read should go to the backing store first: the
    /// transaction has no copy and the tree has no node.
    fn needs_load(&self, cache: &CacheInner, ctx: &InvocationContext, entry: &EntryRef, fqn: &Fqn) -> bool {
        cache.loader.is_some()
            && !ctx.options.skip_cache_loader
            && entry.lock().workspace().peek(fqn).is_none()
            && !cache.tree.exists(fqn)
    }

    fn announce(&self, cache: &CacheInner, ctx: &InvocationContext, fqn: Fqn, change: AppliedChange) {
        let origin_local = ctx.origin_local;
        let event = match change {
            AppliedChange::Created => CacheEvent::NodeCreated {
                fqn,
                pre: false,
                origin_local,
            },
            AppliedChange::Modified => CacheEvent::NodeModified {
                fqn,
                pre: false,
                origin_local,
            },
            AppliedChange::Removed => CacheEvent::NodeRemoved {
                fqn,
                pre: false,
                origin_local,
            },
        };
        // Post events cannot veto; failures are logged by the notifier.
        let _ = cache.notifier.notify(event);
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::TreeCache;
    use crate::config::{CacheConfig, NodeLockingScheme};
    use crate::error::CacheError;
    use crate::fqn::Fqn;

    fn cache() -> TreeCache {
        let config = CacheConfig {
            node_locking_scheme: NodeLockingScheme::Optimistic,
            lock_acquisition_timeout_ms: 100,
            ..CacheConfig::default()
        };
        TreeCache::builder(config).build().unwrap()
    }

    #[test]
    fn test_transaction_reads_its_own_writes() {
        let cache = cache();
        let tx = cache.begin();
        tx.cache().put(&Fqn::parse("/a"), "k", "v").unwrap();
        assert_eq!(tx.cache().get(&Fqn::parse("/a"), "k").unwrap(), Some("v".into()));
        assert_eq!(cache.get(&Fqn::parse("/a"), "k").unwrap(), None);
        tx.commit().unwrap();
        assert_eq!(cache.get(&Fqn::parse("/a"), "k").unwrap(), Some("v".into()));
        assert_eq!(cache.number_of_locks_held(), 0);
    }

    #[test]
    fn test_conflicting_commit_fails() {
        let cache = cache();
        cache.put(&Fqn::parse("/a"), "k", "0").unwrap();

        let first = cache.begin();
        let second = cache.begin();
        first.cache().put(&Fqn::parse("/a"), "k", "1").unwrap();
        second.cache().put(&Fqn::parse("/a"), "k", "2").unwrap();
        first.commit().unwrap();
        match second.commit() {
            Err(CacheError::Locking { .. }) => {}
            other => panic!("expected Locking, got {:?}", other),
        }
        assert_eq!(cache.get(&Fqn::parse("/a"), "k").unwrap(), Some("1".into()));
        assert_eq!(cache.transaction_count(), 0);
    }

    #[test]
    fn test_non_transactional_write_applies_immediately() {
        let cache = cache();
        cache.put(&Fqn::parse("/a/b"), "k", "v").unwrap();
        let node = cache.inner().tree.find_node(&Fqn::parse("/a/b"), false).unwrap();
        assert_eq!(node.version(), Some(1));
        assert!(cache.remove_node(&Fqn::parse("/a")).unwrap());
        assert!(!cache.exists(&Fqn::parse("/a")).unwrap());
    }

    #[test]
    fn test_rollback_discards_workspace() {
        let cache = cache();
        let tx = cache.begin();
        tx.cache().put(&Fqn::parse("/a"), "k", "v").unwrap();
        tx.rollback().unwrap();
        assert!(!cache.exists(&Fqn::parse("/a")).unwrap());
    }
}
