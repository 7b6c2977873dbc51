//! Backing store integration.
//!
//! Misses are filled from the [`CacheLoader`] before the tree is read.
//! Without passivation every applied change is written through to the
//! store; with passivation the store only receives evicted nodes, and nodes
//! leave the store again when they are loaded back.

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::error::CacheResult;
use crate::fqn::Fqn;
use crate::loader::CacheLoader;
use crate::notify::CacheEvent;
use crate::pipeline::{Interceptor, InvocationContext, Next};

/// Loads missing nodes and writes changes to the backing store.
pub struct LoaderInterceptor;

impl Interceptor for LoaderInterceptor {
    fn name(&self) -> &'static str {
        "loader"
    }

    fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let loader = match &cache.loader {
            Some(loader) if !ctx.options.skip_cache_loader => loader.clone(),
            _ => return next.invoke(cache, ctx, command),
        };
        let passivation = cache.config.cache_loader.passivation;

        match &command {
            Command::GetChildrenNames { fqn } => {
                self.load(cache, ctx, &*loader, fqn)?;
                for name in loader.children_names(fqn)? {
                    self.load(cache, ctx, &*loader, &fqn.child(name))?;
                }
            }
            Command::Get { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::Exists { fqn, .. } => self.load(cache, ctx, &*loader, fqn)?,
            // Key-level writes need the stored data in memory first.
            Command::Put { fqn, .. } | Command::RemoveKey { fqn, .. } if passivation => {
                self.load(cache, ctx, &*loader, fqn)?
            }
            Command::Evict { fqn } if passivation => self.passivate(cache, ctx, &*loader, fqn)?,
            _ => {}
        }

        let store = !passivation && (ctx.gtx.is_none() || matches!(command, Command::Commit { .. }));
        let stored = if store { Some(command.clone()) } else { None };
        let reply = next.invoke(cache, ctx, command)?;

        match stored {
            Some(Command::Commit { gtx }) => {
                for modification in cache.txs.modifications(&gtx) {
                    write_through(&*loader, &modification)?;
                }
            }
            Some(command) if command.is_write() => write_through(&*loader, &command)?,
            _ => {}
        }
        Ok(reply)
    }
}

impl LoaderInterceptor {
    /// Brings the stored node at `fqn` into the tree when memory has
    /// nothing for it.
    fn load(
        &self,
        cache: &CacheInner,
        ctx: &InvocationContext,
        loader: &dyn CacheLoader,
        fqn: &Fqn,
    ) -> CacheResult<()> {
        if cache.tree.find_node(fqn, false).is_some_and(|n| n.has_data()) {
            return Ok(());
        }
        let Some(data) = loader.get(fqn)? else {
            return Ok(());
        };
        let passivation = cache.config.cache_loader.passivation;
        let quiet = ctx.options.suppress_notifications || !passivation;
        cache.notifier.around(
            quiet,
            |pre| CacheEvent::NodeActivated {
                fqn: fqn.clone(),
                pre,
            },
            || {
                let node = cache.tree.get_or_create(fqn, |_| {});
                node.put_all(data, false);
                Ok(())
            },
        )?;
        tracing::trace!(%fqn, "loaded node from store");

        if passivation {
            if loader.children_names(fqn)?.is_empty() {
                loader.remove(fqn)?;
            } else {
                loader.remove_data(fqn)?;
            }
        }
        Ok(())
    }

    /// Writes the node at `fqn` to the store ahead of its eviction.
    fn passivate(
        &self,
        cache: &CacheInner,
        ctx: &InvocationContext,
        loader: &dyn CacheLoader,
        fqn: &Fqn,
    ) -> CacheResult<()> {
        let Some(node) = cache.tree.find_node(fqn, false) else {
            return Ok(());
        };
        cache.notifier.around(
            ctx.options.suppress_notifications,
            |pre| CacheEvent::NodePassivated {
                fqn: fqn.clone(),
                pre,
            },
            || {
                loader.remove_data(fqn)?;
                loader.put(fqn, node.data())
            },
        )?;
        tracing::trace!(%fqn, "passivated node");
        Ok(())
    }
}

fn write_through(loader: &dyn CacheLoader, command: &Command) -> CacheResult<()> {
    match command {
        Command::Put { fqn, key, value } => loader.put_key(fqn, key, value).map(|_| ()),
        Command::PutData { fqn, data, erase } => {
            if *erase {
                loader.remove_data(fqn)?;
            }
            loader.put(fqn, data.clone())
        }
        Command::RemoveKey { fqn, key } => loader.remove_key(fqn, key).map(|_| ()),
        Command::RemoveData { fqn } => loader.remove_data(fqn),
        Command::RemoveNode { fqn } => loader.remove(fqn),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TreeCache;
    use std::sync::Arc;
    use crate::config::{CacheConfig, CacheLoaderConfig};
    use crate::loader::InMemoryCacheLoader;
    use crate::notify::RecordingListener;

    fn cache(passivation: bool) -> (TreeCache, Arc<InMemoryCacheLoader>) {
        let loader = Arc::new(InMemoryCacheLoader::new());
        let config = CacheConfig {
            cache_loader: CacheLoaderConfig {
                passivation,
                fetch_persistent_state: false,
            },
            ..CacheConfig::default()
        };
        let cache = TreeCache::builder(config)
            .loader(loader.clone())
            .build()
            .unwrap();
        (cache, loader)
    }

    #[test]
    fn test_write_through_and_load_on_miss() {
        let (cache, loader) = cache(false);
        cache.put(&Fqn::parse("/a/b"), "k", "v").unwrap();
        assert_eq!(loader.get(&Fqn::parse("/a/b")).unwrap().unwrap()["k"], "v");

        assert!(cache.evict(&Fqn::parse("/a/b")).unwrap());
        assert!(!cache.inner().tree.exists(&Fqn::parse("/a/b")));
        assert_eq!(cache.get(&Fqn::parse("/a/b"), "k").unwrap(), Some("v".into()));
    }

    #[test]
    fn test_transaction_written_on_commit_only() {
        let (cache, loader) = cache(false);
        let tx = cache.begin();
        tx.cache().put(&Fqn::parse("/a"), "k", "v").unwrap();
        assert!(loader.get(&Fqn::parse("/a")).unwrap().is_none());
        tx.commit().unwrap();
        assert!(loader.get(&Fqn::parse("/a")).unwrap().is_some());

        let tx = cache.begin();
        tx.cache().remove_node(&Fqn::parse("/a")).unwrap();
        tx.rollback().unwrap();
        assert!(loader.get(&Fqn::parse("/a")).unwrap().is_some());
    }

    #[test]
    fn test_passivation_moves_node_between_memory_and_store() {
        let (cache, loader) = cache(true);
        let listener = Arc::new(RecordingListener::new());
        cache.add_listener(listener.clone());

        cache.put(&Fqn::parse("/a"), "k", "v").unwrap();
        assert!(loader.is_empty());

        cache.evict(&Fqn::parse("/a")).unwrap();
        assert_eq!(loader.get(&Fqn::parse("/a")).unwrap().unwrap()["k"], "v");
        assert!(!cache.inner().tree.exists(&Fqn::parse("/a")));

        assert_eq!(cache.get(&Fqn::parse("/a"), "k").unwrap(), Some("v".into()));
        assert!(loader.get(&Fqn::parse("/a")).unwrap().is_none());

        let events = listener.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, CacheEvent::NodePassivated { pre: false, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, CacheEvent::NodeActivated { pre: false, .. })));
    }

    #[test]
    fn test_skip_cache_loader_option() {
        let (cache, loader) = cache(false);
        loader
            .put_key(&Fqn::parse("/stored"), "k", "v")
            .unwrap();
        let options = crate::pipeline::InvocationOptions {
            skip_cache_loader: true,
            ..Default::default()
        };
        assert_eq!(
            cache.with_options(options).get(&Fqn::parse("/stored"), "k").unwrap(),
            None
        );
        assert_eq!(cache.get(&Fqn::parse("/stored"), "k").unwrap(), Some("v".into()));
    }
}
