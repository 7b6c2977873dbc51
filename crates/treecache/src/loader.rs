//! Backing store consulted on cache misses and written on eviction.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::CacheResult;
use crate::fqn::{Fqn, Segment};
use crate::node::DataMap;

/// Persistent store behind the cache.
pub trait CacheLoader: Send + Sync {
    /// Data stored for `fqn`, or `None` if the node is not stored.
    fn get(&self, fqn: &Fqn) -> CacheResult<Option<DataMap>>;

    /// True if the node is stored.
    fn exists(&self, fqn: &Fqn) -> CacheResult<bool>;

    /// Names of the stored children of `fqn`.
    fn children_names(&self, fqn: &Fqn) -> CacheResult<BTreeSet<Segment>>;

    /// Merges `data` into the stored node, creating it (and its ancestors)
    /// if needed.
    fn put(&self, fqn: &Fqn, data: DataMap) -> CacheResult<()>;

    /// Stores one value, returning the previous one.
    fn put_key(&self, fqn: &Fqn, key: &str, value: &str) -> CacheResult<Option<String>>;

    /// Removes one value, returning it.
    fn remove_key(&self, fqn: &Fqn, key: &str) -> CacheResult<Option<String>>;

    /// Clears the stored node's data but keeps the node.
    fn remove_data(&self, fqn: &Fqn) -> CacheResult<()>;

    /// Removes the stored node and its whole subtree.
    fn remove(&self, fqn: &Fqn) -> CacheResult<()>;
}

/// Store kept in a sorted map, so subtrees are contiguous ranges.
#[derive(Default)]
pub struct InMemoryCacheLoader {
    nodes: RwLock<BTreeMap<Fqn, DataMap>>,
}

impl InMemoryCacheLoader {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn ensure_ancestors(nodes: &mut BTreeMap<Fqn, DataMap>, fqn: &Fqn) {
        for len in 1..fqn.len() {
            nodes.entry(fqn.prefix(len)).or_default();
        }
    }

    fn subtree(nodes: &BTreeMap<Fqn, DataMap>, fqn: &Fqn) -> Vec<Fqn> {
        nodes
            .range((Bound::Included(fqn.clone()), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.is_child_or_equal_to(fqn))
            .cloned()
            .collect()
    }
}

impl CacheLoader for InMemoryCacheLoader {
    fn get(&self, fqn: &Fqn) -> CacheResult<Option<DataMap>> {
        Ok(self.nodes.read().get(fqn).cloned())
    }

    fn exists(&self, fqn: &Fqn) -> CacheResult<bool> {
        Ok(self.nodes.read().contains_key(fqn))
    }

    fn children_names(&self, fqn: &Fqn) -> CacheResult<BTreeSet<Segment>> {
        let nodes = self.nodes.read();
        let depth = fqn.len() + 1;
        Ok(Self::subtree(&nodes, fqn)
            .into_iter()
            .filter(|k| k.len() == depth)
            .filter_map(|k| k.last_segment().cloned())
            .collect())
    }

    fn put(&self, fqn: &Fqn, data: DataMap) -> CacheResult<()> {
        let mut nodes = self.nodes.write();
        Self::ensure_ancestors(&mut nodes, fqn);
        nodes.entry(fqn.clone()).or_default().extend(data);
        Ok(())
    }

    fn put_key(&self, fqn: &Fqn, key: &str, value: &str) -> CacheResult<Option<String>> {
        let mut nodes = self.nodes.write();
        Self::ensure_ancestors(&mut nodes, fqn);
        Ok(nodes
            .entry(fqn.clone())
            .or_default()
            .insert(key.to_string(), value.to_string()))
    }

    fn remove_key(&self, fqn: &Fqn, key: &str) -> CacheResult<Option<String>> {
        Ok(self
            .nodes
            .write()
            .get_mut(fqn)
            .and_then(|d| d.remove(key)))
    }

    fn remove_data(&self, fqn: &Fqn) -> CacheResult<()> {
        if let Some(data) = self.nodes.write().get_mut(fqn) {
            data.clear();
        }
        Ok(())
    }

    fn remove(&self, fqn: &Fqn) -> CacheResult<()> {
        let mut nodes = self.nodes.write();
        for key in Self::subtree(&nodes, fqn) {
            nodes.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(k: &str, v: &str) -> DataMap {
        DataMap::from([(k.to_string(), v.to_string())])
    }

    #[test]
    fn test_put_creates_ancestors() {
        let loader = InMemoryCacheLoader::new();
        loader.put(&Fqn::parse("/a/b/c"), data("k", "v")).unwrap();
        assert!(loader.exists(&Fqn::parse("/a")).unwrap());
        assert!(loader.exists(&Fqn::parse("/a/b")).unwrap());
        assert_eq!(
            loader.get(&Fqn::parse("/a/b/c")).unwrap(),
            Some(data("k", "v"))
        );
        assert_eq!(loader.get(&Fqn::parse("/a")).unwrap(), Some(DataMap::new()));
    }

    #[test]
    fn test_children_names_only_direct() {
        let loader = InMemoryCacheLoader::new();
        loader.put(&Fqn::parse("/a/b/c"), DataMap::new()).unwrap();
        loader.put(&Fqn::parse("/a/d"), DataMap::new()).unwrap();
        loader.put(&Fqn::parse("/ab"), DataMap::new()).unwrap();
        let names = loader.children_names(&Fqn::parse("/a")).unwrap();
        assert_eq!(
            names,
            BTreeSet::from([Segment::from("b"), Segment::from("d")])
        );
    }

    #[test]
    fn test_remove_subtree() {
        let loader = InMemoryCacheLoader::new();
        loader.put(&Fqn::parse("/a/b/c"), DataMap::new()).unwrap();
        loader.put(&Fqn::parse("/x"), DataMap::new()).unwrap();
        loader.remove(&Fqn::parse("/a")).unwrap();
        assert!(!loader.exists(&Fqn::parse("/a/b")).unwrap());
        assert!(loader.exists(&Fqn::parse("/x")).unwrap());
        assert_eq!(loader.len(), 1);
    }

    #[test]
    fn test_key_operations() {
        let loader = InMemoryCacheLoader::new();
        let fqn = Fqn::parse("/a");
        assert_eq!(loader.put_key(&fqn, "k", "1").unwrap(), None);
        assert_eq!(loader.put_key(&fqn, "k", "2").unwrap(), Some("1".into()));
        assert_eq!(loader.remove_key(&fqn, "k").unwrap(), Some("2".into()));
        loader.put_key(&fqn, "x", "y").unwrap();
        loader.remove_data(&fqn).unwrap();
        assert_eq!(loader.get(&fqn).unwrap(), Some(DataMap::new()));
    }
}
