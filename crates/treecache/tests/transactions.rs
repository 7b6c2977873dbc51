//! Transactions on a single member and across the group: isolation,
//! upgrade races, tombstones and the optimistic scheme.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{config, TestCluster};
use treecache::{
    CacheConfig, CacheError, CacheMode, Fqn, IsolationLevel, NodeLockingScheme, ReleaseOrder,
    TreeCache,
};

fn local(config: CacheConfig) -> TreeCache {
    TreeCache::builder(config).build().expect("build cache")
}

#[test]
fn test_rolled_back_overwrite_keeps_committed_value() {
    let cache = local(CacheConfig::default());
    let fqn = Fqn::parse("/a/b");

    let tx = cache.begin();
    tx.cache().put(&fqn, "k", "1").unwrap();
    tx.commit().unwrap();

    let tx = cache.begin();
    tx.cache().put(&fqn, "k", "2").unwrap();
    tx.rollback().unwrap();

    assert_eq!(cache.get(&fqn, "k").unwrap(), Some("1".into()));
}

#[test]
fn test_tombstone_hides_subtree_until_unmarked() {
    let cache = local(CacheConfig::default());
    cache.put(&Fqn::parse("/a/b"), "k", "v").unwrap();

    let tx = cache.begin();
    tx.cache().remove_node(&Fqn::parse("/a")).unwrap();
    assert!(!tx.cache().exists(&Fqn::parse("/a")).unwrap());
    assert!(!tx.cache().exists(&Fqn::parse("/a/b")).unwrap());

    let a = cache.find_node(&Fqn::parse("/a"), true).unwrap();
    let b = cache.find_node(&Fqn::parse("/a/b"), true).unwrap();
    assert!(a.is_marked_for_removal());
    assert!(b.is_marked_for_removal());

    a.unmark_for_removal(false);
    assert!(tx.cache().exists(&Fqn::parse("/a")).unwrap());
    assert!(!tx.cache().exists(&Fqn::parse("/a/b")).unwrap());

    a.unmark_for_removal(true);
    assert!(tx.cache().exists(&Fqn::parse("/a/b")).unwrap());
    tx.rollback().unwrap();
    assert_eq!(cache.get(&Fqn::parse("/a/b"), "k").unwrap(), Some("v".into()));
}

#[test]
fn test_upgrade_race_has_one_winner() {
    let cache = local(CacheConfig {
        lock_acquisition_timeout_ms: 5_000,
        ..CacheConfig::default()
    });
    let fqn = Fqn::parse("/contended");
    cache.put(&fqn, "k", "start").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let fqn = fqn.clone();
            thread::spawn(move || {
                let tx = cache.begin();
                tx.cache().get(&fqn, "k").unwrap();
                barrier.wait();
                match tx.cache().put(&fqn, "k", format!("writer-{}", i)) {
                    Ok(_) => {
                        tx.commit().unwrap();
                        Some(i)
                    }
                    Err(e) => {
                        assert!(
                            matches!(e, CacheError::Locking { .. } | CacheError::Timeout { .. }),
                            "unexpected error: {}",
                            e
                        );
                        tx.rollback().unwrap();
                        None
                    }
                }
            })
        })
        .collect();

    let winners: Vec<usize> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(
        cache.get(&fqn, "k").unwrap(),
        Some(format!("writer-{}", winners[0]))
    );
    assert_eq!(cache.number_of_locks_held(), 0);
}

#[test]
fn test_disjoint_transactions_run_concurrently() {
    let cache = local(CacheConfig {
        lock_acquisition_timeout_ms: 200,
        ..CacheConfig::default()
    });
    let first = cache.begin();
    let second = cache.begin();
    first.cache().put(&Fqn::parse("/left/x"), "k", "1").unwrap();
    second.cache().put(&Fqn::parse("/right/y"), "k", "2").unwrap();
    first.commit().unwrap();
    second.commit_with_order(ReleaseOrder::Lifo).unwrap();
    assert_eq!(cache.number_of_nodes(), 4);
}

#[test]
fn test_write_blocks_other_transaction_until_commit() {
    let cache = local(CacheConfig {
        lock_acquisition_timeout_ms: 100,
        ..CacheConfig::default()
    });
    let fqn = Fqn::parse("/w");
    let writer = cache.begin();
    writer.cache().put(&fqn, "k", "1").unwrap();

    let reader = cache.begin();
    assert!(reader.cache().get(&fqn, "k").unwrap_err().is_timeout());
    writer.commit().unwrap();
    assert_eq!(reader.cache().get(&fqn, "k").unwrap(), Some("1".into()));
    reader.commit().unwrap();
}

#[test]
fn test_read_uncommitted_sees_dirty_value() {
    let cache = local(CacheConfig {
        isolation_level: IsolationLevel::ReadUncommitted,
        lock_acquisition_timeout_ms: 100,
        ..CacheConfig::default()
    });
    let fqn = Fqn::parse("/dirty");
    cache.put(&fqn, "k", "clean").unwrap();

    let writer = cache.begin();
    writer.cache().put(&fqn, "k", "dirty").unwrap();
    assert_eq!(cache.get(&fqn, "k").unwrap(), Some("dirty".into()));
    writer.rollback().unwrap();
    assert_eq!(cache.get(&fqn, "k").unwrap(), Some("clean".into()));
}

#[test]
fn test_peer_forgets_transaction_after_commit() {
    let cluster = TestCluster::new(2, config(CacheMode::ReplSync));
    let tx = cluster.cache(0).begin();
    tx.cache().put(&Fqn::parse("/x"), "k", "v").unwrap();
    let gtx = tx.gtx();
    tx.commit().unwrap();
    assert_eq!(gtx.address(), cluster.cache(0).local_address());
    assert_eq!(cluster.cache(1).transaction_count(), 0);
}

#[test]
fn test_optimistic_transaction_replicates() {
    let optimistic = CacheConfig {
        node_locking_scheme: NodeLockingScheme::Optimistic,
        ..config(CacheMode::ReplSync)
    };
    let cluster = TestCluster::new(2, optimistic);
    let fqn = Fqn::parse("/opt/a");

    let tx = cluster.cache(0).begin();
    tx.cache().put(&fqn, "k", "v").unwrap();
    assert!(!cluster.cache(0).exists(&fqn).unwrap());
    tx.commit().unwrap();

    assert_eq!(cluster.cache(0).get(&fqn, "k").unwrap(), Some("v".into()));
    assert_eq!(cluster.cache(1).get(&fqn, "k").unwrap(), Some("v".into()));
    let node = cluster.cache(1).find_node(&fqn, false).unwrap();
    assert!(node.version().is_some());
}

#[test]
fn test_optimistic_conflict_aborts_later_commit() {
    let cache = local(CacheConfig {
        node_locking_scheme: NodeLockingScheme::Optimistic,
        ..CacheConfig::default()
    });
    let fqn = Fqn::parse("/race");
    cache.put(&fqn, "k", "0").unwrap();

    let first = cache.begin();
    let second = cache.begin();
    first.cache().put(&fqn, "k", "1").unwrap();
    second.cache().put(&fqn, "k", "2").unwrap();
    first.commit().unwrap();
    assert!(matches!(
        second.commit(),
        Err(CacheError::Locking { .. })
    ));

    assert_eq!(cache.get(&fqn, "k").unwrap(), Some("1".into()));
    assert_eq!(cache.transaction_count(), 0);
    assert_eq!(cache.number_of_locks_held(), 0);
}
