//! Region activation and inactivation with partial state transfer.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{config, TestCluster};
use treecache::transport::DeliveryMode;
use treecache::{
    Address, CacheConfig, CacheError, CacheMode, CacheResult, Command, Fqn, GlobalTransaction,
    LocalTransport, MessageHandler, RegionStatus, Reply, Transport, TreeCache,
};

fn inactive_on_startup() -> CacheConfig {
    CacheConfig {
        inactive_on_startup: true,
        ..config(CacheMode::ReplSync)
    }
}

#[test]
fn test_inactivate_then_activate_restores_state() {
    let cluster = TestCluster::new(2, config(CacheMode::ReplSync));
    let (source, target) = (cluster.cache(0), cluster.cache(1));
    let region = Fqn::parse("/r");

    source.put(&Fqn::parse("/r/a"), "k", "1").unwrap();
    assert!(target.exists(&Fqn::parse("/r/a")).unwrap());

    target.inactivate_region(&region).unwrap();
    assert_eq!(target.region_status(&region), RegionStatus::Inactive);
    assert!(!target.exists(&region).unwrap());

    source.put(&Fqn::parse("/r/b"), "k", "2").unwrap();
    assert!(!target.exists(&Fqn::parse("/r/b")).unwrap());

    target.activate_region(&region).unwrap();
    assert_eq!(target.region_status(&region), RegionStatus::Active);
    assert_eq!(target.get(&Fqn::parse("/r/a"), "k").unwrap(), Some("1".into()));
    assert_eq!(target.get(&Fqn::parse("/r/b"), "k").unwrap(), Some("2".into()));

    source.put(&Fqn::parse("/r/c"), "k", "3").unwrap();
    assert!(target.exists(&Fqn::parse("/r/c")).unwrap());
}

#[test]
fn test_activate_populated_region_fails_without_changes() {
    let cluster = TestCluster::new(2, inactive_on_startup());
    let cache = cluster.cache(0);
    let options = treecache::InvocationOptions {
        cache_mode_local: true,
        ..Default::default()
    };
    cache.with_options(options).put(&Fqn::parse("/full/x"), "k", "v").unwrap();
    let before = cache.print_details();

    let err = cache.activate_region(&Fqn::parse("/full")).unwrap_err();
    assert!(matches!(err, CacheError::RegionNotEmpty { .. }));
    assert_eq!(cache.print_details(), before);
    assert_ne!(cache.region_status(&Fqn::parse("/full")), RegionStatus::Active);
}

#[test]
fn test_inactive_on_startup_drops_replication_until_activated() {
    let cluster = TestCluster::new(2, inactive_on_startup());
    let (source, target) = (cluster.cache(0), cluster.cache(1));
    let region = Fqn::parse("/shared");

    source.activate_region(&region).unwrap();
    source.put(&Fqn::parse("/shared/a"), "k", "v").unwrap();
    assert!(!target.exists(&Fqn::parse("/shared/a")).unwrap());

    target.activate_region(&region).unwrap();
    assert_eq!(target.get(&Fqn::parse("/shared/a"), "k").unwrap(), Some("v".into()));

    source.put(&Fqn::parse("/shared/b"), "k", "w").unwrap();
    assert_eq!(target.get(&Fqn::parse("/shared/b"), "k").unwrap(), Some("w".into()));
}

#[test]
fn test_state_of_inactive_source_is_not_shared() {
    let cluster = TestCluster::new(2, inactive_on_startup());
    let options = treecache::InvocationOptions {
        cache_mode_local: true,
        ..Default::default()
    };
    cluster
        .cache(0)
        .with_options(options)
        .put(&Fqn::parse("/private/a"), "k", "v")
        .unwrap();

    cluster.cache(1).activate_region(&Fqn::parse("/private")).unwrap();
    assert!(!cluster.cache(1).exists(&Fqn::parse("/private/a")).unwrap());
    assert_eq!(
        cluster.cache(1).region_status(&Fqn::parse("/private")),
        RegionStatus::Active
    );
}

#[test]
fn test_activating_active_region_is_a_no_op() {
    let cluster = TestCluster::new(2, inactive_on_startup());
    let region = Fqn::parse("/twice");
    cluster.cache(0).activate_region(&region).unwrap();
    cluster.cache(0).put(&Fqn::parse("/twice/a"), "k", "v").unwrap();
    cluster.cache(0).activate_region(&region).unwrap();
    assert!(cluster.cache(0).exists(&Fqn::parse("/twice/a")).unwrap());
}

#[test]
fn test_overlapping_region_registration_conflicts() {
    let cluster = TestCluster::new(1, config(CacheMode::ReplSync));
    let cache = cluster.cache(0);
    cache
        .register_region(&Fqn::parse("/outer"), Some("scope-a".into()))
        .unwrap();
    let err = cache
        .register_region(&Fqn::parse("/outer/inner"), Some("scope-b".into()))
        .unwrap_err();
    assert!(matches!(err, CacheError::RegionNameConflict { .. }));
}

#[test]
fn test_inactivation_evicts_buddy_backups() {
    let buddy = CacheConfig {
        buddy_replication: treecache::BuddyReplicationConfig {
            enabled: true,
            num_buddies: 1,
        },
        ..config(CacheMode::ReplSync)
    };
    let cluster = TestCluster::new(2, buddy);
    let (owner, holder) = (cluster.cache(0), cluster.cache(1));
    let fqn = Fqn::parse("/b/data");
    owner.put(&fqn, "k", "v").unwrap();

    let backup = Fqn::from_relative(&owner.buddy_backup_root(), &fqn);
    assert!(holder.exists(&backup).unwrap());

    holder.inactivate_region(&Fqn::parse("/b")).unwrap();
    assert!(!holder.exists(&backup).unwrap());
}

fn put(path: &str, value: &str) -> Command {
    Command::Put {
        fqn: Fqn::parse(path),
        key: "k".into(),
        value: value.into(),
    }
}

fn prepare(gtx: GlobalTransaction, path: &str, value: &str) -> Command {
    Command::Prepare {
        gtx,
        modifications: vec![put(path, value)],
        origin: gtx.address(),
        one_phase: false,
    }
}

/// Peer that answers a state request by first sending replication traffic
/// for the region being activated, then reporting that it has no state.
struct BusyPeer {
    transport: Arc<LocalTransport>,
    activating: TreeCache,
    visible_while_queuing: Mutex<Option<bool>>,
}

impl MessageHandler for BusyPeer {
    fn handle(&self, _from: Address, command: Command) -> CacheResult<Reply> {
        if !matches!(command, Command::GetPartialState { .. }) {
            return Ok(Reply::Unit);
        }
        let origin = self.transport.local_address();
        let committed = GlobalTransaction::new(origin, 1);
        let abandoned = GlobalTransaction::new(origin, 2);
        let stray = GlobalTransaction::new(origin, 3);
        let traffic = vec![
            put("/r/a", "1"),
            put("/r/a", "2"),
            put("/r/a", "3"),
            prepare(committed, "/r/b", "tx"),
            Command::Commit { gtx: committed },
            prepare(abandoned, "/r/c", "lost"),
            Command::Commit { gtx: stray },
        ];
        let target = [self.activating.local_address()];
        for command in &traffic {
            self.transport
                .send(Some(&target), command, DeliveryMode::Sync, Duration::from_secs(1))?;
        }
        let visible = self.activating.exists(&Fqn::parse("/r/a"))?;
        *self.visible_while_queuing.lock().unwrap() = Some(visible);
        Ok(Reply::State(None))
    }

    fn view_accepted(&self, _members: Vec<Address>) {}
}

#[test]
fn test_traffic_during_activation_is_queued_then_replayed() {
    let cluster = TestCluster::new(1, inactive_on_startup());
    let cache = cluster.cache(0);
    let region = Fqn::parse("/r");

    let transport = cluster.group.transport();
    let peer = Arc::new(BusyPeer {
        transport: transport.clone(),
        activating: cache.clone(),
        visible_while_queuing: Mutex::new(None),
    });
    let handler: Arc<dyn MessageHandler> = peer.clone();
    transport.connect(Arc::downgrade(&handler)).unwrap();
    assert_eq!(cache.members().len(), 2);

    cache.activate_region(&region).unwrap();

    assert_eq!(*peer.visible_while_queuing.lock().unwrap(), Some(false));
    assert_eq!(cache.region_status(&region), RegionStatus::Active);
    assert_eq!(cache.get(&Fqn::parse("/r/a"), "k").unwrap(), Some("3".into()));
    assert_eq!(cache.get(&Fqn::parse("/r/b"), "k").unwrap(), Some("tx".into()));
    assert!(!cache.exists(&Fqn::parse("/r/c")).unwrap());
    assert_eq!(cache.transaction_count(), 0);
    assert_eq!(cache.number_of_locks_held(), 0);
}
