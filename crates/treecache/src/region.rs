//! Regions: subtrees that are activated and inactivated independently.
//!
//! While a region is activating it queues inbound replication so that
//! nothing is lost between the state snapshot and the switch to active.

use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::command::Command;
use crate::error::{CacheError, CacheResult};
use crate::fqn::{Fqn, Segment};
use crate::types::{Address, GlobalTransaction};

/// Root of the subtrees holding buddy backups.
pub const BUDDY_BACKUP_ROOT: &str = "_BUDDY_BACKUP_";

/// Path under which `owner`'s data is backed up.
pub fn buddy_backup_root(owner: Address) -> Fqn {
    Fqn::from_segments([
        Segment::from(BUDDY_BACKUP_ROOT),
        Segment::from(owner.to_string()),
    ])
}

/// Strips a buddy backup prefix, returning the path as its owner sees it.
pub fn strip_buddy_backup(fqn: &Fqn) -> Fqn {
    match fqn.get(0) {
        Ok(first) if first.as_str() == Some(BUDDY_BACKUP_ROOT) && fqn.len() >= 2 => {
            Fqn::from_segments(fqn.segments()[2..].iter().cloned())
        }
        _ => fqn.clone(),
    }
}

/// Activation state of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionStatus {
    /// Replication for the subtree is ignored.
    Inactive,
    /// State is being fetched; replication is queued.
    Queuing,
    /// Replication is applied.
    Active,
}

/// A registered region.
#[derive(Clone, Debug)]
pub struct Region {
    fqn: Fqn,
    status: RegionStatus,
    scope: Option<String>,
    queue: Vec<(Address, Command)>,
}

impl Region {
    fn new(fqn: Fqn, status: RegionStatus) -> Self {
        Self {
            fqn,
            status,
            scope: None,
            queue: Vec::new(),
        }
    }

    /// Root of the region.
    pub fn fqn(&self) -> &Fqn {
        &self.fqn
    }

    /// Current status.
    pub fn status(&self) -> RegionStatus {
        self.status
    }

    /// Serialization scope name associated with the region.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Number of queued messages.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// What to do with an inbound replicated command.
#[derive(Debug, PartialEq, Eq)]
pub enum Gate {
    /// Apply it now.
    Apply,
    /// It was queued for the activating region.
    Queued,
    /// The region is inactive; ignore it.
    Drop,
}

/// Registry of regions keyed by root path.
pub struct RegionManager {
    regions: Mutex<BTreeMap<Fqn, Region>>,
    inactive_on_startup: bool,
}

impl RegionManager {
    /// Creates an empty registry. When `inactive_on_startup` is set, paths
    /// outside any region are treated as inactive.
    pub fn new(inactive_on_startup: bool) -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            inactive_on_startup,
        }
    }

    /// Status given to paths not covered by a region.
    pub fn default_status(&self) -> RegionStatus {
        if self.inactive_on_startup {
            RegionStatus::Inactive
        } else {
            RegionStatus::Active
        }
    }

    /// Registers a region. Fails if it overlaps a different region.
    pub fn register(&self, fqn: &Fqn, scope: Option<String>) -> CacheResult<()> {
        let mut regions = self.regions.lock();
        if let Some(existing) = regions.get_mut(fqn) {
            if scope.is_some() {
                existing.scope = scope;
            }
            return Ok(());
        }
        if let Some(existing) = regions
            .keys()
            .find(|r| fqn.is_child_of(r) || r.is_child_of(fqn))
        {
            return Err(CacheError::RegionNameConflict {
                fqn: fqn.clone(),
                existing: existing.clone(),
            });
        }
        let mut region = Region::new(fqn.clone(), self.default_status());
        region.scope = scope;
        tracing::debug!(%fqn, status = ?region.status, "registered region");
        regions.insert(fqn.clone(), region);
        Ok(())
    }

    /// Returns the region rooted exactly at `fqn`, registering it if needed.
    pub fn get_or_create(&self, fqn: &Fqn) -> CacheResult<Region> {
        self.register(fqn, None)?;
        self.get(fqn)
            .ok_or_else(|| CacheError::IllegalState(format!("region {} vanished", fqn)))
    }

    /// Region rooted exactly at `fqn`.
    pub fn get(&self, fqn: &Fqn) -> Option<Region> {
        self.regions.lock().get(fqn).cloned()
    }

    /// Unregisters a region, dropping anything it queued.
    pub fn remove(&self, fqn: &Fqn) -> Option<Region> {
        self.regions.lock().remove(fqn)
    }

    /// All regions in path order.
    pub fn regions(&self) -> Vec<Region> {
        self.regions.lock().values().cloned().collect()
    }

    /// Nearest region containing `fqn` (itself or an ancestor).
    pub fn region_for(&self, fqn: &Fqn) -> Option<Region> {
        let regions = self.regions.lock();
        Self::find(&regions, fqn).cloned()
    }

    fn find<'a>(regions: &'a BTreeMap<Fqn, Region>, fqn: &Fqn) -> Option<&'a Region> {
        (0..=fqn.len())
            .rev()
            .find_map(|len| regions.get(&fqn.prefix(len)))
    }

    /// Status of the region containing `fqn`.
    pub fn status_of(&self, fqn: &Fqn) -> RegionStatus {
        self.region_for(fqn)
            .map(|r| r.status)
            .unwrap_or_else(|| self.default_status())
    }

    /// True if commands for `fqn` are applied.
    pub fn is_active(&self, fqn: &Fqn) -> bool {
        self.status_of(fqn) == RegionStatus::Active
    }

    /// Sets the status of a registered region.
    pub fn set_status(&self, fqn: &Fqn, status: RegionStatus) -> CacheResult<()> {
        let mut regions = self.regions.lock();
        let region = regions
            .get_mut(fqn)
            .ok_or_else(|| CacheError::IllegalState(format!("no region at {}", fqn)))?;
        tracing::debug!(%fqn, from = ?region.status, to = ?status, "region status change");
        region.status = status;
        if status == RegionStatus::Inactive {
            region.queue.clear();
        }
        Ok(())
    }

    /// Decides whether an inbound command for `fqn` is applied, queued or
    /// dropped. Buddy backup paths are judged by their owner's path.
    pub fn gate(&self, from: Address, fqn: &Fqn, command: &Command) -> Gate {
        let fqn = strip_buddy_backup(fqn);
        let mut regions = self.regions.lock();
        let root = match Self::find(&regions, &fqn) {
            Some(region) => region.fqn.clone(),
            None => {
                return match self.default_status() {
                    RegionStatus::Active => Gate::Apply,
                    _ => Gate::Drop,
                }
            }
        };
        let Some(region) = regions.get_mut(&root) else {
            return Gate::Drop;
        };
        match region.status {
            RegionStatus::Active => Gate::Apply,
            RegionStatus::Inactive => Gate::Drop,
            RegionStatus::Queuing => {
                region.queue.push((from, command.clone()));
                Gate::Queued
            }
        }
    }

    /// Queues a commit or rollback behind its prepare when that prepare is
    /// waiting in a queuing region. Returns true if it was queued.
    pub fn queue_outcome(&self, from: Address, gtx: GlobalTransaction, command: &Command) -> bool {
        let mut regions = self.regions.lock();
        let holder = regions.values_mut().find(|r| {
            r.status == RegionStatus::Queuing
                && r.queue
                    .iter()
                    .any(|(_, c)| matches!(c, Command::Prepare { gtx: g, .. } if *g == gtx))
        });
        match holder {
            Some(region) => {
                region.queue.push((from, command.clone()));
                true
            }
            None => false,
        }
    }

    /// Takes the queued messages of a queuing region. When the queue is
    /// already empty the region flips to active in the same step, so no
    /// message can slip in between the final drain and activation.
    pub fn drain_or_activate(&self, fqn: &Fqn) -> CacheResult<Vec<(Address, Command)>> {
        let mut regions = self.regions.lock();
        let region = regions
            .get_mut(fqn)
            .ok_or_else(|| CacheError::IllegalState(format!("no region at {}", fqn)))?;
        if region.queue.is_empty() {
            region.status = RegionStatus::Active;
            tracing::debug!(%fqn, "region active");
            return Ok(Vec::new());
        }
        Ok(std::mem::take(&mut region.queue))
    }
}

/// Filters a drained queue: prepares whose outcome was not queued are
/// dropped, and so are commits or rollbacks whose prepare was not queued.
pub fn reconcile_queue(queue: Vec<(Address, Command)>) -> Vec<(Address, Command)> {
    use std::collections::HashSet;

    let prepared: HashSet<_> = queue
        .iter()
        .filter_map(|(_, c)| match c {
            Command::Prepare { gtx, .. } => Some(*gtx),
            _ => None,
        })
        .collect();
    let completed: HashSet<_> = queue
        .iter()
        .filter_map(|(_, c)| match c {
            Command::Commit { gtx } | Command::Rollback { gtx } => Some(*gtx),
            _ => None,
        })
        .collect();

    queue
        .into_iter()
        .filter(|(_, c)| match c {
            Command::Prepare {
                gtx, one_phase, ..
            } => {
                let keep = *one_phase || completed.contains(gtx);
                if !keep {
                    tracing::debug!(%gtx, "dropping queued prepare without outcome");
                }
                keep
            }
            Command::Commit { gtx } | Command::Rollback { gtx } => {
                let keep = prepared.contains(gtx);
                if !keep {
                    tracing::debug!(%gtx, "forgiving queued outcome without prepare");
                }
                keep
            }
            _ => true,
        })
        .collect()
}
