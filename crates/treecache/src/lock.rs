//! Per-node reader/writer locks with owner tracking.
//!
//! Each cache node owns one [`NodeLock`] covering its data and children maps
//! (not its subtree). Owners are global transactions or calling threads. A
//! reader may upgrade to a writer; two concurrent upgraders would deadlock,
//! so the second one fails with a locking error instead of waiting.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::error::{CacheError, CacheResult};
use crate::fqn::Fqn;
use crate::types::GlobalTransaction;

/// Type of node lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Shared lock, multiple readers allowed.
    Read,
    /// Exclusive lock, only one writer allowed.
    Write,
}

impl LockType {
    fn as_str(&self) -> &'static str {
        match self {
            LockType::Read => "read",
            LockType::Write => "write",
        }
    }
}

/// Cache-wide isolation level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// No locking at all.
    None,
    /// Writers lock, readers never do.
    ReadUncommitted,
    /// Shared read locks, exclusive write locks.
    ReadCommitted,
    /// Shared read locks held to transaction end, exclusive write locks.
    #[default]
    RepeatableRead,
    /// Every lock is exclusive.
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(IsolationLevel::None),
            "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(CacheError::Configuration(format!(
                "unknown isolation level '{}'",
                other
            ))),
        }
    }
}

impl IsolationLevel {
    /// Lock type actually taken for a request, or `None` if no lock is needed.
    pub fn effective(&self, requested: LockType) -> Option<LockType> {
        match (self, requested) {
            (IsolationLevel::None, _) => None,
            (IsolationLevel::ReadUncommitted, LockType::Read) => None,
            (IsolationLevel::Serializable, _) => Some(LockType::Write),
            (_, requested) => Some(requested),
        }
    }
}

/// Entity holding a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// A (local or remote) global transaction.
    Transaction(GlobalTransaction),
    /// A calling thread outside any transaction.
    Thread(ThreadId),
}

impl LockOwner {
    /// Owner for the calling thread.
    pub fn current_thread() -> Self {
        LockOwner::Thread(std::thread::current().id())
    }

    /// The global transaction, if this owner is one.
    pub fn transaction(&self) -> Option<GlobalTransaction> {
        match self {
            LockOwner::Transaction(gtx) => Some(*gtx),
            LockOwner::Thread(_) => None,
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(gtx) => write!(f, "{}", gtx),
            LockOwner::Thread(id) => write!(f, "{:?}", id),
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<LockOwner>,
    readers: HashSet<LockOwner>,
    upgrading: Option<LockOwner>,
}

impl LockState {
    fn holds(&self, owner: &LockOwner) -> bool {
        self.writer.as_ref() == Some(owner) || self.readers.contains(owner)
    }
}

/// Reader/writer lock guarding one node.
pub struct NodeLock {
    fqn: Fqn,
    isolation: IsolationLevel,
    state: Mutex<LockState>,
    released: Condvar,
}

impl NodeLock {
    /// Creates an unlocked lock for the node at `fqn`.
    pub fn new(fqn: Fqn, isolation: IsolationLevel) -> Self {
        Self {
            fqn,
            isolation,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Acquires a lock for `owner`, waiting up to `timeout`.
    ///
    /// A zero timeout waits indefinitely; callers opting into that accept
    /// that a lost owner can block them forever.
    ///
    /// Returns `Ok(true)` if the owner gained a lock it did not hold before
    /// (including an upgrade), `Ok(false)` if nothing changed.
    pub fn acquire(
        &self,
        owner: LockOwner,
        requested: LockType,
        timeout: Duration,
    ) -> CacheResult<bool> {
        let lock_type = match self.isolation.effective(requested) {
            Some(t) => t,
            None => return Ok(false),
        };
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        let started = Instant::now();

        let mut state = self.state.lock();
        match lock_type {
            LockType::Read => {
                if state.holds(&owner) {
                    return Ok(false);
                }
                while state.writer.is_some() || state.upgrading.is_some() {
                    if self.wait(&mut state, deadline) {
                        return Err(self.timeout(owner, lock_type, started));
                    }
                }
                state.readers.insert(owner);
                Ok(true)
            }
            LockType::Write => {
                if state.writer == Some(owner) {
                    return Ok(false);
                }
                if state.readers.contains(&owner) {
                    return self.upgrade(&mut state, owner, deadline, started);
                }
                while state.writer.is_some()
                    || !state.readers.is_empty()
                    || state.upgrading.is_some()
                {
                    if self.wait(&mut state, deadline) {
                        return Err(self.timeout(owner, lock_type, started));
                    }
                }
                state.writer = Some(owner);
                Ok(true)
            }
        }
    }

    fn upgrade(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LockState>,
        owner: LockOwner,
        deadline: Option<Instant>,
        started: Instant,
    ) -> CacheResult<bool> {
        if let Some(other) = state.upgrading {
            if other != owner {
                return Err(CacheError::locking(
                    &self.fqn,
                    format!(
                        "{} cannot upgrade to write lock while {} is upgrading",
                        owner, other
                    ),
                ));
            }
        }
        state.upgrading = Some(owner);
        while state.writer.is_some() || state.readers.len() > 1 {
            if self.wait(state, deadline) {
                state.upgrading = None;
                self.released.notify_all();
                return Err(self.timeout(owner, LockType::Write, started));
            }
        }
        state.readers.remove(&owner);
        state.upgrading = None;
        state.writer = Some(owner);
        tracing::trace!(fqn = %self.fqn, %owner, "upgraded read lock to write lock");
        Ok(true)
    }

    /// Waits for a release; returns true if the deadline passed.
    fn wait(
        &self,
        state: &mut parking_lot::MutexGuard<'_, LockState>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return true;
                }
                self.released.wait_until(state, deadline).timed_out() && Instant::now() >= deadline
            }
            None => {
                self.released.wait(state);
                false
            }
        }
    }

    fn timeout(&self, owner: LockOwner, lock_type: LockType, started: Instant) -> CacheError {
        CacheError::Timeout {
            fqn: self.fqn.clone(),
            owner: owner.to_string(),
            lock: lock_type.as_str(),
            waited: started.elapsed(),
        }
    }

    /// Releases whatever `owner` holds. Returns true if it held anything.
    pub fn release(&self, owner: &LockOwner) -> bool {
        let mut state = self.state.lock();
        let mut released = false;
        if state.writer.as_ref() == Some(owner) {
            state.writer = None;
            released = true;
        }
        released |= state.readers.remove(owner);
        if released {
            self.released.notify_all();
        }
        released
    }

    /// Forcibly releases every holder. Used when breaking locks.
    pub fn release_all(&self) -> Vec<LockOwner> {
        let mut state = self.state.lock();
        let mut owners: Vec<LockOwner> = state.readers.drain().collect();
        if let Some(writer) = state.writer.take() {
            owners.push(writer);
        }
        state.upgrading = None;
        self.released.notify_all();
        owners
    }

    /// Current writer, if any.
    pub fn writer(&self) -> Option<LockOwner> {
        self.state.lock().writer
    }

    /// Current readers.
    pub fn readers(&self) -> Vec<LockOwner> {
        self.state.lock().readers.iter().copied().collect()
    }

    /// Every current holder, writer first.
    pub fn owners(&self) -> Vec<LockOwner> {
        let state = self.state.lock();
        state
            .writer
            .iter()
            .copied()
            .chain(state.readers.iter().copied())
            .collect()
    }

    /// True if `owner` holds a read or write lock.
    pub fn is_owner(&self, owner: &LockOwner) -> bool {
        self.state.lock().holds(owner)
    }

    /// True if any owner holds the lock.
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }

    /// True if an owner holds the write lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// True if any owner holds a read lock.
    pub fn is_read_locked(&self) -> bool {
        !self.state.lock().readers.is_empty()
    }

    /// Number of distinct holders.
    pub fn holder_count(&self) -> usize {
        let state = self.state.lock();
        state.readers.len() + usize::from(state.writer.is_some())
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NodeLock")
            .field("fqn", &self.fqn)
            .field("writer", &state.writer)
            .field("readers", &state.readers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn owner(id: u64) -> LockOwner {
        LockOwner::Transaction(GlobalTransaction::new(Address::new(1), id))
    }

    fn make_lock() -> NodeLock {
        NodeLock::new(Fqn::parse("/a"), IsolationLevel::RepeatableRead)
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_multiple_readers() {
        let lock = make_lock();
        assert!(lock.acquire(owner(1), LockType::Read, SHORT).unwrap());
        assert!(lock.acquire(owner(2), LockType::Read, SHORT).unwrap());
        assert_eq!(lock.readers().len(), 2);
        assert!(!lock.acquire(owner(1), LockType::Read, SHORT).unwrap());
    }

    #[test]
    fn test_write_lock_exclusive() {
        let lock = make_lock();
        lock.acquire(owner(1), LockType::Write, SHORT).unwrap();

        match lock.acquire(owner(2), LockType::Write, SHORT) {
            Err(CacheError::Timeout { lock: "write", .. }) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        match lock.acquire(owner(2), LockType::Read, SHORT) {
            Err(CacheError::Timeout { lock: "read", .. }) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        // Writer may re-request either kind without blocking.
        assert!(!lock.acquire(owner(1), LockType::Read, SHORT).unwrap());
        assert!(!lock.acquire(owner(1), LockType::Write, SHORT).unwrap());
    }

    #[test]
    fn test_upgrade_sole_reader() {
        let lock = make_lock();
        lock.acquire(owner(1), LockType::Read, SHORT).unwrap();
        assert!(lock.acquire(owner(1), LockType::Write, SHORT).unwrap());
        assert_eq!(lock.writer(), Some(owner(1)));
        assert!(lock.readers().is_empty());
    }

    #[test]
    fn test_upgrade_times_out_with_other_reader() {
        let lock = make_lock();
        lock.acquire(owner(1), LockType::Read, SHORT).unwrap();
        lock.acquire(owner(2), LockType::Read, SHORT).unwrap();
        assert!(lock
            .acquire(owner(1), LockType::Write, SHORT)
            .unwrap_err()
            .is_timeout());
        // Failed upgrade leaves the read lock in place.
        assert!(lock.is_owner(&owner(1)));
        assert!(lock.writer().is_none());
    }

    #[test]
    fn test_concurrent_upgrade_fails_loudly() {
        let lock = Arc::new(make_lock());
        lock.acquire(owner(1), LockType::Read, SHORT).unwrap();
        lock.acquire(owner(2), LockType::Read, SHORT).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let upgrader = {
            let lock = lock.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                lock.acquire(owner(1), LockType::Write, Duration::from_secs(5))
            })
        };
        barrier.wait();
        // Wait until owner 1 registered as upgrader.
        while lock.state.lock().upgrading.is_none() {
            thread::yield_now();
        }
        match lock.acquire(owner(2), LockType::Write, Duration::from_secs(5)) {
            Err(CacheError::Locking { .. }) => {}
            other => panic!("expected Locking, got {:?}", other),
        }
        lock.release(&owner(2));
        assert!(upgrader.join().unwrap().unwrap());
        assert_eq!(lock.writer(), Some(owner(1)));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let lock = Arc::new(make_lock());
        lock.acquire(owner(1), LockType::Write, SHORT).unwrap();

        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || lock.acquire(owner(2), LockType::Write, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(lock.release(&owner(1)));
        assert!(waiter.join().unwrap().unwrap());
        assert_eq!(lock.writer(), Some(owner(2)));
    }

    #[test]
    fn test_release_all_breaks_everyone() {
        let lock = make_lock();
        lock.acquire(owner(1), LockType::Read, SHORT).unwrap();
        lock.acquire(owner(2), LockType::Read, SHORT).unwrap();
        let broken = lock.release_all();
        assert_eq!(broken.len(), 2);
        assert!(!lock.is_locked());
        lock.acquire(owner(3), LockType::Write, SHORT).unwrap();
    }

    #[test]
    fn test_release_not_held() {
        let lock = make_lock();
        assert!(!lock.release(&owner(9)));
    }

    #[test]
    fn test_serializable_reads_are_exclusive() {
        let lock = NodeLock::new(Fqn::root(), IsolationLevel::Serializable);
        lock.acquire(owner(1), LockType::Read, SHORT).unwrap();
        assert!(lock.is_write_locked());
        assert!(lock
            .acquire(owner(2), LockType::Read, SHORT)
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn test_read_uncommitted_and_none() {
        let lock = NodeLock::new(Fqn::root(), IsolationLevel::ReadUncommitted);
        assert!(!lock.acquire(owner(1), LockType::Read, SHORT).unwrap());
        assert!(lock.acquire(owner(1), LockType::Write, SHORT).unwrap());
        assert!(!lock.acquire(owner(2), LockType::Read, SHORT).unwrap());

        let none = NodeLock::new(Fqn::root(), IsolationLevel::None);
        assert!(!none.acquire(owner(1), LockType::Write, SHORT).unwrap());
        assert!(!none.is_locked());
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "SERIALIZABLE".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!(matches!(
            "SNAPSHOT".parse::<IsolationLevel>(),
            Err(CacheError::Configuration(_))
        ));
    }
}
