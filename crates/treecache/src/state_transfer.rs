//! Partial state transfer between members.
//!
//! The requester asks peers one at a time for a snapshot of a subtree. Each
//! round doubles the timeout; the final round asks sources to break locks
//! that stand in the way. A round in which every peer answered "no data"
//! ends the transfer with nothing to integrate.

use std::sync::Arc;
use std::time::Duration;

use crate::command::{Command, Reply};
use crate::error::{CacheError, CacheResult};
use crate::fqn::Fqn;
use crate::loader::CacheLoader;
use crate::lock::{LockOwner, LockType};
use crate::node::{NodeSnapshot, TreeNode};
use crate::transport::{DeliveryMode, Response, Transport};
use crate::tree::DataTree;
use crate::types::Address;

/// Escalating retry schedule for state requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    base: Duration,
    attempts: u32,
}

impl RetrySchedule {
    /// Schedule starting at `base` with `attempts` rounds (at least one).
    pub fn new(base: Duration, attempts: u32) -> Self {
        Self {
            base,
            attempts: attempts.max(1),
        }
    }

    /// Number of rounds.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Timeout of round `attempt` (zero based).
    pub fn timeout(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }

    /// True if sources should break locks in round `attempt`.
    pub fn force(&self, attempt: u32) -> bool {
        attempt + 1 == self.attempts
    }
}

/// Requests the state of `fqn` from `sources`, in order.
///
/// Returns `Ok(None)` when a full round completed without timeouts and no
/// peer had data, and [`CacheError::StateTransfer`] when every round saw at
/// least one peer time out or fail.
pub fn fetch_state(
    transport: &dyn Transport,
    sources: &[Address],
    fqn: &Fqn,
    schedule: RetrySchedule,
) -> CacheResult<Option<NodeSnapshot>> {
    if sources.is_empty() {
        tracing::debug!(%fqn, "no peers to fetch state from");
        return Ok(None);
    }
    let mut last_failure = String::new();
    for attempt in 0..schedule.attempts() {
        let timeout = schedule.timeout(attempt);
        let force = schedule.force(attempt);
        let mut saw_timeout = false;
        for source in sources {
            let request = Command::GetPartialState {
                fqn: fqn.clone(),
                timeout_ms: timeout.as_millis() as u64,
                force,
            };
            let responses =
                transport.send(Some(std::slice::from_ref(source)), &request, DeliveryMode::Sync, timeout)?;
            let response = responses
                .into_iter()
                .find(|(a, _)| a == source)
                .map(|(_, r)| r)
                .unwrap_or(Response::Suspected);
            match response {
                Response::Reply(Reply::State(Some(state))) => {
                    tracing::info!(%fqn, %source, nodes = state.node_count(), "received state");
                    return Ok(Some(state));
                }
                Response::Reply(Reply::State(None)) => {
                    tracing::debug!(%fqn, %source, "source has no state");
                }
                Response::Suspected => {
                    tracing::debug!(%fqn, %source, "source suspected, skipping");
                }
                Response::Timeout => {
                    saw_timeout = true;
                    last_failure = format!("{} timed out after {:?}", source, timeout);
                    tracing::debug!(%fqn, %source, ?timeout, "state request timed out");
                }
                Response::Failed(reason) => {
                    saw_timeout = true;
                    last_failure = format!("{} failed: {}", source, reason);
                    tracing::debug!(%fqn, %source, %reason, "state request failed");
                }
                Response::Reply(other) => {
                    saw_timeout = true;
                    last_failure = format!("{} sent unexpected reply {:?}", source, other);
                }
            }
        }
        if !saw_timeout {
            tracing::debug!(%fqn, "no peer holds state");
            return Ok(None);
        }
        tracing::warn!(%fqn, attempt, force, "state transfer round failed, escalating");
    }
    Err(CacheError::StateTransfer {
        fqn: fqn.clone(),
        reason: last_failure,
    })
}

/// Produces a snapshot of `fqn` for a requesting peer.
///
/// Read-locks the subtree for the calling thread. When that times out and
/// `force` is set, `break_locks` is given the subtree root to clear the
/// conflicting owners and the lock is tried once more.
pub fn generate_state(
    tree: &DataTree,
    fqn: &Fqn,
    timeout: Duration,
    force: bool,
    break_locks: impl Fn(&Arc<TreeNode>),
) -> CacheResult<Option<NodeSnapshot>> {
    let node = match tree.find_node(fqn, false) {
        Some(node) => node,
        None => return Ok(None),
    };
    let owner = LockOwner::current_thread();
    let acquired = match node.acquire_all(owner, LockType::Read, timeout) {
        Ok(acquired) => acquired,
        Err(e) if e.is_timeout() && force => {
            tracing::warn!(%fqn, error = %e, "breaking locks to generate state");
            break_locks(&node);
            node.acquire_all(owner, LockType::Read, timeout)?
        }
        Err(e) => return Err(e),
    };
    let state = node.snapshot();
    for locked in acquired.iter().rev() {
        locked.release(&owner);
    }
    Ok(Some(state))
}

/// Adds stored nodes under `fqn` that are not in memory to `state`.
pub fn overlay_persistent(
    state: &mut NodeSnapshot,
    loader: &dyn CacheLoader,
    fqn: &Fqn,
) -> CacheResult<()> {
    if state.data.is_empty() {
        if let Some(data) = loader.get(fqn)? {
            state.data = data;
        }
    }
    for name in loader.children_names(fqn)? {
        let child = state.children.entry(name.clone()).or_default();
        overlay_persistent(child, loader, &fqn.child(name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheResult;
    use crate::loader::InMemoryCacheLoader;
    use crate::lock::IsolationLevel;
    use crate::node::{DataMap, NodeKind};
    use crate::transport::MessageHandler;
    use crate::types::GlobalTransaction;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Weak;

    /// Transport that answers each peer with a scripted list of responses.
    struct Scripted {
        script: Mutex<HashMap<Address, Vec<Response>>>,
        requests: Mutex<Vec<(Address, bool, u64)>>,
    }

    impl Scripted {
        fn new(script: Vec<(u64, Vec<Response>)>) -> Self {
            Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|(a, r)| (Address::new(a), r))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for Scripted {
        fn local_address(&self) -> Address {
            Address::new(1)
        }
        fn members(&self) -> Vec<Address> {
            Vec::new()
        }
        fn connect(&self, _handler: Weak<dyn MessageHandler>) -> CacheResult<()> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn send(
            &self,
            targets: Option<&[Address]>,
            command: &Command,
            _mode: DeliveryMode,
            _timeout: Duration,
        ) -> CacheResult<Vec<(Address, Response)>> {
            let target = targets.unwrap()[0];
            if let Command::GetPartialState {
                force, timeout_ms, ..
            } = command
            {
                self.requests.lock().push((target, *force, *timeout_ms));
            }
            let mut script = self.script.lock();
            let queue = script.get_mut(&target).unwrap();
            let response = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            };
            Ok(vec![(target, response)])
        }
    }

    fn snapshot() -> NodeSnapshot {
        NodeSnapshot {
            data: DataMap::from([("k".into(), "v".into())]),
            children: Default::default(),
        }
    }

    fn schedule() -> RetrySchedule {
        RetrySchedule::new(Duration::from_millis(10), 3)
    }

    #[test]
    fn test_schedule_escalates() {
        let s = schedule();
        assert_eq!(s.timeout(0), Duration::from_millis(10));
        assert_eq!(s.timeout(2), Duration::from_millis(40));
        assert!(!s.force(1));
        assert!(s.force(2));
    }

    #[test]
    fn test_first_peer_with_data_wins() {
        let transport = Scripted::new(vec![
            (2, vec![Response::Reply(Reply::State(None))]),
            (3, vec![Response::Reply(Reply::State(Some(snapshot())))]),
        ]);
        let peers = [Address::new(2), Address::new(3)];
        let state = fetch_state(&transport, &peers, &Fqn::parse("/r"), schedule()).unwrap();
        assert_eq!(state, Some(snapshot()));
    }

    #[test]
    fn test_nobody_has_data_is_soft_success() {
        let transport = Scripted::new(vec![
            (2, vec![Response::Reply(Reply::State(None))]),
            (3, vec![Response::Suspected]),
        ]);
        let peers = [Address::new(2), Address::new(3)];
        let state = fetch_state(&transport, &peers, &Fqn::parse("/r"), schedule()).unwrap();
        assert!(state.is_none());
        assert_eq!(transport.requests.lock().len(), 2);
    }

    #[test]
    fn test_timeout_then_success_on_forced_round() {
        let transport = Scripted::new(vec![(
            2,
            vec![
                Response::Timeout,
                Response::Timeout,
                Response::Reply(Reply::State(Some(snapshot()))),
            ],
        )]);
        let state =
            fetch_state(&transport, &[Address::new(2)], &Fqn::parse("/r"), schedule()).unwrap();
        assert!(state.is_some());
        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].2, 10);
        assert!(!requests[1].1);
        assert!(requests[2].1);
        assert_eq!(requests[2].2, 40);
    }

    #[test]
    fn test_exhausted_with_timeouts_is_hard_failure() {
        let transport = Scripted::new(vec![
            (2, vec![Response::Timeout]),
            (3, vec![Response::Reply(Reply::State(None))]),
        ]);
        let peers = [Address::new(2), Address::new(3)];
        match fetch_state(&transport, &peers, &Fqn::parse("/r"), schedule()) {
            Err(CacheError::StateTransfer { fqn, .. }) => assert_eq!(fqn, Fqn::parse("/r")),
            other => panic!("expected StateTransfer, got {:?}", other),
        }
        assert_eq!(transport.requests.lock().len(), 6);
    }

    #[test]
    fn test_generate_state_missing_node() {
        let tree = DataTree::new(NodeKind::Standard, IsolationLevel::RepeatableRead);
        let state =
            generate_state(&tree, &Fqn::parse("/none"), Duration::from_millis(10), false, |_| {})
                .unwrap();
        assert!(state.is_none());
    }

    #[test]
    fn test_generate_state_breaks_locks_when_forced() {
        let tree = DataTree::new(NodeKind::Standard, IsolationLevel::RepeatableRead);
        let node = tree.get_or_create(&Fqn::parse("/r/a"), |_| {});
        node.put("k".into(), "v".into());
        let writer = LockOwner::Transaction(GlobalTransaction::new(Address::new(9), 1));
        node.acquire(writer, LockType::Write, Duration::from_millis(10))
            .unwrap();

        let fqn = Fqn::parse("/r");
        let err = generate_state(&tree, &fqn, Duration::from_millis(20), false, |_| {})
            .unwrap_err();
        assert!(err.is_timeout());

        let state = generate_state(&tree, &fqn, Duration::from_millis(20), true, |n| {
            n.release_all_forced()
        })
        .unwrap()
        .unwrap();
        assert_eq!(state.node_count(), 2);
        assert_eq!(tree.root().number_of_locks_held(), 0);
    }

    #[test]
    fn test_overlay_persistent_adds_stored_nodes() {
        let loader = InMemoryCacheLoader::new();
        loader
            .put(&Fqn::parse("/r/stored"), DataMap::from([("s".into(), "1".into())]))
            .unwrap();
        let mut state = snapshot();
        overlay_persistent(&mut state, &loader, &Fqn::parse("/r")).unwrap();
        assert_eq!(state.data.get("k"), Some(&"v".to_string()));
        assert_eq!(state.node_count(), 2);
    }
}
