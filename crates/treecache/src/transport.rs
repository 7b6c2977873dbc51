//! Group transport seam and an in-process implementation.
//!
//! The cache talks to its peers only through [`Transport`]: point-to-multipoint
//! sends with per-target responses, plus view changes delivered to the
//! registered [`MessageHandler`]. [`LocalGroup`] wires several caches in one
//! process together; every message still goes through bincode so commands
//! and replies are exercised exactly as they would be on a wire.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::command::{Command, Reply};
use crate::error::{CacheError, CacheResult};
use crate::types::Address;

/// Whether the sender waits for responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Wait for every target's response.
    Sync,
    /// Fire and forget.
    Async,
}

/// Outcome of a send for one target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The target handled the command.
    Reply(Reply),
    /// The target failed to handle the command.
    Failed(String),
    /// The target did not answer in time.
    Timeout,
    /// The target is suspected to have left the group.
    Suspected,
}

impl Response {
    /// True for a successful reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Reply(_))
    }
}

/// Receives commands and views from the transport.
pub trait MessageHandler: Send + Sync {
    /// Handles a command sent by `from`.
    fn handle(&self, from: Address, command: Command) -> CacheResult<Reply>;

    /// Installs a new membership view, in view order.
    fn view_accepted(&self, members: Vec<Address>);
}

/// Group communication used by the cache.
pub trait Transport: Send + Sync {
    /// Address of this member.
    fn local_address(&self) -> Address;

    /// Current view, in view order.
    fn members(&self) -> Vec<Address>;

    /// Joins the group and starts delivering messages to `handler`.
    fn connect(&self, handler: Weak<dyn MessageHandler>) -> CacheResult<()>;

    /// Leaves the group.
    fn disconnect(&self);

    /// Sends `command` to `targets`, or to every other member when `None`.
    ///
    /// Synchronous sends return one response per target. Asynchronous sends
    /// return as soon as the message is handed off.
    fn send(
        &self,
        targets: Option<&[Address]>,
        command: &Command,
        mode: DeliveryMode,
        timeout: Duration,
    ) -> CacheResult<Vec<(Address, Response)>>;
}

/// Reachability of a member inside a [`LocalGroup`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reachability {
    /// Messages are delivered.
    #[default]
    Reachable,
    /// Messages are dropped and synchronous senders see a timeout.
    Unresponsive,
    /// Messages are dropped and synchronous senders see a suspicion.
    Suspected,
}

struct Member {
    address: Address,
    handler: Weak<dyn MessageHandler>,
    reachability: Reachability,
}

/// In-process group of cache members.
///
/// Delivery happens on the sender's thread. The group lock is never held
/// while a handler runs, so handlers may send in turn.
pub struct LocalGroup {
    members: Mutex<Vec<Member>>,
    next_address: AtomicU64,
}

impl LocalGroup {
    /// Creates an empty group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: Mutex::new(Vec::new()),
            next_address: AtomicU64::new(1),
        })
    }

    /// Creates a transport with a fresh address. It joins on `connect`.
    pub fn transport(self: &Arc<Self>) -> Arc<LocalTransport> {
        let address = Address::new(self.next_address.fetch_add(1, Ordering::SeqCst));
        Arc::new(LocalTransport {
            group: self.clone(),
            address,
        })
    }

    /// Current view.
    pub fn view(&self) -> Vec<Address> {
        self.members.lock().iter().map(|m| m.address).collect()
    }

    /// Changes how a member responds to messages.
    pub fn set_reachability(&self, address: Address, reachability: Reachability) {
        if let Some(member) = self
            .members
            .lock()
            .iter_mut()
            .find(|m| m.address == address)
        {
            member.reachability = reachability;
        }
    }

    /// Removes a member without it taking part, as if its process died.
    /// The remaining members receive the new view.
    pub fn crash(&self, address: Address) {
        tracing::info!(%address, "member crashed");
        self.leave(address);
    }

    fn join(&self, address: Address, handler: Weak<dyn MessageHandler>) {
        {
            let mut members = self.members.lock();
            if members.iter().any(|m| m.address == address) {
                return;
            }
            members.push(Member {
                address,
                handler,
                reachability: Reachability::Reachable,
            });
        }
        self.broadcast_view();
    }

    fn leave(&self, address: Address) {
        let removed = {
            let mut members = self.members.lock();
            let before = members.len();
            members.retain(|m| m.address != address);
            members.len() != before
        };
        if removed {
            self.broadcast_view();
        }
    }

    fn broadcast_view(&self) {
        let (view, handlers): (Vec<Address>, Vec<Weak<dyn MessageHandler>>) = {
            let members = self.members.lock();
            (
                members.iter().map(|m| m.address).collect(),
                members.iter().map(|m| m.handler.clone()).collect(),
            )
        };
        tracing::debug!(?view, "installing view");
        for handler in handlers.iter().filter_map(Weak::upgrade) {
            handler.view_accepted(view.clone());
        }
    }

    fn deliver(&self, from: Address, to: Address, payload: &[u8]) -> Response {
        let target = {
            let members = self.members.lock();
            members
                .iter()
                .find(|m| m.address == to)
                .map(|m| (m.handler.clone(), m.reachability))
        };
        let (handler, reachability) = match target {
            Some(t) => t,
            None => return Response::Suspected,
        };
        match reachability {
            Reachability::Reachable => {}
            Reachability::Unresponsive => return Response::Timeout,
            Reachability::Suspected => return Response::Suspected,
        }
        let handler = match handler.upgrade() {
            Some(h) => h,
            None => return Response::Suspected,
        };
        let command: Command = match bincode::deserialize(payload) {
            Ok(c) => c,
            Err(e) => return Response::Failed(format!("undecodable command: {}", e)),
        };
        match handler.handle(from, command) {
            Ok(reply) => match roundtrip_reply(&reply) {
                Ok(reply) => Response::Reply(reply),
                Err(e) => Response::Failed(e.to_string()),
            },
            Err(e) if e.is_timeout() => Response::Timeout,
            Err(e) => Response::Failed(e.to_string()),
        }
    }
}

fn roundtrip_reply(reply: &Reply) -> CacheResult<Reply> {
    let bytes = bincode::serialize(reply)?;
    Ok(bincode::deserialize(&bytes)?)
}

/// One member's endpoint in a [`LocalGroup`].
pub struct LocalTransport {
    group: Arc<LocalGroup>,
    address: Address,
}

impl LocalTransport {
    /// Group this transport belongs to.
    pub fn group(&self) -> &Arc<LocalGroup> {
        &self.group
    }
}

impl Transport for LocalTransport {
    fn local_address(&self) -> Address {
        self.address
    }

    fn members(&self) -> Vec<Address> {
        self.group.view()
    }

    fn connect(&self, handler: Weak<dyn MessageHandler>) -> CacheResult<()> {
        self.group.join(self.address, handler);
        Ok(())
    }

    fn disconnect(&self) {
        self.group.leave(self.address);
    }

    fn send(
        &self,
        targets: Option<&[Address]>,
        command: &Command,
        mode: DeliveryMode,
        _timeout: Duration,
    ) -> CacheResult<Vec<(Address, Response)>> {
        let targets: Vec<Address> = match targets {
            Some(t) => t.iter().copied().filter(|a| *a != self.address).collect(),
            None => self
                .group
                .view()
                .into_iter()
                .filter(|a| *a != self.address)
                .collect(),
        };
        let payload = bincode::serialize(command)?;
        tracing::trace!(
            from = %self.address,
            command = command.name(),
            targets = targets.len(),
            bytes = payload.len(),
            "sending"
        );

        let mut responses = Vec::with_capacity(targets.len());
        for target in targets {
            let response = self.group.deliver(self.address, target, &payload);
            match mode {
                DeliveryMode::Sync => responses.push((target, response)),
                DeliveryMode::Async => {
                    if let Response::Failed(reason) = &response {
                        tracing::debug!(%target, %reason, "async delivery failed");
                    }
                }
            }
        }
        Ok(responses)
    }
}

/// Checks synchronous responses, mapping the first failure to an error.
///
/// Suspected members are skipped: they are about to leave the view and
/// their locks will be broken by the membership change.
pub fn check_responses(responses: &[(Address, Response)]) -> CacheResult<()> {
    for (address, response) in responses {
        match response {
            Response::Reply(_) => {}
            Response::Suspected => {
                tracing::debug!(%address, "ignoring response from suspected member");
            }
            Response::Timeout => {
                return Err(CacheError::Replication(format!(
                    "{} timed out",
                    address
                )))
            }
            Response::Failed(reason) => {
                return Err(CacheError::Replication(format!(
                    "{} failed: {}",
                    address, reason
                )))
            }
        }
    }
    Ok(())
}
