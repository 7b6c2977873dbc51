//! Replication of local changes to the rest of the group.
//!
//! Non-transactional writes are sent as they happen. Transactional writes
//! travel as one prepare at commit: a two-phase prepare/commit in
//! synchronous modes, a single one-phase prepare in asynchronous modes.
//! Invalidation modes send evictions instead of data, and buddy
//! replication sends backups to the buddy group only.

use std::sync::Arc;

use crate::cache::CacheInner;
use crate::command::{Command, Reply};
use crate::error::CacheResult;
use crate::fqn::Fqn;
use crate::pipeline::{Interceptor, InvocationContext, Next};
use crate::region::buddy_backup_root;
use crate::transport::{check_responses, DeliveryMode, Response, Transport};
use crate::types::{Address, GlobalTransaction};

/// Sends local changes to peers once they are applied locally.
pub struct ReplicationInterceptor;

impl Interceptor for ReplicationInterceptor {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn invoke(
        &self,
        cache: &CacheInner,
        ctx: &mut InvocationContext,
        command: Command,
        next: Next<'_>,
    ) -> CacheResult<Reply> {
        let transport = match &cache.transport {
            Some(t)
                if cache.config.cache_mode.is_clustered()
                    && ctx.origin_local
                    && !ctx.options.cache_mode_local =>
            {
                t.clone()
            }
            _ => return next.invoke(cache, ctx, command),
        };
        let replicate = match &command {
            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. } => true,
            c => c.is_write() && ctx.gtx.is_none(),
        };
        if !replicate {
            return next.invoke(cache, ctx, command);
        }

        let reply = next.invoke(cache, ctx, command.clone())?;
        let sender = Sender { cache, transport };
        match command {
            Command::Prepare {
                gtx,
                modifications,
                origin,
                one_phase,
            } => sender.prepare(gtx, modifications, origin, one_phase)?,
            Command::Commit { gtx } => sender.commit(gtx),
            Command::Rollback { gtx } => sender.rollback(gtx),
            write => sender.write(write)?,
        }
        Ok(reply)
    }
}

struct Sender<'a> {
    cache: &'a CacheInner,
    transport: Arc<dyn Transport>,
}

impl Sender<'_> {
    fn synchronous(&self) -> bool {
        self.cache.config.cache_mode.is_synchronous()
    }

    /// Targets for this member's changes: the buddy group when buddy
    /// replication is on, everybody otherwise.
    fn targets(&self) -> Option<Vec<Address>> {
        if self.cache.config.buddy_replication.enabled {
            Some(self.cache.membership.buddies())
        } else {
            None
        }
    }

    /// Wire form of a local command.
    fn outbound(&self, command: &Command) -> Command {
        let command = if self.cache.config.cache_mode.is_invalidation() {
            command.to_invalidation()
        } else {
            command.clone()
        };
        if self.cache.config.buddy_replication.enabled {
            let backup = buddy_backup_root(self.cache.local_address);
            command.map_fqn(&|fqn| Some(Fqn::from_relative(&backup, fqn)))
        } else {
            command
        }
    }

    fn send(&self, command: &Command, mode: DeliveryMode) -> CacheResult<Vec<(Address, Response)>> {
        let targets = self.targets();
        if targets.as_ref().is_some_and(|t| t.is_empty()) {
            return Ok(Vec::new());
        }
        self.transport.send(
            targets.as_deref(),
            command,
            mode,
            self.cache.config.sync_timeout(),
        )
    }

    fn send_async(&self, command: Command) -> CacheResult<()> {
        match &self.cache.queue {
            Some(queue) => {
                queue.add(command);
                Ok(())
            }
            _ => self.send(&command, DeliveryMode::Async).map(|_| ()),
        }
    }

    fn prepare(
        &self,
        gtx: GlobalTransaction,
        modifications: Vec<Command>,
        origin: Address,
        one_phase: bool,
    ) -> CacheResult<()> {
        if !self.synchronous() || modifications.is_empty() {
            return Ok(());
        }
        let prepare = Command::Prepare {
            gtx,
            modifications: modifications.iter().map(|m| self.outbound(m)).collect(),
            origin,
            one_phase,
        };
        if let Some(entry) = self.cache.txs.get(&gtx) {
            entry.lock().mark_replicated();
        }
        tracing::debug!(%gtx, count = modifications.len(), "replicating prepare");
        let responses = self.send(&prepare, DeliveryMode::Sync)?;
        check_responses(&responses)
    }

    fn commit(&self, gtx: GlobalTransaction) {
        if self.synchronous() {
            if self.was_replicated(gtx) {
                self.finish_remote(Command::Commit { gtx });
            }
            return;
        }
        let modifications = self.cache.txs.modifications(&gtx);
        if modifications.is_empty() {
            return;
        }
        let prepare = Command::Prepare {
            gtx,
            modifications: modifications.iter().map(|m| self.outbound(m)).collect(),
            origin: self.cache.local_address,
            one_phase: true,
        };
        if let Err(e) = self.send_async(prepare) {
            tracing::warn!(%gtx, error = %e, "asynchronous commit not replicated");
        }
    }

    fn rollback(&self, gtx: GlobalTransaction) {
        if self.synchronous() && self.was_replicated(gtx) {
            self.finish_remote(Command::Rollback { gtx });
        }
    }

    fn was_replicated(&self, gtx: GlobalTransaction) -> bool {
        self.cache
            .txs
            .get(&gtx)
            .is_some_and(|e| e.lock().was_replicated())
    }

    /// Second-phase messages cannot undo the local outcome; failures are
    /// logged and left to lock breaking on the peers.
    fn finish_remote(&self, command: Command) {
        let result = self
            .send(&command, DeliveryMode::Sync)
            .and_then(|responses| check_responses(&responses));
        if let Err(e) = result {
            tracing::warn!(command = command.name(), error = %e, "second phase not acknowledged");
        }
    }

    fn write(&self, command: Command) -> CacheResult<()> {
        let outbound = self.outbound(&command);
        if self.synchronous() {
            let responses = self.send(&outbound, DeliveryMode::Sync)?;
            check_responses(&responses)
        } else {
            self.send_async(outbound)
        }
    }
}
