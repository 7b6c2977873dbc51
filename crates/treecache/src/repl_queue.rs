//! Batching queue for asynchronous replication.
//!
//! Commands are appended by callers and sent to every other member as one
//! `Replicate` batch, either when the queue reaches its size limit (flushed
//! on the appending thread) or when the background timer fires. A failed
//! send drops the batch.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::command::Command;
use crate::transport::{DeliveryMode, Transport};

struct Shared {
    transport: Arc<dyn Transport>,
    elements: Mutex<Vec<Command>>,
    send_timeout: Duration,
    flushes: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.elements.lock());
        if batch.is_empty() {
            return 0;
        }
        let len = batch.len();
        let command = Command::Replicate { commands: batch };
        match self
            .transport
            .send(None, &command, DeliveryMode::Async, self.send_timeout)
        {
            Ok(_) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(len, "flushed replication queue");
            }
            Err(e) => {
                self.dropped.fetch_add(len as u64, Ordering::Relaxed);
                tracing::warn!(len, error = %e, "replication batch failed, dropping it");
            }
        }
        len
    }
}

/// Flushes `shared` every `period` until `shutdown` fires or its sender is
/// dropped. Sends run on the blocking pool since transports are synchronous.
async fn run_timer(shared: Arc<Shared>, period: Duration, mut shutdown: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let shared = shared.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || shared.flush()).await {
                    tracing::warn!(error = %e, "replication queue flush task failed");
                }
            }
        }
    }
    tracing::debug!("replication queue timer stopped");
}

/// Running timer task. `runtime` is set when the queue was started outside
/// any tokio runtime and had to bring its own.
struct Timer {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    runtime: Option<Runtime>,
}

impl Timer {
    fn shut_down(self) {
        let _ = self.shutdown.send(());
        match self.runtime {
            Some(runtime) if Handle::try_current().is_err() => {
                if let Err(e) = runtime.block_on(self.handle) {
                    tracing::warn!(error = %e, "replication queue timer failed");
                }
            }
            // Blocking is not allowed inside a runtime; the task exits on its
            // next poll.
            Some(runtime) => runtime.shutdown_background(),
            None => {}
        }
    }
}

/// Size- and time-bounded replication buffer.
pub struct ReplicationQueue {
    shared: Arc<Shared>,
    interval: Duration,
    max_elements: usize,
    timer: Mutex<Option<Timer>>,
}

impl ReplicationQueue {
    /// Creates a stopped queue. A zero `interval` disables the timer.
    pub fn new(
        transport: Arc<dyn Transport>,
        interval: Duration,
        max_elements: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                elements: Mutex::new(Vec::new()),
                send_timeout,
                flushes: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            interval,
            max_elements: max_elements.max(1),
            timer: Mutex::new(None),
        }
    }

    /// Starts the timer. Calling it again while running does nothing.
    ///
    /// The timer task runs on the ambient tokio runtime when there is one,
    /// otherwise on a single-worker runtime owned by the queue.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() || self.interval.is_zero() {
            return;
        }
        let runtime = match Handle::try_current() {
            Ok(_) => None,
            Err(_) => {
                let built = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("repl-queue")
                    .enable_time()
                    .build();
                match built {
                    Ok(runtime) => Some(runtime),
                    Err(e) => {
                        tracing::warn!(error = %e, "could not start replication queue timer");
                        return;
                    }
                }
            }
        };
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = run_timer(self.shared.clone(), self.interval, shutdown_rx);
        let handle = match &runtime {
            Some(runtime) => runtime.spawn(task),
            None => tokio::spawn(task),
        };
        tracing::debug!(interval = ?self.interval, "replication queue timer started");
        *timer = Some(Timer {
            shutdown,
            handle,
            runtime,
        });
    }

    /// Stops the timer, waiting for it to exit when that is allowed, then
    /// flushes what is left. Calling it again does nothing.
    pub fn stop(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.shut_down();
        }
        self.shared.flush();
    }

    /// True while the timer runs.
    pub fn is_running(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Appends a command, flushing on this thread when the queue is full.
    pub fn add(&self, command: Command) {
        let full = {
            let mut elements = self.shared.elements.lock();
            elements.push(command);
            elements.len() >= self.max_elements
        };
        if full {
            self.shared.flush();
        }
    }

    /// Sends everything queued now. Returns the batch size.
    pub fn flush(&self) -> usize {
        self.shared.flush()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.shared.elements.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches sent.
    pub fn flush_count(&self) -> u64 {
        self.shared.flushes.load(Ordering::Relaxed)
    }

    /// Number of commands lost to failed sends.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ReplicationQueue {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.shut_down();
        }
    }
}
