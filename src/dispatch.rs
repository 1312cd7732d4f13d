//! Delivery of committed commits to a publisher.
//!
//! Every accepted commit enters the engine's undispatched set. A scheduler
//! hands it to a [`PublishCommits`] sink and marks it dispatched only after
//! the sink accepted it, so a crash between the two redelivers the commit on
//! the next [`start`](ScheduleDispatches::start). Delivery is at least once.
//!
//! Two schedulers are provided:
//!
//! - [`SyncDispatchScheduler`] publishes inline on the committing thread.
//! - [`AsyncDispatchScheduler`] routes commits to a fixed pool of worker
//!   threads, each draining its own bounded queue. A stream always maps to
//!   the same worker, so per-stream delivery order is preserved.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::commit::Commit;
use crate::error::{BoxError, DispatchError, StoreError};
use crate::metrics::{NoopMetrics, RecordMetrics};
use crate::persistence::PersistStreams;

/// Downstream sink for committed commits.
///
/// `publish` may fail; the commit then stays undispatched and is offered
/// again on the next scheduler start.
pub trait PublishCommits: Send + Sync {
    /// Deliver one commit.
    ///
    /// # Errors
    ///
    /// Any error the sink wants to report. It is logged by the scheduler.
    fn publish(&self, commit: &Commit) -> Result<(), BoxError>;

    /// Release sink resources. Called at most once, by the owning scheduler.
    fn dispose(&self) {}
}

/// Drives commits from the engine's undispatched set to a publisher.
pub trait ScheduleDispatches: Send + Sync {
    /// Initialize the engine and replay every undispatched commit.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Store`] if the engine cannot be initialized or read,
    /// [`DispatchError::Disposed`] after disposal.
    fn start(&self) -> Result<(), DispatchError>;

    /// Deliver `commit` and mark it dispatched.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Disposed`] after disposal. The synchronous scheduler
    /// also reports publisher and storage failures here.
    fn schedule_dispatch(&self, commit: Commit) -> Result<(), DispatchError>;

    /// Stop accepting work and release the publisher and the engine.
    ///
    /// Idempotent and never panics.
    fn dispose(&self);
}

/// Sizing for [`AsyncDispatchScheduler`].
///
/// # Examples
///
/// ```
/// use eventfold_streams::DispatchConfig;
///
/// let config = DispatchConfig {
///     workers: 2,
///     ..DispatchConfig::default()
/// };
/// assert_eq!(config.queue_capacity, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of worker threads. Values below 1 are treated as 1.
    ///
    /// Default: 4.
    pub workers: usize,

    /// Bound of each worker's queue. Values below 1 are treated as 1.
    ///
    /// Default: 1024.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// Collaborators shared by a scheduler and its workers.
struct Dispatcher {
    persistence: Arc<dyn PersistStreams>,
    publisher: Arc<dyn PublishCommits>,
    metrics: Arc<dyn RecordMetrics>,
}

impl Dispatcher {
    /// Publish `commit` then mark it dispatched.
    ///
    /// A publisher failure leaves the commit undispatched. A mark that fails
    /// because the engine was disposed in the meantime is swallowed.
    fn dispatch(&self, commit: &Commit) -> Result<(), DispatchError> {
        let _span = tracing::info_span!(
            "dispatch",
            bucket_id = %commit.bucket_id,
            stream_id = %commit.stream_id,
            checkpoint_token = commit.checkpoint_token,
        )
        .entered();

        if let Err(source) = self.publisher.publish(commit) {
            tracing::error!(
                commit_id = %commit.commit_id,
                error = %source,
                "publisher failed, commit stays undispatched"
            );
            self.metrics.dispatch_failed();
            return Err(DispatchError::Publish {
                commit_id: commit.commit_id,
                source,
            });
        }

        match self.persistence.mark_commit_as_dispatched(commit) {
            Ok(()) => {
                self.metrics.commit_dispatched();
                tracing::debug!(commit_id = %commit.commit_id, "commit dispatched");
                Ok(())
            }
            Err(StoreError::Disposed) => {
                tracing::warn!(
                    commit_id = %commit.commit_id,
                    "engine disposed before commit could be marked dispatched"
                );
                Ok(())
            }
            Err(e) => Err(DispatchError::Store(e)),
        }
    }

    fn undispatched(&self) -> Result<Vec<Commit>, DispatchError> {
        self.persistence.initialize()?;
        let pending = self.persistence.get_undispatched_commits()?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "replaying undispatched commits");
        }
        Ok(pending)
    }

    fn release(&self) {
        self.publisher.dispose();
        self.persistence.dispose();
    }
}

/// Publishes on the calling thread, then marks the commit dispatched.
pub struct SyncDispatchScheduler {
    dispatcher: Dispatcher,
    disposed: AtomicBool,
}

impl SyncDispatchScheduler {
    /// Create a scheduler over `persistence` delivering to `publisher`.
    pub fn new(persistence: Arc<dyn PersistStreams>, publisher: Arc<dyn PublishCommits>) -> Self {
        Self {
            dispatcher: Dispatcher {
                persistence,
                publisher,
                metrics: Arc::new(NoopMetrics),
            },
            disposed: AtomicBool::new(false),
        }
    }

    /// Report dispatch counters to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn RecordMetrics>) -> Self {
        self.dispatcher.metrics = metrics;
        self
    }

    fn ensure_live(&self) -> Result<(), DispatchError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(DispatchError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl ScheduleDispatches for SyncDispatchScheduler {
    fn start(&self) -> Result<(), DispatchError> {
        self.ensure_live()?;
        for commit in self.dispatcher.undispatched()? {
            match self.dispatcher.dispatch(&commit) {
                // Already logged; the commit waits for the next start.
                Ok(()) | Err(DispatchError::Publish { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn schedule_dispatch(&self, commit: Commit) -> Result<(), DispatchError> {
        self.ensure_live()?;
        self.dispatcher.dispatch(&commit)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("disposing synchronous dispatch scheduler");
        self.dispatcher.release();
    }
}

/// Publishes from a fixed pool of worker threads.
///
/// Each worker is a dedicated OS thread draining a bounded tokio `mpsc`
/// queue with `blocking_recv`. Commits are routed by a hash of
/// `(bucket_id, stream_id)`, so one stream is always served by one worker in
/// submission order. Different streams may be delivered out of commit order.
///
/// [`schedule_dispatch`](ScheduleDispatches::schedule_dispatch) only enqueues;
/// publisher failures are logged by the worker and the commit stays
/// undispatched. A full queue blocks the caller when the calling thread may
/// block. On a current-thread runtime, where it may not, the commit is parked
/// in the worker's overflow buffer and delivered after the queued ones.
pub struct AsyncDispatchScheduler {
    dispatcher: Arc<Dispatcher>,
    /// `None` once disposed; dropping the senders closes every queue.
    queues: Mutex<Option<Vec<WorkerQueue>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
    disposed: AtomicBool,
}

/// Commits waiting behind a full queue, in submission order.
type Overflow = Arc<Mutex<VecDeque<Commit>>>;

/// The sending side of one worker.
#[derive(Clone)]
struct WorkerQueue {
    tx: mpsc::Sender<Commit>,
    /// Only filled while the channel is full; nothing is sent on the channel
    /// while it holds commits, so channel commits are always older.
    overflow: Overflow,
}

impl AsyncDispatchScheduler {
    /// Spawn the worker pool.
    ///
    /// # Arguments
    ///
    /// * `persistence` - Engine whose undispatched set is drained.
    /// * `publisher` - Sink receiving each commit.
    /// * `config` - Worker count and queue bound.
    pub fn new(
        persistence: Arc<dyn PersistStreams>,
        publisher: Arc<dyn PublishCommits>,
        config: DispatchConfig,
    ) -> Self {
        Self::with_metrics(persistence, publisher, config, Arc::new(NoopMetrics))
    }

    /// Like [`new`](Self::new), reporting dispatch counters to `metrics`.
    pub fn with_metrics(
        persistence: Arc<dyn PersistStreams>,
        publisher: Arc<dyn PublishCommits>,
        config: DispatchConfig,
        metrics: Arc<dyn RecordMetrics>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            persistence,
            publisher,
            metrics,
        });
        let stopping = Arc::new(AtomicBool::new(false));
        let worker_count = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);

        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (tx, rx) = mpsc::channel::<Commit>(capacity);
            let overflow = Overflow::default();
            let dispatcher = Arc::clone(&dispatcher);
            let stopping = Arc::clone(&stopping);
            let parked = Arc::clone(&overflow);
            queues.push(WorkerQueue { tx, overflow });
            workers.push(std::thread::spawn(move || {
                run_worker(worker, rx, &parked, &dispatcher, &stopping);
            }));
        }
        tracing::debug!(workers = worker_count, capacity, "dispatch workers started");

        Self {
            dispatcher,
            queues: Mutex::new(Some(queues)),
            workers: Mutex::new(workers),
            stopping,
            disposed: AtomicBool::new(false),
        }
    }

    fn route(commit: &Commit, workers: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        commit.bucket_id.hash(&mut hasher);
        commit.stream_id.hash(&mut hasher);
        (hasher.finish() % workers as u64) as usize
    }

    fn enqueue(&self, commit: Commit) -> Result<(), DispatchError> {
        let queue = {
            let queues = self.queues.lock().map_err(|_| DispatchError::Disposed)?;
            let Some(queues) = queues.as_ref() else {
                return Err(DispatchError::Disposed);
            };
            queues[Self::route(&commit, queues.len())].clone()
        };

        // Parking and the worker's channel-then-overflow read are serialized
        // by this lock, so a parked commit never overtakes a queued one.
        let commit = {
            let mut overflow = queue
                .overflow
                .lock()
                .map_err(|_| DispatchError::Disposed)?;
            if !overflow.is_empty() {
                overflow.push_back(commit);
                return Ok(());
            }
            match queue.tx.try_send(commit) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(DispatchError::Disposed),
                Err(TrySendError::Full(commit)) if !can_block() => {
                    tracing::debug!(
                        commit_id = %commit.commit_id,
                        "dispatch queue full on a current-thread runtime, parking commit"
                    );
                    overflow.push_back(commit);
                    return Ok(());
                }
                Err(TrySendError::Full(commit)) => commit,
            }
        };

        tracing::debug!(
            stream_id = %commit.stream_id,
            "dispatch queue full, waiting for room"
        );
        block_on_send(&queue.tx, commit)
    }
}

/// Whether the calling thread may block without stalling a runtime.
fn can_block() -> bool {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Err(_) => true,
        Ok(handle) => handle.runtime_flavor() == RuntimeFlavor::MultiThread,
    }
}

/// Block until the queue has room. Only called where [`can_block`] holds.
fn block_on_send(sender: &mpsc::Sender<Commit>, commit: Commit) -> Result<(), DispatchError> {
    let sent = if tokio::runtime::Handle::try_current().is_ok() {
        tokio::task::block_in_place(|| sender.blocking_send(commit))
    } else {
        sender.blocking_send(commit)
    };
    sent.map_err(|_| DispatchError::Disposed)
}

/// Next commit for a worker: queued ones first, then parked ones.
///
/// Returns `None` once the queue is closed.
fn next_commit(
    rx: &mut mpsc::Receiver<Commit>,
    overflow: &Mutex<VecDeque<Commit>>,
) -> Option<Commit> {
    if let Ok(mut parked) = overflow.lock() {
        match rx.try_recv() {
            Ok(commit) => return Some(commit),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        if let Some(commit) = parked.pop_front() {
            return Some(commit);
        }
    }
    // Commits are only parked while the channel is full, so with both empty
    // the next commit arrives on the channel.
    rx.blocking_recv()
}

/// Worker loop: dispatch queued commits until the queue closes or the
/// scheduler starts stopping.
fn run_worker(
    worker: usize,
    mut rx: mpsc::Receiver<Commit>,
    overflow: &Mutex<VecDeque<Commit>>,
    dispatcher: &Dispatcher,
    stopping: &AtomicBool,
) {
    while let Some(commit) = next_commit(&mut rx, overflow) {
        if stopping.load(Ordering::Acquire) {
            break;
        }
        // Failures are logged inside `dispatch`; nothing to report back.
        if let Err(e) = dispatcher.dispatch(&commit)
            && !matches!(e, DispatchError::Publish { .. })
        {
            tracing::error!(worker, error = %e, "dispatch failed");
        }
    }
    tracing::debug!(worker, "dispatch worker stopped");
}

impl ScheduleDispatches for AsyncDispatchScheduler {
    fn start(&self) -> Result<(), DispatchError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DispatchError::Disposed);
        }
        for commit in self.dispatcher.undispatched()? {
            self.enqueue(commit)?;
        }
        Ok(())
    }

    fn schedule_dispatch(&self, commit: Commit) -> Result<(), DispatchError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DispatchError::Disposed);
        }
        self.enqueue(commit)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("disposing asynchronous dispatch scheduler");
        self.stopping.store(true, Ordering::Release);
        if let Ok(mut queues) = self.queues.lock() {
            queues.take();
        }

        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        let current = std::thread::current().id();
        for handle in workers {
            // A publisher that disposes the scheduler from inside a worker
            // must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("dispatch worker panicked");
            }
        }

        self.dispatcher.release();
    }
}

impl Drop for AsyncDispatchScheduler {
    fn drop(&mut self) {
        // Close the queues so idle workers exit. Engine and publisher are
        // only released by an explicit `dispose`.
        self.stopping.store(true, Ordering::Release);
        if let Ok(mut queues) = self.queues.lock() {
            queues.take();
        }
    }
}

/// Forwards commits into an unbounded tokio channel.
///
/// Handy for wiring dispatch into an async consumer or a test.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Commit>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiver that observes its commits.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Commit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PublishCommits for ChannelPublisher {
    fn publish(&self, commit: &Commit) -> Result<(), BoxError> {
        self.tx
            .send(commit.clone())
            .map_err(|_| "commit receiver dropped".into())
    }
}

/// Accepts and discards every commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl PublishCommits for NullPublisher {
    fn publish(&self, _commit: &Commit) -> Result<(), BoxError> {
        Ok(())
    }
}
