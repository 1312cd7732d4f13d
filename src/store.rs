//! The [`EventStore`] facade and its builder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::commit::{Commit, CommitAttempt, Snapshot};
use crate::concurrency::CommitOutcome;
use crate::conflict::{ConflictDetector, DetectConflicts};
use crate::dispatch::{
    AsyncDispatchScheduler, DispatchConfig, PublishCommits, ScheduleDispatches,
    SyncDispatchScheduler,
};
use crate::error::{ConcurrencyConflict, DispatchError, StoreError, StreamError};
use crate::hooks::{DispatchSchedulerHook, OptimisticPipelineHook, PipelineHook};
use crate::metrics::{NoopMetrics, RecordMetrics};
use crate::persistence::PersistStreams;
use crate::stream::EventStream;

struct StoreInner<P: PersistStreams + 'static> {
    persistence: Arc<P>,
    hooks: Vec<Arc<dyn PipelineHook>>,
    detector: Arc<dyn DetectConflicts>,
    metrics: Arc<dyn RecordMetrics>,
    scheduler: Option<Arc<dyn ScheduleDispatches>>,
    disposed: AtomicBool,
}

/// Entry point for writing and reading streams.
///
/// Wraps a persistence engine with pipeline hooks, conflict detection,
/// metrics and an optional dispatch scheduler. Stream sessions opened from
/// the store commit through it, so every commit passes the same hooks.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_streams::{EventMessage, EventStore, InMemoryPersistence, DEFAULT_BUCKET};
/// use serde_json::json;
/// use uuid::Uuid;
///
/// let store = EventStore::builder(Arc::new(InMemoryPersistence::new()))
///     .build()
///     .unwrap();
/// let mut stream = store.create_stream(DEFAULT_BUCKET, "acc-1").unwrap();
/// stream.add(EventMessage::new("Opened", json!({"owner": "ada"}))).unwrap();
/// stream.commit_changes(Uuid::new_v4()).unwrap();
/// assert_eq!(stream.stream_revision(), 1);
/// ```
pub struct EventStore<P: PersistStreams + 'static> {
    inner: Arc<StoreInner<P>>,
}

impl<P: PersistStreams + 'static> Clone for EventStore<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PersistStreams + 'static> std::fmt::Debug for EventStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("hooks", &self.inner.hooks.len())
            .field("dispatch", &self.inner.scheduler.is_some())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<P: PersistStreams + 'static> EventStore<P> {
    /// Start configuring a store over `persistence`.
    pub fn builder(persistence: Arc<P>) -> EventStoreBuilder<P> {
        EventStoreBuilder::new(persistence)
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.is_disposed() {
            Err(StoreError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn conflict_detector(&self) -> &dyn DetectConflicts {
        self.inner.detector.as_ref()
    }

    /// Start a new, empty stream session. No I/O happens until the first
    /// commit.
    ///
    /// # Errors
    ///
    /// [`StreamError::Disposed`] after [`dispose`](Self::dispose).
    pub fn create_stream(
        &self,
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Result<EventStream<P>, StreamError> {
        if self.is_disposed() {
            return Err(StreamError::Disposed);
        }
        Ok(EventStream::create(self.clone(), bucket_id, stream_id))
    }

    /// Open a session over the events in `[min_revision, max_revision]`.
    ///
    /// A stream without commits opens empty when `min_revision` is 0.
    ///
    /// # Errors
    ///
    /// * [`StreamError::StreamNotFound`] if the stream has no commits and
    ///   `min_revision > 0`.
    /// * [`StreamError::Persistence`] if reading fails.
    /// * [`StreamError::Disposed`] after disposal.
    pub fn open_stream(
        &self,
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<EventStream<P>, StreamError> {
        if self.is_disposed() {
            return Err(StreamError::Disposed);
        }
        EventStream::open(self.clone(), bucket_id, stream_id, min_revision, max_revision)
    }

    /// Open a session seeded from `snapshot`, replaying only the events after
    /// it up to `max_revision`.
    ///
    /// # Errors
    ///
    /// [`StreamError::Persistence`] if reading fails,
    /// [`StreamError::Disposed`] after disposal.
    pub fn open_stream_from_snapshot(
        &self,
        snapshot: &Snapshot,
        max_revision: u64,
    ) -> Result<EventStream<P>, StreamError> {
        if self.is_disposed() {
            return Err(StreamError::Disposed);
        }
        EventStream::open_from_snapshot(self.clone(), snapshot, max_revision)
    }

    /// Run `attempt` through the pipeline hooks and the engine.
    ///
    /// Any hook may veto the attempt before it reaches the engine. A vetoed
    /// retry of a commit the engine already holds is still reported as
    /// [`CommitOutcome::Duplicate`]. Accepted commits are passed to every
    /// hook's `post_commit`, including dispatch scheduling when configured.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disposed`] after disposal, or whatever the engine
    /// reports. Duplicates and conflicts come back as [`CommitOutcome`]s.
    pub fn commit(&self, attempt: CommitAttempt) -> Result<CommitOutcome, StoreError> {
        self.ensure_live()?;
        let _span = tracing::info_span!(
            "commit",
            bucket_id = %attempt.bucket_id,
            stream_id = %attempt.stream_id,
            commit_sequence = attempt.commit_sequence,
        )
        .entered();

        for hook in &self.inner.hooks {
            if let Err(conflict) = hook.pre_commit(&attempt) {
                return self.vetoed(&attempt, conflict);
            }
        }

        let outcome = self.inner.persistence.commit(attempt)?;
        match &outcome {
            CommitOutcome::Accepted(commit) => {
                self.inner.metrics.commit_accepted(commit.events.len());
                tracing::info!(
                    checkpoint_token = commit.checkpoint_token,
                    stream_revision = commit.stream_revision,
                    events = commit.events.len(),
                    "commit accepted"
                );
                for hook in &self.inner.hooks {
                    hook.post_commit(commit);
                }
            }
            CommitOutcome::Duplicate(_) => self.inner.metrics.commit_duplicate(),
            CommitOutcome::Conflict(conflict) => {
                tracing::debug!(%conflict, "commit lost a concurrency race");
                self.inner.metrics.commit_conflict();
            }
        }
        Ok(outcome)
    }

    /// Settle an attempt a hook vetoed.
    ///
    /// Hooks only know part of a stream's history, so a veto never hides a
    /// retry of a commit the engine already holds: that is still reported as
    /// a duplicate.
    fn vetoed(
        &self,
        attempt: &CommitAttempt,
        conflict: ConcurrencyConflict,
    ) -> Result<CommitOutcome, StoreError> {
        let stored = self.inner.persistence.get_from(
            &attempt.bucket_id,
            &attempt.stream_id,
            attempt.first_revision(),
            attempt.stream_revision,
        )?;
        if let Some(commit) = stored
            .into_iter()
            .find(|c| c.commit_id == attempt.commit_id && c.same_content(attempt))
        {
            tracing::debug!(
                commit_id = %commit.commit_id,
                "vetoed attempt is a retry of a stored commit"
            );
            self.inner.metrics.commit_duplicate();
            return Ok(CommitOutcome::Duplicate(commit));
        }
        tracing::debug!(%conflict, "commit vetoed by pipeline hook");
        self.inner.metrics.commit_conflict();
        Ok(CommitOutcome::Conflict(conflict))
    }

    /// Commits of one stream overlapping `[min_revision, max_revision]`,
    /// passed through every hook's `select`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disposed`] after disposal, or an engine failure.
    pub fn get_from(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        self.ensure_live()?;
        let commits = self
            .inner
            .persistence
            .get_from(bucket_id, stream_id, min_revision, max_revision)?;
        Ok(self.select(commits))
    }

    /// Every commit after `checkpoint_token`, passed through every hook's
    /// `select`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disposed`] after disposal, or an engine failure.
    pub fn get_from_checkpoint(&self, checkpoint_token: u64) -> Result<Vec<Commit>, StoreError> {
        self.ensure_live()?;
        let commits = self.inner.persistence.get_from_checkpoint(checkpoint_token)?;
        Ok(self.select(commits))
    }

    fn select(&self, commits: Vec<Commit>) -> Vec<Commit> {
        if self.inner.hooks.is_empty() {
            return commits;
        }
        commits
            .into_iter()
            .filter_map(|commit| {
                self.inner
                    .hooks
                    .iter()
                    .try_fold(commit, |commit, hook| hook.select(commit))
            })
            .collect()
    }

    /// Remove every commit and notify hooks.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disposed`] after disposal, or an engine failure.
    pub fn purge(&self) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.inner.persistence.purge()?;
        for hook in &self.inner.hooks {
            hook.on_purge(None);
        }
        Ok(())
    }

    /// Remove every commit in `bucket_id` and notify hooks.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disposed`] after disposal, or an engine failure.
    pub fn purge_bucket(&self, bucket_id: &str) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.inner.persistence.purge_bucket(bucket_id)?;
        for hook in &self.inner.hooks {
            hook.on_purge(Some(bucket_id));
        }
        Ok(())
    }

    /// Remove one stream with its snapshots and notify hooks.
    ///
    /// # Errors
    ///
    /// [`StoreError::Disposed`] after disposal, or an engine failure.
    pub fn delete_stream(&self, bucket_id: &str, stream_id: &str) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.inner.persistence.delete_stream(bucket_id, stream_id)?;
        for hook in &self.inner.hooks {
            hook.on_delete_stream(bucket_id, stream_id);
        }
        Ok(())
    }

    /// Direct access to the engine, bypassing hooks.
    ///
    /// Use for snapshots, checkpoint scans and administrative operations.
    pub fn advanced(&self) -> &Arc<P> {
        &self.inner.persistence
    }

    /// Whether [`dispose`](Self::dispose) has been called on any clone.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Dispose the dispatch scheduler and the engine. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("disposing event store");
        if let Some(scheduler) = &self.inner.scheduler {
            scheduler.dispose();
        }
        self.inner.persistence.dispose();
    }
}

/// How the builder should wire dispatch.
enum DispatchSetup {
    None,
    Scheduler(Arc<dyn ScheduleDispatches>),
    Synchronous(Arc<dyn PublishCommits>),
    Asynchronous(Arc<dyn PublishCommits>, DispatchConfig),
}

/// Builder for [`EventStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_streams::{
///     CountingMetrics, DispatchConfig, EventStore, InMemoryPersistence, NullPublisher,
/// };
///
/// let metrics = Arc::new(CountingMetrics::new());
/// let store = EventStore::builder(Arc::new(InMemoryPersistence::new()))
///     .optimistic_hook()
///     .metrics(metrics.clone())
///     .asynchronous_dispatch(Arc::new(NullPublisher), DispatchConfig::default())
///     .build()
///     .unwrap();
/// store.dispose();
/// ```
pub struct EventStoreBuilder<P: PersistStreams + 'static> {
    persistence: Arc<P>,
    hooks: Vec<Arc<dyn PipelineHook>>,
    detector: Arc<dyn DetectConflicts>,
    metrics: Arc<dyn RecordMetrics>,
    dispatch: DispatchSetup,
}

impl<P: PersistStreams + 'static> EventStoreBuilder<P> {
    /// Create a builder with no hooks, an empty conflict detector, no-op
    /// metrics and no dispatch.
    pub fn new(persistence: Arc<P>) -> Self {
        Self {
            persistence,
            hooks: Vec::new(),
            detector: Arc::new(ConflictDetector::new()),
            metrics: Arc::new(NoopMetrics),
            dispatch: DispatchSetup::None,
        }
    }

    /// Append a pipeline hook. Hooks run in registration order.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn hook(mut self, hook: impl PipelineHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Append an [`OptimisticPipelineHook`] with the default cache size.
    pub fn optimistic_hook(self) -> Self {
        self.hook(OptimisticPipelineHook::default())
    }

    /// Set the detector consulted when a session loses a commit race.
    ///
    /// If not called, nothing is considered conflicting and lost races are
    /// resolved by absorbing the winner's events.
    pub fn conflict_detector(mut self, detector: impl DetectConflicts + 'static) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    /// Set the metrics sink shared by the store and its dispatch scheduler.
    pub fn metrics(mut self, metrics: Arc<dyn RecordMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a custom dispatch scheduler. The store starts it on
    /// [`build`](Self::build) and disposes it with the store.
    pub fn dispatch_scheduler(mut self, scheduler: Arc<dyn ScheduleDispatches>) -> Self {
        self.dispatch = DispatchSetup::Scheduler(scheduler);
        self
    }

    /// Publish each accepted commit inline on the committing thread.
    pub fn synchronous_dispatch(mut self, publisher: Arc<dyn PublishCommits>) -> Self {
        self.dispatch = DispatchSetup::Synchronous(publisher);
        self
    }

    /// Publish accepted commits from a worker pool.
    pub fn asynchronous_dispatch(
        mut self,
        publisher: Arc<dyn PublishCommits>,
        config: DispatchConfig,
    ) -> Self {
        self.dispatch = DispatchSetup::Asynchronous(publisher, config);
        self
    }

    /// Initialize the engine, start dispatch (replaying undispatched
    /// commits) and build the [`EventStore`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the engine cannot be initialized or the
    /// dispatch scheduler fails to start.
    pub fn build(self) -> Result<EventStore<P>, StoreError> {
        self.persistence.initialize()?;

        let engine: Arc<dyn PersistStreams> = self.persistence.clone();
        let scheduler: Option<Arc<dyn ScheduleDispatches>> = match self.dispatch {
            DispatchSetup::None => None,
            DispatchSetup::Scheduler(scheduler) => Some(scheduler),
            DispatchSetup::Synchronous(publisher) => Some(Arc::new(
                SyncDispatchScheduler::new(engine, publisher).with_metrics(self.metrics.clone()),
            )),
            DispatchSetup::Asynchronous(publisher, config) => {
                Some(Arc::new(AsyncDispatchScheduler::with_metrics(
                    engine,
                    publisher,
                    config,
                    self.metrics.clone(),
                )))
            }
        };

        let mut hooks = self.hooks;
        if let Some(scheduler) = &scheduler {
            scheduler.start().map_err(|e| match e {
                DispatchError::Store(e) => e,
                other => StoreError::storage("starting dispatch scheduler", other),
            })?;
            hooks.push(Arc::new(DispatchSchedulerHook::new(Arc::clone(scheduler))));
        }

        tracing::debug!(
            hooks = hooks.len(),
            dispatch = scheduler.is_some(),
            "event store built"
        );
        Ok(EventStore {
            inner: Arc::new(StoreInner {
                persistence: self.persistence,
                hooks,
                detector: self.detector,
                metrics: self.metrics,
                scheduler,
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::commit::DEFAULT_BUCKET;
    use crate::commit::test_fixtures::attempt;
    use crate::error::{BoxError, ConflictKind};
    use crate::memory::InMemoryPersistence;
    use crate::metrics::CountingMetrics;

    fn engine() -> Arc<InMemoryPersistence> {
        Arc::new(InMemoryPersistence::new())
    }

    /// Hides commits whose stream id starts with `_`.
    struct HidePrivate;

    impl PipelineHook for HidePrivate {
        fn select(&self, commit: Commit) -> Option<Commit> {
            (!commit.stream_id.starts_with('_')).then_some(commit)
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<u64>>);

    impl PublishCommits for Recording {
        fn publish(&self, commit: &Commit) -> Result<(), BoxError> {
            self.0.lock().expect("lock").push(commit.checkpoint_token);
            Ok(())
        }
    }

    #[test]
    fn build_initializes_engine() {
        let engine = engine();
        let _store = EventStore::builder(engine.clone())
            .build()
            .expect("store should build");
        assert!(engine.is_initialized());
    }

    #[test]
    fn commit_reports_metrics_for_each_outcome() {
        let metrics = Arc::new(CountingMetrics::new());
        let store = EventStore::builder(engine())
            .metrics(metrics.clone())
            .build()
            .expect("store should build");

        let a = attempt("s", 1, 2, 2);
        assert!(store.commit(a.clone()).expect("commit").is_accepted());
        assert!(matches!(
            store.commit(a).expect("commit"),
            CommitOutcome::Duplicate(_)
        ));
        assert!(matches!(
            store.commit(attempt("s", 1, 1, 1)).expect("commit"),
            CommitOutcome::Conflict(_)
        ));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.events, 2);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.conflicts, 1);
    }

    #[test]
    fn optimistic_hook_vetoes_before_the_engine() {
        let store = EventStore::builder(engine())
            .optimistic_hook()
            .build()
            .expect("store should build");
        store.commit(attempt("s", 1, 1, 1)).expect("commit");

        let outcome = store.commit(attempt("s", 1, 1, 1)).expect("commit");
        let CommitOutcome::Conflict(conflict) = outcome else {
            panic!("expected Conflict, got {outcome:?}");
        };
        assert_eq!(conflict.kind, ConflictKind::Rejected);
    }

    #[test]
    fn optimistic_hook_does_not_hide_retries_of_older_commits() {
        let metrics = Arc::new(CountingMetrics::new());
        let store = EventStore::builder(engine())
            .optimistic_hook()
            .metrics(metrics.clone())
            .build()
            .expect("store should build");
        let first = attempt("s", 1, 1, 1);
        store.commit(first.clone()).expect("commit");
        store.commit(attempt("s", 2, 2, 1)).expect("commit");

        let outcome = store.commit(first.clone()).expect("retry should succeed");
        let CommitOutcome::Duplicate(stored) = outcome else {
            panic!("expected Duplicate, got {outcome:?}");
        };
        assert_eq!(stored.commit_id, first.commit_id);
        assert_eq!(metrics.snapshot().duplicates, 1);
        assert_eq!(metrics.snapshot().conflicts, 0);

        // Same id with different content is still vetoed.
        let mut altered = first;
        altered.events[0] = crate::EventMessage::new("Frozen", serde_json::Value::Null);
        assert!(matches!(
            store.commit(altered).expect("commit"),
            CommitOutcome::Conflict(_)
        ));
    }

    #[test]
    fn select_hooks_filter_reads() {
        let store = EventStore::builder(engine())
            .hook(HidePrivate)
            .build()
            .expect("store should build");
        store.commit(attempt("visible", 1, 1, 1)).expect("commit");
        store.commit(attempt("_hidden", 1, 1, 1)).expect("commit");

        let all = store.get_from_checkpoint(0).expect("scan");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].stream_id, "visible");
        assert_eq!(store.advanced().get_from_checkpoint(0).expect("scan").len(), 2);
    }

    #[test]
    fn synchronous_dispatch_publishes_and_replays_on_build() {
        let engine = engine();
        engine.commit(attempt("before", 1, 1, 1)).expect("commit");

        let publisher = Arc::new(Recording::default());
        let store = EventStore::builder(engine.clone())
            .synchronous_dispatch(publisher.clone())
            .build()
            .expect("store should build");
        assert_eq!(*publisher.0.lock().expect("lock"), vec![1]);

        store.commit(attempt("after", 1, 1, 1)).expect("commit");
        assert_eq!(*publisher.0.lock().expect("lock"), vec![1, 2]);
        assert!(engine.get_undispatched_commits().expect("read").is_empty());
    }

    #[test]
    fn purge_and_delete_go_through_hooks() {
        let store = EventStore::builder(engine())
            .optimistic_hook()
            .build()
            .expect("store should build");
        store.commit(attempt("s", 1, 1, 1)).expect("commit");
        store.delete_stream(DEFAULT_BUCKET, "s").expect("delete");

        // The hook forgot the stream, so a fresh first commit is allowed.
        assert!(store.commit(attempt("s", 1, 1, 1)).expect("commit").is_accepted());

        store.purge().expect("purge");
        assert!(store.commit(attempt("s", 1, 1, 1)).expect("commit").is_accepted());
    }

    #[test]
    fn dispose_is_idempotent_and_shared_by_clones() {
        let engine = engine();
        let store = EventStore::builder(engine.clone())
            .build()
            .expect("store should build");
        let clone = store.clone();

        store.dispose();
        store.dispose();
        assert!(clone.is_disposed());
        assert!(engine.is_disposed());
        assert!(matches!(
            clone.create_stream(DEFAULT_BUCKET, "s"),
            Err(StreamError::Disposed)
        ));
        assert!(matches!(
            clone.commit(attempt("s", 1, 1, 1)),
            Err(StoreError::Disposed)
        ));
    }

    // The store is shared across threads by cloning.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<EventStore<InMemoryPersistence>>();
            assert_send_sync::<crate::EventStream<InMemoryPersistence>>();
        }
    };
}
