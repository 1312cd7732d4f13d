//! The storage-agnostic persistence contract and its async adapter.
//!
//! [`PersistStreams`] is the blocking contract every backend implements.
//! [`AsyncPersistence`] exposes the same operations as `async fn`s that move
//! the blocking call onto tokio's blocking pool, so async callers never stall
//! a runtime worker on engine locks or I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::commit::{Commit, CommitAttempt, Snapshot, StreamHead};
use crate::concurrency::CommitOutcome;
use crate::error::StoreError;

/// Storage contract for commits, stream heads, snapshots and dispatch state.
///
/// Implementations must be safe to share across threads. Conflicting writes
/// to the *same* stream are serialized by [`commit`](PersistStreams::commit);
/// writes to different streams should not block each other beyond what the
/// backend needs for the global checkpoint order.
///
/// Every operation on a disposed engine returns [`StoreError::Disposed`].
pub trait PersistStreams: Send + Sync {
    /// Prepare storage. Safe to call any number of times.
    fn initialize(&self) -> Result<(), StoreError>;

    /// Persist one commit attempt atomically.
    ///
    /// Runs [`check_attempt`](crate::check_attempt) and, on
    /// [`AttemptCheck::Proceed`](crate::AttemptCheck::Proceed), stores the
    /// commit, advances the stream head, enqueues it as undispatched and
    /// assigns the next checkpoint token.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidCommit`] for structurally invalid attempts, or a
    /// backend failure. Duplicates and conflicts are returned as
    /// [`CommitOutcome`] variants.
    fn commit(&self, attempt: CommitAttempt) -> Result<CommitOutcome, StoreError>;

    /// Commits of one stream overlapping `[min_revision, max_revision]`,
    /// ordered by commit sequence.
    fn get_from(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>, StoreError>;

    /// Every commit with a checkpoint token greater than `checkpoint_token`,
    /// in ascending token order.
    fn get_from_checkpoint(&self, checkpoint_token: u64) -> Result<Vec<Commit>, StoreError>;

    /// Like [`get_from_checkpoint`](Self::get_from_checkpoint), limited to one
    /// bucket.
    fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &str,
        checkpoint_token: u64,
    ) -> Result<Vec<Commit>, StoreError>;

    /// Bucket commits stamped at or after `start`, in checkpoint order.
    fn get_from_time(&self, bucket_id: &str, start: DateTime<Utc>)
    -> Result<Vec<Commit>, StoreError>;

    /// Bucket commits stamped in `[start, end)`, in checkpoint order.
    ///
    /// Stamps are wall-clock values and may collide or skew; the result is a
    /// deterministic slice of the store's order, not an exact time window.
    fn get_from_to(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError>;

    /// Commits not yet marked dispatched, in arrival order.
    fn get_undispatched_commits(&self) -> Result<Vec<Commit>, StoreError>;

    /// Remove `commit` from the undispatched set. Idempotent.
    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<(), StoreError>;

    /// Heads whose `head_revision - snapshot_revision >= max_threshold`.
    fn get_streams_to_snapshot(&self, max_threshold: u64) -> Result<Vec<StreamHead>, StoreError>;

    /// The snapshot with the highest revision not above `max_revision`.
    fn get_snapshot(
        &self,
        bucket_id: &str,
        stream_id: &str,
        max_revision: u64,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// Record a snapshot and advance the head's snapshot revision.
    ///
    /// Returns `false`, recording nothing, when the stream has no head.
    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool, StoreError>;

    /// Remove all state.
    fn purge(&self) -> Result<(), StoreError>;

    /// Remove all state belonging to one bucket.
    fn purge_bucket(&self, bucket_id: &str) -> Result<(), StoreError>;

    /// Remove all state and whatever storage structures `initialize` created.
    fn drop_store(&self) -> Result<(), StoreError>;

    /// Remove a stream's commits, head and snapshots.
    fn delete_stream(&self, bucket_id: &str, stream_id: &str) -> Result<(), StoreError>;

    /// Release backend resources. Idempotent.
    fn dispose(&self);

    /// Whether [`dispose`](Self::dispose) has been called.
    fn is_disposed(&self) -> bool;
}

impl<P: PersistStreams + ?Sized> PersistStreams for Arc<P> {
    fn initialize(&self) -> Result<(), StoreError> {
        (**self).initialize()
    }

    fn commit(&self, attempt: CommitAttempt) -> Result<CommitOutcome, StoreError> {
        (**self).commit(attempt)
    }

    fn get_from(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        (**self).get_from(bucket_id, stream_id, min_revision, max_revision)
    }

    fn get_from_checkpoint(&self, checkpoint_token: u64) -> Result<Vec<Commit>, StoreError> {
        (**self).get_from_checkpoint(checkpoint_token)
    }

    fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &str,
        checkpoint_token: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        (**self).get_from_bucket_checkpoint(bucket_id, checkpoint_token)
    }

    fn get_from_time(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError> {
        (**self).get_from_time(bucket_id, start)
    }

    fn get_from_to(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError> {
        (**self).get_from_to(bucket_id, start, end)
    }

    fn get_undispatched_commits(&self) -> Result<Vec<Commit>, StoreError> {
        (**self).get_undispatched_commits()
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<(), StoreError> {
        (**self).mark_commit_as_dispatched(commit)
    }

    fn get_streams_to_snapshot(&self, max_threshold: u64) -> Result<Vec<StreamHead>, StoreError> {
        (**self).get_streams_to_snapshot(max_threshold)
    }

    fn get_snapshot(
        &self,
        bucket_id: &str,
        stream_id: &str,
        max_revision: u64,
    ) -> Result<Option<Snapshot>, StoreError> {
        (**self).get_snapshot(bucket_id, stream_id, max_revision)
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool, StoreError> {
        (**self).add_snapshot(snapshot)
    }

    fn purge(&self) -> Result<(), StoreError> {
        (**self).purge()
    }

    fn purge_bucket(&self, bucket_id: &str) -> Result<(), StoreError> {
        (**self).purge_bucket(bucket_id)
    }

    fn drop_store(&self) -> Result<(), StoreError> {
        (**self).drop_store()
    }

    fn delete_stream(&self, bucket_id: &str, stream_id: &str) -> Result<(), StoreError> {
        (**self).delete_stream(bucket_id, stream_id)
    }

    fn dispose(&self) {
        (**self).dispose()
    }

    fn is_disposed(&self) -> bool {
        (**self).is_disposed()
    }
}

/// Async view over a blocking [`PersistStreams`] engine.
///
/// Each call clones the inner `Arc` into a `spawn_blocking` closure and
/// awaits it. `Clone` is cheap.
#[derive(Debug)]
pub struct AsyncPersistence<P: ?Sized> {
    inner: Arc<P>,
}

impl<P: ?Sized> Clone for AsyncPersistence<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PersistStreams + ?Sized + 'static> AsyncPersistence<P> {
    /// Wrap a shared engine.
    pub fn new(inner: Arc<P>) -> Self {
        Self { inner }
    }

    /// The wrapped blocking engine.
    pub fn blocking(&self) -> &Arc<P> {
        &self.inner
    }

    /// Run `op` against the engine on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&P) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&*inner))
            .await
            .map_err(|e| StoreError::storage("blocking persistence task failed", e))?
    }

    /// See [`PersistStreams::initialize`].
    pub async fn initialize(&self) -> Result<(), StoreError> {
        self.run(|p| p.initialize()).await
    }

    /// See [`PersistStreams::commit`].
    pub async fn commit(&self, attempt: CommitAttempt) -> Result<CommitOutcome, StoreError> {
        self.run(move |p| p.commit(attempt)).await
    }

    /// See [`PersistStreams::get_from`].
    pub async fn get_from(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        let (bucket_id, stream_id) = (bucket_id.to_owned(), stream_id.to_owned());
        self.run(move |p| p.get_from(&bucket_id, &stream_id, min_revision, max_revision))
            .await
    }

    /// See [`PersistStreams::get_from_checkpoint`].
    pub async fn get_from_checkpoint(
        &self,
        checkpoint_token: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        self.run(move |p| p.get_from_checkpoint(checkpoint_token))
            .await
    }

    /// See [`PersistStreams::get_from_bucket_checkpoint`].
    pub async fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &str,
        checkpoint_token: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        let bucket_id = bucket_id.to_owned();
        self.run(move |p| p.get_from_bucket_checkpoint(&bucket_id, checkpoint_token))
            .await
    }

    /// See [`PersistStreams::get_from_time`].
    pub async fn get_from_time(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError> {
        let bucket_id = bucket_id.to_owned();
        self.run(move |p| p.get_from_time(&bucket_id, start)).await
    }

    /// See [`PersistStreams::get_from_to`].
    pub async fn get_from_to(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError> {
        let bucket_id = bucket_id.to_owned();
        self.run(move |p| p.get_from_to(&bucket_id, start, end))
            .await
    }

    /// See [`PersistStreams::get_undispatched_commits`].
    pub async fn get_undispatched_commits(&self) -> Result<Vec<Commit>, StoreError> {
        self.run(|p| p.get_undispatched_commits()).await
    }

    /// See [`PersistStreams::mark_commit_as_dispatched`].
    pub async fn mark_commit_as_dispatched(&self, commit: Commit) -> Result<(), StoreError> {
        self.run(move |p| p.mark_commit_as_dispatched(&commit))
            .await
    }

    /// See [`PersistStreams::get_streams_to_snapshot`].
    pub async fn get_streams_to_snapshot(
        &self,
        max_threshold: u64,
    ) -> Result<Vec<StreamHead>, StoreError> {
        self.run(move |p| p.get_streams_to_snapshot(max_threshold))
            .await
    }

    /// See [`PersistStreams::get_snapshot`].
    pub async fn get_snapshot(
        &self,
        bucket_id: &str,
        stream_id: &str,
        max_revision: u64,
    ) -> Result<Option<Snapshot>, StoreError> {
        let (bucket_id, stream_id) = (bucket_id.to_owned(), stream_id.to_owned());
        self.run(move |p| p.get_snapshot(&bucket_id, &stream_id, max_revision))
            .await
    }

    /// See [`PersistStreams::add_snapshot`].
    pub async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool, StoreError> {
        self.run(move |p| p.add_snapshot(snapshot)).await
    }

    /// See [`PersistStreams::purge`].
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.run(|p| p.purge()).await
    }

    /// See [`PersistStreams::purge_bucket`].
    pub async fn purge_bucket(&self, bucket_id: &str) -> Result<(), StoreError> {
        let bucket_id = bucket_id.to_owned();
        self.run(move |p| p.purge_bucket(&bucket_id)).await
    }

    /// See [`PersistStreams::drop_store`].
    pub async fn drop_store(&self) -> Result<(), StoreError> {
        self.run(|p| p.drop_store()).await
    }

    /// See [`PersistStreams::delete_stream`].
    pub async fn delete_stream(&self, bucket_id: &str, stream_id: &str) -> Result<(), StoreError> {
        let (bucket_id, stream_id) = (bucket_id.to_owned(), stream_id.to_owned());
        self.run(move |p| p.delete_stream(&bucket_id, &stream_id))
            .await
    }

    /// See [`PersistStreams::dispose`].
    pub fn dispose(&self) {
        self.inner.dispose()
    }

    /// See [`PersistStreams::is_disposed`].
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}
