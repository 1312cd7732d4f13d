//! In-memory reference engine.
//!
//! All state sits behind a single mutex, so every operation observes one
//! total order. Reads are linear scans over the commit list. The engine is the
//! behavioural baseline other backends are tested against, and the default
//! engine for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::commit::{Commit, CommitAttempt, Snapshot, StreamHead};
use crate::concurrency::{AttemptCheck, CommitOutcome, StreamPosition, check_attempt};
use crate::error::StoreError;
use crate::persistence::PersistStreams;

/// `(bucket_id, stream_id)`.
type StreamKey = (String, String);

fn key(bucket_id: &str, stream_id: &str) -> StreamKey {
    (bucket_id.to_owned(), stream_id.to_owned())
}

/// Per-stream bookkeeping kept next to the head.
#[derive(Debug)]
struct StreamEntry {
    head: StreamHead,
    commit_sequence: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Every commit, in checkpoint order.
    commits: Vec<Commit>,
    /// Checkpoint tokens of commits not yet dispatched.
    undispatched: BTreeSet<u64>,
    streams: HashMap<StreamKey, StreamEntry>,
    /// Snapshots per stream, keyed by revision.
    snapshots: HashMap<StreamKey, BTreeMap<u64, Snapshot>>,
    /// Last checkpoint token handed out. Survives purge, drop and delete so
    /// tokens are never reissued.
    last_checkpoint: u64,
    initialized: bool,
}

impl MemoryState {
    fn clear(&mut self) {
        self.commits.clear();
        self.undispatched.clear();
        self.streams.clear();
        self.snapshots.clear();
    }

    fn remove_where(&mut self, mut doomed: impl FnMut(&str, &str) -> bool) {
        let undispatched = &mut self.undispatched;
        self.commits.retain(|c| {
            let remove = doomed(&c.bucket_id, &c.stream_id);
            if remove {
                undispatched.remove(&c.checkpoint_token);
            }
            !remove
        });
        self.streams.retain(|(b, s), _| !doomed(b, s));
        self.snapshots.retain(|(b, s), _| !doomed(b, s));
    }
}

/// A [`PersistStreams`] engine that keeps everything in process memory.
///
/// Nothing survives the process. Checkpoint tokens are unique for the
/// lifetime of the instance.
///
/// # Examples
///
/// ```
/// use eventfold_streams::{InMemoryPersistence, PersistStreams};
///
/// let engine = InMemoryPersistence::new();
/// engine.initialize().unwrap();
/// assert!(engine.get_from_checkpoint(0).unwrap().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    state: Mutex<MemoryState>,
    disposed: AtomicBool,
}

impl InMemoryPersistence {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`initialize`](PersistStreams::initialize) has run since the
    /// last [`drop_store`](PersistStreams::drop_store).
    pub fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.initialized)
            .unwrap_or(false)
    }

    /// Lock the state, failing fast once disposed.
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        self.state
            .lock()
            .map_err(|_| StoreError::storage("in-memory state lock poisoned", "poisoned mutex"))
    }

    fn scan(&self, mut keep: impl FnMut(&Commit) -> bool) -> Result<Vec<Commit>, StoreError> {
        let state = self.lock()?;
        Ok(state.commits.iter().filter(|c| keep(c)).cloned().collect())
    }
}

impl PersistStreams for InMemoryPersistence {
    fn initialize(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.initialized {
            tracing::debug!("initializing in-memory persistence");
            state.initialized = true;
        }
        Ok(())
    }

    fn commit(&self, attempt: CommitAttempt) -> Result<CommitOutcome, StoreError> {
        attempt.validate().map_err(StoreError::InvalidCommit)?;

        let mut state = self.lock()?;
        let stream_key = key(&attempt.bucket_id, &attempt.stream_id);
        let position = state
            .streams
            .get(&stream_key)
            .map(|entry| StreamPosition {
                revision: entry.head.head_revision,
                commit_sequence: entry.commit_sequence,
            })
            .unwrap_or_default();
        let existing = state.commits.iter().find(|c| {
            c.commit_id == attempt.commit_id
                && c.bucket_id == attempt.bucket_id
                && c.stream_id == attempt.stream_id
        });

        match check_attempt(&attempt, position, existing) {
            AttemptCheck::Duplicate(stored) => {
                tracing::debug!(
                    stream_id = %attempt.stream_id,
                    commit_id = %attempt.commit_id,
                    "duplicate commit attempt"
                );
                return Ok(CommitOutcome::Duplicate(stored.clone()));
            }
            AttemptCheck::Conflict(conflict) => {
                tracing::debug!(%conflict, "commit attempt rejected");
                return Ok(CommitOutcome::Conflict(conflict));
            }
            AttemptCheck::Proceed => {}
        }

        state.last_checkpoint += 1;
        let commit = attempt.into_commit(state.last_checkpoint);

        let entry = state
            .streams
            .entry(stream_key)
            .or_insert_with(|| StreamEntry {
                head: StreamHead {
                    bucket_id: commit.bucket_id.clone(),
                    stream_id: commit.stream_id.clone(),
                    head_revision: 0,
                    snapshot_revision: 0,
                },
                commit_sequence: 0,
            });
        entry.head.head_revision = commit.stream_revision;
        entry.commit_sequence = commit.commit_sequence;

        state.undispatched.insert(commit.checkpoint_token);
        state.commits.push(commit.clone());

        tracing::debug!(
            stream_id = %commit.stream_id,
            commit_sequence = commit.commit_sequence,
            checkpoint_token = commit.checkpoint_token,
            "commit stored"
        );
        Ok(CommitOutcome::Accepted(commit))
    }

    fn get_from(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        // Checkpoint order equals commit-sequence order within a stream.
        self.scan(|c| {
            c.bucket_id == bucket_id
                && c.stream_id == stream_id
                && c.overlaps(min_revision, max_revision)
        })
    }

    fn get_from_checkpoint(&self, checkpoint_token: u64) -> Result<Vec<Commit>, StoreError> {
        self.scan(|c| c.checkpoint_token > checkpoint_token)
    }

    fn get_from_bucket_checkpoint(
        &self,
        bucket_id: &str,
        checkpoint_token: u64,
    ) -> Result<Vec<Commit>, StoreError> {
        self.scan(|c| c.bucket_id == bucket_id && c.checkpoint_token > checkpoint_token)
    }

    fn get_from_time(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError> {
        self.scan(|c| c.bucket_id == bucket_id && c.commit_stamp >= start)
    }

    fn get_from_to(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Commit>, StoreError> {
        self.scan(|c| c.bucket_id == bucket_id && c.commit_stamp >= start && c.commit_stamp < end)
    }

    fn get_undispatched_commits(&self) -> Result<Vec<Commit>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .commits
            .iter()
            .filter(|c| state.undispatched.contains(&c.checkpoint_token))
            .cloned()
            .collect())
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if !state.undispatched.remove(&commit.checkpoint_token) {
            tracing::debug!(
                checkpoint_token = commit.checkpoint_token,
                "commit already marked as dispatched"
            );
        }
        Ok(())
    }

    fn get_streams_to_snapshot(&self, max_threshold: u64) -> Result<Vec<StreamHead>, StoreError> {
        let state = self.lock()?;
        let mut heads: Vec<StreamHead> = state
            .streams
            .values()
            .filter(|entry| entry.head.unsnapshotted() >= max_threshold)
            .map(|entry| entry.head.clone())
            .collect();
        heads.sort_by(|a, b| {
            (&a.bucket_id, &a.stream_id).cmp(&(&b.bucket_id, &b.stream_id))
        });
        Ok(heads)
    }

    fn get_snapshot(
        &self,
        bucket_id: &str,
        stream_id: &str,
        max_revision: u64,
    ) -> Result<Option<Snapshot>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .snapshots
            .get(&key(bucket_id, stream_id))
            .and_then(|by_revision| by_revision.range(..=max_revision).next_back())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let stream_key = key(&snapshot.bucket_id, &snapshot.stream_id);
        let Some(entry) = state.streams.get_mut(&stream_key) else {
            tracing::debug!(
                stream_id = %snapshot.stream_id,
                "snapshot for unknown stream ignored"
            );
            return Ok(false);
        };
        entry.head.snapshot_revision = entry.head.snapshot_revision.max(snapshot.stream_revision);
        state
            .snapshots
            .entry(stream_key)
            .or_default()
            .insert(snapshot.stream_revision, snapshot);
        Ok(true)
    }

    fn purge(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        tracing::warn!("purging all in-memory commits");
        state.clear();
        Ok(())
    }

    fn purge_bucket(&self, bucket_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        tracing::warn!(bucket_id, "purging bucket");
        state.remove_where(|b, _| b == bucket_id);
        Ok(())
    }

    fn drop_store(&self) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        tracing::warn!("dropping in-memory store");
        state.clear();
        state.initialized = false;
        Ok(())
    }

    fn delete_stream(&self, bucket_id: &str, stream_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        tracing::info!(bucket_id, stream_id, "deleting stream");
        state.remove_where(|b, s| b == bucket_id && s == stream_id);
        Ok(())
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!("in-memory persistence disposed");
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;
    use crate::commit::DEFAULT_BUCKET;
    use crate::commit::test_fixtures::attempt;
    use crate::error::ConflictKind;

    fn accepted(engine: &InMemoryPersistence, a: CommitAttempt) -> Commit {
        match engine.commit(a).expect("commit should succeed") {
            CommitOutcome::Accepted(c) => c,
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let engine = InMemoryPersistence::new();
        engine.initialize().expect("first initialize");
        engine.initialize().expect("second initialize");
        assert!(engine.is_initialized());
    }

    #[test]
    fn per_stream_sequence_and_revision_advance_without_gaps() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("s", 1, 1, 1));
        accepted(&engine, attempt("s", 2, 3, 2));
        accepted(&engine, attempt("s", 3, 4, 1));

        let commits = engine
            .get_from(DEFAULT_BUCKET, "s", 0, u64::MAX)
            .expect("read should succeed");
        let sequences: Vec<u64> = commits.iter().map(|c| c.commit_sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        for pair in commits.windows(2) {
            assert_eq!(
                pair[1].stream_revision,
                pair[0].stream_revision + pair[1].events.len() as u64
            );
        }
    }

    #[test]
    fn get_from_returns_commits_overlapping_the_range() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("s", 1, 2, 2)); // 1..=2
        accepted(&engine, attempt("s", 2, 5, 3)); // 3..=5
        accepted(&engine, attempt("s", 3, 6, 1)); // 6

        let middle = engine
            .get_from(DEFAULT_BUCKET, "s", 4, 4)
            .expect("read should succeed");
        assert_eq!(middle.len(), 1);
        assert_eq!(middle[0].commit_sequence, 2);

        let tail = engine
            .get_from(DEFAULT_BUCKET, "s", 2, u64::MAX)
            .expect("read should succeed");
        assert_eq!(tail.len(), 3);
    }

    #[test]
    fn checkpoint_scan_is_strictly_greater_and_ascending() {
        let engine = InMemoryPersistence::new();
        for i in 0..5 {
            accepted(&engine, attempt(&format!("s-{i}"), 1, 1, 1));
        }
        let page = engine.get_from_checkpoint(2).expect("scan should succeed");
        let tokens: Vec<u64> = page.iter().map(|c| c.checkpoint_token).collect();
        assert_eq!(tokens, vec![3, 4, 5]);
    }

    #[test]
    fn bucket_checkpoint_scan_filters_bucket() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("s", 1, 1, 1));
        let mut other = attempt("s", 1, 1, 1);
        other.bucket_id = "tenant-b".to_owned();
        accepted(&engine, other);

        let page = engine
            .get_from_bucket_checkpoint("tenant-b", 0)
            .expect("scan should succeed");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].checkpoint_token, 2);
    }

    #[test]
    fn duplicate_leaves_state_unchanged() {
        let engine = InMemoryPersistence::new();
        let a = attempt("s", 1, 1, 1);
        let first = accepted(&engine, a.clone());

        let outcome = engine.commit(a).expect("retry should not error");
        assert_eq!(outcome, CommitOutcome::Duplicate(first));
        assert_eq!(
            engine.get_from_checkpoint(0).expect("scan").len(),
            1,
            "duplicate must not store a second commit"
        );
        assert_eq!(engine.get_undispatched_commits().expect("read").len(), 1);
    }

    #[test]
    fn stale_writer_gets_a_conflict() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("s", 1, 1, 1));
        let outcome = engine
            .commit(attempt("s", 1, 1, 1))
            .expect("conflict is not an error");
        let CommitOutcome::Conflict(conflict) = outcome else {
            panic!("expected Conflict, got {outcome:?}");
        };
        assert_eq!(conflict.kind, ConflictKind::Overlap);
    }

    #[test]
    fn invalid_attempt_is_rejected() {
        let engine = InMemoryPersistence::new();
        let err = engine
            .commit(attempt("s", 1, 1, 0))
            .expect_err("empty commit should be rejected");
        assert!(matches!(err, StoreError::InvalidCommit(_)));
    }

    #[test]
    fn concurrent_writers_on_one_stream_exactly_one_wins() {
        let engine = Arc::new(InMemoryPersistence::new());
        let writers = 8;
        let barrier = Arc::new(Barrier::new(writers));

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let a = attempt("contested", 1, 1, 1);
                    barrier.wait();
                    engine.commit(a).expect("commit should not error")
                })
            })
            .collect();

        let outcomes: Vec<CommitOutcome> = handles
            .into_iter()
            .map(|h| h.join().expect("writer thread panicked"))
            .collect();
        let wins = outcomes.iter().filter(|o| o.is_accepted()).count();
        let conflicts = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Conflict(_)))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, writers - 1);
    }

    #[test]
    fn undispatched_tracking_and_idempotent_mark() {
        let engine = InMemoryPersistence::new();
        let c1 = accepted(&engine, attempt("a", 1, 1, 1));
        let c2 = accepted(&engine, attempt("b", 1, 1, 1));

        engine.mark_commit_as_dispatched(&c1).expect("mark");
        engine.mark_commit_as_dispatched(&c1).expect("second mark");
        let pending = engine.get_undispatched_commits().expect("read");
        assert_eq!(pending, vec![c2]);
    }

    #[test]
    fn time_window_queries() {
        let engine = InMemoryPersistence::new();
        let base = Utc::now();
        for (i, offset) in [0i64, 10, 20].into_iter().enumerate() {
            let mut a = attempt(&format!("s-{i}"), 1, 1, 1);
            a.commit_stamp = base + chrono::Duration::seconds(offset);
            accepted(&engine, a);
        }
        let window = engine
            .get_from_to(
                DEFAULT_BUCKET,
                base + chrono::Duration::seconds(5),
                base + chrono::Duration::seconds(20),
            )
            .expect("query should succeed");
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].stream_id, "s-1");

        let since = engine
            .get_from_time(DEFAULT_BUCKET, base + chrono::Duration::seconds(10))
            .expect("query should succeed");
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn snapshot_bounding_and_candidates() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("s", 1, 5, 5));
        assert_eq!(engine.get_streams_to_snapshot(5).expect("read").len(), 1);

        let snap = Snapshot {
            bucket_id: DEFAULT_BUCKET.to_owned(),
            stream_id: "s".to_owned(),
            stream_revision: 5,
            payload: serde_json::json!({ "balance": 5 }),
        };
        assert!(engine.add_snapshot(snap).expect("add snapshot"));
        assert!(engine.get_streams_to_snapshot(5).expect("read").is_empty());

        assert!(
            engine
                .get_snapshot(DEFAULT_BUCKET, "s", 4)
                .expect("read")
                .is_none(),
            "snapshot above max revision must not be returned"
        );
        let found = engine
            .get_snapshot(DEFAULT_BUCKET, "s", 10)
            .expect("read")
            .expect("snapshot should exist");
        assert_eq!(found.stream_revision, 5);

        accepted(&engine, attempt("s", 2, 10, 5));
        let heads = engine.get_streams_to_snapshot(5).expect("read");
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].head_revision, 10);
        assert_eq!(heads[0].snapshot_revision, 5);
    }

    #[test]
    fn add_snapshot_for_unknown_stream_returns_false() {
        let engine = InMemoryPersistence::new();
        let snap = Snapshot {
            bucket_id: DEFAULT_BUCKET.to_owned(),
            stream_id: "ghost".to_owned(),
            stream_revision: 1,
            payload: serde_json::Value::Null,
        };
        assert!(!engine.add_snapshot(snap).expect("add should not error"));
        assert!(
            engine
                .get_snapshot(DEFAULT_BUCKET, "ghost", u64::MAX)
                .expect("read")
                .is_none()
        );
    }

    #[test]
    fn purge_keeps_checkpoints_unique() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("s", 1, 1, 1));
        engine.purge().expect("purge");
        assert!(engine.get_from_checkpoint(0).expect("scan").is_empty());

        let again = accepted(&engine, attempt("s", 1, 1, 1));
        assert_eq!(again.checkpoint_token, 2, "tokens are never reissued");
    }

    #[test]
    fn delete_stream_and_purge_bucket_remove_only_their_scope() {
        let engine = InMemoryPersistence::new();
        accepted(&engine, attempt("keep", 1, 1, 1));
        accepted(&engine, attempt("gone", 1, 1, 1));
        let mut tenant = attempt("t", 1, 1, 1);
        tenant.bucket_id = "tenant".to_owned();
        accepted(&engine, tenant);

        engine.delete_stream(DEFAULT_BUCKET, "gone").expect("delete");
        engine.purge_bucket("tenant").expect("purge bucket");

        let left = engine.get_from_checkpoint(0).expect("scan");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].stream_id, "keep");
        assert_eq!(engine.get_undispatched_commits().expect("read").len(), 1);
        assert_eq!(engine.get_streams_to_snapshot(0).expect("read").len(), 1);
    }

    #[test]
    fn drop_store_resets_initialization() {
        let engine = InMemoryPersistence::new();
        engine.initialize().expect("initialize");
        engine.drop_store().expect("drop");
        assert!(!engine.is_initialized());
    }

    #[test]
    fn disposed_engine_fails_fast() {
        let engine = InMemoryPersistence::new();
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(matches!(
            engine.commit(attempt("s", 1, 1, 1)),
            Err(StoreError::Disposed)
        ));
        assert!(matches!(
            engine.get_from_checkpoint(0),
            Err(StoreError::Disposed)
        ));
    }
}
