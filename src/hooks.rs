//! Pipeline hooks run by [`EventStore`](crate::EventStore) around every
//! commit and read.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::commit::{Commit, CommitAttempt};
use crate::concurrency::StreamPosition;
use crate::dispatch::ScheduleDispatches;
use crate::error::{ConcurrencyConflict, ConflictKind};

/// Interception points around the store's commit and read paths.
///
/// Hooks run in registration order. Every method has a pass-through default.
pub trait PipelineHook: Send + Sync {
    /// Filter or transform a commit read back from the engine.
    ///
    /// Returning `None` hides the commit from the caller.
    fn select(&self, commit: Commit) -> Option<Commit> {
        Some(commit)
    }

    /// Inspect an attempt before it reaches the engine.
    ///
    /// # Errors
    ///
    /// Returning a conflict vetoes the attempt; the store reports it as
    /// [`CommitOutcome::Conflict`](crate::CommitOutcome::Conflict) without
    /// writing to the engine, unless the attempt turns out to be a retry of a
    /// stored commit.
    fn pre_commit(&self, attempt: &CommitAttempt) -> Result<(), ConcurrencyConflict> {
        let _ = attempt;
        Ok(())
    }

    /// Observe a commit the engine accepted.
    fn post_commit(&self, commit: &Commit) {
        let _ = commit;
    }

    /// The store was purged: everything when `bucket_id` is `None`,
    /// otherwise one bucket.
    fn on_purge(&self, bucket_id: Option<&str>) {
        let _ = bucket_id;
    }

    /// One stream was deleted.
    fn on_delete_stream(&self, bucket_id: &str, stream_id: &str) {
        let _ = (bucket_id, stream_id);
    }
}

/// Default number of stream heads kept by [`OptimisticPipelineHook`].
pub const DEFAULT_MAX_CACHED_STREAMS: usize = 100;

#[derive(Debug, Clone, Copy)]
struct CachedHead {
    position: StreamPosition,
    last_commit_id: Uuid,
}

#[derive(Debug, Default)]
struct HeadCache {
    heads: HashMap<(String, String), CachedHead>,
    /// Insertion order, oldest first, for eviction.
    order: VecDeque<(String, String)>,
}

/// Vetoes attempts already known to be stale, saving an engine round trip.
///
/// The hook remembers the head of the most recently committed streams. An
/// attempt whose sequence or first revision does not move past the cached
/// head is rejected with [`ConflictKind::Rejected`]. A retry of the cached
/// commit is let through; retries of older commits are recognised by the
/// store after the veto.
///
/// The cache only learns from commits made through the store it is
/// registered with, so it can lag behind the engine but never run ahead of
/// it, as long as purges and deletes also go through that store.
#[derive(Debug)]
pub struct OptimisticPipelineHook {
    max_streams: usize,
    cache: Mutex<HeadCache>,
}

impl Default for OptimisticPipelineHook {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_STREAMS)
    }
}

impl OptimisticPipelineHook {
    /// Cache at most `max_streams` heads (at least one).
    pub fn new(max_streams: usize) -> Self {
        Self {
            max_streams: max_streams.max(1),
            cache: Mutex::new(HeadCache::default()),
        }
    }

    /// Number of heads currently cached.
    pub fn cached_streams(&self) -> usize {
        self.cache.lock().map(|c| c.heads.len()).unwrap_or(0)
    }
}

impl PipelineHook for OptimisticPipelineHook {
    fn pre_commit(&self, attempt: &CommitAttempt) -> Result<(), ConcurrencyConflict> {
        let Ok(cache) = self.cache.lock() else {
            return Ok(());
        };
        let key = (attempt.bucket_id.clone(), attempt.stream_id.clone());
        let Some(head) = cache.heads.get(&key) else {
            return Ok(());
        };
        if head.last_commit_id == attempt.commit_id {
            return Ok(());
        }
        let stale = attempt.commit_sequence <= head.position.commit_sequence
            || attempt.first_revision() <= head.position.revision;
        if !stale {
            return Ok(());
        }
        tracing::debug!(
            stream_id = %attempt.stream_id,
            attempted_sequence = attempt.commit_sequence,
            head_sequence = head.position.commit_sequence,
            "stale attempt rejected from head cache"
        );
        Err(ConcurrencyConflict {
            bucket_id: attempt.bucket_id.clone(),
            stream_id: attempt.stream_id.clone(),
            kind: ConflictKind::Rejected,
            attempted_sequence: attempt.commit_sequence,
            attempted_revision: attempt.stream_revision,
            head_sequence: head.position.commit_sequence,
            head_revision: head.position.revision,
        })
    }

    fn post_commit(&self, commit: &Commit) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        let key = (commit.bucket_id.clone(), commit.stream_id.clone());
        let head = CachedHead {
            position: StreamPosition {
                revision: commit.stream_revision,
                commit_sequence: commit.commit_sequence,
            },
            last_commit_id: commit.commit_id,
        };
        if cache.heads.insert(key.clone(), head).is_none() {
            cache.order.push_back(key);
            while cache.heads.len() > self.max_streams {
                match cache.order.pop_front() {
                    Some(oldest) => {
                        cache.heads.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    fn on_purge(&self, bucket_id: Option<&str>) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        match bucket_id {
            None => {
                cache.heads.clear();
                cache.order.clear();
            }
            Some(bucket_id) => {
                cache.heads.retain(|(b, _), _| b != bucket_id);
                cache.order.retain(|(b, _)| b != bucket_id);
            }
        }
    }

    fn on_delete_stream(&self, bucket_id: &str, stream_id: &str) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        cache
            .heads
            .retain(|(b, s), _| !(b == bucket_id && s == stream_id));
        cache
            .order
            .retain(|(b, s)| !(b == bucket_id && s == stream_id));
    }
}

/// Hands every accepted commit to a dispatch scheduler.
///
/// A scheduling failure is logged and otherwise ignored: the commit is
/// already durable and undispatched, so the next scheduler start replays it.
pub struct DispatchSchedulerHook {
    scheduler: Arc<dyn ScheduleDispatches>,
}

impl DispatchSchedulerHook {
    /// Forward commits to `scheduler`.
    pub fn new(scheduler: Arc<dyn ScheduleDispatches>) -> Self {
        Self { scheduler }
    }
}

impl PipelineHook for DispatchSchedulerHook {
    fn post_commit(&self, commit: &Commit) {
        if let Err(e) = self.scheduler.schedule_dispatch(commit.clone()) {
            tracing::warn!(
                commit_id = %commit.commit_id,
                error = %e,
                "could not schedule dispatch, commit left for replay"
            );
        }
    }
}
