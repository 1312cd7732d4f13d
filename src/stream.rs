//! Per-aggregate read/write session.
//!
//! An [`EventStream`] is a client-local view of one stream: the events loaded
//! from the engine plus a batch of uncommitted events. It is not shared and
//! owns no engine state; on a lost race it reconciles by reloading what the
//! other writer committed.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::commit::{Commit, CommitAttempt, EventMessage, Headers, Snapshot};
use crate::concurrency::CommitOutcome;
use crate::error::{ConcurrencyConflict, StoreError, StreamError};
use crate::persistence::PersistStreams;
use crate::store::EventStore;

/// Lifecycle of an [`EventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Commits are being read from the engine.
    Loading,
    /// Accepting events and commits.
    Ready,
    /// A commit attempt is in flight.
    Committing,
    /// The last commit lost to a conflicting write. The session holds the
    /// refreshed history and its uncommitted events; commit again or clear.
    Conflicted,
    /// Terminal.
    Disposed,
}

/// What [`EventStream::commit_changes`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitReceipt {
    /// The batch was stored as this commit.
    Committed(Commit),
    /// The batch had already been stored under the same commit id.
    Duplicate,
    /// There was nothing to commit.
    NoChanges,
    /// Another writer got there first with non-conflicting events. The
    /// session absorbed them and dropped its own batch.
    Resolved {
        /// Commits that won the race, oldest first.
        concurrent: Vec<Commit>,
    },
}

/// A read/write session over one stream.
///
/// Obtain one from [`EventStore::create_stream`], [`EventStore::open_stream`]
/// or [`EventStore::open_stream_from_snapshot`].
pub struct EventStream<P: PersistStreams + 'static> {
    store: EventStore<P>,
    bucket_id: String,
    stream_id: String,
    stream_revision: u64,
    commit_sequence: u64,
    committed_events: Vec<EventMessage>,
    committed_headers: Headers,
    uncommitted_events: Vec<EventMessage>,
    uncommitted_headers: Headers,
    state: StreamState,
}

impl<P: PersistStreams + 'static> std::fmt::Debug for EventStream<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("bucket_id", &self.bucket_id)
            .field("stream_id", &self.stream_id)
            .field("stream_revision", &self.stream_revision)
            .field("commit_sequence", &self.commit_sequence)
            .field("uncommitted", &self.uncommitted_events.len())
            .field("state", &self.state)
            .finish()
    }
}

impl<P: PersistStreams + 'static> EventStream<P> {
    /// An empty session at revision 0. No I/O.
    pub(crate) fn create(
        store: EventStore<P>,
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision: 0,
            commit_sequence: 0,
            committed_events: Vec::new(),
            committed_headers: Headers::new(),
            uncommitted_events: Vec::new(),
            uncommitted_headers: Headers::new(),
            state: StreamState::Ready,
        }
    }

    /// Load the events in `[min_revision, max_revision]`.
    ///
    /// A stream with no commits opens empty when `min_revision` is 0 and is
    /// reported missing otherwise.
    pub(crate) fn open(
        store: EventStore<P>,
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Self, StreamError> {
        let mut stream = Self::create(store, bucket_id, stream_id);
        stream.state = StreamState::Loading;

        let commits = stream.store.get_from(
            &stream.bucket_id,
            &stream.stream_id,
            min_revision,
            max_revision,
        )?;
        if commits.is_empty() && min_revision > 0 {
            return Err(StreamError::StreamNotFound {
                bucket_id: stream.bucket_id,
                stream_id: stream.stream_id,
            });
        }
        stream.populate(&commits, min_revision, max_revision);
        stream.state = StreamState::Ready;
        Ok(stream)
    }

    /// Start at `snapshot` and load only the events after it.
    pub(crate) fn open_from_snapshot(
        store: EventStore<P>,
        snapshot: &Snapshot,
        max_revision: u64,
    ) -> Result<Self, StreamError> {
        let mut stream = Self::create(store, &snapshot.bucket_id, &snapshot.stream_id);
        stream.state = StreamState::Loading;
        stream.stream_revision = snapshot.stream_revision;

        // Reading from the snapshot revision itself picks up the commit that
        // contains it, which carries the commit sequence to continue from.
        let commits = stream.store.get_from(
            &stream.bucket_id,
            &stream.stream_id,
            snapshot.stream_revision,
            max_revision,
        )?;
        stream.populate(
            &commits,
            snapshot.stream_revision.saturating_add(1),
            max_revision,
        );
        stream.state = StreamState::Ready;
        Ok(stream)
    }

    /// Fold loaded commits into the committed view, keeping only events
    /// whose revision falls in `[min_revision, max_revision]`.
    fn populate(&mut self, commits: &[Commit], min_revision: u64, max_revision: u64) {
        for commit in commits {
            self.commit_sequence = commit.commit_sequence;
            let mut revision = commit.first_revision();
            for event in &commit.events {
                if revision > max_revision {
                    break;
                }
                if revision >= min_revision {
                    self.committed_events.push(event.clone());
                    self.stream_revision = revision;
                }
                revision += 1;
            }
            self.committed_headers
                .extend(commit.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Load everything committed after the session's revision.
    fn load_newer(&self) -> Result<Vec<Commit>, StoreError> {
        self.store.get_from(
            &self.bucket_id,
            &self.stream_id,
            self.stream_revision.saturating_add(1),
            u64::MAX,
        )
    }

    fn refresh_with(&mut self, commits: &[Commit]) {
        let from = self.stream_revision.saturating_add(1);
        self.populate(commits, from, u64::MAX);
    }

    fn ensure_live(&self) -> Result<(), StreamError> {
        if self.state == StreamState::Disposed {
            Err(StreamError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Partition of the stream.
    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    /// The stream identifier.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Revision of the last committed event the session knows about.
    pub fn stream_revision(&self) -> u64 {
        self.stream_revision
    }

    /// Sequence of the last commit the session knows about.
    pub fn commit_sequence(&self) -> u64 {
        self.commit_sequence
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Events loaded from or committed through this session, in order.
    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed_events
    }

    /// Commit headers seen while loading, later commits overriding earlier.
    pub fn committed_headers(&self) -> &Headers {
        &self.committed_headers
    }

    /// Events waiting for the next [`commit_changes`](Self::commit_changes).
    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted_events
    }

    /// Headers for the next commit.
    pub fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    /// Queue an event. No I/O happens until
    /// [`commit_changes`](Self::commit_changes).
    ///
    /// # Errors
    ///
    /// [`StreamError::Disposed`] after [`dispose`](Self::dispose).
    pub fn add(&mut self, event: EventMessage) -> Result<(), StreamError> {
        self.ensure_live()?;
        self.uncommitted_events.push(event);
        Ok(())
    }

    /// Encode an adjacently tagged domain event and queue it.
    ///
    /// # Errors
    ///
    /// [`StreamError::Encode`] if the event does not serialize to a tagged
    /// object, [`StreamError::Disposed`] after disposal.
    pub fn add_event<E: Serialize>(&mut self, event: &E) -> Result<(), StreamError> {
        self.ensure_live()?;
        let message = EventMessage::from_event(event)?;
        self.uncommitted_events.push(message);
        Ok(())
    }

    /// Set a header on the next commit.
    ///
    /// # Errors
    ///
    /// [`StreamError::Disposed`] after disposal.
    pub fn set_header(&mut self, key: impl Into<String>, value: Value) -> Result<(), StreamError> {
        self.ensure_live()?;
        self.uncommitted_headers.insert(key.into(), value);
        Ok(())
    }

    /// Drop pending events and headers without committing.
    pub fn clear_changes(&mut self) {
        self.uncommitted_events.clear();
        self.uncommitted_headers.clear();
        if self.state == StreamState::Conflicted {
            self.state = StreamState::Ready;
        }
    }

    /// Commit the pending batch under `commit_id`.
    ///
    /// The batch claims the next commit sequence and the revisions right
    /// after the session's view of the stream.
    ///
    /// # Returns
    ///
    /// * [`CommitReceipt::Committed`] when the engine accepted the batch.
    /// * [`CommitReceipt::Duplicate`] when `commit_id` was already stored with
    ///   the same content. The session reloads and clears the batch.
    /// * [`CommitReceipt::Resolved`] when another writer won the race but the
    ///   conflict detector found nothing clashing. The session absorbs the
    ///   winner's commits and clears the batch.
    /// * [`CommitReceipt::NoChanges`] when the batch is empty.
    ///
    /// # Errors
    ///
    /// * [`StreamError::ConflictingCommand`] when the concurrent events clash
    ///   with the batch. The session is refreshed, keeps the batch and moves
    ///   to [`StreamState::Conflicted`].
    /// * [`StreamError::Persistence`] for any other engine failure. The batch
    ///   is kept.
    /// * [`StreamError::Disposed`] after disposal.
    pub fn commit_changes(&mut self, commit_id: Uuid) -> Result<CommitReceipt, StreamError> {
        self.ensure_live()?;
        if self.uncommitted_events.is_empty() {
            return Ok(CommitReceipt::NoChanges);
        }

        let _span = tracing::info_span!(
            "commit_changes",
            bucket_id = %self.bucket_id,
            stream_id = %self.stream_id,
            %commit_id,
        )
        .entered();

        self.state = StreamState::Committing;
        let attempt = self.build_attempt(commit_id);
        let result = self.store.commit(attempt);
        self.state = StreamState::Ready;

        match result? {
            CommitOutcome::Accepted(commit) => {
                self.committed_events.append(&mut self.uncommitted_events);
                self.committed_headers.append(&mut self.uncommitted_headers);
                self.stream_revision = commit.stream_revision;
                self.commit_sequence = commit.commit_sequence;
                Ok(CommitReceipt::Committed(commit))
            }
            CommitOutcome::Duplicate(_) => {
                let newer = self.load_newer()?;
                self.refresh_with(&newer);
                self.clear_changes();
                tracing::debug!("commit already stored, session refreshed");
                Ok(CommitReceipt::Duplicate)
            }
            CommitOutcome::Conflict(conflict) => self.resolve_conflict(conflict),
        }
    }

    fn build_attempt(&self, commit_id: Uuid) -> CommitAttempt {
        CommitAttempt {
            bucket_id: self.bucket_id.clone(),
            stream_id: self.stream_id.clone(),
            stream_revision: self.stream_revision + self.uncommitted_events.len() as u64,
            commit_id,
            commit_sequence: self.commit_sequence + 1,
            commit_stamp: chrono::Utc::now(),
            headers: self.uncommitted_headers.clone(),
            events: self.uncommitted_events.clone(),
        }
    }

    fn resolve_conflict(
        &mut self,
        conflict: ConcurrencyConflict,
    ) -> Result<CommitReceipt, StreamError> {
        let concurrent = self.load_newer()?;
        if concurrent.is_empty() {
            // Nothing newer to reconcile with, so the batch cannot be
            // dropped as benign.
            return Err(StreamError::Persistence(StoreError::Concurrency(conflict)));
        }

        let theirs: Vec<EventMessage> = concurrent
            .iter()
            .flat_map(|c| c.events.iter().cloned())
            .collect();
        let clashes = self
            .store
            .conflict_detector()
            .conflicts_with(&self.uncommitted_events, &theirs);
        self.refresh_with(&concurrent);

        if clashes {
            tracing::info!(
                concurrent = concurrent.len(),
                "uncommitted events conflict with concurrent commits"
            );
            self.state = StreamState::Conflicted;
            return Err(StreamError::ConflictingCommand {
                bucket_id: self.bucket_id.clone(),
                stream_id: self.stream_id.clone(),
                conflicting_commits: concurrent.len(),
            });
        }

        tracing::debug!(
            concurrent = concurrent.len(),
            "concurrent commits do not conflict, dropping local batch"
        );
        self.clear_changes();
        Ok(CommitReceipt::Resolved { concurrent })
    }

    /// End the session, dropping buffered state. Idempotent.
    pub fn dispose(&mut self) {
        self.committed_events.clear();
        self.uncommitted_events.clear();
        self.uncommitted_headers.clear();
        self.state = StreamState::Disposed;
    }
}
