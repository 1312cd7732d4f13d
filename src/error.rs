//! Crate-level error types for engines, stream sessions and dispatch.

use std::fmt;

use uuid::Uuid;

/// Boxed error used to carry a backend or publisher failure as a source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why an attempt collided with what the stream already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another commit already claims part of the attempt's sequence or
    /// revision range.
    Overlap,
    /// The attempt starts past the stream head, leaving a hole.
    Gap,
    /// The commit id is already stored with different content.
    CommitIdReused,
    /// A pipeline hook vetoed the attempt as stale.
    Rejected,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Overlap => "overlapping revision range",
            Self::Gap => "revision gap",
            Self::CommitIdReused => "commit id reused with different content",
            Self::Rejected => "rejected by pipeline hook",
        };
        f.write_str(text)
    }
}

/// Details of an optimistic concurrency conflict on one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConflict {
    /// Partition of the contested stream.
    pub bucket_id: String,
    /// The contested stream.
    pub stream_id: String,
    /// What kind of collision was detected.
    pub kind: ConflictKind,
    /// Sequence the attempt tried to claim.
    pub attempted_sequence: u64,
    /// Revision the attempt tried to end at.
    pub attempted_revision: u64,
    /// Stream head sequence when the attempt was checked.
    pub head_sequence: u64,
    /// Stream head revision when the attempt was checked.
    pub head_revision: u64,
}

impl fmt::Display for ConcurrencyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on stream '{}/{}': attempted sequence {} revision {}, head is sequence {} revision {}",
            self.kind,
            self.bucket_id,
            self.stream_id,
            self.attempted_sequence,
            self.attempted_revision,
            self.head_sequence,
            self.head_revision
        )
    }
}

/// Error returned by a persistence engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer already occupies the attempt's revision range.
    ///
    /// Recoverable: reload the stream and retry, or escalate to conflict
    /// resolution.
    #[error("concurrency conflict: {0}")]
    Concurrency(ConcurrencyConflict),

    /// The exact same commit is already stored.
    ///
    /// An idempotent-retry signal, not a failure.
    #[error("duplicate commit {commit_id} on stream '{bucket_id}/{stream_id}'")]
    DuplicateCommit {
        /// Partition of the stream.
        bucket_id: String,
        /// Stream the commit belongs to.
        stream_id: String,
        /// The repeated commit id.
        commit_id: Uuid,
    },

    /// The stream has no commits.
    #[error("stream '{bucket_id}/{stream_id}' not found")]
    StreamNotFound {
        /// Partition of the stream.
        bucket_id: String,
        /// The missing stream.
        stream_id: String,
    },

    /// The attempt breaks a structural rule (empty events, nil id, ...).
    #[error("invalid commit attempt: {0}")]
    InvalidCommit(String),

    /// The engine has been disposed and refuses further work.
    #[error("persistence engine has been disposed")]
    Disposed,

    /// A backend failure, with the original cause preserved.
    #[error("storage failure: {context}")]
    Storage {
        /// What the engine was doing when it failed.
        context: String,
        /// The backend error.
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    /// Wrap a backend error with a short description of the operation.
    pub fn storage(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// Error returned by an [`EventStream`](crate::EventStream) session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream has no commits and create-on-open was not requested.
    #[error("stream '{bucket_id}/{stream_id}' not found")]
    StreamNotFound {
        /// Partition of the stream.
        bucket_id: String,
        /// The missing stream.
        stream_id: String,
    },

    /// Uncommitted events conflict with events another writer committed.
    ///
    /// The session has been refreshed and still holds its uncommitted
    /// events; the caller decides whether to retry or clear them.
    #[error(
        "conflicting command on stream '{bucket_id}/{stream_id}': {conflicting_commits} concurrent commit(s) conflict with uncommitted events"
    )]
    ConflictingCommand {
        /// Partition of the stream.
        bucket_id: String,
        /// The contested stream.
        stream_id: String,
        /// Number of concurrent commits that were loaded during resolution.
        conflicting_commits: usize,
    },

    /// The engine failed for a reason other than concurrency or duplicates.
    #[error("persistence failure: {0}")]
    Persistence(#[source] StoreError),

    /// A typed event could not be encoded into an [`EventMessage`](crate::EventMessage).
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The session has been disposed.
    #[error("stream session has been disposed")]
    Disposed,
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StreamNotFound {
                bucket_id,
                stream_id,
            } => Self::StreamNotFound {
                bucket_id,
                stream_id,
            },
            other => Self::Persistence(other),
        }
    }
}

/// Error raised while dispatching a commit to a publisher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The publisher rejected the commit. It stays undispatched.
    #[error("publishing commit {commit_id} failed: {source}")]
    Publish {
        /// The commit that could not be published.
        commit_id: Uuid,
        /// The publisher's error.
        #[source]
        source: BoxError,
    },

    /// Reading or marking commits failed.
    #[error("dispatch storage failure: {0}")]
    Store(#[from] StoreError),

    /// The scheduler has been disposed and accepts no more work.
    #[error("dispatch scheduler has been disposed")]
    Disposed,
}

/// Error raised by a [`SerializeCommits`](crate::SerializeCommits) implementation.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// Writing or reading the underlying byte stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
