//! Optimistic commit streams over a pluggable persistence engine.
//!
//! Writers open an [`EventStream`] through an [`EventStore`], append events
//! and commit them as one atomic [`Commit`]. The engine orders commits per
//! stream with a commit sequence and across the store with a checkpoint
//! token. Stale writers get a conflict, retried commits are detected as
//! duplicates, and accepted commits are handed to a dispatch scheduler that
//! publishes each one at least once. Read models tail the checkpoint order
//! with a [`PollingClient`].

mod checkpoint;
mod commit;
mod concurrency;
mod conflict;
mod dispatch;
mod error;
mod hooks;
mod memory;
mod metrics;
mod persistence;
mod polling;
mod serialization;
mod store;
mod stream;

pub use checkpoint::CheckpointFile;
pub use commit::{
    Commit, CommitAttempt, DEFAULT_BUCKET, EventMessage, Headers, Snapshot, StreamHead,
};
pub use concurrency::{AttemptCheck, CommitOutcome, StreamPosition, check_attempt};
pub use conflict::{ConflictDetector, DetectConflicts};
pub use dispatch::{
    AsyncDispatchScheduler, ChannelPublisher, DispatchConfig, NullPublisher, PublishCommits,
    ScheduleDispatches, SyncDispatchScheduler,
};
pub use error::{
    BoxError, ConcurrencyConflict, ConflictKind, DispatchError, SerializationError, StoreError,
    StreamError,
};
pub use hooks::{
    DEFAULT_MAX_CACHED_STREAMS, DispatchSchedulerHook, OptimisticPipelineHook, PipelineHook,
};
pub use memory::InMemoryPersistence;
pub use metrics::{CountingMetrics, MetricsSnapshot, NoopMetrics, RecordMetrics};
pub use persistence::{AsyncPersistence, PersistStreams};
pub use polling::{CommitStream, PollingClient, PollingConfig, PollingHandle};
pub use serialization::{JsonSerializer, SerializeCommits};
pub use store::{EventStore, EventStoreBuilder};
pub use stream::{CommitReceipt, EventStream, StreamState};
