//! Commit, event and snapshot value types shared by every layer.
//!
//! Nothing in this module performs I/O. A [`CommitAttempt`] is what a writer
//! proposes; a [`Commit`] is what an engine hands back once the attempt has
//! been accepted and stamped with a store-wide checkpoint token.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Bucket used when a caller has no partitioning needs.
pub const DEFAULT_BUCKET: &str = "default";

/// Commit- and event-level metadata. Key order carries no meaning.
pub type Headers = BTreeMap<String, Value>;

/// A single domain event as stored inside a commit.
///
/// The `event_type` tag travels next to the body so the concrete type of a
/// polymorphic event survives persistence. Typed events are expected to use
/// adjacently tagged serde (`#[serde(tag = "type", content = "data")]`), which
/// [`from_event`](EventMessage::from_event) splits into `event_type` + `body`.
///
/// # Examples
///
/// ```
/// use eventfold_streams::EventMessage;
/// use serde_json::json;
///
/// let msg = EventMessage::new("AccountOpened", json!({"owner": "ada"}))
///     .with_header("source", json!("api"));
/// assert_eq!(msg.event_type, "AccountOpened");
/// assert_eq!(msg.headers["source"], json!("api"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Type tag of the event body (e.g. `"AccountOpened"`).
    pub event_type: String,
    /// Opaque event payload.
    pub body: Value,
    /// Per-event metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: Headers,
}

impl EventMessage {
    /// Build an event from a type tag and a raw JSON body.
    pub fn new(event_type: impl Into<String>, body: Value) -> Self {
        Self {
            event_type: event_type.into(),
            body,
            headers: Headers::new(),
        }
    }

    /// Encode an adjacently tagged domain event.
    ///
    /// Serializes `event`, takes its `"type"` field as the event type and its
    /// `"data"` field (or `null` for unit variants) as the body.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized or does
    /// not serialize to an object with a string `"type"` field.
    pub fn from_event<E: Serialize>(event: &E) -> serde_json::Result<Self> {
        let value = serde_json::to_value(event)?;
        let Value::Object(mut obj) = value else {
            return Err(serde::ser::Error::custom(
                "event must serialize to an adjacently tagged object",
            ));
        };
        let event_type = match obj.remove("type") {
            Some(Value::String(tag)) => tag,
            _ => {
                return Err(serde::ser::Error::custom(
                    "event must carry a string 'type' tag",
                ));
            }
        };
        let body = obj.remove("data").unwrap_or(Value::Null);
        Ok(Self::new(event_type, body))
    }

    /// Attach a header, replacing any previous value under `key`.
    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Decode the event back into an adjacently tagged domain type.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the tag is unknown to `E` or the body
    /// does not match the variant's shape.
    pub fn decode<E: DeserializeOwned>(&self) -> serde_json::Result<E> {
        let tagged = if self.body.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({ "type": self.event_type, "data": self.body })
        };
        serde_json::from_value(tagged)
    }
}

/// A write proposed against one stream, not yet accepted by an engine.
///
/// `stream_revision` is the revision of the *last* event in the attempt and
/// `commit_sequence` is the stream-local commit counter the writer expects
/// this commit to take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitAttempt {
    /// Partition namespace.
    pub bucket_id: String,
    /// Aggregate stream identifier.
    pub stream_id: String,
    /// Revision of the last event in `events`.
    pub stream_revision: u64,
    /// Identifier used for idempotent retries.
    pub commit_id: Uuid,
    /// Stream-local commit counter, starting at 1.
    pub commit_sequence: u64,
    /// Wall-clock time the attempt was built. Not an ordering key.
    pub commit_stamp: DateTime<Utc>,
    /// Commit-level metadata.
    #[serde(default)]
    pub headers: Headers,
    /// Events in stream order. Never empty for a valid attempt.
    pub events: Vec<EventMessage>,
}

impl CommitAttempt {
    /// Revision of the first event in this attempt.
    ///
    /// Saturates at zero for malformed attempts; [`validate`](Self::validate)
    /// rejects those before any engine looks at the range.
    pub fn first_revision(&self) -> u64 {
        self.stream_revision.saturating_add(1).saturating_sub(self.events.len() as u64)
    }

    /// Check the structural rules every engine enforces before storing.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the stream id is empty, the
    /// commit id is nil, sequence or revision is zero, there are no events,
    /// or the revision is smaller than the number of events.
    pub fn validate(&self) -> Result<(), String> {
        if self.stream_id.trim().is_empty() {
            return Err("stream id must not be empty".to_owned());
        }
        if self.commit_id.is_nil() {
            return Err("commit id must not be nil".to_owned());
        }
        if self.commit_sequence == 0 {
            return Err("commit sequence must start at 1".to_owned());
        }
        if self.stream_revision == 0 {
            return Err("stream revision must start at 1".to_owned());
        }
        if self.events.is_empty() {
            return Err("a commit must contain at least one event".to_owned());
        }
        if self.stream_revision < self.events.len() as u64 {
            return Err(format!(
                "stream revision {} is smaller than the event count {}",
                self.stream_revision,
                self.events.len()
            ));
        }
        Ok(())
    }

    /// Turn the attempt into a stored commit at `checkpoint_token`.
    pub fn into_commit(self, checkpoint_token: u64) -> Commit {
        Commit {
            bucket_id: self.bucket_id,
            stream_id: self.stream_id,
            stream_revision: self.stream_revision,
            commit_id: self.commit_id,
            commit_sequence: self.commit_sequence,
            commit_stamp: self.commit_stamp,
            checkpoint_token,
            headers: self.headers,
            events: self.events,
        }
    }
}

/// An accepted, immutable commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Partition namespace.
    pub bucket_id: String,
    /// Aggregate stream identifier.
    pub stream_id: String,
    /// Revision of the last event in `events`.
    pub stream_revision: u64,
    /// Identifier used for idempotent retries.
    pub commit_id: Uuid,
    /// Stream-local commit counter, gap free from 1.
    pub commit_sequence: u64,
    /// Wall-clock time the attempt was built.
    pub commit_stamp: DateTime<Utc>,
    /// Store-wide ordering key; strictly increasing, never reused.
    pub checkpoint_token: u64,
    /// Commit-level metadata.
    #[serde(default)]
    pub headers: Headers,
    /// Events in stream order.
    pub events: Vec<EventMessage>,
}

impl Commit {
    /// Revision of the first event in this commit.
    pub fn first_revision(&self) -> u64 {
        self.stream_revision.saturating_add(1).saturating_sub(self.events.len() as u64)
    }

    /// Whether `attempt` carries the same write as this commit.
    ///
    /// The commit stamp is ignored: a retried attempt may be rebuilt with a
    /// fresh clock reading and is still the same write.
    pub fn same_content(&self, attempt: &CommitAttempt) -> bool {
        self.bucket_id == attempt.bucket_id
            && self.stream_id == attempt.stream_id
            && self.commit_id == attempt.commit_id
            && self.commit_sequence == attempt.commit_sequence
            && self.stream_revision == attempt.stream_revision
            && self.headers == attempt.headers
            && self.events == attempt.events
    }

    /// Whether any event of this commit falls inside `[min, max]`.
    pub fn overlaps(&self, min_revision: u64, max_revision: u64) -> bool {
        self.stream_revision >= min_revision && self.first_revision() <= max_revision
    }
}

/// Cached per-stream summary used to find snapshot candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    /// Partition namespace.
    pub bucket_id: String,
    /// Aggregate stream identifier.
    pub stream_id: String,
    /// Latest committed revision.
    pub head_revision: u64,
    /// Revision covered by the newest snapshot, `0` if none.
    pub snapshot_revision: u64,
}

impl StreamHead {
    /// Number of revisions committed since the last snapshot.
    pub fn unsnapshotted(&self) -> u64 {
        self.head_revision.saturating_sub(self.snapshot_revision)
    }
}

/// A precomputed aggregate state at a given stream revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Partition namespace.
    pub bucket_id: String,
    /// Aggregate stream identifier.
    pub stream_id: String,
    /// Revision the payload represents.
    pub stream_revision: u64,
    /// Opaque memento.
    pub payload: Value,
}

impl Snapshot {
    /// Capture a serializable state as a snapshot payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `state` cannot be serialized.
    pub fn from_state<T: Serialize>(
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
        stream_revision: u64,
        state: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            payload: serde_json::to_value(state)?,
        })
    }

    /// Decode the payload into a typed state.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `T`.
    pub fn state<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}
