//! Business-level conflict detection run after an optimistic concurrency
//! failure.
//!
//! When a session loses a commit race it loads the commits that beat it and
//! asks a [`DetectConflicts`] implementation whether its own uncommitted
//! events really clash with them. [`ConflictDetector`] is a table of
//! predicates keyed by event type pairs, registered up front.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::commit::EventMessage;

/// Decides whether uncommitted events clash with concurrently committed ones.
pub trait DetectConflicts: Send + Sync {
    /// `true` if any uncommitted event conflicts with any committed event.
    fn conflicts_with(&self, uncommitted: &[EventMessage], committed: &[EventMessage]) -> bool;
}

type Predicate = Arc<dyn Fn(&EventMessage, &EventMessage) -> bool + Send + Sync>;

/// Table of conflict predicates keyed by `(uncommitted type, committed type)`.
///
/// Pairs with no registered predicate never conflict, so an empty detector
/// treats every concurrent write as benign.
///
/// # Examples
///
/// ```
/// use eventfold_streams::{ConflictDetector, DetectConflicts, EventMessage};
/// use serde_json::json;
///
/// let detector = ConflictDetector::new()
///     .register_always("Withdrawn", "Frozen")
///     .register("Withdrawn", "Withdrawn", |mine, theirs| {
///         mine.body["amount"].as_u64().unwrap_or(0) + theirs.body["amount"].as_u64().unwrap_or(0) > 100
///     });
///
/// let mine = [EventMessage::new("Withdrawn", json!({"amount": 60}))];
/// let small = [EventMessage::new("Withdrawn", json!({"amount": 10}))];
/// let large = [EventMessage::new("Withdrawn", json!({"amount": 70}))];
/// assert!(!detector.conflicts_with(&mine, &small));
/// assert!(detector.conflicts_with(&mine, &large));
/// ```
#[derive(Default, Clone)]
pub struct ConflictDetector {
    predicates: HashMap<(String, String), Predicate>,
}

impl ConflictDetector {
    /// An empty table: nothing conflicts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate for one event type pair, replacing any earlier
    /// registration for the same pair.
    ///
    /// # Arguments
    ///
    /// * `uncommitted_type` - Type tag of the session's pending event.
    /// * `committed_type` - Type tag of the concurrently committed event.
    /// * `predicate` - Called with `(uncommitted, committed)`; returns `true`
    ///   on conflict.
    pub fn register<F>(
        mut self,
        uncommitted_type: impl Into<String>,
        committed_type: impl Into<String>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&EventMessage, &EventMessage) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(
            (uncommitted_type.into(), committed_type.into()),
            Arc::new(predicate),
        );
        self
    }

    /// Register a pair that always conflicts.
    pub fn register_always(
        self,
        uncommitted_type: impl Into<String>,
        committed_type: impl Into<String>,
    ) -> Self {
        self.register(uncommitted_type, committed_type, |_, _| true)
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    /// Whether no pair is registered.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl DetectConflicts for ConflictDetector {
    fn conflicts_with(&self, uncommitted: &[EventMessage], committed: &[EventMessage]) -> bool {
        if self.predicates.is_empty() {
            return false;
        }
        uncommitted.iter().any(|mine| {
            committed.iter().any(|theirs| {
                self.predicates
                    .get(&(mine.event_type.clone(), theirs.event_type.clone()))
                    .is_some_and(|predicate| predicate(mine, theirs))
            })
        })
    }
}

impl fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<_> = self.predicates.keys().collect();
        pairs.sort();
        f.debug_struct("ConflictDetector")
            .field("pairs", &pairs)
            .finish()
    }
}
