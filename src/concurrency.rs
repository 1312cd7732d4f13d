//! Backend-independent optimistic concurrency and duplicate detection.
//!
//! Every engine runs [`check_attempt`] inside its per-stream critical
//! section (a lock, a transaction, a conditional write) before persisting.
//! The check only needs the stream's current position and the stored commit
//! sharing the attempt's id, so backends can answer it with two point
//! lookups.

use crate::commit::{Commit, CommitAttempt};
use crate::error::{ConcurrencyConflict, ConflictKind, StoreError};

/// Where a stream currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamPosition {
    /// Revision of the stream's last event, `0` for an empty stream.
    pub revision: u64,
    /// Sequence of the stream's last commit, `0` for an empty stream.
    pub commit_sequence: u64,
}

/// Verdict of [`check_attempt`].
#[derive(Debug, PartialEq)]
pub enum AttemptCheck<'a> {
    /// The attempt may be persisted.
    Proceed,
    /// The attempt is a retry of this stored commit.
    Duplicate(&'a Commit),
    /// The attempt collides with the stream's history.
    Conflict(ConcurrencyConflict),
}

/// Result of handing an attempt to an engine.
///
/// Duplicate and conflict are ordinary outcomes of optimistic writes, so they
/// are returned as data. [`into_result`](CommitOutcome::into_result) turns
/// them into [`StoreError`]s for callers that prefer `?`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The attempt was stored as this commit.
    Accepted(Commit),
    /// An identical commit was already stored; nothing changed.
    Duplicate(Commit),
    /// Another writer got there first.
    Conflict(ConcurrencyConflict),
}

impl CommitOutcome {
    /// Whether the attempt was newly stored.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Convert signal variants into errors.
    ///
    /// # Errors
    ///
    /// * [`StoreError::DuplicateCommit`] for [`CommitOutcome::Duplicate`].
    /// * [`StoreError::Concurrency`] for [`CommitOutcome::Conflict`].
    pub fn into_result(self) -> Result<Commit, StoreError> {
        match self {
            Self::Accepted(commit) => Ok(commit),
            Self::Duplicate(commit) => Err(StoreError::DuplicateCommit {
                bucket_id: commit.bucket_id,
                stream_id: commit.stream_id,
                commit_id: commit.commit_id,
            }),
            Self::Conflict(conflict) => Err(StoreError::Concurrency(conflict)),
        }
    }
}

/// Decide whether `attempt` may be appended to a stream at `position`.
///
/// # Arguments
///
/// * `attempt` - A structurally valid attempt.
/// * `position` - The stream's current head.
/// * `existing` - The stored commit in the same stream with the attempt's
///   commit id, if any.
///
/// # Returns
///
/// * [`AttemptCheck::Duplicate`] if `existing` carries the same content.
/// * [`AttemptCheck::Conflict`] if the id is reused for different content,
///   if the attempt overlaps committed sequences or revisions, or if it
///   would leave a gap after the head.
/// * [`AttemptCheck::Proceed`] otherwise.
pub fn check_attempt<'a>(
    attempt: &CommitAttempt,
    position: StreamPosition,
    existing: Option<&'a Commit>,
) -> AttemptCheck<'a> {
    let conflict = |kind| {
        AttemptCheck::Conflict(ConcurrencyConflict {
            bucket_id: attempt.bucket_id.clone(),
            stream_id: attempt.stream_id.clone(),
            kind,
            attempted_sequence: attempt.commit_sequence,
            attempted_revision: attempt.stream_revision,
            head_sequence: position.commit_sequence,
            head_revision: position.revision,
        })
    };

    if let Some(stored) = existing {
        if stored.same_content(attempt) {
            return AttemptCheck::Duplicate(stored);
        }
        return conflict(ConflictKind::CommitIdReused);
    }

    if attempt.commit_sequence <= position.commit_sequence
        || attempt.first_revision() <= position.revision
    {
        return conflict(ConflictKind::Overlap);
    }

    if attempt.commit_sequence != position.commit_sequence + 1
        || attempt.first_revision() != position.revision + 1
    {
        return conflict(ConflictKind::Gap);
    }

    AttemptCheck::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::test_fixtures::attempt;

    fn at(revision: u64, commit_sequence: u64) -> StreamPosition {
        StreamPosition {
            revision,
            commit_sequence,
        }
    }

    #[test]
    fn first_commit_on_empty_stream_proceeds() {
        let a = attempt("s", 1, 2, 2);
        assert_eq!(check_attempt(&a, at(0, 0), None), AttemptCheck::Proceed);
    }

    #[test]
    fn next_commit_after_head_proceeds() {
        let a = attempt("s", 3, 7, 2);
        assert_eq!(check_attempt(&a, at(5, 2), None), AttemptCheck::Proceed);
    }

    #[test]
    fn stale_writer_overlaps() {
        // Head already at revision 1 / sequence 1; a second writer that also
        // loaded revision 0 claims the same slot.
        let a = attempt("s", 1, 1, 1);
        let AttemptCheck::Conflict(c) = check_attempt(&a, at(1, 1), None) else {
            panic!("expected a conflict");
        };
        assert_eq!(c.kind, ConflictKind::Overlap);
        assert_eq!(c.head_revision, 1);
        assert_eq!(c.attempted_sequence, 1);
    }

    #[test]
    fn revision_overlap_alone_is_a_conflict() {
        // Sequence looks fresh but the revision range reaches into history.
        let a = attempt("s", 3, 6, 2); // revisions 5..=6
        let check = check_attempt(&a, at(5, 2), None);
        assert!(matches!(
            check,
            AttemptCheck::Conflict(ConcurrencyConflict {
                kind: ConflictKind::Overlap,
                ..
            })
        ));
    }

    #[test]
    fn skipping_ahead_is_a_gap() {
        let a = attempt("s", 2, 9, 1);
        let check = check_attempt(&a, at(3, 1), None);
        assert!(matches!(
            check,
            AttemptCheck::Conflict(ConcurrencyConflict {
                kind: ConflictKind::Gap,
                ..
            })
        ));
    }

    #[test]
    fn identical_retry_is_a_duplicate() {
        let a = attempt("s", 1, 1, 1);
        let stored = a.clone().into_commit(1);
        assert_eq!(
            check_attempt(&a, at(1, 1), Some(&stored)),
            AttemptCheck::Duplicate(&stored)
        );
    }

    #[test]
    fn reused_id_with_new_content_conflicts() {
        let a = attempt("s", 1, 1, 1);
        let stored = a.clone().into_commit(1);
        let mut reused = attempt("s", 2, 2, 1);
        reused.commit_id = a.commit_id;
        let check = check_attempt(&reused, at(1, 1), Some(&stored));
        assert!(matches!(
            check,
            AttemptCheck::Conflict(ConcurrencyConflict {
                kind: ConflictKind::CommitIdReused,
                ..
            })
        ));
    }

    #[test]
    fn into_result_maps_signals_to_errors() {
        let commit = attempt("s", 1, 1, 1).into_commit(1);
        assert!(CommitOutcome::Accepted(commit.clone()).into_result().is_ok());
        assert!(matches!(
            CommitOutcome::Duplicate(commit).into_result(),
            Err(StoreError::DuplicateCommit { .. })
        ));
    }
}
