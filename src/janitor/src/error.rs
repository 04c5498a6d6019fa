use thiserror::Error;

/// Failure modes of the reclamation pipeline.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// The entity does not satisfy the preconditions for its cleanup path.
    #[error("not a cleanup candidate: {0}")]
    NotCandidate(String),

    /// An expected reference is absent (for example a repo row without a
    /// usable URL).
    #[error("missing reference: {0}")]
    MissingReference(String),

    /// The entity is in a state that forbids the requested deletion, such
    /// as a device still linked to an update transaction.
    #[error("conflicting state: {0}")]
    ConflictingState(String),

    /// Remote storage deletion exhausted all retry attempts; this is the
    /// error of the final attempt.
    #[error("storage reclamation failed: {0}")]
    Storage(#[from] object_store::Error),

    /// Candidate discovery or row mutation failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// At least one candidate in a page failed; the job stops after the
    /// whole page has drained so the next run can retry cleanly.
    #[error("{job} interrupted on page {page}: {failed} of {total} candidates failed")]
    Interrupted {
        job: &'static str,
        page: u32,
        failed: usize,
        total: usize,
    },

    /// Control signal, not a failure: the stage's feature flag is off.
    /// Never escalated to a non-zero process exit.
    #[error("feature flag {0} is disabled")]
    FeatureDisabled(&'static str),
}
