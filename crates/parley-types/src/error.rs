use thiserror::Error;

/// Failure taxonomy shared by every store-backed operation.
///
/// `Forbidden` is not represented: access policy is enforced by the backing
/// platform, and a rejected write surfaces here as `Transient`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No local user session; the action was aborted before any store call.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A referenced row is absent (e.g. username lookup came back empty).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Unique-constraint violation: the row already exists.
    #[error("already exists")]
    Conflict,

    /// Network or store failure. Retryable by the caller; never retried
    /// automatically, and never clears previously fetched state.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
