//! Shared error taxonomy glue.
//!
//! Each component defines its own `thiserror`-derived error enum (see
//! [`crate::event::store::AppendError`], [`crate::document::Error`],
//! [`crate::snapshot::Error`], [`crate::projection::Error`],
//! [`crate::migration::Error`], [`crate::projection::status::Error`]); this
//! module only carries the backend-facing taxonomy those enums embed, and a
//! top-level [`EngineError`] that aggregates them for call sites (such as
//! [`crate::stream::Handle::session`]) that can surface any of the above.

use thiserror::Error;

/// Classification of an error raised by a backing-store call, independent of
/// which component surfaced it.
///
/// A pluggable status-code extractor (see [`crate::resilience`]) maps
/// concrete backend exceptions onto this taxonomy; [`crate::resilience::RetryPolicy`]
/// decides retry behavior purely from this enum.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Version or ETag mismatch on a conditional write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend signaled retryable pressure (e.g. HTTP 429).
    #[error("throttled: {0}")]
    Throttled(String),

    /// The referenced stream/document/snapshot/projection does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configured container/table is missing and auto-create is disabled.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Network-level or otherwise retryable infrastructure error.
    #[error("transient: {0}")]
    Transient(String),

    /// Retry budget exhausted after repeated [`BackendError::Throttled`] or
    /// [`BackendError::Transient`] failures.
    #[error("exhausted retry budget after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// The last underlying error observed.
        last: Box<BackendError>,
    },
}

impl BackendError {
    /// Whether [`crate::resilience::RetryPolicy`] should retry an operation
    /// that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Throttled(_) | BackendError::Transient(_))
    }
}

/// Top-level error aggregating every component-specific error this crate can
/// surface, for call sites that touch more than one component in a single
/// operation (e.g. the Event Stream handle's commit protocol).
#[derive(Debug, Error)]
pub enum EngineError {
    /// See [`crate::event::store::AppendError`].
    #[error(transparent)]
    Append(#[from] crate::event::store::AppendError),

    /// See [`crate::document::Error`].
    #[error(transparent)]
    Document(#[from] crate::document::Error),

    /// See [`crate::snapshot::Error`].
    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::Error),

    /// See [`crate::projection::Error`].
    #[error(transparent)]
    Projection(#[from] crate::projection::Error),

    /// See [`crate::migration::Error`].
    #[error(transparent)]
    Migration(#[from] crate::migration::Error),

    /// See [`crate::projection::status::Error`].
    #[error(transparent)]
    ProjectionStatus(#[from] crate::projection::status::Error),

    /// Precondition violated by the caller (null/empty input, malformed
    /// version range), never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation retried as far as configuration allows and still
    /// failed against a throttled or transient backend.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
