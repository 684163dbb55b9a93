//! Core error taxonomy.
//!
//! These are the errors the engine itself can raise, independent of how
//! they are eventually persisted or surfaced. Optimistic concurrency,
//! programmer errors in dispatch, and domain validation failures each
//! get their own variant rather than being collapsed into one bucket.

use thiserror::Error;

use crate::id::AggregateId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// The optimistic compare-and-update in `persist()` affected zero rows.
    #[error("The {aggregate_type} you are trying to update is out of date. Please refresh and try again.")]
    OutOfDateVersion {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// A caller attempted to persist a read-only temporal snapshot.
    #[error("Cannot persist a view of {aggregate_type} {aggregate_id}: it is a read-only snapshot")]
    CannotPersistView {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// An aggregate or event-store mapping required at boot/first-use was never wired up.
    #[error("Improperly configured: {0}")]
    ImproperlyConfigured(String),

    /// `apply` was dispatched to an event kind with no `apply_<kind>` handler.
    #[error("No apply handler implemented for event kind '{0}' on {1}")]
    NotImplementedForKind(&'static str, &'static str),

    /// A precondition enforced by a domain method failed.
    #[error("{0}")]
    DomainValidation(String),

    /// A referenced lot or action does not exist.
    #[error("{0}")]
    MissingEntity(String),

    /// A context validator rejected an event during replay; this indicates
    /// stored data that violates a domain invariant and is always fatal.
    #[error("Context validation failed while replaying {aggregate_type} {aggregate_id}: {reason}")]
    ContextValidation {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
        reason: String,
    },

    /// A database or serialization fault surfaced by the event store.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl CoreError {
    pub fn domain_validation(msg: impl Into<String>) -> Self {
        Self::DomainValidation(msg.into())
    }

    pub fn missing_entity(msg: impl Into<String>) -> Self {
        Self::MissingEntity(msg.into())
    }

    /// Client-recoverable errors warrant a `warn`-level log at most;
    /// everything else indicates a programmer or data-integrity fault
    /// worth logging loudly at the point it is raised.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::OutOfDateVersion { .. } | Self::DomainValidation(_) | Self::MissingEntity(_)
        )
    }
}
