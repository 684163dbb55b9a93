//! Aggregate module
//!
//! Aggregate root pattern for event sourcing: state plus an
//! uncommitted-events buffer, with event application dispatched by an
//! explicit kind tag rather than reflection over the event's type name.

pub mod action;
pub mod wine_lot;

pub use action::Action;
pub use wine_lot::WineLot;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::domain::error::CoreError;
use crate::id::AggregateId;

/// An event belonging to one aggregate's stream.
///
/// `event_kind` is the explicit dispatch tag used by `apply`/`load` — the
/// Rust rendering of "derive a handler name from the event's type name,"
/// done as a tag on the variant instead of string-mangling reflection.
pub trait AggregateEvent: Serialize + DeserializeOwned + Clone + std::fmt::Debug {
    /// Dispatch tag, e.g. `"volume_received"`.
    fn event_kind(&self) -> &'static str;

    /// Storage discriminant, e.g. `"VolumeReceived"`.
    fn event_type(&self) -> &'static str;

    fn event_version(&self) -> i32 {
        1
    }

    /// `Some` for event kinds that carry domain time (the `Timestamped` trait).
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// `Some` for event kinds that carry an originating action id (the
    /// `ActionSequenced` trait); serialized as the event store's
    /// `sequence_number` column.
    fn sequence_number(&self) -> Option<String> {
        None
    }
}

/// Aggregate root contract shared by `WineLot` and `Action`.
///
/// `apply` and `load` both mutate state; only `apply` validates context,
/// buffers the event, and — when the aggregate is persistable — registers
/// it with the repository (`crate::repository::add_wine_lot`/`add_action`)
/// so a unit of work picks it up without the caller chaining a separate
/// call. `load` is used exclusively by replay and projection, which must
/// never touch the buffer or the repository.
pub trait Aggregate: Sized {
    type Event: AggregateEvent;

    fn aggregate_type() -> &'static str;
    fn id(&self) -> AggregateId;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);

    /// True once this instance has been (or is about to be) registered
    /// with the repository; false for `load_states_before` snapshots.
    fn is_persistable(&self) -> bool;
    fn mark_not_persistable(&mut self);

    /// Replay inserts new-past events into an aggregate whose creation
    /// event now postdates them; this flag tells the unit of work that
    /// such an aggregate still needs an insert, not a version bump.
    fn is_backdating(&self) -> bool;
    fn mark_for_backdating(&mut self);

    /// `true` until this instance has ever been persisted.
    fn is_adding(&self) -> bool;

    /// A blank seed carrying only `id`, used as the fold target when
    /// replaying an existing aggregate's full history.
    fn identity(id: AggregateId) -> Self;

    /// Events applied via `apply` since the aggregate was loaded or created,
    /// not yet drained into the unit of work's buffer.
    fn recorded_events(&self) -> &[Self::Event];

    /// Row ids of previously persisted events this aggregate has queued
    /// for retraction (populated by editing use cases before `load`).
    fn pending_retractions(&self) -> &[i64];
    fn clear_pending_retractions(&mut self);

    /// Mutates state for `event`, without validating context or buffering.
    fn load_event(&mut self, event: Self::Event) -> Result<(), CoreError>;

    /// Validates context, mutates state, buffers the event for commit, and
    /// registers `self` with the repository if persistable. `WineLot` and
    /// `Action` each override this to call their own `repository::add_*`;
    /// this default is a fallback for a hypothetical aggregate with no
    /// repository counterpart to register with.
    fn apply_event(&mut self, event: Self::Event) -> Result<(), CoreError> {
        self.load_event(event)
    }

    /// Raises `OutOfDateVersion` if `self.version() != expected`.
    fn confirm_version(&self, expected: i64) -> Result<(), CoreError> {
        if self.version() != expected {
            return Err(CoreError::OutOfDateVersion {
                aggregate_type: Self::aggregate_type(),
                aggregate_id: self.id(),
            });
        }
        Ok(())
    }
}

/// Converts a PascalCase event type name to its snake_case dispatch
/// kind, e.g. `VolumeBlended` -> `volume_blended`. Exposed for tests that
/// assert the naming convention; production dispatch uses the explicit
/// `event_kind()` tag on each variant, never this derivation at runtime.
#[cfg(test)]
pub(crate) fn snake_case(pascal: &str) -> String {
    let mut out = String::new();
    for (i, ch) in pascal.char_indices() {
        if ch.is_uppercase() && i > 0 {
            out.push('_');
        }
        out.extend(ch.to_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_matches_expected_dispatch_tags() {
        assert_eq!(snake_case("VolumeBlended"), "volume_blended");
        assert_eq!(snake_case("WineLotCreated"), "wine_lot_created");
        assert_eq!(snake_case("SkuInventoryAdded"), "sku_inventory_added");
    }
}
