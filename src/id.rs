//! Identifiers and clock.
//!
//! Aggregate identity is a 26-character, lexicographically sortable ULID
//! rather than a UUID: its string form sorts the same way as its
//! generation time, which lets the event store's canonical order fall
//! back on `id ASC` as a stable tie-breaker without a secondary index.

use chrono::{DateTime, Utc};
use ulid::Ulid;

/// The identity type for every aggregate in the system.
pub type AggregateId = Ulid;

/// Generates a new aggregate identifier.
pub fn new_id() -> AggregateId {
    Ulid::new()
}

/// Abstracts the wall clock so replay and backdating logic can be
/// exercised deterministically in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real, wall-clock implementation used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, for deterministic tests of
/// backdating and the "effective_at must be in the past" policy.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// The epoch sentinel used as the `occurred_at` of every `WineLotCreated`
/// event, so a lot's creation always sorts first in canonical order.
pub fn creation_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).expect("unix epoch is representable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_26_chars_and_sorts_with_time() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert_eq!(a.to_string().len(), 26);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn fixed_clock_is_stable() {
        let t = Utc::now();
        let clock = FixedClock(t);
        assert_eq!(clock.now(), t);
        assert_eq!(clock.now(), t);
    }

    #[test]
    fn creation_epoch_is_unix_zero() {
        assert_eq!(creation_epoch().timestamp(), 0);
    }
}
