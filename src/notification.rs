//! Notification bus.
//!
//! A process-wide registry mapping each event kind to an ordered list of
//! subscribers, booted once from a static table built in Rust code —
//! never by string-based dynamic import, which is the one piece of the
//! reference design this reimplementation explicitly declines to carry
//! forward.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::domain::error::CoreError;
use crate::domain::{ActionEvent, WineLotEvent};

/// Any domain event the bus can dispatch. `WineLot` and `Action` streams
/// are distinct aggregate types but share one bus, the way the reference
/// design dispatches by event kind regardless of which aggregate raised it.
#[derive(Debug, Clone)]
pub enum Notification {
    WineLot(WineLotEvent),
    Action(ActionEvent),
}

impl Notification {
    pub fn event_kind(&self) -> &'static str {
        match self {
            Notification::WineLot(e) => {
                use crate::aggregate::AggregateEvent;
                e.event_kind()
            }
            Notification::Action(e) => {
                use crate::aggregate::AggregateEvent;
                e.event_kind()
            }
        }
    }
}

/// A stateless handler invoked synchronously for every notification of
/// a kind it is registered against. Implementors must not carry state
/// across dispatches; construct fresh or keep pure.
pub trait Subscriber: Send + Sync {
    fn handle(&self, notification: &Notification) -> Result<(), CoreError>;
}

type Registry = HashMap<&'static str, Vec<Box<dyn Subscriber>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The static subscriber table. Add entries here, in Rust code, as new
/// subscribers are introduced — this is the table the reference design
/// would have populated via reflection-based dynamic import.
fn build_registry() -> Registry {
    HashMap::new()
}

/// Populates the registry. Idempotent: subsequent calls are a no-op,
/// matching `OnceLock`'s own semantics.
pub fn boot() {
    REGISTRY.get_or_init(build_registry);
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(build_registry)
}

/// Looks up subscribers for `notification`'s kind and invokes each in
/// registration order. The first subscriber error aborts the remaining
/// invocations for this notification and is propagated to the caller.
pub fn dispatch(notification: &Notification) -> Result<(), CoreError> {
    if let Some(subscribers) = registry().get(notification.event_kind()) {
        for subscriber in subscribers {
            subscriber.handle(notification)?;
        }
    }
    Ok(())
}

/// Dispatches each notification in list order; an uncaught subscriber
/// error aborts remaining dispatches.
pub fn dispatch_all(notifications: &[Notification]) -> Result<(), CoreError> {
    for notification in notifications {
        dispatch(notification)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_is_idempotent() {
        boot();
        let first: *const Registry = registry();
        boot();
        let second: *const Registry = registry();
        assert_eq!(
            first, second,
            "a second boot() must reuse the existing registry, not rebuild one"
        );
    }

    #[test]
    fn dispatch_with_no_subscribers_is_a_no_op() {
        boot();
        let lot_id = crate::id::new_id();
        let notification = Notification::WineLot(WineLotEvent::WineLotDeleted(
            crate::domain::wine_lot_events::WineLotDeleted {
                aggregate_id: lot_id,
                occurred_at: chrono::Utc::now(),
            },
        ));
        assert!(dispatch(&notification).is_ok());
    }
}
