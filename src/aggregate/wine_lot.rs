//! WineLot aggregate.
//!
//! Tracks a lot's code and volume. Composition is intentionally absent
//! here — it is a read-side concern derived by the projector in
//! `crate::projection::composition`, never stored on the aggregate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::aggregate::Aggregate;
use crate::domain::composition::ComponentAmount;
use crate::domain::error::CoreError;
use crate::domain::wine_lot_events::{
    VolumeBlended, VolumeBottled, VolumeMoved, VolumeReceived, VolumeRemeasured, WineLotCreated,
    WineLotDeleted, WineLotEvent, WineLotUpdated,
};
use crate::domain::value_change::ValueChange;
use crate::id::{creation_epoch, new_id, AggregateId};

#[derive(Debug, Clone)]
pub struct WineLot {
    id: AggregateId,
    version: i64,
    pub code: String,
    pub volume: Decimal,
    pub deleted_at: Option<DateTime<Utc>>,
    adding: bool,
    persistable: bool,
    backdating: bool,
    recorded_events: Vec<WineLotEvent>,
    pending_retractions: Vec<i64>,
}

/// `^[A-Z0-9][A-Z0-9_-]{0,48}[A-Z0-9]$`, checked by hand rather than via
/// a regex crate the rest of the stack has no other use for.
fn validate_code(code: &str) -> Result<(), CoreError> {
    let chars: Vec<char> = code.chars().collect();
    let is_edge = |c: char| c.is_ascii_uppercase() || c.is_ascii_digit();
    let is_middle = |c: char| is_edge(c) || c == '_' || c == '-';

    let valid = (2..=50).contains(&chars.len())
        && is_edge(chars[0])
        && is_edge(*chars.last().unwrap())
        && chars[1..chars.len() - 1].iter().all(|&c| is_middle(c));

    if valid {
        Ok(())
    } else {
        Err(CoreError::domain_validation(format!(
            "'{code}' is not a valid wine lot code"
        )))
    }
}

impl WineLot {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn ensure_not_deleted(&self) -> Result<(), CoreError> {
        if self.is_deleted() {
            return Err(CoreError::domain_validation(format!(
                "wine lot {} has been deleted",
                self.id
            )));
        }
        Ok(())
    }

    pub fn create(
        code: String,
        components: Vec<ComponentAmount>,
    ) -> Result<(Self, WineLotEvent), CoreError> {
        validate_code(&code)?;
        let composition =
            crate::domain::composition::Composition::from_components(&components);
        if !composition.is_conserved() {
            return Err(CoreError::domain_validation(
                "wine lot composition must sum to 1.0",
            ));
        }

        let id = new_id();
        let mut lot = Self::identity(id);
        lot.adding = true;
        let event = WineLotEvent::WineLotCreated(WineLotCreated {
            aggregate_id: id,
            occurred_at: creation_epoch(),
            code,
            components,
        });
        lot.apply_event(event.clone())?;
        Ok((lot, event))
    }

    pub fn update(&self, code: String) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        validate_code(&code)?;
        Ok(WineLotEvent::WineLotUpdated(WineLotUpdated {
            aggregate_id: self.id,
            code: ValueChange::new(self.code.clone(), code),
        }))
    }

    pub fn destroy(&self, now: DateTime<Utc>) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        Ok(WineLotEvent::WineLotDeleted(WineLotDeleted {
            aggregate_id: self.id,
            occurred_at: now,
        }))
    }

    /// No `volume > 0` precondition here: the reference domain only
    /// rejects receives on a deleted lot, leaving magnitude validation to
    /// the caller (e.g. the use case that records the action).
    pub fn receive_volume(
        &self,
        action_id: String,
        effective_at: DateTime<Utc>,
        volume: Decimal,
    ) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        Ok(WineLotEvent::VolumeReceived(VolumeReceived {
            aggregate_id: self.id,
            occurred_at: effective_at,
            action_id,
            volume,
        }))
    }

    pub fn remeasure(
        &self,
        action_id: String,
        effective_at: DateTime<Utc>,
        volume: Decimal,
    ) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        if volume < Decimal::ZERO {
            return Err(CoreError::domain_validation("remeasured volume cannot be negative"));
        }
        Ok(WineLotEvent::VolumeRemeasured(VolumeRemeasured {
            aggregate_id: self.id,
            occurred_at: effective_at,
            action_id,
            volume,
        }))
    }

    pub fn blend_in_volume(
        &self,
        action_id: String,
        effective_at: DateTime<Utc>,
        volume_received: Decimal,
        volumes: HashMap<String, Decimal>,
    ) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        if volume_received <= Decimal::ZERO {
            return Err(CoreError::domain_validation(
                "blended volume received must be positive",
            ));
        }
        Ok(WineLotEvent::VolumeBlended(VolumeBlended {
            aggregate_id: self.id,
            occurred_at: effective_at,
            action_id,
            volumes,
            volume_received,
        }))
    }

    /// Zero is allowed (unlike `blend_in_volume`): a zero-volume move is
    /// a legitimate no-op debit the original use case never bothered to
    /// reject.
    pub fn move_volume(
        &self,
        action_id: String,
        effective_at: DateTime<Utc>,
        volume: Decimal,
        to_wine_lot_id: AggregateId,
    ) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        if volume < Decimal::ZERO {
            return Err(CoreError::domain_validation("moved volume cannot be negative"));
        }
        Ok(WineLotEvent::VolumeMoved(VolumeMoved {
            aggregate_id: self.id,
            occurred_at: effective_at,
            action_id,
            volume,
            to_wine_lot_id,
        }))
    }

    pub fn bottle(
        &self,
        action_id: String,
        effective_at: DateTime<Utc>,
        volume: Decimal,
    ) -> Result<WineLotEvent, CoreError> {
        self.ensure_not_deleted()?;
        if volume <= Decimal::ZERO {
            return Err(CoreError::domain_validation("bottled volume must be positive"));
        }
        Ok(WineLotEvent::VolumeBottled(VolumeBottled {
            aggregate_id: self.id,
            occurred_at: effective_at,
            action_id,
            volume,
        }))
    }

    fn validate_context(&self, event: &WineLotEvent) -> Result<(), CoreError> {
        match event {
            WineLotEvent::VolumeMoved(e) => self.validate_volume_moved_context(e),
            WineLotEvent::VolumeBottled(e) => self.validate_volume_bottled_context(e),
            _ => Ok(()),
        }
    }

    /// The reference implementation typed this validator's parameter to
    /// `VolumeBottled` by mistake and relied on name-based dispatch to
    /// paper over it; here the two kinds each get their own, correctly
    /// typed function.
    fn validate_volume_moved_context(&self, event: &VolumeMoved) -> Result<(), CoreError> {
        if self.volume - event.volume < Decimal::ZERO {
            return Err(CoreError::ContextValidation {
                aggregate_type: Self::aggregate_type(),
                aggregate_id: self.id,
                reason: "insufficient volume remaining".into(),
            });
        }
        Ok(())
    }

    fn validate_volume_bottled_context(&self, event: &VolumeBottled) -> Result<(), CoreError> {
        if self.volume - event.volume < Decimal::ZERO {
            return Err(CoreError::ContextValidation {
                aggregate_type: Self::aggregate_type(),
                aggregate_id: self.id,
                reason: "insufficient volume remaining".into(),
            });
        }
        Ok(())
    }

    fn apply_wine_lot_created(&mut self, event: WineLotCreated) {
        self.id = event.aggregate_id;
        self.code = event.code;
        self.volume = Decimal::ZERO;
        self.deleted_at = None;
    }

    fn apply_wine_lot_updated(&mut self, event: WineLotUpdated) {
        self.code = event.code.after;
    }

    /// Deliberately does NOT mutate `code`. The reference implementation
    /// appends a random suffix to free up the code for reuse, which is
    /// non-deterministic and breaks replay equivalence; uniqueness here
    /// is instead enforced by a partial index over non-deleted rows
    /// (see the `wine_lots` migration notes in DESIGN.md).
    fn apply_wine_lot_deleted(&mut self, event: WineLotDeleted) {
        self.deleted_at = Some(event.occurred_at);
    }

    fn apply_volume_received(&mut self, event: VolumeReceived) {
        self.volume += event.volume;
    }

    /// Absolute set, not an increment.
    fn apply_volume_remeasured(&mut self, event: VolumeRemeasured) {
        self.volume = event.volume;
    }

    /// Increments by `volume_received`, not `Σ volumes` — see the
    /// composition projector's note on why these may diverge.
    fn apply_volume_blended(&mut self, event: VolumeBlended) {
        self.volume += event.volume_received;
    }

    fn apply_volume_bottled(&mut self, event: VolumeBottled) {
        self.volume -= event.volume;
    }

    fn apply_volume_moved(&mut self, event: VolumeMoved) {
        self.volume -= event.volume;
    }
}

impl Aggregate for WineLot {
    type Event = WineLotEvent;

    fn aggregate_type() -> &'static str {
        "WineLot"
    }

    fn id(&self) -> AggregateId {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
        self.adding = false;
    }

    fn is_persistable(&self) -> bool {
        self.persistable
    }

    fn mark_not_persistable(&mut self) {
        self.persistable = false;
    }

    fn is_backdating(&self) -> bool {
        self.backdating
    }

    fn mark_for_backdating(&mut self) {
        self.backdating = true;
    }

    fn is_adding(&self) -> bool {
        self.adding
    }

    fn identity(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            code: String::new(),
            volume: Decimal::ZERO,
            deleted_at: None,
            adding: false,
            persistable: true,
            backdating: false,
            recorded_events: Vec::new(),
            pending_retractions: Vec::new(),
        }
    }

    fn recorded_events(&self) -> &[WineLotEvent] {
        &self.recorded_events
    }

    fn pending_retractions(&self) -> &[i64] {
        &self.pending_retractions
    }

    fn clear_pending_retractions(&mut self) {
        self.pending_retractions.clear();
    }

    fn load_event(&mut self, event: WineLotEvent) -> Result<(), CoreError> {
        self.validate_context(&event)?;
        match event {
            WineLotEvent::WineLotCreated(e) => self.apply_wine_lot_created(e),
            WineLotEvent::WineLotUpdated(e) => self.apply_wine_lot_updated(e),
            WineLotEvent::WineLotDeleted(e) => self.apply_wine_lot_deleted(e),
            WineLotEvent::VolumeReceived(e) => self.apply_volume_received(e),
            WineLotEvent::VolumeRemeasured(e) => self.apply_volume_remeasured(e),
            WineLotEvent::VolumeBlended(e) => self.apply_volume_blended(e),
            WineLotEvent::VolumeBottled(e) => self.apply_volume_bottled(e),
            WineLotEvent::VolumeMoved(e) => self.apply_volume_moved(e),
        }
        Ok(())
    }

    fn apply_event(&mut self, event: WineLotEvent) -> Result<(), CoreError> {
        self.load_event(event.clone())?;
        self.recorded_events.push(event);
        if self.persistable {
            crate::repository::add_wine_lot(self)?;
        }
        Ok(())
    }
}

impl WineLot {
    /// Registers a previously stored event for retraction; used by
    /// editing use cases before folding a replacement event through
    /// `apply_event` within the same unit of work.
    pub fn queue_retraction(&mut self, stored_event_id: i64) {
        self.pending_retractions.push(stored_event_id);
    }

    /// Drained by the repository when registering this aggregate for persistence.
    pub fn recorded_events_mut(&mut self) -> &mut Vec<WineLotEvent> {
        &mut self.recorded_events
    }

    /// Drained by the repository when registering this aggregate for persistence.
    pub fn pending_retractions_mut(&mut self) -> &mut Vec<i64> {
        &mut self.pending_retractions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::composition::LotComponent;
    use rust_decimal_macros::dec;

    fn components() -> Vec<ComponentAmount> {
        vec![ComponentAmount {
            component: LotComponent::new("Cabernet", "Napa", 2022),
            percent: dec!(1.0),
        }]
    }

    #[test]
    fn create_pins_occurred_at_to_epoch() {
        let (lot, event) = WineLot::create("AB01".into(), components()).unwrap();
        assert_eq!(lot.volume, Decimal::ZERO);
        assert!(!lot.is_deleted());
        match event {
            WineLotEvent::WineLotCreated(e) => assert_eq!(e.occurred_at.timestamp(), 0),
            _ => panic!("expected WineLotCreated"),
        }
    }

    #[test]
    fn rejects_invalid_codes() {
        assert!(WineLot::create("a".into(), components()).is_err());
        assert!(WineLot::create("-AB".into(), components()).is_err());
        assert!(WineLot::create("A".into(), components()).is_err());
    }

    #[test]
    fn receive_then_bottle_adjusts_volume() {
        let (mut lot, _) = WineLot::create("AB01".into(), components()).unwrap();
        let now = Utc::now();
        let received = lot
            .receive_volume("act-1".into(), now, dec!(5.00))
            .unwrap();
        lot.apply_event(received).unwrap();
        assert_eq!(lot.volume, dec!(5.00));

        let bottled = lot.bottle("act-2".into(), now, dec!(2.00)).unwrap();
        lot.apply_event(bottled).unwrap();
        assert_eq!(lot.volume, dec!(3.00));
    }

    #[test]
    fn bottle_beyond_remaining_volume_fails_context_validation() {
        let (mut lot, _) = WineLot::create("AB01".into(), components()).unwrap();
        let now = Utc::now();
        let received = lot.receive_volume("act-1".into(), now, dec!(1.00)).unwrap();
        lot.apply_event(received).unwrap();

        let over_bottled = WineLotEvent::VolumeBottled(VolumeBottled {
            aggregate_id: lot.id(),
            occurred_at: now,
            action_id: "act-2".into(),
            volume: dec!(5.00),
        });
        let err = lot.apply_event(over_bottled).unwrap_err();
        assert!(matches!(err, CoreError::ContextValidation { .. }));
    }

    #[test]
    fn operations_on_deleted_lot_fail() {
        let (mut lot, _) = WineLot::create("AB01".into(), components()).unwrap();
        let destroyed = lot.destroy(Utc::now()).unwrap();
        lot.apply_event(destroyed).unwrap();
        assert!(lot.is_deleted());
        assert!(lot.receive_volume("act-1".into(), Utc::now(), dec!(1.00)).is_err());
        assert!(lot.destroy(Utc::now()).is_err());
    }

    #[test]
    fn remeasure_sets_absolute_volume() {
        let (mut lot, _) = WineLot::create("AB01".into(), components()).unwrap();
        let now = Utc::now();
        let received = lot.receive_volume("act-1".into(), now, dec!(5.00)).unwrap();
        lot.apply_event(received).unwrap();
        let remeasured = lot.remeasure("act-2".into(), now, dec!(4.50)).unwrap();
        lot.apply_event(remeasured).unwrap();
        assert_eq!(lot.volume, dec!(4.50));
    }

    #[test]
    fn deletion_does_not_mutate_code() {
        let (mut lot, _) = WineLot::create("AB01".into(), components()).unwrap();
        let code_before = lot.code.clone();
        let destroyed = lot.destroy(Utc::now()).unwrap();
        lot.apply_event(destroyed).unwrap();
        assert_eq!(lot.code, code_before);
    }
}
