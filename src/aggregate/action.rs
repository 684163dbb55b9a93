//! Action aggregate.
//!
//! Records a user intent (`RECEIVE_VOLUME`, `REMEASURE`, `BLEND`,
//! `BOTTLE`) and its edit history. An action's own id is reused as the
//! `sequence_number` on every downstream `WineLot` event it causes,
//! which is how temporal replay correlates an edit back to the exact
//! point in a lot's history that needs to be revised.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::aggregate::Aggregate;
use crate::domain::action_events::{
    ActionDeleted, ActionDetails, ActionEdited, ActionEditedDetails, ActionRecorded, ActionType,
};
use crate::domain::error::CoreError;
use crate::domain::value_change::ValueChange;
use crate::domain::ActionEvent;
use crate::id::{new_id, AggregateId};

#[derive(Debug, Clone)]
pub struct Action {
    id: AggregateId,
    version: i64,
    pub effective_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub action_type: Option<ActionType>,
    pub details: Option<ActionDetails>,
    pub involved_wine_lot_ids: Vec<AggregateId>,
    pub revision_number: i32,
    adding: bool,
    persistable: bool,
    backdating: bool,
    recorded_events: Vec<ActionEvent>,
    pending_retractions: Vec<i64>,
}

impl Action {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn ensure_not_deleted(&self) -> Result<(), CoreError> {
        if self.is_deleted() {
            return Err(CoreError::domain_validation(format!(
                "action {} has been deleted",
                self.id
            )));
        }
        Ok(())
    }

    fn ensure_type(&self, expected: ActionType) -> Result<(), CoreError> {
        if self.action_type != Some(expected) {
            return Err(CoreError::domain_validation(format!(
                "action {} is not a {expected:?}",
                self.id
            )));
        }
        Ok(())
    }

    fn record(
        details: ActionDetails,
        effective_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Result<(Self, ActionEvent), CoreError> {
        let id = new_id();
        let mut action = Self::identity(id);
        action.adding = true;
        let event = ActionEvent::ActionRecorded(ActionRecorded {
            aggregate_id: id,
            effective_at,
            recorded_at,
            details,
        });
        action.apply_event(event.clone())?;
        Ok((action, event))
    }

    pub fn record_receive_volume(
        wine_lot_id: AggregateId,
        volume: Decimal,
        effective_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Result<(Self, ActionEvent), CoreError> {
        Self::record(
            ActionDetails::ReceiveVolume { wine_lot_id, volume },
            effective_at,
            recorded_at,
        )
    }

    pub fn record_remeasure(
        wine_lot_id: AggregateId,
        volume: Decimal,
        effective_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Result<(Self, ActionEvent), CoreError> {
        Self::record(
            ActionDetails::Remeasure { wine_lot_id, volume },
            effective_at,
            recorded_at,
        )
    }

    pub fn record_blend(
        blend_volumes: HashMap<String, Decimal>,
        receiving_wine_lot_id: AggregateId,
        blended_volume: Decimal,
        effective_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Result<(Self, ActionEvent), CoreError> {
        if blended_volume <= Decimal::ZERO {
            return Err(CoreError::domain_validation("blended_volume must be positive"));
        }
        let total: Decimal = blend_volumes.values().copied().sum();
        if total == Decimal::ZERO {
            return Err(CoreError::domain_validation(
                "blend_volumes must not sum to zero",
            ));
        }
        Self::record(
            ActionDetails::Blend {
                blend_volumes,
                receiving_wine_lot_id,
                blended_volume,
            },
            effective_at,
            recorded_at,
        )
    }

    pub fn record_bottle(
        wine_lot_id: AggregateId,
        volume_bottled: Decimal,
        bottles: i32,
        effective_at: DateTime<Utc>,
        recorded_at: DateTime<Utc>,
    ) -> Result<(Self, ActionEvent), CoreError> {
        Self::record(
            ActionDetails::Bottle {
                wine_lot_id,
                volume_bottled,
                bottles,
            },
            effective_at,
            recorded_at,
        )
    }

    pub fn destroy(&self, deleted_at: DateTime<Utc>) -> Result<ActionEvent, CoreError> {
        self.ensure_not_deleted()?;
        Ok(ActionEvent::ActionDeleted(ActionDeleted {
            aggregate_id: self.id,
            deleted_at,
        }))
    }

    pub fn edit_receive_volume(
        &self,
        wine_lot_id: AggregateId,
        volume: Decimal,
        edited_at: DateTime<Utc>,
    ) -> Result<ActionEvent, CoreError> {
        self.ensure_not_deleted()?;
        self.ensure_type(ActionType::ReceiveVolume)?;
        let ActionDetails::ReceiveVolume {
            wine_lot_id: before_lot,
            volume: before_volume,
        } = self.details.clone().expect("recorded action always has details")
        else {
            unreachable!("ensure_type checked the discriminant")
        };
        Ok(ActionEvent::ActionEdited(ActionEdited {
            aggregate_id: self.id,
            edited_at,
            details: ActionEditedDetails::ReceiveVolume {
                wine_lot_id: ValueChange::new(before_lot, wine_lot_id),
                volume: ValueChange::new(before_volume, volume),
            },
        }))
    }

    pub fn edit_remeasure(
        &self,
        wine_lot_id: AggregateId,
        volume: Decimal,
        edited_at: DateTime<Utc>,
    ) -> Result<ActionEvent, CoreError> {
        self.ensure_not_deleted()?;
        self.ensure_type(ActionType::Remeasure)?;
        let ActionDetails::Remeasure {
            wine_lot_id: before_lot,
            volume: before_volume,
        } = self.details.clone().expect("recorded action always has details")
        else {
            unreachable!("ensure_type checked the discriminant")
        };
        Ok(ActionEvent::ActionEdited(ActionEdited {
            aggregate_id: self.id,
            edited_at,
            details: ActionEditedDetails::Remeasure {
                wine_lot_id: ValueChange::new(before_lot, wine_lot_id),
                volume: ValueChange::new(before_volume, volume),
            },
        }))
    }

    pub fn edit_blend(
        &self,
        blend_volumes: HashMap<String, Decimal>,
        receiving_wine_lot_id: AggregateId,
        blended_volume: Decimal,
        edited_at: DateTime<Utc>,
    ) -> Result<ActionEvent, CoreError> {
        self.ensure_not_deleted()?;
        self.ensure_type(ActionType::Blend)?;
        if blended_volume <= Decimal::ZERO {
            return Err(CoreError::domain_validation("blended_volume must be positive"));
        }
        let ActionDetails::Blend {
            blend_volumes: before_volumes,
            receiving_wine_lot_id: before_receiver,
            blended_volume: before_blended,
        } = self.details.clone().expect("recorded action always has details")
        else {
            unreachable!("ensure_type checked the discriminant")
        };
        Ok(ActionEvent::ActionEdited(ActionEdited {
            aggregate_id: self.id,
            edited_at,
            details: ActionEditedDetails::Blend {
                blend_volumes: ValueChange::new(before_volumes, blend_volumes),
                receiving_wine_lot_id: ValueChange::new(before_receiver, receiving_wine_lot_id),
                blended_volume: ValueChange::new(before_blended, blended_volume),
            },
        }))
    }

    pub fn edit_bottle(
        &self,
        wine_lot_id: AggregateId,
        volume_bottled: Decimal,
        bottles: i32,
        edited_at: DateTime<Utc>,
    ) -> Result<ActionEvent, CoreError> {
        self.ensure_not_deleted()?;
        self.ensure_type(ActionType::Bottle)?;
        let ActionDetails::Bottle {
            wine_lot_id: before_lot,
            volume_bottled: before_volume,
            bottles: before_bottles,
        } = self.details.clone().expect("recorded action always has details")
        else {
            unreachable!("ensure_type checked the discriminant")
        };
        Ok(ActionEvent::ActionEdited(ActionEdited {
            aggregate_id: self.id,
            edited_at,
            details: ActionEditedDetails::Bottle {
                wine_lot_id: ValueChange::new(before_lot, wine_lot_id),
                volume_bottled: ValueChange::new(before_volume, volume_bottled),
                bottles: ValueChange::new(before_bottles, bottles),
            },
        }))
    }

    fn apply_action_recorded(&mut self, event: ActionRecorded) {
        self.id = event.aggregate_id;
        self.effective_at = event.effective_at;
        self.recorded_at = event.recorded_at;
        self.deleted_at = None;
        self.updated_at = None;
        self.revision_number = 0;
        self.action_type = Some(event.details.action_type());
        self.involved_wine_lot_ids = event.details.involved_wine_lot_ids();
        self.details = Some(event.details);
    }

    fn apply_action_edited(&mut self, event: ActionEdited) {
        self.revision_number += 1;
        self.updated_at = Some(event.edited_at);
        let after = event.details.after();
        self.action_type = Some(after.action_type());
        self.involved_wine_lot_ids = after.involved_wine_lot_ids();
        self.details = Some(after);
    }

    fn apply_action_deleted(&mut self, event: ActionDeleted) {
        self.deleted_at = Some(event.deleted_at);
    }
}

impl Aggregate for Action {
    type Event = ActionEvent;

    fn aggregate_type() -> &'static str {
        "Action"
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
        let epoch = crate::id::creation_epoch();
        Self {
            id,
            version: 0,
            effective_at: epoch,
            recorded_at: epoch,
            updated_at: None,
            deleted_at: None,
            action_type: None,
            details: None,
            involved_wine_lot_ids: Vec::new(),
            revision_number: 0,
            adding: false,
            persistable: true,
            backdating: false,
            recorded_events: Vec::new(),
            pending_retractions: Vec::new(),
        }
    }

    fn recorded_events(&self) -> &[ActionEvent] {
        &self.recorded_events
    }

    fn pending_retractions(&self) -> &[i64] {
        &self.pending_retractions
    }

    fn clear_pending_retractions(&mut self) {
        self.pending_retractions.clear();
    }

    fn load_event(&mut self, event: ActionEvent) -> Result<(), CoreError> {
        match event {
            ActionEvent::ActionRecorded(e) => self.apply_action_recorded(e),
            ActionEvent::ActionEdited(e) => self.apply_action_edited(e),
            ActionEvent::ActionDeleted(e) => self.apply_action_deleted(e),
        }
        Ok(())
    }

    fn apply_event(&mut self, event: ActionEvent) -> Result<(), CoreError> {
        self.load_event(event.clone())?;
        self.recorded_events.push(event);
        if self.persistable {
            crate::repository::add_action(self)?;
        }
        Ok(())
    }
}

impl Action {
    pub fn queue_retraction(&mut self, stored_event_id: i64) {
        self.pending_retractions.push(stored_event_id);
    }

    /// Drained by the repository when registering this aggregate for persistence.
    pub fn recorded_events_mut(&mut self) -> &mut Vec<ActionEvent> {
        &mut self.recorded_events
    }

    /// Drained by the repository when registering this aggregate for persistence.
    pub fn pending_retractions_mut(&mut self) -> &mut Vec<i64> {
        &mut self.pending_retractions
    }
}
