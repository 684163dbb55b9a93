//! Action event stream.
//!
//! An `Action` carries one of four payload shapes discriminated by
//! `action_type`. This is the tagged-sum rendering of what the original
//! domain spread across four sibling "recorded data" classes picked
//! apart by isinstance checks: here the discriminant is a real enum tag
//! serde preserves on the wire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateEvent;
use crate::domain::error::CoreError;
use crate::domain::value_change::ValueChange;
use crate::id::AggregateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    ReceiveVolume,
    Remeasure,
    Blend,
    Bottle,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ReceiveVolume => "RECEIVE_VOLUME",
            ActionType::Remeasure => "REMEASURE",
            ActionType::Blend => "BLEND",
            ActionType::Bottle => "BOTTLE",
        }
    }
}

impl std::str::FromStr for ActionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVE_VOLUME" => Ok(ActionType::ReceiveVolume),
            "REMEASURE" => Ok(ActionType::Remeasure),
            "BLEND" => Ok(ActionType::Blend),
            "BOTTLE" => Ok(ActionType::Bottle),
            other => Err(CoreError::Persistence(format!(
                "unrecognized action_type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionDetails {
    ReceiveVolume { wine_lot_id: AggregateId, volume: Decimal },
    Remeasure { wine_lot_id: AggregateId, volume: Decimal },
    Blend {
        blend_volumes: HashMap<String, Decimal>,
        receiving_wine_lot_id: AggregateId,
        blended_volume: Decimal,
    },
    Bottle {
        wine_lot_id: AggregateId,
        volume_bottled: Decimal,
        bottles: i32,
    },
}

impl ActionDetails {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionDetails::ReceiveVolume { .. } => ActionType::ReceiveVolume,
            ActionDetails::Remeasure { .. } => ActionType::Remeasure,
            ActionDetails::Blend { .. } => ActionType::Blend,
            ActionDetails::Bottle { .. } => ActionType::Bottle,
        }
    }

    /// Every wine lot id this action touches, in the order the domain
    /// source derives them: for a blend, the receiving lot first, then
    /// each source lot.
    pub fn involved_wine_lot_ids(&self) -> Vec<AggregateId> {
        match self {
            ActionDetails::ReceiveVolume { wine_lot_id, .. }
            | ActionDetails::Remeasure { wine_lot_id, .. }
            | ActionDetails::Bottle { wine_lot_id, .. } => vec![*wine_lot_id],
            ActionDetails::Blend {
                blend_volumes,
                receiving_wine_lot_id,
                ..
            } => {
                let mut ids = vec![*receiving_wine_lot_id];
                ids.extend(blend_volumes.keys().filter_map(|k| k.parse::<AggregateId>().ok()));
                ids
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionEditedDetails {
    ReceiveVolume {
        wine_lot_id: ValueChange<AggregateId>,
        volume: ValueChange<Decimal>,
    },
    Remeasure {
        wine_lot_id: ValueChange<AggregateId>,
        volume: ValueChange<Decimal>,
    },
    Blend {
        blend_volumes: ValueChange<HashMap<String, Decimal>>,
        receiving_wine_lot_id: ValueChange<AggregateId>,
        blended_volume: ValueChange<Decimal>,
    },
    Bottle {
        wine_lot_id: ValueChange<AggregateId>,
        volume_bottled: ValueChange<Decimal>,
        bottles: ValueChange<i32>,
    },
}

impl ActionEditedDetails {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionEditedDetails::ReceiveVolume { .. } => ActionType::ReceiveVolume,
            ActionEditedDetails::Remeasure { .. } => ActionType::Remeasure,
            ActionEditedDetails::Blend { .. } => ActionType::Blend,
            ActionEditedDetails::Bottle { .. } => ActionType::Bottle,
        }
    }

    /// Projects the "after" side into the same shape `ActionDetails` has,
    /// the way the aggregate rebuilds its `details`/`involved_wine_lot_ids`
    /// fields after an edit.
    pub fn after(&self) -> ActionDetails {
        match self {
            ActionEditedDetails::ReceiveVolume { wine_lot_id, volume } => {
                ActionDetails::ReceiveVolume {
                    wine_lot_id: wine_lot_id.after,
                    volume: volume.after,
                }
            }
            ActionEditedDetails::Remeasure { wine_lot_id, volume } => ActionDetails::Remeasure {
                wine_lot_id: wine_lot_id.after,
                volume: volume.after,
            },
            ActionEditedDetails::Blend {
                blend_volumes,
                receiving_wine_lot_id,
                blended_volume,
            } => ActionDetails::Blend {
                blend_volumes: blend_volumes.after.clone(),
                receiving_wine_lot_id: receiving_wine_lot_id.after,
                blended_volume: blended_volume.after,
            },
            ActionEditedDetails::Bottle {
                wine_lot_id,
                volume_bottled,
                bottles,
            } => ActionDetails::Bottle {
                wine_lot_id: wine_lot_id.after,
                volume_bottled: volume_bottled.after,
                bottles: bottles.after,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecorded {
    pub aggregate_id: AggregateId,
    pub effective_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub details: ActionDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEdited {
    pub aggregate_id: AggregateId,
    pub edited_at: DateTime<Utc>,
    pub details: ActionEditedDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDeleted {
    pub aggregate_id: AggregateId,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ActionEvent {
    ActionRecorded(ActionRecorded),
    ActionEdited(ActionEdited),
    ActionDeleted(ActionDeleted),
}

impl AggregateEvent for ActionEvent {
    fn event_kind(&self) -> &'static str {
        match self {
            ActionEvent::ActionRecorded(_) => "action_recorded",
            ActionEvent::ActionEdited(_) => "action_edited",
            ActionEvent::ActionDeleted(_) => "action_deleted",
        }
    }

    fn event_type(&self) -> &'static str {
        match self {
            ActionEvent::ActionRecorded(_) => "ActionRecorded",
            ActionEvent::ActionEdited(_) => "ActionEdited",
            ActionEvent::ActionDeleted(_) => "ActionDeleted",
        }
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ActionEvent::ActionRecorded(e) => Some(e.recorded_at),
            ActionEvent::ActionEdited(e) => Some(e.edited_at),
            ActionEvent::ActionDeleted(e) => Some(e.deleted_at),
        }
    }
}

impl ActionEvent {
    pub fn aggregate_id(&self) -> AggregateId {
        match self {
            ActionEvent::ActionRecorded(e) => e.aggregate_id,
            ActionEvent::ActionEdited(e) => e.aggregate_id,
            ActionEvent::ActionDeleted(e) => e.aggregate_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn blend_involved_ids_lists_receiver_first_then_sources() {
        let source = crate::id::new_id();
        let receiver = crate::id::new_id();
        let details = ActionDetails::Blend {
            blend_volumes: HashMap::from([(source.to_string(), dec!(5.00))]),
            receiving_wine_lot_id: receiver,
            blended_volume: dec!(5.00),
        };
        let ids = details.involved_wine_lot_ids();
        assert_eq!(ids[0], receiver);
        assert!(ids.contains(&source));
    }

    #[test]
    fn edited_details_after_round_trips_into_action_details() {
        let lot = crate::id::new_id();
        let edited = ActionEditedDetails::ReceiveVolume {
            wine_lot_id: ValueChange::new(lot, lot),
            volume: ValueChange::new(dec!(1.00), dec!(2.00)),
        };
        match edited.after() {
            ActionDetails::ReceiveVolume { volume, .. } => assert_eq!(volume, dec!(2.00)),
            _ => panic!("expected ReceiveVolume"),
        }
    }
}
