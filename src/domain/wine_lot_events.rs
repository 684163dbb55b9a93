//! WineLot event stream.
//!
//! Tagged with `#[serde(tag = "event_type")]` rather than dispatched by
//! reflecting on a Python class name: the tag round-trips through JSON
//! and doubles as the `event_kind()` used to pick an `apply_<kind>`
//! handler in `WineLot::load_event`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::aggregate::AggregateEvent;
use crate::domain::composition::ComponentAmount;
use crate::domain::value_change::ValueChange;
use crate::id::AggregateId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WineLotCreated {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub code: String,
    pub components: Vec<ComponentAmount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WineLotUpdated {
    pub aggregate_id: AggregateId,
    pub code: ValueChange<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WineLotDeleted {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeReceived {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub action_id: String,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRemeasured {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub action_id: String,
    pub volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBlended {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub action_id: String,
    /// Source lot id (as a string) -> volume drawn from that source.
    pub volumes: HashMap<String, Decimal>,
    pub volume_received: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBottled {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub action_id: String,
    pub volume: Decimal,
}

/// Debit-side counterpart of `VolumeBlended` on every source lot. Not a
/// public action type of its own; it is emitted internally by the blend
/// use case alongside the receiving lot's `VolumeBlended`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMoved {
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub action_id: String,
    pub volume: Decimal,
    pub to_wine_lot_id: AggregateId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum WineLotEvent {
    WineLotCreated(WineLotCreated),
    WineLotUpdated(WineLotUpdated),
    WineLotDeleted(WineLotDeleted),
    VolumeReceived(VolumeReceived),
    VolumeRemeasured(VolumeRemeasured),
    VolumeBlended(VolumeBlended),
    VolumeBottled(VolumeBottled),
    VolumeMoved(VolumeMoved),
}

impl AggregateEvent for WineLotEvent {
    fn event_kind(&self) -> &'static str {
        match self {
            WineLotEvent::WineLotCreated(_) => "wine_lot_created",
            WineLotEvent::WineLotUpdated(_) => "wine_lot_updated",
            WineLotEvent::WineLotDeleted(_) => "wine_lot_deleted",
            WineLotEvent::VolumeReceived(_) => "volume_received",
            WineLotEvent::VolumeRemeasured(_) => "volume_remeasured",
            WineLotEvent::VolumeBlended(_) => "volume_blended",
            WineLotEvent::VolumeBottled(_) => "volume_bottled",
            WineLotEvent::VolumeMoved(_) => "volume_moved",
        }
    }

    fn event_type(&self) -> &'static str {
        match self {
            WineLotEvent::WineLotCreated(_) => "WineLotCreated",
            WineLotEvent::WineLotUpdated(_) => "WineLotUpdated",
            WineLotEvent::WineLotDeleted(_) => "WineLotDeleted",
            WineLotEvent::VolumeReceived(_) => "VolumeReceived",
            WineLotEvent::VolumeRemeasured(_) => "VolumeRemeasured",
            WineLotEvent::VolumeBlended(_) => "VolumeBlended",
            WineLotEvent::VolumeBottled(_) => "VolumeBottled",
            WineLotEvent::VolumeMoved(_) => "VolumeMoved",
        }
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        match self {
            WineLotEvent::WineLotCreated(e) => Some(e.occurred_at),
            WineLotEvent::WineLotUpdated(_) => None,
            WineLotEvent::WineLotDeleted(e) => Some(e.occurred_at),
            WineLotEvent::VolumeReceived(e) => Some(e.occurred_at),
            WineLotEvent::VolumeRemeasured(e) => Some(e.occurred_at),
            WineLotEvent::VolumeBlended(e) => Some(e.occurred_at),
            WineLotEvent::VolumeBottled(e) => Some(e.occurred_at),
            WineLotEvent::VolumeMoved(e) => Some(e.occurred_at),
        }
    }

    fn sequence_number(&self) -> Option<String> {
        match self {
            WineLotEvent::WineLotCreated(_) => None,
            WineLotEvent::WineLotUpdated(_) => None,
            WineLotEvent::WineLotDeleted(_) => None,
            WineLotEvent::VolumeReceived(e) => Some(e.action_id.clone()),
            WineLotEvent::VolumeRemeasured(e) => Some(e.action_id.clone()),
            WineLotEvent::VolumeBlended(e) => Some(e.action_id.clone()),
            WineLotEvent::VolumeBottled(e) => Some(e.action_id.clone()),
            WineLotEvent::VolumeMoved(e) => Some(e.action_id.clone()),
        }
    }
}

impl WineLotEvent {
    pub fn aggregate_id(&self) -> AggregateId {
        match self {
            WineLotEvent::WineLotCreated(e) => e.aggregate_id,
            WineLotEvent::WineLotUpdated(e) => e.aggregate_id,
            WineLotEvent::WineLotDeleted(e) => e.aggregate_id,
            WineLotEvent::VolumeReceived(e) => e.aggregate_id,
            WineLotEvent::VolumeRemeasured(e) => e.aggregate_id,
            WineLotEvent::VolumeBlended(e) => e.aggregate_id,
            WineLotEvent::VolumeBottled(e) => e.aggregate_id,
            WineLotEvent::VolumeMoved(e) => e.aggregate_id,
        }
    }
}
