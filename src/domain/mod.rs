//! Domain module
//!
//! Core domain types shared by the engine and the winemaking example
//! aggregates.

pub mod action_events;
pub mod composition;
pub mod error;
pub mod value_change;
pub mod wine_lot_events;

pub use action_events::{ActionDetails, ActionEditedDetails, ActionEvent, ActionType};
pub use composition::{Composition, ComponentAmount, LotComponent};
pub use error::CoreError;
pub use value_change::ValueChange;
pub use wine_lot_events::WineLotEvent;
