//! cellar_ledger
//!
//! An event-sourced aggregate persistence engine, applied here to a
//! small winemaking domain (wine lots, blending, bottling) as a worked
//! example of its temporal replay and projection machinery.

pub mod aggregate;
pub mod config;
pub mod cursor;
pub mod db;
pub mod domain;
pub mod event_store;
pub mod id;
pub mod notification;
pub mod projection;
pub mod repository;
pub mod replay;

pub use aggregate::{Aggregate, AggregateEvent};
pub use config::Config;
pub use domain::{ActionEvent, CoreError, WineLotEvent};
pub use event_store::{EventStore, EventStoreError, TemporalBound};
pub use id::AggregateId;
