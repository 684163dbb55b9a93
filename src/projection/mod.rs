//! Projection module
//!
//! Read-side views derived by replaying events, never stored on an
//! aggregate itself.

mod composition;

pub use composition::calculate_composition;
