//! Generic before/after pair used by edit events to describe exactly
//! which fields changed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueChange<T> {
    pub before: T,
    pub after: T,
}

impl<T> ValueChange<T> {
    pub fn new(before: T, after: T) -> Self {
        Self { before, after }
    }
}
